//! Contact index shared by the in-memory and persistent backends.
//!
//! Every mutation validates first and only then touches state, so a failed
//! call leaves the index exactly as it was. The persistent backend relies on
//! this: it validates, appends to the WAL, then applies.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::contact::{sort_by_seniority, Contact, ContactId, LinkPrecedence, NewContact};

use super::traits::StorageError;

#[derive(Debug, Clone, Default)]
pub(crate) struct ContactIndex {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    /// primary id -> contacts whose `linked_id` points at it
    children: HashMap<ContactId, BTreeSet<ContactId>>,
    last_id: u64,
    last_created_at: Option<DateTime<Utc>>,
}

fn invalid(msg: impl Into<String>) -> StorageError {
    StorageError::InvalidMutation(msg.into())
}

impl ContactIndex {
    pub(crate) fn from_contacts(contacts: impl IntoIterator<Item = Contact>, last_id: u64) -> Self {
        let mut index = Self::default();
        for contact in contacts {
            index.insert(contact);
        }
        index.last_id = index.last_id.max(last_id);
        index
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn last_id(&self) -> u64 {
        self.last_id
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    fn live(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id).filter(|c| !c.is_deleted())
    }

    fn collect_live<'a>(&self, ids: impl IntoIterator<Item = &'a ContactId>) -> Vec<Contact> {
        let unique: BTreeSet<ContactId> = ids.into_iter().copied().collect();
        let mut out: Vec<Contact> = unique
            .into_iter()
            .filter_map(|id| self.live(id).cloned())
            .collect();
        sort_by_seniority(&mut out);
        out
    }

    pub(crate) fn find_by_identifiers(&self, email: Option<&str>, phone_number: Option<&str>) -> Vec<Contact> {
        let by_email = email
            .filter(|e| !e.is_empty())
            .and_then(|e| self.by_email.get(e))
            .into_iter()
            .flatten();
        let by_phone = phone_number
            .filter(|p| !p.is_empty())
            .and_then(|p| self.by_phone.get(p))
            .into_iter()
            .flatten();
        self.collect_live(by_email.chain(by_phone))
    }

    pub(crate) fn find_by_cluster_root(&self, primary_id: ContactId) -> Vec<Contact> {
        let children = self.children.get(&primary_id).into_iter().flatten();
        self.collect_live(std::iter::once(&primary_id).chain(children))
    }

    pub(crate) fn find_by_ids(&self, ids: &[ContactId]) -> Vec<Contact> {
        self.collect_live(ids)
    }

    fn require_live_primary(&self, id: ContactId, role: &str) -> Result<&Contact, StorageError> {
        let contact = self.by_id.get(&id).ok_or(StorageError::ContactNotFound(id))?;
        if contact.is_deleted() {
            return Err(invalid(format!("{role} {id} is deleted")));
        }
        if !contact.is_primary() {
            return Err(invalid(format!("{role} {id} is not a primary")));
        }
        Ok(contact)
    }

    /// Builds the contact `create` would insert, without inserting it.
    pub(crate) fn allocate(&self, new: &NewContact, now: DateTime<Utc>) -> Result<Contact, StorageError> {
        let email = new.email.clone().filter(|e| !e.is_empty());
        let phone_number = new.phone_number.clone().filter(|p| !p.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(invalid("contact needs an email or a phone number"));
        }

        match (new.link_precedence, new.linked_id) {
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Primary, Some(_)) => {
                return Err(invalid("a primary contact cannot carry a linked id"));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(invalid("a secondary contact needs a linked id"));
            }
            (LinkPrecedence::Secondary, Some(primary)) => {
                self.require_live_primary(primary, "linked contact")?;
            }
        }

        let id = self
            .last_id
            .checked_add(1)
            .map(ContactId::new)
            .ok_or_else(|| StorageError::BackendError("contact id overflow".to_string()))?;

        // Seniority follows id order even if the wall clock steps back.
        let created_at = self.last_created_at.map_or(now, |last| last.max(now));

        Ok(Contact {
            id,
            email,
            phone_number,
            link_precedence: new.link_precedence,
            linked_id: new.linked_id,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        })
    }

    /// Puts a fully formed contact, replacing any previous version.
    pub(crate) fn insert(&mut self, contact: Contact) {
        if let Some(prev) = self.by_id.remove(&contact.id) {
            self.unindex(&prev);
        }

        if let Some(email) = contact.email.clone() {
            self.by_email.entry(email).or_default().insert(contact.id);
        }
        if let Some(phone) = contact.phone_number.clone() {
            self.by_phone.entry(phone).or_default().insert(contact.id);
        }
        if let Some(parent) = contact.linked_id {
            self.children.entry(parent).or_default().insert(contact.id);
        }

        self.last_id = self.last_id.max(contact.id.get());
        self.last_created_at = Some(
            self.last_created_at
                .map_or(contact.created_at, |last| last.max(contact.created_at)),
        );
        self.by_id.insert(contact.id, contact);
    }

    fn unindex(&mut self, contact: &Contact) {
        if let Some(email) = contact.email.as_deref() {
            remove_from(&mut self.by_email, email, contact.id);
        }
        if let Some(phone) = contact.phone_number.as_deref() {
            remove_from(&mut self.by_phone, phone, contact.id);
        }
        if let Some(parent) = contact.linked_id {
            if let Some(set) = self.children.get_mut(&parent) {
                set.remove(&contact.id);
                if set.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
    }

    fn set_link(&mut self, id: ContactId, linked_id: ContactId, at: DateTime<Utc>) {
        let Some(mut contact) = self.by_id.get(&id).cloned() else {
            return;
        };
        contact.link_precedence = LinkPrecedence::Secondary;
        contact.linked_id = Some(linked_id);
        contact.updated_at = at;
        self.insert(contact);
    }

    pub(crate) fn validate_demote(&self, id: ContactId, new_linked_id: ContactId) -> Result<(), StorageError> {
        if id == new_linked_id {
            return Err(invalid(format!("contact {id} cannot link at itself")));
        }
        self.require_live_primary(id, "demoted contact")?;
        self.require_live_primary(new_linked_id, "new primary")?;
        Ok(())
    }

    pub(crate) fn demote(
        &mut self,
        id: ContactId,
        new_linked_id: ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.validate_demote(id, new_linked_id)?;
        self.set_link(id, new_linked_id, at);
        Ok(())
    }

    pub(crate) fn validate_relink(&self, old_primary_id: ContactId, new_primary_id: ContactId) -> Result<(), StorageError> {
        if old_primary_id == new_primary_id {
            return Err(invalid(format!("cannot relink contact {old_primary_id} onto itself")));
        }
        self.require_live_primary(new_primary_id, "new primary")?;
        Ok(())
    }

    pub(crate) fn relink_children(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
        at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        self.validate_relink(old_primary_id, new_primary_id)?;
        let children: Vec<ContactId> = self
            .children
            .get(&old_primary_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for &child in &children {
            self.set_link(child, new_primary_id, at);
        }
        Ok(children.len())
    }

    pub(crate) fn validate_merge(&self, survivor: ContactId, demoted: &[ContactId]) -> Result<(), StorageError> {
        self.require_live_primary(survivor, "surviving primary")?;
        let mut seen = BTreeSet::new();
        for &id in demoted {
            if !seen.insert(id) {
                return Err(invalid(format!("contact {id} listed twice for demotion")));
            }
            self.validate_demote(id, survivor)?;
        }
        Ok(())
    }

    pub(crate) fn merge_clusters(
        &mut self,
        survivor: ContactId,
        demoted: &[ContactId],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.validate_merge(survivor, demoted)?;
        for &old_primary in demoted {
            self.relink_children(old_primary, survivor, at)?;
            self.set_link(old_primary, survivor, at);
        }
        Ok(())
    }

    pub(crate) fn soft_delete(&mut self, id: ContactId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let contact = self.by_id.get_mut(&id).ok_or(StorageError::ContactNotFound(id))?;
        if contact.is_deleted() {
            return Ok(false);
        }
        contact.deleted_at = Some(at);
        contact.updated_at = at;
        Ok(true)
    }
}

fn remove_from(map: &mut HashMap<String, BTreeSet<ContactId>>, key: &str, id: ContactId) {
    if let Some(set) = map.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}
