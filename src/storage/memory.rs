//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of [`ContactStore`].
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::sync::RwLock;

use chrono::Utc;

use crate::contact::{Contact, ContactId, NewContact};
use crate::storage::index::ContactIndex;
use crate::storage::traits::{ContactStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory contact store.
///
/// Every mutation runs under a single write lock, so `merge_clusters` is
/// observed atomically by concurrent readers.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    state: RwLock<ContactIndex>,
}

impl InMemoryContactStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contacts, soft-deleted ones included.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("contact.len"))?.len())
    }

    /// Returns true if nothing has been stored yet.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of every stored contact in id order.
    pub fn all(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.all"))?;
        Ok(state.contacts().cloned().collect())
    }
}

impl ContactStore for InMemoryContactStore {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.find_by_identifiers"))?;
        Ok(state.find_by_identifiers(email, phone_number))
    }

    fn find_by_cluster_root(&self, primary_id: ContactId) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.find_by_cluster_root"))?;
        Ok(state.find_by_cluster_root(primary_id))
    }

    fn find_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.find_by_ids"))?;
        Ok(state.find_by_ids(ids))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.get"))?;
        Ok(state.get(id).cloned())
    }

    fn create(&self, contact: NewContact) -> Result<Contact, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.create"))?;
        let contact = state.allocate(&contact, Utc::now())?;
        state.insert(contact.clone());
        Ok(contact)
    }

    fn demote(&self, contact_id: ContactId, new_linked_id: ContactId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.demote"))?;
        state.demote(contact_id, new_linked_id, Utc::now())
    }

    fn relink_children(
        &self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.relink_children"))?;
        state.relink_children(old_primary_id, new_primary_id, Utc::now())
    }

    fn merge_clusters(&self, survivor: ContactId, demoted: &[ContactId]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.merge_clusters"))?;
        state.merge_clusters(survivor, demoted, Utc::now())
    }

    fn soft_delete(&self, id: ContactId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("contact.soft_delete"))?;
        state.soft_delete(id, Utc::now()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contact::{Identifiers, LinkPrecedence};

    fn primary(store: &InMemoryContactStore, email: Option<&str>, phone: Option<&str>) -> Contact {
        let ids = Identifiers::new(email, phone).unwrap();
        store.create(NewContact::primary(&ids)).unwrap()
    }

    #[test]
    fn contact_create_get_and_lookup() {
        let store = InMemoryContactStore::new();
        assert!(store.is_empty().unwrap());

        let c = primary(&store, Some("lorraine@hillvalley.edu"), Some("123456"));
        assert_eq!(c.id, ContactId::new(1));
        assert!(c.is_primary());
        assert_eq!(c.created_at, c.updated_at);

        let got = store.get(c.id).unwrap().unwrap();
        assert_eq!(got, c);

        let by_phone = store.find_by_identifiers(None, Some("123456")).unwrap();
        assert_eq!(by_phone.len(), 1);
        assert!(store.find_by_identifiers(Some("nobody@x.com"), None).unwrap().is_empty());
        assert!(store.get(ContactId::new(77)).unwrap().is_none());
    }

    #[test]
    fn demote_and_relink_separately() {
        let store = InMemoryContactStore::new();
        let p1 = primary(&store, Some("a@x.com"), None);
        let p2 = primary(&store, Some("b@x.com"), None);
        let s = store
            .create(NewContact::secondary(
                &Identifiers::new(Some("c@x.com"), None).unwrap(),
                p2.id,
            ))
            .unwrap();

        assert_eq!(store.relink_children(p2.id, p1.id).unwrap(), 1);
        store.demote(p2.id, p1.id).unwrap();

        let p2_after = store.get(p2.id).unwrap().unwrap();
        assert_eq!(p2_after.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(p2_after.linked_id, Some(p1.id));
        assert!(p2_after.updated_at >= p2.updated_at);
        assert_eq!(store.get(s.id).unwrap().unwrap().linked_id, Some(p1.id));

        // A secondary is never demoted twice.
        assert!(matches!(
            store.demote(p2.id, p1.id),
            Err(StorageError::InvalidMutation(_))
        ));
    }

    #[test]
    fn merge_clusters_handles_many_primaries() {
        let store = InMemoryContactStore::new();
        let p1 = primary(&store, Some("a@x.com"), None);
        let p2 = primary(&store, Some("b@x.com"), None);
        let p3 = primary(&store, None, Some("333"));

        store.merge_clusters(p1.id, &[p2.id, p3.id]).unwrap();

        let cluster = store.find_by_cluster_root(p1.id).unwrap();
        assert_eq!(cluster.len(), 3);
        assert!(cluster.iter().filter(|c| c.is_primary()).count() == 1);
        assert!(cluster.iter().all(|c| c.root_id() == p1.id));
    }

    #[test]
    fn soft_deleted_contacts_are_hidden_from_queries() {
        let store = InMemoryContactStore::new();
        let p = primary(&store, Some("a@x.com"), Some("111"));
        let s = store
            .create(NewContact::secondary(
                &Identifiers::new(Some("a@x.com"), Some("222")).unwrap(),
                p.id,
            ))
            .unwrap();

        store.soft_delete(s.id).unwrap();
        store.soft_delete(s.id).unwrap();

        assert_eq!(store.find_by_identifiers(None, Some("222")).unwrap().len(), 0);
        assert_eq!(store.find_by_cluster_root(p.id).unwrap().len(), 1);
        assert!(store.find_by_ids(&[s.id]).unwrap().is_empty());
        assert!(store.get(s.id).unwrap().unwrap().is_deleted());
        assert_eq!(store.all().unwrap().len(), 2);
    }
}
