//! Contact records and the consolidated identity view.
//!
//! A [`Contact`] is a single identifier record (an email, a phone number, or
//! both). Contacts that belong to the same person form a cluster: exactly one
//! `primary` contact plus any number of `secondary` contacts linking directly
//! at it.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Stable, monotonically increasing contact identifier.
///
/// Ids are assigned by the store in creation order, so a lower id is always
/// the older record. This makes the id the tie-break for cluster seniority.
///
/// # Examples
///
/// ```
/// use identity_reconciler::ContactId;
///
/// let id = ContactId::new(7);
/// assert_eq!(id.get(), 7);
/// assert!(ContactId::new(1) < id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContactId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// The oldest live contact of a cluster.
    Primary,
    /// Any other member; links at the primary.
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Store-assigned identifier.
    pub id: ContactId,
    /// Email address, if known.
    pub email: Option<String>,
    /// Phone number, if known.
    pub phone_number: Option<String>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
    /// The cluster primary; `None` for primaries.
    pub linked_id: Option<ContactId>,
    /// Creation time; defines cluster seniority.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true for cluster primaries.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns true once the contact has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Id of the cluster primary this contact belongs to.
    #[must_use]
    pub fn root_id(&self) -> ContactId {
        self.linked_id.unwrap_or(self.id)
    }

    /// Orders contacts oldest first: by `created_at`, then by id.
    #[must_use]
    pub fn cmp_seniority(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sorts contacts oldest first.
pub fn sort_by_seniority(contacts: &mut [Contact]) {
    contacts.sort_by(Contact::cmp_seniority);
}

/// Creation request for a contact; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    /// Email address, if any.
    pub email: Option<String>,
    /// Phone number, if any.
    pub phone_number: Option<String>,
    /// Requested precedence.
    pub link_precedence: LinkPrecedence,
    /// Primary to link at (secondaries only).
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    /// A fresh identity with no existing cluster.
    #[must_use]
    pub fn primary(identifiers: &Identifiers) -> Self {
        Self {
            email: identifiers.email.clone(),
            phone_number: identifiers.phone_number.clone(),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    /// A new identifier combination for the cluster rooted at `primary`.
    #[must_use]
    pub fn secondary(identifiers: &Identifiers, primary: ContactId) -> Self {
        Self {
            email: identifiers.email.clone(),
            phone_number: identifiers.phone_number.clone(),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary),
        }
    }
}

/// A validated email / phone pair with at least one value present.
///
/// Empty strings count as absent, so `Some("")` never matches a stored
/// contact and never gets written.
///
/// # Examples
///
/// ```
/// use identity_reconciler::Identifiers;
///
/// let ids = Identifiers::new(Some("a@x.com"), Some("")).unwrap();
/// assert_eq!(ids.email(), Some("a@x.com"));
/// assert_eq!(ids.phone_number(), None);
///
/// assert!(Identifiers::new(None, Some("")).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifiers {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Identifiers {
    /// Validates an incoming identifier pair.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingIdentifier` when neither value is
    /// present and non-empty.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, ValidationError> {
        let email = non_empty(email);
        let phone_number = non_empty(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    /// The supplied email.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The supplied phone number.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Returns true when this pair carries a value the cluster does not hold yet.
    #[must_use]
    pub fn is_new_to(&self, cluster: &[Contact]) -> bool {
        let email_known = |email: &str| {
            cluster
                .iter()
                .any(|c| c.email.as_deref() == Some(email))
        };
        let phone_known = |phone: &str| {
            cluster
                .iter()
                .any(|c| c.phone_number.as_deref() == Some(phone))
        };

        self.email().is_some_and(|e| !email_known(e))
            || self.phone_number().is_some_and(|p| !phone_known(p))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Consolidated view of one identity cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    /// Id of the cluster primary.
    pub primary_contact_id: ContactId,
    /// Distinct emails, primary's first.
    pub emails: Vec<String>,
    /// Distinct phone numbers, primary's first.
    pub phone_numbers: Vec<String>,
    /// Every other member, in gather order.
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ConsolidatedContact {
    /// Builds the view for `primary` and the gathered `members`.
    ///
    /// `members` may or may not contain the primary itself. The primary's
    /// email and phone lead their lists regardless of where it sits in
    /// `members`; every other value keeps its first-seen order. Deleted
    /// members are skipped.
    #[must_use]
    pub fn from_cluster(primary: &Contact, members: &[Contact]) -> Self {
        let live = || members.iter().filter(|c| !c.is_deleted());

        let emails = distinct_values(
            primary.email.as_deref(),
            live().filter_map(|c| c.email.as_deref()),
        );
        let phone_numbers = distinct_values(
            primary.phone_number.as_deref(),
            live().filter_map(|c| c.phone_number.as_deref()),
        );

        let mut secondary_contact_ids = Vec::new();
        for member in live().filter(|c| c.id != primary.id) {
            if !secondary_contact_ids.contains(&member.id) {
                secondary_contact_ids.push(member.id);
            }
        }

        Self {
            primary_contact_id: primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        }
    }
}

fn distinct_values<'a>(
    lead: Option<&'a str>,
    rest: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for value in lead.into_iter().chain(rest) {
        if !value.is_empty() && seen.insert(value) {
            out.push(value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn contact(id: u64, email: Option<&str>, phone: Option<&str>, linked: Option<u64>) -> Contact {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let created_at = base + Duration::seconds(i64::try_from(id).unwrap());
        Contact {
            id: ContactId::new(id),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            link_precedence: if linked.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            linked_id: linked.map(ContactId::new),
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    #[test]
    fn identifiers_treat_empty_strings_as_absent() {
        assert!(matches!(
            Identifiers::new(None, None),
            Err(ValidationError::MissingIdentifier)
        ));
        assert!(Identifiers::new(Some(""), Some("")).is_err());

        let ids = Identifiers::new(Some(""), Some("123")).unwrap();
        assert_eq!(ids.email(), None);
        assert_eq!(ids.phone_number(), Some("123"));
    }

    #[test]
    fn is_new_to_only_considers_supplied_values() {
        let cluster = vec![contact(1, Some("a@x.com"), Some("111"), None)];

        let known = Identifiers::new(Some("a@x.com"), None).unwrap();
        assert!(!known.is_new_to(&cluster));

        let known_pair = Identifiers::new(Some("a@x.com"), Some("111")).unwrap();
        assert!(!known_pair.is_new_to(&cluster));

        let new_phone = Identifiers::new(Some("a@x.com"), Some("222")).unwrap();
        assert!(new_phone.is_new_to(&cluster));

        let new_email = Identifiers::new(Some("b@x.com"), None).unwrap();
        assert!(new_email.is_new_to(&cluster));
    }

    #[test]
    fn consolidated_view_puts_primary_values_first() {
        let primary = contact(1, Some("p@x.com"), Some("111"), None);
        // Primary gathered last on purpose.
        let members = vec![
            contact(2, Some("s@x.com"), Some("222"), Some(1)),
            contact(3, Some("p@x.com"), Some("222"), Some(1)),
            primary.clone(),
        ];

        let view = ConsolidatedContact::from_cluster(&primary, &members);
        assert_eq!(view.primary_contact_id, ContactId::new(1));
        assert_eq!(view.emails, vec!["p@x.com", "s@x.com"]);
        assert_eq!(view.phone_numbers, vec!["111", "222"]);
        assert_eq!(
            view.secondary_contact_ids,
            vec![ContactId::new(2), ContactId::new(3)]
        );
    }

    #[test]
    fn consolidated_view_skips_missing_and_deleted_values() {
        let primary = contact(1, None, Some("111"), None);
        let mut gone = contact(2, Some("gone@x.com"), None, Some(1));
        gone.deleted_at = Some(Utc::now());
        let members = vec![primary.clone(), gone, contact(3, Some("b@x.com"), None, Some(1))];

        let view = ConsolidatedContact::from_cluster(&primary, &members);
        assert_eq!(view.emails, vec!["b@x.com"]);
        assert_eq!(view.phone_numbers, vec!["111"]);
        assert_eq!(view.secondary_contact_ids, vec![ContactId::new(3)]);
    }

    #[test]
    fn seniority_orders_by_created_at_then_id() {
        let mut a = contact(5, Some("a"), None, None);
        let b = contact(3, Some("b"), None, None);
        a.created_at = b.created_at;

        let mut contacts = vec![a, b];
        sort_by_seniority(&mut contacts);
        assert_eq!(contacts[0].id, ContactId::new(3));
    }

    #[test]
    fn contact_serializes_with_camel_case_keys() {
        let c = contact(2, Some("a@x.com"), None, Some(1));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["linkPrecedence"], "secondary");
        assert_eq!(json["linkedId"], 1);
        assert!(json["phoneNumber"].is_null());
        assert!(json["deletedAt"].is_null());
    }
}
