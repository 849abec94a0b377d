//! Abstract storage trait for contacts.
//!
//! The resolver owns every reconciliation decision; a store only answers
//! queries and applies the mutations it is told to. By using a trait, we enable:
//! - In-memory backends for testing and embedded use
//! - Persistent backends for production

use thiserror::Error;

use crate::contact::{Contact, ContactId, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// A mutation would break the cluster invariants.
    #[error("Invalid contact mutation: {0}")]
    InvalidMutation(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Storage trait for contact records.
///
/// Every query excludes soft-deleted contacts except [`ContactStore::get`].
/// Query results are ordered oldest first (`created_at`, then id).
///
/// # Safety Considerations
/// - All mutations should be atomic where possible
/// - Implementations should handle concurrent access safely
pub trait ContactStore: Send + Sync {
    /// Find live contacts whose email equals `email` or whose phone equals
    /// `phone_number`. A `None` argument matches nothing.
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Find live contacts where `id = primary_id` or `linked_id = primary_id`.
    fn find_by_cluster_root(&self, primary_id: ContactId) -> Result<Vec<Contact>, StorageError>;

    /// Find live contacts with any of the given ids.
    fn find_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>, StorageError>;

    /// Get a contact by id, including soft-deleted ones.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Insert a new contact, assigning its id and timestamps.
    ///
    /// # Errors
    /// - `InvalidMutation`: no identifier, or a secondary whose `linked_id`
    ///   is not a live primary
    fn create(&self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Flip a primary to secondary and link it at `new_linked_id`.
    ///
    /// Contacts that were linked at `contact_id` are left untouched; pair this
    /// with [`ContactStore::relink_children`] or use
    /// [`ContactStore::merge_clusters`].
    fn demote(&self, contact_id: ContactId, new_linked_id: ContactId) -> Result<(), StorageError>;

    /// Re-point every contact linked at `old_primary_id` to `new_primary_id`.
    /// Returns the number of contacts updated.
    fn relink_children(
        &self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, StorageError>;

    /// Fold the clusters rooted at `demoted` into the cluster rooted at
    /// `survivor`.
    ///
    /// Backends that can apply a batch atomically must override this. The
    /// default re-links children before demoting each primary, so a reader
    /// never sees a secondary linked at another secondary.
    fn merge_clusters(&self, survivor: ContactId, demoted: &[ContactId]) -> Result<(), StorageError> {
        for &old_primary in demoted {
            self.relink_children(old_primary, survivor)?;
            self.demote(old_primary, survivor)?;
        }
        Ok(())
    }

    /// Mark a contact as deleted. Idempotent.
    fn soft_delete(&self, id: ContactId) -> Result<(), StorageError>;

    /// Durably persist pending writes. Called once at shutdown.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_contact_store_object_safe(_: &dyn ContactStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ContactNotFound(ContactId::new(12));
        assert!(err.to_string().contains("Contact not found: 12"));

        let err = StorageError::BackendError("disk full".to_string());
        assert!(err.to_string().contains("disk full"));

        let err = StorageError::InvalidMutation("contact 3 is not a primary".to_string());
        assert!(err.to_string().contains("not a primary"));
    }
}
