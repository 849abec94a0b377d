//! # identity-reconciler - contact identity reconciliation
//!
//! Given an email and/or a phone number, decide which known person they
//! belong to, merge identity clusters that turn out to be the same person,
//! and return a consolidated view of every identifier tied to that person.
//!
//! ## Core Concepts
//!
//! - **Contact**: one identifier record, either the cluster `primary` or a
//!   `secondary` linking directly at it
//! - **Cluster**: all contacts of one person; the oldest contact is primary
//! - **IdentityResolver**: the reconciliation algorithm, run against any
//!   [`ContactStore`]
//! - **ConsolidatedContact**: the deduplicated view returned to callers
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use identity_reconciler::{IdentityResolver, InMemoryContactStore};
//!
//! let resolver = IdentityResolver::new(Arc::new(InMemoryContactStore::new()));
//!
//! let first = resolver.resolve(Some("lorraine@hillvalley.edu"), Some("123456"))?;
//! let second = resolver.resolve(Some("mcfly@hillvalley.edu"), Some("123456"))?;
//!
//! assert_eq!(first.primary_contact_id, second.primary_contact_id);
//! assert_eq!(second.emails, vec!["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]);
//! # Ok::<(), identity_reconciler::ReconcileError>(())
//! ```
//!
//! ## Features
//!
//! - `persistent`: WAL-backed on-disk store ([`storage::open_database`])
//! - `transport-http`: axum router exposing `POST /identify`
//! - `server`: both of the above plus the `identity-server` binary

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod contact;
pub mod error;
pub mod identify;
pub mod resolver;
pub mod storage;

#[cfg(feature = "transport-http")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use contact::{Contact, ContactId, ConsolidatedContact, Identifiers, LinkPrecedence, NewContact};
pub use error::{ExecutionError, ReconcileError, ReconcileResult, ValidationError};
pub use identify::{IdentifyRequest, IdentifyResponse};
pub use resolver::{IdentityResolver, ResolverConfig};
pub use storage::{ContactStore, InMemoryContactStore, StorageError};
