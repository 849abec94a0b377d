//! Identity reconciliation.
//!
//! [`IdentityResolver`] holds every reconciliation decision: it matches the
//! incoming identifiers, merges clusters that turn out to be the same person,
//! records new identifier combinations and assembles the consolidated view.
//! The [`ContactStore`] it is handed only answers queries and applies
//! mutations.
//!
//! # Algorithm
//!
//! 1. Look up live contacts sharing the email or the phone number.
//! 2. No match: create a new primary and return it alone.
//! 3. Lift every match to its cluster primary. More than one primary means
//!    previously separate identities are the same person: the oldest
//!    survives and the rest are demoted in one atomic store call.
//! 4. Gather the surviving cluster.
//! 5. If the request carries a value the cluster lacks, add a secondary.
//! 6. Build the [`ConsolidatedContact`].

mod locks;

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::contact::{Contact, ContactId, ConsolidatedContact, Identifiers, NewContact};
use crate::error::{ExecutionError, ReconcileError, ReconcileResult, ValidationError};
use crate::storage::{ContactStore, StorageError};

use self::locks::StripedLocks;

/// Attempts per request before a concurrent-modification conflict surfaces.
const MAX_ATTEMPTS: usize = 8;

/// Tuning for [`IdentityResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Number of identifier lock stripes.
    pub lock_stripes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { lock_stripes: 64 }
    }
}

impl ResolverConfig {
    /// Upper bound on `lock_stripes`.
    pub const MAX_LOCK_STRIPES: usize = 1 << 16;

    /// Check the configuration, returning it unchanged when valid.
    pub fn validate(self) -> ReconcileResult<Self> {
        if self.lock_stripes == 0 || self.lock_stripes > Self::MAX_LOCK_STRIPES {
            return Err(ValidationError::InvalidConfig {
                field: "lock_stripes".to_string(),
                reason: format!(
                    "must be between 1 and {} (got {})",
                    Self::MAX_LOCK_STRIPES,
                    self.lock_stripes
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Reconciles incoming identifiers against a [`ContactStore`].
pub struct IdentityResolver {
    store: Arc<dyn ContactStore>,
    locks: StripedLocks,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("lock_stripes", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Create a resolver with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self {
            store,
            locks: StripedLocks::new(ResolverConfig::default().lock_stripes),
        }
    }

    /// Create a resolver with explicit tuning.
    pub fn with_config(store: Arc<dyn ContactStore>, config: ResolverConfig) -> ReconcileResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            store,
            locks: StripedLocks::new(config.lock_stripes),
        })
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Resolve an email and/or phone number to its consolidated identity.
    ///
    /// Empty strings count as absent.
    ///
    /// # Errors
    /// - `ValidationError::MissingIdentifier` if both are absent
    /// - `ExecutionError::Storage` if the store fails
    #[instrument(
        skip_all,
        level = "debug",
        fields(has_email = email.is_some(), has_phone = phone_number.is_some())
    )]
    pub fn resolve(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> ReconcileResult<ConsolidatedContact> {
        let identifiers = Identifiers::new(email, phone_number)?;
        self.resolve_identifiers(&identifiers)
    }

    /// Resolve an already validated identifier pair.
    pub fn resolve_identifiers(&self, identifiers: &Identifiers) -> ReconcileResult<ConsolidatedContact> {
        let _stripes = self.locks.lock(identifiers);

        let mut attempt = 1;
        loop {
            match self.reconcile(identifiers) {
                Err(err) if attempt < MAX_ATTEMPTS && is_stale(&err) => {
                    debug!(attempt, error = %err, "cluster changed during resolution; retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn reconcile(&self, identifiers: &Identifiers) -> ReconcileResult<ConsolidatedContact> {
        let matches = self
            .store
            .find_by_identifiers(identifiers.email(), identifiers.phone_number())?;

        let roots = self.live_roots(&matches)?;
        let Some((survivor, others)) = roots.split_first() else {
            return self.create_primary(identifiers, matches.len());
        };

        if !others.is_empty() {
            let demoted: Vec<ContactId> = others.iter().map(|c| c.id).collect();
            self.store.merge_clusters(survivor.id, &demoted)?;
            info!(survivor = %survivor.id, demoted = ?demoted, "merged identity clusters");
        }

        let mut cluster = self.store.find_by_cluster_root(survivor.id)?;
        let primary = cluster
            .iter()
            .find(|c| c.id == survivor.id)
            .cloned()
            .ok_or_else(|| ExecutionError::InconsistentCluster {
                primary_id: survivor.id,
                reason: "primary missing from its own cluster".to_string(),
            })?;
        if !primary.is_primary() {
            return Err(ExecutionError::InconsistentCluster {
                primary_id: primary.id,
                reason: "cluster root was demoted".to_string(),
            }
            .into());
        }

        if identifiers.is_new_to(&cluster) {
            let secondary = self
                .store
                .create(NewContact::secondary(identifiers, primary.id))?;
            debug!(contact_id = %secondary.id, primary_id = %primary.id, "recorded new secondary contact");
            cluster.push(secondary);
        }

        Ok(ConsolidatedContact::from_cluster(&primary, &cluster))
    }

    /// Live primaries of the clusters touched by `matches`, oldest first.
    ///
    /// Secondaries whose primary is deleted have no live root and are ignored.
    fn live_roots(&self, matches: &[Contact]) -> ReconcileResult<Vec<Contact>> {
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let mut root_ids: Vec<ContactId> = matches.iter().map(Contact::root_id).collect();
        root_ids.sort_unstable();
        root_ids.dedup();

        let roots = self.store.find_by_ids(&root_ids)?;
        if let Some(stale) = roots.iter().find(|c| !c.is_primary()) {
            return Err(ExecutionError::InconsistentCluster {
                primary_id: stale.id,
                reason: "matched contact links at a secondary".to_string(),
            }
            .into());
        }
        Ok(roots)
    }

    fn create_primary(
        &self,
        identifiers: &Identifiers,
        orphans: usize,
    ) -> ReconcileResult<ConsolidatedContact> {
        let contact = self.store.create(NewContact::primary(identifiers))?;
        debug!(contact_id = %contact.id, orphans, "created new primary contact");
        Ok(ConsolidatedContact::from_cluster(&contact, std::slice::from_ref(&contact)))
    }
}

/// Errors caused by another request changing a cluster between our read and
/// our write. A fresh lookup sees the new state and repairs it.
fn is_stale(err: &ReconcileError) -> bool {
    matches!(
        err,
        ReconcileError::Execution(
            ExecutionError::Storage {
                source: StorageError::InvalidMutation(_)
            } | ExecutionError::InconsistentCluster { .. }
        )
    )
}
