//! Striped per-identifier locks.
//!
//! Two requests that share an email or a phone number hash to at least one
//! common stripe and run one after the other. Stripes are always taken in
//! ascending index order, so requests holding two stripes cannot deadlock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::contact::Identifiers;

const EMAIL_DOMAIN: &[u8] = b"email";
const PHONE_DOMAIN: &[u8] = b"phone";

/// Fixed-size table of mutexes keyed by identifier hash.
#[derive(Debug)]
pub(crate) struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

/// Held stripes; released on drop.
#[must_use = "stripes are released as soon as the guard is dropped"]
pub(crate) struct StripeGuard<'a> {
    _held: Vec<MutexGuard<'a, ()>>,
}

impl StripedLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_of(&self, domain: &[u8], value: &str) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain);
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        let hash = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        // Stripe counts fit in usize, so the remainder does too.
        #[allow(clippy::cast_possible_truncation)]
        let index = (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize;
        index
    }

    /// Stripe indices covering `identifiers`, sorted and deduplicated.
    pub(crate) fn stripes_for(&self, identifiers: &Identifiers) -> Vec<usize> {
        let mut indices: Vec<usize> = identifiers
            .email()
            .map(|e| self.stripe_of(EMAIL_DOMAIN, e))
            .into_iter()
            .chain(identifiers.phone_number().map(|p| self.stripe_of(PHONE_DOMAIN, p)))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Block until every stripe covering `identifiers` is held.
    ///
    /// A poisoned stripe is recovered: it guards no data, only ordering.
    pub(crate) fn lock(&self, identifiers: &Identifiers) -> StripeGuard<'_> {
        let held = self
            .stripes_for(identifiers)
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        StripeGuard { _held: held }
    }
}
