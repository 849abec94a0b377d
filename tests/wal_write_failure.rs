//! A write that fails partway must not reappear after restart.
//!
//! Lowers the process file size limit, so this file holds a single test and
//! runs as its own binary.

#![cfg(all(unix, feature = "persistent"))]

use identity_reconciler::storage::{open_database, PersistentConfig};
use identity_reconciler::{ContactId, ContactStore, Identifiers, LinkPrecedence, NewContact};
use tempfile::tempdir;

fn config() -> Option<PersistentConfig> {
    Some(PersistentConfig {
        sync_on_write: false,
        ..PersistentConfig::default()
    })
}

/// Sets the file size limit, returning the previous one.
fn limit_file_size(bytes: u64) -> libc::rlimit {
    // SAFETY: plain libc calls on stack-owned structs.
    unsafe {
        libc::signal(libc::SIGXFSZ, libc::SIG_IGN);
        let mut old = std::mem::zeroed::<libc::rlimit>();
        assert_eq!(libc::getrlimit(libc::RLIMIT_FSIZE, &mut old), 0);
        let new = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: old.rlim_max,
        };
        assert_eq!(libc::setrlimit(libc::RLIMIT_FSIZE, &new), 0);
        old
    }
}

fn restore_file_size(old: &libc::rlimit) {
    // SAFETY: see `limit_file_size`.
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_FSIZE, old), 0);
    }
}

fn primary(store: &dyn ContactStore, email: &str) -> identity_reconciler::Contact {
    let ids = Identifiers::new(Some(email), None).unwrap();
    store.create(NewContact::primary(&ids)).unwrap()
}

#[test]
fn failed_merge_is_not_replayed() {
    let dir = tempdir().unwrap();

    {
        let store = open_database(dir.path(), config()).unwrap();
        let p1 = primary(&store, "a@x.com");
        let p2 = primary(&store, "b@x.com");

        // Room for only a fragment of the merge record.
        let old = limit_file_size(store.wal_size().unwrap() + 10);
        let result = store.merge_clusters(p1.id, &[p2.id]);
        restore_file_size(&old);

        assert!(result.is_err());
        assert!(store.get(p2.id).unwrap().unwrap().is_primary());

        // Later writes land cleanly after the rolled-back fragment.
        primary(&store, "c@x.com");
        store.flush().unwrap();
    }

    let store = open_database(dir.path(), config()).unwrap();
    assert_eq!(store.len().unwrap(), 3);
    let ids: Vec<ContactId> = (1..=3).map(ContactId::new).collect();
    for contact in store.find_by_ids(&ids).unwrap() {
        assert_eq!(contact.link_precedence, LinkPrecedence::Primary, "{contact:?}");
    }
}
