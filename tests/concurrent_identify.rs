//! Concurrent resolutions must leave every cluster with exactly one primary
//! and no secondary-of-secondary links.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use identity_reconciler::{ContactStore, IdentityResolver, InMemoryContactStore, ResolverConfig};

const THREADS: usize = 8;

fn assert_clusters_consistent(store: &InMemoryContactStore) {
    let all = store.all().unwrap();
    let primaries: HashSet<_> = all.iter().filter(|c| c.is_primary()).map(|c| c.id).collect();

    for contact in &all {
        if contact.is_primary() {
            assert!(contact.linked_id.is_none(), "primary {} carries a link", contact.id);
        } else {
            let parent = contact.linked_id.expect("secondary without link");
            assert!(
                primaries.contains(&parent),
                "secondary {} links at non-primary {parent}",
                contact.id
            );
        }
    }
}

#[test]
fn same_identifiers_from_many_threads_create_one_contact() {
    let store = Arc::new(InMemoryContactStore::new());
    let resolver = Arc::new(IdentityResolver::new(store.clone()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                resolver.resolve(Some("race@x.com"), Some("42")).unwrap()
            })
        })
        .collect();

    let views: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(store.len().unwrap(), 1);
    assert!(views.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn interleaved_merges_keep_clusters_consistent() {
    let store = Arc::new(InMemoryContactStore::new());
    let resolver = Arc::new(
        IdentityResolver::with_config(store.clone(), ResolverConfig { lock_stripes: 16 }).unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let resolver = Arc::clone(&resolver);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    let email = format!("user{}@x.com", (t * 3 + i) % 20);
                    let phone = format!("{}", (t + i * 7) % 15);
                    resolver.resolve(Some(&email), Some(&phone)).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_clusters_consistent(&store);

    // One more pass over every identifier must be a pure lookup.
    let before = store.len().unwrap();
    for t in 0..THREADS {
        for i in 0..50 {
            let email = format!("user{}@x.com", (t * 3 + i) % 20);
            let phone = format!("{}", (t + i * 7) % 15);
            let view = resolver.resolve(Some(&email), Some(&phone)).unwrap();
            let root = store.get(view.primary_contact_id).unwrap().unwrap();
            assert!(root.is_primary());
        }
    }
    assert_eq!(store.len().unwrap(), before);
    assert_clusters_consistent(&store);
}
