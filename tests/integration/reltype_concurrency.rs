#![allow(clippy::all)]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use graphkern::{
    storage::{NamedRelationshipType, RelationshipType, Store, StoreOptions},
    types::{KernelError, RelTypeId, Result},
    EntityKind,
};

fn named(name: &str) -> Arc<dyn RelationshipType> {
    Arc::new(NamedRelationshipType::new(name))
}

#[test]
fn racing_registrations_share_one_id() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let threads = 8;
    let barrier = Barrier::new(threads);
    let ids: Vec<RelTypeId> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    store.register_relationship_type(named("SHARED"), None)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;
    let distinct: HashSet<RelTypeId> = ids.into_iter().collect();
    assert_eq!(distinct.len(), 1);
    assert_eq!(store.id_allocator().high_id(EntityKind::RelationshipType), 1);
    Ok(())
}

#[test]
fn distinct_names_get_distinct_ids() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let ids: Vec<RelTypeId> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = &store;
                s.spawn(move || store.register_relationship_type(named(&format!("T{i}")), None))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;
    let distinct: HashSet<RelTypeId> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 6);
    assert_eq!(store.relationship_types().len(), 6);
    Ok(())
}

#[test]
fn name_pending_in_other_transaction_conflicts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let mut tx = store.begin()?;
    let id = store.register_relationship_type(named("PENDING"), Some(&mut tx))?;

    let other = thread::scope(|s| {
        s.spawn(|| store.register_relationship_type(named("PENDING"), None))
            .join()
            .expect("thread panicked")
    });
    assert!(matches!(other, Err(KernelError::Conflict(_))));
    assert!(!store.is_valid("PENDING"));

    tx.commit()?;
    let after = thread::scope(|s| {
        s.spawn(|| store.register_relationship_type(named("PENDING"), None))
            .join()
            .expect("thread panicked")
    })?;
    assert_eq!(after, id);
    assert_eq!(store.id_allocator().high_id(EntityKind::RelationshipType), 1);
    Ok(())
}
