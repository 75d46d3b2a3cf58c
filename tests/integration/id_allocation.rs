#![allow(clippy::all)]

use std::sync::Arc;

use graphkern::{
    idgen::{EntityKind, FileIdSource, IdAllocator, IdAllocatorModule, PersistenceSource},
    storage::{NamedRelationshipType, Store, StoreOptions, ID_FILE_NAME},
    types::{KernelError, Result},
    EventData, EventKind, RelationshipType,
};

fn named(name: &str) -> Arc<dyn RelationshipType> {
    Arc::new(NamedRelationshipType::new(name))
}

#[test]
fn high_ids_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ids");
    {
        let allocator = Arc::new(IdAllocator::new());
        let module = IdAllocatorModule::new(Arc::clone(&allocator));
        module.set_persistence_source(Arc::new(FileIdSource::open(&path)?))?;
        module.start()?;
        for _ in 0..5 {
            allocator.next_id(EntityKind::Node)?;
        }
        allocator.next_id(EntityKind::Property)?;
        module.stop()?;
    }
    let source = FileIdSource::open(&path)?;
    let high = source.load_high_ids()?;
    assert_eq!(high.get(EntityKind::Node), 5);
    assert_eq!(high.get(EntityKind::Property), 1);
    assert_eq!(high.get(EntityKind::RelationshipType), 0);

    let allocator = IdAllocator::new();
    allocator.configure(Arc::new(source))?;
    assert_eq!(allocator.next_id(EntityKind::Node)?, 5);
    Ok(())
}

#[test]
fn undone_ids_are_never_reissued() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let first = store.register_relationship_type(named("A"), None)?;
    let mut tx = store.begin()?;
    let second = store.register_relationship_type(named("B"), Some(&mut tx))?;
    tx.rollback()?;
    assert!(!store.is_valid("B"));
    let third = store.register_relationship_type(named("C"), None)?;
    assert!(first < second && second < third);
    assert_eq!(store.id_allocator().high_id(EntityKind::RelationshipType), 3);
    store.close()?;

    let store = Store::open(dir.path(), StoreOptions::default())?;
    let fourth = store.register_relationship_type(named("B"), None)?;
    assert!(fourth > third);
    Ok(())
}

#[test]
fn reserved_id_outlives_veto_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = Store::create(dir.path(), StoreOptions::default())?;
        store.events().register_pro_active(
            EventKind::RelationshipTypeCreate,
            Arc::new(|_: EventKind, _: &EventData<'_>| false),
        );
        let err = store.register_relationship_type(named("LIKES"), None).unwrap_err();
        assert!(err.is_veto());
        store.close()?;
    }
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert_eq!(store.register_relationship_type(named("KNOWS"), None)?.0, 1);
    Ok(())
}

#[test]
fn corrupt_id_file_fails_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    Store::create(dir.path(), StoreOptions::default())?.close()?;
    let path = dir.path().join(ID_FILE_NAME);
    let mut bytes = std::fs::read(&path)?;
    bytes[0] ^= 0xff;
    std::fs::write(&path, bytes)?;
    assert!(matches!(
        Store::open(dir.path(), StoreOptions::default()),
        Err(KernelError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn reload_is_rejected() {
    let module = IdAllocatorModule::new(Arc::new(IdAllocator::new()));
    assert!(matches!(module.reload(), Err(KernelError::AllocatorMisuse(_))));
}
