#![allow(clippy::all)]

use std::mem;
use std::sync::{Arc, Once};
use std::thread;

use graphkern::{
    command::{Command, CommandState, Mutation},
    event::{EventData, EventKind},
    storage::{NamedRelationshipType, RelationshipType, Store, StoreOptions, NAME_CAPACITY},
    txn::TxStatus,
    types::{KernelError, RelTypeId, Result},
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("graphkern=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[derive(Debug)]
enum Rel {
    Friend,
    Likes,
    Knows,
}

impl RelationshipType for Rel {
    fn name(&self) -> &str {
        match self {
            Rel::Friend => "FRIEND",
            Rel::Likes => "LIKES",
            Rel::Knows => "KNOWS",
        }
    }
}

fn named(name: &str) -> Arc<dyn RelationshipType> {
    Arc::new(NamedRelationshipType::new(name))
}

fn count_pro_active(store: &Store, kind: EventKind) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&count);
    store.events().register_pro_active(
        kind,
        Arc::new(move |_: EventKind, _: &EventData<'_>| {
            *seen.lock() += 1;
            true
        }),
    );
    count
}

#[test]
fn register_is_idempotent() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let gate = count_pro_active(&store, EventKind::RelationshipTypeCreate);

    assert!(!store.is_valid("LIKES"));
    let id = store.register_relationship_type(Arc::new(Rel::Likes), None)?;
    assert!(store.is_valid("LIKES"));
    assert_eq!(*gate.lock(), 1);

    let again = store.register_relationship_type(Arc::new(Rel::Likes), None)?;
    assert_eq!(again, id);
    assert_eq!(*gate.lock(), 1);
    assert_eq!(store.id_allocator().high_id(graphkern::EntityKind::RelationshipType), 1);
    Ok(())
}

#[test]
fn veto_leaves_name_invalid_and_marks_rollback_only() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let veto = store.events().register_pro_active(
        EventKind::RelationshipTypeCreate,
        Arc::new(|_: EventKind, data: &EventData<'_>| {
            let name = match data.command().and_then(|c| c.mutation()) {
                Some(Mutation::CreateRelationshipType { name, .. }) => name.clone(),
                _ => return true,
            };
            name != "LIKES"
        }),
    );
    let re_active = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&re_active);
    store.events().register_re_active(
        EventKind::RelationshipTypeCreate,
        Arc::new(move |_: EventKind, data: &EventData<'_>| -> Result<()> {
            if let Some(Mutation::CreateRelationshipType { name, .. }) =
                data.command().and_then(|c| c.mutation())
            {
                seen.lock().push(name.clone());
            }
            Ok(())
        }),
    );

    let mut tx = store.begin()?;
    let err = store
        .register_relationship_type(Arc::new(Rel::Likes), Some(&mut tx))
        .unwrap_err();
    assert!(err.is_veto());
    assert!(!err.is_execution_failure());
    assert_eq!(tx.status(), TxStatus::MarkedRollback);
    assert!(matches!(tx.commit(), Err(KernelError::RolledBack(_))));
    assert!(!store.is_valid("LIKES"));

    assert!(store.events().unregister_pro_active(EventKind::RelationshipTypeCreate, veto));
    let knows = store.register_relationship_type(Arc::new(Rel::Knows), None)?;
    assert_eq!(knows, RelTypeId(1));
    assert!(store.is_valid("KNOWS"));
    assert_eq!(*re_active.lock(), vec!["KNOWS".to_owned()]);
    Ok(())
}

#[test]
fn store_write_failure_is_distinct_from_veto() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let gate = count_pro_active(&store, EventKind::RelationshipTypeCreate);
    let long = "R".repeat(NAME_CAPACITY + 1);
    let err = store.register_relationship_type(named(&long), None).unwrap_err();
    assert!(err.is_execution_failure());
    assert!(!err.is_veto());
    assert_eq!(*gate.lock(), 0);
    assert!(!store.is_valid(&long));
    assert!(!store.is_transaction_active());
    let next = store.register_relationship_type(named("SHORT"), None)?;
    assert_eq!(next, RelTypeId(1));
    Ok(())
}

#[test]
fn friend_end_to_end_across_reopen() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let friend: Arc<dyn RelationshipType> = Arc::new(Rel::Friend);
    {
        let store = Store::create(dir.path(), StoreOptions::default())?;
        let mut tx = store.begin()?;
        let id = store.register_relationship_type(Arc::clone(&friend), Some(&mut tx))?;
        assert_eq!(id, RelTypeId(0));
        assert!(!store.is_valid("FRIEND"));
        tx.commit()?;

        let tx = store.begin()?;
        assert_eq!(store.get_id_for(friend.as_ref()), Some(RelTypeId(0)));
        let handle = store.get_relationship_type(RelTypeId(0)).expect("handle");
        assert!(Arc::ptr_eq(&handle, &friend));
        tx.commit()?;
        store.close()?;
    }
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert_eq!(store.id_for_name("FRIEND"), Some(RelTypeId(0)));
    let handle = store.get_relationship_type(RelTypeId(0)).expect("handle");
    assert_eq!(handle.name(), "FRIEND");
    assert_eq!(
        store.register_relationship_type(Arc::clone(&friend), None)?,
        RelTypeId(0)
    );
    let rebound = store.get_relationship_type(RelTypeId(0)).expect("handle");
    assert!(Arc::ptr_eq(&rebound, &friend));
    Ok(())
}

#[test]
fn undo_twice_does_not_corrupt_registry() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    store.register_relationship_type(named("KEEP"), None)?;

    let mut tx = store.begin()?;
    let id = RelTypeId(store.id_allocator().next_id(graphkern::EntityKind::RelationshipType)? as u32);
    let slot = tx.add_command(Command::with_mutation(Mutation::CreateRelationshipType {
        id,
        name: "TEMP".into(),
    }))?;
    tx.execute(slot)?;
    assert_eq!(tx.command(slot)?.state(), CommandState::Executed);
    tx.undo(slot)?;
    tx.undo(slot)?;
    assert_eq!(tx.command(slot)?.state(), CommandState::Undone);
    tx.commit()?;

    assert!(!store.is_valid("TEMP"));
    assert!(store.is_valid("KEEP"));
    assert_eq!(store.relationship_types().len(), 1);
    Ok(())
}

#[test]
fn rollback_undoes_in_reverse_order() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    store.register_relationship_type(named("OLD"), None)?;

    let mut tx = store.begin()?;
    store.delete_relationship_type("OLD", Some(&mut tx))?;
    store.register_relationship_type(named("NEW"), Some(&mut tx))?;
    assert_eq!(tx.command_count(), 2);
    assert!(store.is_valid("OLD"));
    tx.rollback()?;

    assert!(store.is_valid("OLD"));
    assert!(!store.is_valid("NEW"));
    store.close()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert_eq!(store.relationship_types().len(), 1);
    assert!(store.is_valid("OLD"));
    Ok(())
}

#[test]
fn delete_becomes_final_on_commit() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let gate = count_pro_active(&store, EventKind::RelationshipTypeDelete);
    let id = store.register_relationship_type(named("GONE"), None)?;
    assert_eq!(store.delete_relationship_type("GONE", None)?, id);
    assert_eq!(*gate.lock(), 1);
    assert!(!store.is_valid("GONE"));
    assert!(store.get_relationship_type(id).is_none());
    assert!(matches!(
        store.delete_relationship_type("GONE", None),
        Err(KernelError::Invalid(_))
    ));
    store.close()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert!(!store.is_valid("GONE"));
    Ok(())
}

#[test]
fn vetoed_delete_keeps_type() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    store.register_relationship_type(named("STAYS"), None)?;
    store.events().register_pro_active(
        EventKind::RelationshipTypeDelete,
        Arc::new(|_: EventKind, _: &EventData<'_>| false),
    );
    let err = store.delete_relationship_type("STAYS", None).unwrap_err();
    assert!(matches!(err, KernelError::Vetoed { kind: EventKind::RelationshipTypeDelete }));
    assert!(store.is_valid("STAYS"));
    store.close()?;
    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert!(store.is_valid("STAYS"));
    Ok(())
}

#[test]
fn add_valid_registers_every_handle() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    store.register_relationship_type(Arc::new(Rel::Knows), None)?;
    let handles: Vec<Arc<dyn RelationshipType>> =
        vec![Arc::new(Rel::Friend), Arc::new(Rel::Likes), Arc::new(Rel::Knows)];
    let ids = store.add_valid_relationship_types(&handles)?;
    assert_eq!(ids, vec![RelTypeId(1), RelTypeId(2), RelTypeId(0)]);
    let names: Vec<String> = store
        .relationship_types()
        .into_iter()
        .map(|raw| raw.name)
        .collect();
    assert_eq!(names, vec!["KNOWS", "FRIEND", "LIKES"]);
    Ok(())
}

#[test]
fn events_follow_transaction_order() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::TxBegin, EventKind::TxCommit, EventKind::RelationshipTypeCreate] {
        let pro = Arc::clone(&log);
        store.events().register_pro_active(
            kind,
            Arc::new(move |kind: EventKind, _: &EventData<'_>| {
                pro.lock().push(format!("pro:{kind}"));
                true
            }),
        );
        let re = Arc::clone(&log);
        store.events().register_re_active(
            kind,
            Arc::new(move |kind: EventKind, _: &EventData<'_>| -> Result<()> {
                re.lock().push(format!("re:{kind}"));
                Ok(())
            }),
        );
    }
    store.register_relationship_type(named("ORDERED"), None)?;
    assert_eq!(
        *log.lock(),
        vec![
            "re:tx_begin",
            "pro:relationship_type_create",
            "re:relationship_type_create",
            "re:tx_commit",
        ]
    );
    Ok(())
}

#[test]
fn empty_name_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    assert!(matches!(
        store.register_relationship_type(named(""), None),
        Err(KernelError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn uncommitted_create_is_not_durable_after_crash() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let mut tx = store.begin()?;
    store.register_relationship_type(named("PENDING"), Some(&mut tx))?;

    thread::scope(|s| {
        s.spawn(|| store.register_relationship_type(named("OTHER"), None))
            .join()
            .expect("thread panicked")
    })?;
    assert!(!store.is_valid("PENDING"));

    // Crash: neither the open transaction nor the store gets to clean up.
    mem::forget(tx);
    mem::forget(store);

    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert!(!store.is_valid("PENDING"));
    assert!(store.is_valid("OTHER"));
    assert_eq!(store.relationship_types().len(), 1);
    Ok(())
}

#[test]
fn uncommitted_delete_is_not_durable_after_crash() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let id = store.register_relationship_type(named("KEEP"), None)?;
    let mut tx = store.begin()?;
    store.delete_relationship_type("KEEP", Some(&mut tx))?;

    thread::scope(|s| {
        s.spawn(|| store.register_relationship_type(named("OTHER"), None))
            .join()
            .expect("thread panicked")
    })?;

    mem::forget(tx);
    mem::forget(store);

    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert_eq!(store.id_for_name("KEEP"), Some(id));
    assert!(store.is_valid("OTHER"));
    Ok(())
}

#[test]
fn evicted_pending_record_is_not_durable() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let opts = StoreOptions {
        records_per_window: 1,
        cache_windows: 1,
        ..StoreOptions::default()
    };
    let store = Store::create(dir.path(), opts)?;
    let mut tx = store.begin()?;
    store.register_relationship_type(named("FIRST"), Some(&mut tx))?;
    store.register_relationship_type(named("SECOND"), Some(&mut tx))?;
    assert!(store.windows().stats().writebacks >= 1);

    mem::forget(tx);
    mem::forget(store);

    let store = Store::open(dir.path(), StoreOptions::default())?;
    assert!(store.relationship_types().is_empty());
    assert!(!store.is_valid("FIRST"));
    Ok(())
}

#[test]
fn reregister_after_own_delete_is_invalid() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path(), StoreOptions::default())?;
    let id = store.register_relationship_type(named("X"), None)?;

    let mut tx = store.begin()?;
    store.delete_relationship_type("X", Some(&mut tx))?;
    assert!(matches!(
        store.register_relationship_type(named("X"), Some(&mut tx)),
        Err(KernelError::Invalid(_))
    ));
    assert!(matches!(
        store.delete_relationship_type("X", Some(&mut tx)),
        Err(KernelError::Invalid(_))
    ));
    tx.rollback()?;
    assert_eq!(store.id_for_name("X"), Some(id));
    Ok(())
}
