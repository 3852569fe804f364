use std::collections::BTreeMap;
use std::sync::Arc;

use autopersist::{
    DirectiveMap, EntityCell, EntityKind, EntitySet, EntityType, MemoryEngine, PersistError,
    PersistOrchestrator, PrimaryKey, StorageEngine, Value,
};

fn engine() -> Arc<MemoryEngine> {
    MemoryEngine::new([
        EntityType::new("User", ["id"]),
        EntityType::new("Membership", ["user_id", "group_id"]),
    ])
}

fn pk(entries: &[(&str, Value)]) -> PrimaryKey {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn persist_as_is_inserts_with_generated_key() {
    let engine = engine();
    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let user = EntityCell::new("User");
    user.set_field("value", "test").unwrap();

    let mut set = EntitySet::new();
    set.insert(user.clone());
    orchestrator.run(&set, &DirectiveMap::new()).await.unwrap();

    let id = user.field("id").unwrap().expect("engine-assigned key");
    let kind = EntityKind::new("User");
    let row = engine.row(&kind, &pk(&[("id", id)])).await.unwrap().unwrap();
    assert_eq!(row.get("value"), Some(&Value::from("test")));
}

#[tokio::test]
async fn force_update_merges_defined_fields_without_reading() {
    let engine = engine();
    let kind = EntityKind::new("User");
    let mut seeded = BTreeMap::new();
    seeded.insert("id".to_string(), Value::from(1i64));
    seeded.insert("value".to_string(), Value::from("old"));
    seeded.insert("note".to_string(), Value::from("keep"));
    engine.seed_row(&kind, seeded).await.unwrap();

    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    // Partial payload: only `value` is defined, `note` is absent.
    let patch = EntityCell::new("User");
    patch.set_field("id", 1i64).unwrap();
    patch.set_field("value", "new").unwrap();

    let directives = DirectiveMap::new();
    directives.mark_force_update(&patch).unwrap();

    let mut set = EntitySet::new();
    set.insert(patch);
    orchestrator.run(&set, &directives).await.unwrap();

    let row = engine
        .row(&kind, &pk(&[("id", Value::from(1i64))]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("value"), Some(&Value::from("new")));
    assert_eq!(row.get("note"), Some(&Value::from("keep")));
}

#[tokio::test]
async fn upsert_inserts_when_no_row_matches() {
    let engine = engine();
    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let user = EntityCell::new("User");
    user.set_field("id", 1i64).unwrap();
    user.set_field("value", "test").unwrap();

    let directives = DirectiveMap::new();
    directives.mark_for_upsert(&user).unwrap();

    let mut set = EntitySet::new();
    set.insert(user);
    orchestrator.run(&set, &directives).await.unwrap();

    let kind = EntityKind::new("User");
    let row = engine
        .row(&kind, &pk(&[("id", Value::from(1i64))]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("value"), Some(&Value::from("test")));
}

#[tokio::test]
async fn upsert_merges_onto_found_record() {
    let engine = engine();
    let kind = EntityKind::new("User");
    let mut seeded = BTreeMap::new();
    seeded.insert("id".to_string(), Value::from(1i64));
    seeded.insert("value".to_string(), Value::from("wrong"));
    seeded.insert("note".to_string(), Value::from("keep"));
    engine.seed_row(&kind, seeded).await.unwrap();

    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let user = EntityCell::new("User");
    user.set_field("id", 1i64).unwrap();
    user.set_field("value", "test").unwrap();

    let directives = DirectiveMap::new();
    directives.mark_for_upsert(&user).unwrap();

    let mut set = EntitySet::new();
    set.insert(user);
    orchestrator.run(&set, &directives).await.unwrap();

    assert_eq!(engine.row_count(&kind).await.unwrap(), 1);
    let row = engine
        .row(&kind, &pk(&[("id", Value::from(1i64))]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("value"), Some(&Value::from("test")));
    assert_eq!(row.get("note"), Some(&Value::from("keep")));
}

#[tokio::test]
async fn delete_wins_over_upsert_and_update() {
    let engine = engine();
    let kind = EntityKind::new("User");
    let mut seeded = BTreeMap::new();
    seeded.insert("id".to_string(), Value::from(1i64));
    seeded.insert("value".to_string(), Value::from("test"));
    engine.seed_row(&kind, seeded).await.unwrap();

    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let user = EntityCell::new("User");
    user.set_field("id", 1i64).unwrap();

    let directives = DirectiveMap::new();
    directives.mark_for_upsert(&user).unwrap();
    directives.mark_force_update(&user).unwrap();
    directives.mark_for_delete(&user).unwrap();

    let mut set = EntitySet::new();
    set.insert(user);
    orchestrator.run(&set, &directives).await.unwrap();

    assert_eq!(engine.row_count(&kind).await.unwrap(), 0);
}

#[tokio::test]
async fn composite_key_upsert_builds_full_key_map() {
    let engine = engine();
    let kind = EntityKind::new("Membership");
    let mut seeded = BTreeMap::new();
    seeded.insert("user_id".to_string(), Value::from(1i64));
    seeded.insert("group_id".to_string(), Value::from(7i64));
    seeded.insert("role".to_string(), Value::from("member"));
    engine.seed_row(&kind, seeded).await.unwrap();

    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let membership = EntityCell::new("Membership");
    membership.set_field("user_id", 1i64).unwrap();
    membership.set_field("group_id", 7i64).unwrap();
    membership.set_field("role", "admin").unwrap();

    let directives = DirectiveMap::new();
    directives.mark_for_upsert(&membership).unwrap();

    let mut set = EntitySet::new();
    set.insert(membership);
    orchestrator.run(&set, &directives).await.unwrap();

    assert_eq!(engine.row_count(&kind).await.unwrap(), 1);
    let row = engine
        .row(
            &kind,
            &pk(&[
                ("user_id", Value::from(1i64)),
                ("group_id", Value::from(7i64)),
            ]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("role"), Some(&Value::from("admin")));
}

#[tokio::test]
async fn missing_key_field_fails_forced_update() {
    let engine = engine();
    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    let user = EntityCell::new("User");
    user.set_field("value", "test").unwrap();

    let directives = DirectiveMap::new();
    directives.mark_force_update(&user).unwrap();

    let mut set = EntitySet::new();
    set.insert(user);
    let err = orchestrator.run(&set, &directives).await.unwrap_err();
    assert_eq!(
        err,
        PersistError::MissingPrimaryKey("id".into(), "User".into())
    );
}

#[tokio::test]
async fn empty_set_still_flushes_once() {
    let engine = engine();
    let session = engine.fork_session();
    let orchestrator = PersistOrchestrator::new(engine.clone(), session);

    orchestrator
        .run(&EntitySet::new(), &DirectiveMap::new())
        .await
        .unwrap();
    assert_eq!(engine.flush_count().await, 1);
    assert_eq!(engine.write_count().await, 0);
}
