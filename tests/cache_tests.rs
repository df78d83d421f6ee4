//! Cache behavior through the client facade: tiers, invalidation,
//! memory pressure, push streams, plus merge properties.
mod common;

use common::*;
use pantry_cache::prelude::*;
use pantry_cache::{ChangeSource, TieredCache};
use proptest::prelude::*;
use std::collections::HashSet;
use tempfile::TempDir;

fn durable_client(dir: &TempDir, transport: std::sync::Arc<ScriptedTransport>) -> CacheClient {
    CacheClient::new(
        CacheConfig::with_durable(DurableConfig::new(dir.path())),
        transport,
    )
}

#[tokio::test]
async fn test_deep_merge_through_client() {
    let client = CacheClient::new(CacheConfig::in_memory(), ScriptedTransport::new());
    let user = CacheKey::new("User", "1");

    client.merge(&RecordSet::new().with(user.clone(), Record::new().with("name", "Ann")));
    client.merge(&RecordSet::new().with(user.clone(), Record::new().with("email", "a@x.com")));

    let record = client.read(&user).unwrap();
    assert_eq!(record.get("name"), Some(&FieldValue::from("Ann")));
    assert_eq!(record.get("email"), Some(&FieldValue::from("a@x.com")));
}

#[tokio::test]
async fn test_cached_query_survives_new_session() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.respond("item", item_response("1", &[("name", json!("Milk"))]));

    {
        let client = durable_client(&dir, transport.clone());
        client
            .query(item_query(), json!({"id": "1"}), CachePolicy::NetworkOnly)
            .await
            .unwrap();
    }

    // A fresh client over the same directory answers from disk.
    let client = durable_client(&dir, transport.clone());
    let value = client
        .query(item_query(), json!({"id": "1"}), CachePolicy::CacheOnly)
        .await
        .unwrap();
    assert_eq!(value, Some(json!({"__typename": "Item", "id": "1", "name": "Milk"})));
    assert_eq!(transport.calls("item"), 1);
}

#[tokio::test]
async fn test_mutation_finishing_after_teardown_is_dropped() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.respond("renameItem", item_response("1", &[("name", json!("Oat milk"))]));
    let gate = transport.gate("renameItem");
    let client = durable_client(&dir, transport.clone());

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .mutate(
                    Operation::mutation("renameItem", Selection::fields(["name"])),
                    json!({"id": "1"}),
                )
                .await
        }
    });
    settle().await;
    assert_eq!(transport.calls("renameItem"), 1);

    client.teardown();
    gate.notify_one();

    let error = pending.await.unwrap().unwrap_err();
    assert!(matches!(error, CacheError::SessionUnavailable(_)));
    assert!(client.is_closed());
    assert!(client.read(&item("1")).is_none());

    // Later writes are refused too.
    let changed = client.merge(&RecordSet::new().with(item("2"), Record::new().with("name", "Eggs")));
    assert!(changed.is_empty());
    assert!(!client.invalidate("Item", "2"));

    // Nothing reached the signed-out user's directory.
    let reopened = durable_client(&dir, ScriptedTransport::new());
    assert!(reopened.read(&item("1")).is_none());
    assert!(reopened.read(&item("2")).is_none());
}

#[tokio::test]
async fn test_mutation_after_teardown_never_reaches_transport() {
    let transport = ScriptedTransport::new();
    let client = CacheClient::new(CacheConfig::in_memory(), transport.clone());
    client.teardown();

    let error = client
        .mutate(Operation::mutation("renameItem", Selection::all()), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, CacheError::SessionUnavailable(_)));
    assert_eq!(transport.calls("renameItem"), 0);
}

#[tokio::test]
async fn test_memory_pressure_is_silent_and_lossless() {
    let dir = TempDir::new().unwrap();
    let client = durable_client(&dir, ScriptedTransport::new());
    client.merge(&RecordSet::new().with(item("1"), Record::new().with("name", "Milk")));

    let recorder = Recorder::new();
    let _handle = client.subscribe(
        Operation::query("item", Selection::fields(["name"])),
        json!({"id": "1"}),
        CachePolicy::CacheOnly,
        recorder.callback(),
    );
    let mut changes = client.changes();
    let before = recorder.count();

    assert!(client.handle_memory_pressure() >= 1);
    assert_eq!(client.stats().cache.volatile.current_size, 0);
    assert!(changes.try_recv().is_err());
    assert_eq!(recorder.count(), before);

    // Still served, now from disk.
    assert!(client.read(&item("1")).is_some());
}

#[tokio::test]
async fn test_invalidate_type_recomputes_dependents() {
    let transport = ScriptedTransport::new();
    transport.respond("items", items_response(&[("1", "Milk"), ("2", "Eggs")]));
    let client = CacheClient::new(CacheConfig::in_memory(), transport);

    let recorder = Recorder::new();
    let _handle = client.subscribe(
        items_query(),
        json!(null),
        CachePolicy::CacheElseNetwork,
        recorder.callback(),
    );
    recorder.wait_for(2).await;
    let mut changes = client.changes();

    assert_eq!(client.invalidate_type("Item"), 2);

    let batch = changes.recv().await.unwrap();
    assert_eq!(batch.source, ChangeSource::Invalidation);
    assert_eq!(batch.keys, vec![item("1"), item("2")]);
    assert_eq!(recorder.last_value(), Some(json!([null, null])));
}

#[tokio::test]
async fn test_clear_all_tells_watches() {
    let transport = ScriptedTransport::new();
    transport.respond("item", item_response("1", &[("name", json!("Milk"))]));
    let client = CacheClient::new(CacheConfig::in_memory(), transport);

    let recorder = Recorder::new();
    let _handle = client.subscribe(
        item_query(),
        json!({"id": "1"}),
        CachePolicy::NetworkOnly,
        recorder.callback(),
    );
    recorder.wait_for(2).await;

    client.clear_all();

    let last = recorder.last().unwrap();
    assert_eq!(last.value, None);
    assert!(client.read(&item("1")).is_none());
}

#[tokio::test]
async fn test_push_stream_merges_like_fetches() {
    let transport = ScriptedTransport::new();
    transport.respond("item", item_response("1", &[("name", json!("Milk"))]));
    let pushes = transport.push_channel("itemChanged");
    let client = CacheClient::new(CacheConfig::in_memory(), transport);

    let recorder = Recorder::new();
    let _handle = client.subscribe(
        item_query(),
        json!({"id": "1"}),
        CachePolicy::CacheElseNetwork,
        recorder.callback(),
    );
    recorder.wait_for(2).await;

    let listener = client
        .listen(Operation::subscription("itemChanged", Selection::all()), json!(null))
        .await
        .unwrap();
    pushes
        .unbounded_send(Ok(RecordSet::new().with(item("1"), Record::new().with("name", "Oat milk"))))
        .unwrap();

    recorder.wait_for(3).await;
    assert_eq!(recorder.last_value().unwrap()["name"], json!("Oat milk"));
    assert_eq!(client.stats().live_listeners, 1);

    listener.cancel();
    settle().await;
    assert!(listener.is_finished());
}

#[tokio::test]
async fn test_push_after_listener_cancel_is_dropped() {
    let transport = ScriptedTransport::new();
    let pushes = transport.push_channel("itemChanged");
    let client = CacheClient::new(CacheConfig::in_memory(), transport);

    let listener = client
        .listen(Operation::subscription("itemChanged", Selection::all()), json!(null))
        .await
        .unwrap();
    client.cancel_listeners();
    settle().await;

    let _ = pushes.unbounded_send(Ok(RecordSet::new().with(item("1"), Record::new().with("name", "Late"))));
    settle().await;

    assert!(listener.is_finished());
    assert!(client.read(&item("1")).is_none());
}

#[tokio::test]
async fn test_malformed_record_does_not_block_the_rest() {
    let client = CacheClient::new(CacheConfig::in_memory(), ScriptedTransport::new());
    let changed = client.merge(
        &RecordSet::new()
            .with(item("1"), Record::new().with("meta", json!({"inline": true})))
            .with(item("2"), Record::new().with("name", "Eggs")),
    );

    assert_eq!(changed, HashSet::from([item("2")]));
    assert_eq!(client.stats().cache.skipped_records, 1);
}

fn arb_record_set() -> impl Strategy<Value = RecordSet> {
    let field = prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(|s| json!(s)),
        any::<bool>().prop_map(|b| json!(b)),
    ];
    let record = prop::collection::btree_map("[a-c]", field, 0..4);
    prop::collection::vec(("[A-C]", "[0-3]", record), 0..8).prop_map(|entries| {
        let mut set = RecordSet::new();
        for (type_name, id, fields) in entries {
            let mut record = Record::new();
            for (name, value) in fields {
                record.set(name, value);
            }
            set.insert(CacheKey::new(type_name, id), record);
        }
        set
    })
}

proptest! {
    #[test]
    fn prop_merge_is_idempotent(set in arb_record_set()) {
        let cache = TieredCache::open(CacheConfig::in_memory());
        cache.merge(&set);
        let keys: HashSet<CacheKey> = set.keys().cloned().collect();
        let first = cache.load(&keys);

        let changed = cache.merge(&set);
        prop_assert!(changed.is_empty());
        prop_assert_eq!(cache.load(&keys), first);
    }

    #[test]
    fn prop_merge_preserves_unspecified_fields(a in arb_record_set(), b in arb_record_set()) {
        let cache = TieredCache::open(CacheConfig::in_memory());
        cache.merge(&a);
        cache.merge(&b);

        for (key, record) in a.iter() {
            if record.is_empty() {
                continue;
            }
            let stored = cache.read(key);
            prop_assert!(stored.is_some());
            let stored = stored.unwrap();
            for (name, value) in record.fields() {
                let overwritten = b.get(key).and_then(|r| r.get(name));
                let expected = overwritten.unwrap_or(value);
                prop_assert_eq!(stored.get(name), Some(expected));
            }
        }
    }
}
