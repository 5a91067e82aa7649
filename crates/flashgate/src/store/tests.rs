use crate::{
    EntryId, Error, KvStore, ManualClock, MemoryStore, ReadOffset, Result, Script, ScriptContext,
};
use core::time::Duration;
use std::sync::Arc;

fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

// Non-atomic read-modify-write; only correct because the store runs scripts
// without interleaving.
fn bump(ctx: &mut dyn ScriptContext, keys: &[String], _args: &[String]) -> Result<i64> {
    let current: i64 = ctx
        .get(&keys[0])?
        .map_or(Ok(0), |v| v.parse())
        .map_err(|_| Error::store("not a number"))?;
    ctx.set(&keys[0], (current + 1).to_string(), None)?;
    Ok(current + 1)
}

static BUMP: Script = Script::new("bump", "-- test only", bump);

#[tokio::test]
async fn ttl_expires_with_clock() {
    let clock = ManualClock::new(1_000);
    let store = MemoryStore::with_clock(clock.clone());

    store
        .set("k", "v", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    store.set("forever", "v", None).await.unwrap();
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

    clock.advance(Duration::from_millis(1_999));
    assert!(store.get("k").await.unwrap().is_some());

    clock.advance(Duration::from_millis(1));
    assert!(store.get("k").await.unwrap().is_none());
    assert_eq!(store.len(), 1);

    clock.advance(Duration::from_secs(86_400));
    assert!(store.get("forever").await.unwrap().is_some());
}

#[tokio::test]
async fn huge_ttl_does_not_wrap_into_the_past() {
    let clock = ManualClock::new(1_000);
    let store = MemoryStore::with_clock(clock.clone());
    store.set("forever", "v", Some(Duration::MAX)).await.unwrap();
    clock.advance(Duration::from_secs(365 * 24 * 3_600));
    assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn set_nx_only_writes_absent_keys() {
    let clock = ManualClock::new(0);
    let store = MemoryStore::with_clock(clock.clone());

    assert!(store.set_nx("lock", "a", Duration::from_secs(1)).await.unwrap());
    assert!(!store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
    assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));

    clock.advance(Duration::from_secs(1));
    assert!(store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
    assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
}

#[tokio::test]
async fn incr_counts_from_zero_and_rejects_text() {
    let store = MemoryStore::new();
    assert_eq!(store.incr("n").await.unwrap(), 1);
    assert_eq!(store.incr("n").await.unwrap(), 2);

    store.set("word", "abc", None).await.unwrap();
    assert!(matches!(store.incr("word").await, Err(Error::Store { .. })));
}

#[tokio::test]
async fn del_reports_whether_a_live_key_existed() {
    let store = MemoryStore::new();
    store.set("k", "v", None).await.unwrap();
    assert!(store.del("k").await.unwrap());
    assert!(!store.del("k").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scripts_do_not_interleave() {
    let store = Arc::new(MemoryStore::new());
    let keys = vec!["counter".to_string()];

    let mut handles = Vec::new();
    for _ in 0..64 {
        let store = Arc::clone(&store);
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.eval(&BUMP, &keys, &[]).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("3200"));
}

#[tokio::test]
async fn set_commands_reject_string_keys() {
    fn sadd_on_string(ctx: &mut dyn ScriptContext, _: &[String], _: &[String]) -> Result<i64> {
        ctx.sadd("plain", "x").map(i64::from)
    }
    static SADD: Script = Script::new("sadd", "-- test only", sadd_on_string);

    let store = MemoryStore::new();
    store.set("plain", "v", None).await.unwrap();
    let err = store.eval(&SADD, &[], &[]).await.unwrap_err();
    assert!(matches!(err, Error::WrongType { key } if key == "plain"));
}

#[tokio::test]
async fn consumer_group_delivers_once_and_tracks_pending() {
    let store = MemoryStore::with_clock(ManualClock::new(5));
    assert!(store.xgroup_create("s", "g").await.unwrap());
    assert!(!store.xgroup_create("s", "g").await.unwrap());

    let first = store.xadd("s", &fields(&[("n", "1")])).await.unwrap();
    let second = store.xadd("s", &fields(&[("n", "2")])).await.unwrap();
    assert_eq!(first, EntryId::new(5, 0));
    assert_eq!(second, EntryId::new(5, 1));

    let batch = store
        .xread_group("s", "g", "c1", ReadOffset::NewEntries, 1, None)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].field("n"), Some("1"));

    // Another member of the group only sees what has not been delivered.
    let batch = store
        .xread_group("s", "g", "c2", ReadOffset::NewEntries, 10, None)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, second);
    assert_eq!(store.xpending("s", "g").await.unwrap(), 2);

    // Pending replay is scoped to the reading consumer.
    let replay = store
        .xread_group("s", "g", "c1", ReadOffset::After(EntryId::ZERO), 10, None)
        .await
        .unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].id, first);

    assert!(store.xack("s", "g", first).await.unwrap());
    assert!(!store.xack("s", "g", first).await.unwrap());
    assert_eq!(store.xpending("s", "g").await.unwrap(), 1);

    let replay = store
        .xread_group("s", "g", "c1", ReadOffset::After(EntryId::ZERO), 10, None)
        .await
        .unwrap();
    assert!(replay.is_empty());
}

#[tokio::test]
async fn group_created_after_appends_sees_earlier_records() {
    let store = MemoryStore::new();
    store.xadd("s", &fields(&[("n", "old")])).await.unwrap();
    store.xgroup_create("s", "g").await.unwrap();
    store.xadd("s", &fields(&[("n", "new")])).await.unwrap();

    let batch = store
        .xread_group("s", "g", "c", ReadOffset::NewEntries, 10, None)
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].field("n"), Some("old"));
    assert_eq!(batch[1].field("n"), Some("new"));
    assert_eq!(store.stream_len("s"), 2);
}

#[tokio::test]
async fn reading_an_unknown_group_fails() {
    let store = MemoryStore::new();
    let err = store
        .xread_group("s", "missing", "c", ReadOffset::NewEntries, 1, None)
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_read_wakes_on_append() {
    let store = Arc::new(MemoryStore::new());
    store.xgroup_create("s", "g").await.unwrap();

    let reader = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .xread_group(
                    "s",
                    "g",
                    "c",
                    ReadOffset::NewEntries,
                    1,
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    store.xadd("s", &fields(&[("n", "1")])).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should wake before its own timeout")
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn blocking_read_times_out_empty() {
    let store = MemoryStore::new();
    store.xgroup_create("s", "g").await.unwrap();

    let started = std::time::Instant::now();
    let batch = store
        .xread_group(
            "s",
            "g",
            "c",
            ReadOffset::NewEntries,
            1,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn entry_id_text_form() {
    let id: EntryId = "1700000000000-3".parse().unwrap();
    assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
    assert_eq!(id.to_string(), "1700000000000-3");
    assert!("nope".parse::<EntryId>().is_err());
    assert!(EntryId::new(1, 9) < EntryId::new(2, 0));
    assert_eq!(EntryId::new(7, 2).successor(3), EntryId::new(7, 3));
    assert_eq!(EntryId::new(7, 2).successor(8), EntryId::new(8, 0));
}
