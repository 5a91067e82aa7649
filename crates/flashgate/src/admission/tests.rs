use crate::{
    Admission, AdmissionController, Error, KvStore, MemoryStore, ORDER_STREAM, ReadOffset,
    SECKILL_SCRIPT, buyers_key, stock_key,
};
use std::sync::Arc;

fn controller() -> (AdmissionController<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (AdmissionController::new(Arc::clone(&store)), store)
}

#[test]
fn codes_map_to_outcomes() {
    for outcome in [Admission::Accepted, Admission::SoldOut, Admission::Duplicate] {
        assert_eq!(Admission::try_from(outcome.code()).unwrap(), outcome);
    }
    assert!(matches!(
        Admission::try_from(7),
        Err(Error::UnexpectedScriptResult { script: "seckill", code: 7 })
    ));
    assert_eq!(stock_key(3), "seckill:stock:3");
    assert_eq!(buyers_key(3), "seckill:order:3");
}

#[tokio::test]
async fn accepts_then_rejects_duplicates_and_sells_out() {
    let (gate, store) = controller();
    gate.publish(10, 2).await.unwrap();

    assert_eq!(gate.admit(10, 1, 100).await.unwrap(), Admission::Accepted);
    assert_eq!(gate.admit(10, 1, 101).await.unwrap(), Admission::Duplicate);
    assert_eq!(gate.admit(10, 2, 102).await.unwrap(), Admission::Accepted);
    assert_eq!(gate.admit(10, 3, 103).await.unwrap(), Admission::SoldOut);
    assert_eq!(gate.remaining(10).await.unwrap(), Some(0));
    assert_eq!(store.stream_len(ORDER_STREAM), 2);
}

#[tokio::test]
async fn admitted_purchase_appends_the_intent() {
    let (gate, store) = controller();
    store.xgroup_create(ORDER_STREAM, "g1").await.unwrap();
    gate.publish(10, 5).await.unwrap();
    gate.admit(10, 42, 9_001).await.unwrap();

    let entries = store
        .xread_group(ORDER_STREAM, "g1", "c1", ReadOffset::NewEntries, 10, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].field("id"), Some("9001"));
    assert_eq!(entries[0].field("userId"), Some("42"));
    assert_eq!(entries[0].field("voucherId"), Some("10"));
}

#[tokio::test]
async fn unpublished_voucher_is_sold_out() {
    let (gate, store) = controller();
    assert_eq!(gate.remaining(77).await.unwrap(), None);
    assert_eq!(gate.admit(77, 1, 1).await.unwrap(), Admission::SoldOut);
    assert_eq!(store.stream_len(ORDER_STREAM), 0);
}

#[tokio::test]
async fn corrupt_stock_is_a_store_error() {
    let (gate, store) = controller();
    store.set(&stock_key(5), "many", None).await.unwrap();
    assert!(matches!(gate.admit(5, 1, 1).await, Err(Error::Store { .. })));
    assert!(matches!(gate.remaining(5).await, Err(Error::Store { .. })));
}

#[tokio::test]
async fn script_rejects_wrong_arity() {
    let (_, store) = controller();
    let err = store
        .eval(&SECKILL_SCRIPT, &[stock_key(1)], &["1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store { .. }));
}

#[tokio::test]
async fn republishing_forgets_previous_buyers() {
    let (gate, _) = controller();
    gate.publish(10, 1).await.unwrap();
    assert_eq!(gate.admit(10, 1, 1).await.unwrap(), Admission::Accepted);
    gate.publish(10, 1).await.unwrap();
    assert_eq!(gate.admit(10, 1, 2).await.unwrap(), Admission::Accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_buyers_never_oversell() {
    const STOCK: u32 = 50;
    const BUYERS: u64 = 200;

    let (gate, store) = controller();
    let gate = Arc::new(gate);
    gate.publish(1, STOCK).await.unwrap();

    let mut handles = Vec::new();
    for user in 0..BUYERS {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            gate.admit(1, user, user as i64).await.unwrap()
        }));
    }
    let mut accepted = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Admission::Accepted => accepted += 1,
            Admission::SoldOut => sold_out += 1,
            Admission::Duplicate => panic!("distinct users cannot be duplicates"),
        }
    }

    assert_eq!(accepted, STOCK as usize);
    assert_eq!(sold_out, (BUYERS - u64::from(STOCK)) as usize);
    assert_eq!(gate.remaining(1).await.unwrap(), Some(0));
    assert_eq!(store.stream_len(ORDER_STREAM), STOCK as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn one_user_racing_itself_is_admitted_once() {
    let (gate, store) = controller();
    let gate = Arc::new(gate);
    gate.publish(1, 100).await.unwrap();

    let mut handles = Vec::new();
    for attempt in 0..32 {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move { gate.admit(1, 7, attempt).await.unwrap() }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| **o == Admission::Accepted).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Admission::Duplicate).count(), 31);
    assert_eq!(gate.remaining(1).await.unwrap(), Some(99));
    assert_eq!(store.stream_len(ORDER_STREAM), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_unit_goes_to_exactly_one_of_two_users() {
    let (gate, _) = controller();
    let gate = Arc::new(gate);
    gate.publish(1, 1).await.unwrap();

    let a = tokio::spawn({
        let gate = Arc::clone(&gate);
        async move { gate.admit(1, 1, 1).await.unwrap() }
    });
    let b = tokio::spawn({
        let gate = Arc::clone(&gate);
        async move { gate.admit(1, 2, 2).await.unwrap() }
    });
    let mut outcomes = [a.await.unwrap(), b.await.unwrap()];
    outcomes.sort_by_key(|o| o.code());
    assert_eq!(outcomes, [Admission::Accepted, Admission::SoldOut]);
}
