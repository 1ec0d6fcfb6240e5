//! Integration tests for the serialized state store.

use pulse_agent::error::Error;
use pulse_agent::state::{StateKey, StateStore};
use serde_json::json;

#[tokio::test]
async fn writes_apply_in_submission_order() {
    let store = StateStore::new();

    // Submitted now, awaited later: order is fixed at call time.
    let pending: Vec<_> = (0..50)
        .map(|n| store.set(StateKey::PageUrl, format!("/page/{n}")))
        .collect();

    let mut versions = Vec::new();
    for write in pending {
        versions.push(write.await.unwrap());
    }

    assert!(versions.windows(2).all(|w| w[0] + 1 == w[1]));
    assert_eq!(store.get(StateKey::PageUrl), Some(json!("/page/49")));
    assert_eq!(store.version(), *versions.last().unwrap());
}

#[tokio::test]
async fn updates_see_every_earlier_write() {
    let store = StateStore::new();
    store.set(StateKey::UserId, "u-1").await.unwrap();

    let updates: Vec<_> = (0..10)
        .map(|_| {
            store.update(StateKey::UserId, |current| {
                let text = current.and_then(|v| v.as_str()).unwrap_or_default();
                Some(json!(format!("{text}+")))
            })
        })
        .collect();
    for update in updates {
        update.await.unwrap();
    }

    assert_eq!(store.get(StateKey::UserId), Some(json!("u-1++++++++++")));
}

#[tokio::test]
async fn snapshots_are_complete_versions() {
    let store = StateStore::new();
    store.set(StateKey::UserId, "u-1").await.unwrap();
    let before = store.snapshot();

    store.set(StateKey::SessionId, "s-1").await.unwrap();
    let after = store.snapshot();

    assert_eq!(before.get(StateKey::SessionId), None);
    assert_eq!(after.get(StateKey::SessionId), Some(&json!("s-1")));
    assert_eq!(after.get(StateKey::UserId), Some(&json!("u-1")));
    assert_eq!(after.version(), before.version() + 1);
}

#[tokio::test]
async fn removal_clears_a_slot() {
    let store = StateStore::new();
    store.set(StateKey::SampledIn, true).await.unwrap();
    assert_eq!(store.get_as::<bool>(StateKey::SampledIn), Some(true));

    store.remove(StateKey::SampledIn).await.unwrap();
    assert_eq!(store.get_as::<bool>(StateKey::SampledIn), None);
}

#[tokio::test]
async fn wrong_shape_reads_as_absent() {
    let store = StateStore::new();
    store.set(StateKey::SampledIn, "yes").await.unwrap();
    assert_eq!(store.get_as::<bool>(StateKey::SampledIn), None);
}

#[tokio::test]
async fn closed_store_rejects_new_writes() {
    let store = StateStore::new();
    let queued = store.set(StateKey::QaMode, true);
    store.close();

    // Already queued before close: still applied.
    assert!(queued.await.is_ok());
    assert_eq!(store.get_as::<bool>(StateKey::QaMode), Some(true));

    let err = store.set(StateKey::QaMode, false).await.unwrap_err();
    assert!(matches!(err, Error::TornDown(_)));
    assert!(store.set_detached(StateKey::QaMode, false).is_err());
    assert!(store.is_closed());
}
