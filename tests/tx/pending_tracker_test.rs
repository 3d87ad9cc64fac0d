//! Pending tracker observations and retry backoff

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use slp_wallet_backend::chain::{Inclusion, NetworkError};
use slp_wallet_backend::storage::TxStorage;
use slp_wallet_backend::tx::{
    ErrorKind, PendingTxTracker, TrackerEvent, TxMeta, TxParams, TxStateManager, TxStatus,
};

use crate::common::{settings, MockChain, ALICE, BOB, NETWORK_ID};

struct Setup {
    chain: Arc<MockChain>,
    state: Arc<TxStateManager>,
    tracker: PendingTxTracker,
}

fn setup() -> Setup {
    let chain = MockChain::new();
    let state = Arc::new(TxStateManager::new(
        TxStorage::in_memory().unwrap(),
        &settings(),
        NETWORK_ID,
    ));
    let tracker = PendingTxTracker::new(
        state.clone(),
        chain.clone(),
        Duration::from_secs(5),
        chrono::Duration::seconds(600),
    );
    Setup {
        chain,
        state,
        tracker,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn minutes(m: i64) -> chrono::Duration {
    chrono::Duration::minutes(m)
}

/// Submitted record broadcast as `hash` at `at`
fn submitted(state: &TxStateManager, hash: &str, at: DateTime<Utc>) -> TxMeta {
    let meta = state
        .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 1_000)))
        .unwrap();
    state.set_tx_status_approved(&meta.id).unwrap();
    state
        .set_tx_status_signed(&meta.id, "0200".to_string(), Vec::new())
        .unwrap();
    state
        .set_tx_status_submitted(&meta.id, hash.to_string(), at)
        .unwrap()
}

#[tokio::test]
async fn test_confirmation_is_reported_without_mutation() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain
        .set_status("aa", Ok(Inclusion::Confirmed { block_height: 812 }));

    let events = s.tracker.update_pending_txs(t0()).await.unwrap();

    assert_eq!(
        events,
        vec![TrackerEvent::Confirmed {
            id: meta.id.clone(),
            block_height: 812,
        }]
    );
    assert_eq!(s.state.get_tx(&meta.id).unwrap().status(), TxStatus::Submitted);
}

#[tokio::test]
async fn test_invalid_transaction_is_reported_failed() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain.set_status(
        "aa",
        Ok(Inclusion::Invalid {
            reason: "double spend".to_string(),
        }),
    );

    let events = s.tracker.update_pending_txs(t0()).await.unwrap();

    match &events[..] {
        [TrackerEvent::Failed { id, error }] => {
            assert_eq!(id, &meta.id);
            assert_eq!(error.kind, ErrorKind::ChainRejection);
            assert_eq!(error.message, "double spend");
        }
        other => panic!("unexpected events {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_transaction_is_reported_dropped() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain.set_status("aa", Ok(Inclusion::NotFound));

    let events = s.tracker.update_pending_txs(t0() + minutes(10)).await.unwrap();

    assert_eq!(events, vec![TrackerEvent::Dropped { id: meta.id }]);
}

#[tokio::test]
async fn test_freshly_broadcast_unknown_transaction_is_not_dropped() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain.set_status("aa", Ok(Inclusion::NotFound));

    assert!(s.tracker.update_pending_txs(t0()).await.unwrap().is_empty());
    assert!(s
        .tracker
        .update_pending_txs(t0() + minutes(9))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(s.state.get_tx(&meta.id).unwrap().status(), TxStatus::Submitted);

    // A retried record gets the longer window
    s.state.increment_retry_count(&meta.id).unwrap();
    assert!(s
        .tracker
        .update_pending_txs(t0() + minutes(19))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        s.tracker.update_pending_txs(t0() + minutes(20)).await.unwrap(),
        vec![TrackerEvent::Dropped { id: meta.id }]
    );
}

#[tokio::test]
async fn test_query_error_is_a_warning() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain.set_status("aa", Err(NetworkError::Timeout));

    let events = s.tracker.update_pending_txs(t0() + minutes(60)).await.unwrap();

    match &events[..] {
        [TrackerEvent::Warning { meta: warned, error }] => {
            assert_eq!(warned.id, meta.id);
            assert!(error.contains("timeout"));
        }
        other => panic!("unexpected events {:?}", other),
    }
    assert_eq!(s.state.get_tx(&meta.id).unwrap(), meta);
}

#[tokio::test]
async fn test_retry_after_threshold() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());

    let young = s.tracker.update_pending_txs(t0() + minutes(9)).await.unwrap();
    assert!(young.is_empty());

    let old = s.tracker.update_pending_txs(t0() + minutes(10)).await.unwrap();
    assert_eq!(old.len(), 1);
    assert!(matches!(&old[0], TrackerEvent::Retry { meta: m } if m.id == meta.id));
}

#[tokio::test]
async fn test_retry_threshold_doubles_with_each_retry() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.state.increment_retry_count(&meta.id).unwrap();
    s.state.increment_retry_count(&meta.id).unwrap();

    assert!(s
        .tracker
        .update_pending_txs(t0() + minutes(39))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        s.tracker
            .update_pending_txs(t0() + minutes(40))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_backoff_is_capped() {
    let s = setup();

    assert_eq!(s.tracker.retry_threshold(0), minutes(10));
    assert_eq!(s.tracker.retry_threshold(3), minutes(80));
    assert_eq!(s.tracker.retry_threshold(16), s.tracker.retry_threshold(500));
}

#[tokio::test]
async fn test_only_submitted_records_are_queried() {
    let s = setup();
    let unapproved = s
        .state
        .add_tx(s.state.generate_tx_meta(TxParams::send(ALICE, BOB, 1_000)))
        .unwrap();
    let confirmed = submitted(&s.state, "bb", t0());
    s.state
        .set_tx_status_confirmed(&confirmed.id, Some(1))
        .unwrap();
    s.chain.set_status("bb", Ok(Inclusion::NotFound));

    let events = s.tracker.update_pending_txs(t0() + minutes(600)).await.unwrap();

    assert!(events.is_empty());
    assert_eq!(
        s.state.get_tx(&unapproved.id).unwrap().status(),
        TxStatus::Unapproved
    );
}

#[tokio::test]
async fn test_events_are_published_to_subscribers() {
    let s = setup();
    let meta = submitted(&s.state, "aa", t0());
    s.chain.set_status("aa", Ok(Inclusion::NotFound));
    let mut events = s.tracker.subscribe();

    s.tracker.update_pending_txs(t0() + minutes(10)).await.unwrap();

    assert_eq!(events.try_recv().unwrap(), TrackerEvent::Dropped { id: meta.id });
}
