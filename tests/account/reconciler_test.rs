//! Reconciliation passes against mock collaborators
//!
//! Covers idempotence, conservation, fail-closed validation, quarantine and
//! snapshot persistence.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use slp_wallet_backend::account::{AccountReconciler, TokenMetadataEntry};
use slp_wallet_backend::chain::NetworkError;
use slp_wallet_backend::script::mint_script;
use slp_wallet_backend::types::OutPoint;

use crate::common::{
    genesis_payload, send_payload, settings, txid, Harness, MockChain, MockOracle, ALICE, BOB,
};

const TOKEN: u64 = 900;

/// Genesis of token 900 (ABC, 2 decimals) with 10_000 base units on output 1
fn issue_token(h: &Harness) -> String {
    let token_id = txid(TOKEN);
    h.chain
        .add_token_transaction(&token_id, genesis_payload("ABC", "Test", 2, 10_000), 2);
    token_id
}

/// SEND of `amount` token units to Alice on output 1 of transaction `n`
fn receive_tokens(h: &Harness, n: u64, token_id: &str, amount: u64) -> String {
    let id = txid(n);
    h.chain
        .add_token_transaction(&id, send_payload(token_id, &[amount]), 1);
    h.chain.add_utxo(ALICE, &id, 1, 546);
    id
}

#[tokio::test]
async fn test_reconcile_ordinary_outputs() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    h.fund(ALICE, 2, 20_000);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(balances.base_currency_available, 30_000);
    assert!(balances.per_token.is_empty());
    assert!(h.oracle.calls().is_empty());
    assert!(h.reconciler.is_tracked(ALICE));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    let token_id = issue_token(&h);
    let send_tx = receive_tokens(&h, 2, &token_id, 1_250);
    h.oracle.set_valid(&send_tx, true);

    let first = h.reconciler.reconcile(ALICE).await.unwrap();
    let second = h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.token(&token_id), Decimal::from_str("12.50").unwrap());
    assert_eq!(first.base_currency_available, 10_000);
    // Validated outputs are kept, so the second pass has nothing to ask
    assert_eq!(h.oracle.calls().len(), 1);
    // Genesis is fetched once for the cache's lifetime
    assert_eq!(h.chain.tx_fetches(&token_id), 1);
}

#[tokio::test]
async fn test_spent_output_reduces_balance_by_its_amount() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    h.fund(ALICE, 2, 4_321);
    h.fund(ALICE, 3, 7_000);

    let before = h.reconciler.reconcile(ALICE).await.unwrap();
    h.chain.remove_utxo(ALICE, &txid(2), 0);
    let after = h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(before.base_currency_available - after.base_currency_available, 4_321);
    assert!(h
        .reconciler
        .utxos(ALICE)
        .iter()
        .all(|u| u.outpoint != OutPoint::new(txid(2), 0)));

    let spendable_sum: u64 = h
        .reconciler
        .utxos(ALICE)
        .iter()
        .filter(|u| u.spendable)
        .map(|u| u.amount)
        .sum();
    assert_eq!(after.base_currency_available, spendable_sum);
}

#[tokio::test]
async fn test_validator_failure_is_fail_closed() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    let token_id = issue_token(&h);
    let a = receive_tokens(&h, 2, &token_id, 500);
    let b = receive_tokens(&h, 3, &token_id, 700);
    h.oracle.set_valid(&a, true);
    h.oracle.set_valid(&b, true);
    h.oracle.set_failing(true);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();

    assert!(balances.per_token.is_empty());
    assert_eq!(balances.base_currency_available, 10_000);
    let tokens: Vec<_> = h
        .reconciler
        .utxos(ALICE)
        .into_iter()
        .filter(|u| u.is_token())
        .collect();
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().all(|u| u.token_valid.is_none() && !u.spendable));

    // Candidates are re-evaluated on the next pass
    h.oracle.set_failing(false);
    let balances = h.reconciler.reconcile(ALICE).await.unwrap();
    assert_eq!(balances.token(&token_id), Decimal::from(12));
}

#[tokio::test]
async fn test_candidates_submitted_as_one_batch() {
    let h = Harness::new();
    let token_id = issue_token(&h);
    let a = receive_tokens(&h, 2, &token_id, 1);
    let b = receive_tokens(&h, 3, &token_id, 2);

    h.reconciler.reconcile(ALICE).await.unwrap();

    let calls = h.oracle.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![a, b]);
}

#[tokio::test]
async fn test_unanswered_candidates_stay_unvalidated_and_are_refetched() {
    let h = Harness::new();
    let token_id = issue_token(&h);
    let send_tx = receive_tokens(&h, 2, &token_id, 10);

    h.reconciler.reconcile(ALICE).await.unwrap();
    h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(h.chain.tx_fetches(&send_tx), 2);
    assert!(h.reconciler.utxos(ALICE)[0].awaiting_validation());
}

#[tokio::test]
async fn test_invalid_token_output_is_excluded_from_spending() {
    let h = Harness::new();
    let token_id = issue_token(&h);
    let send_tx = receive_tokens(&h, 2, &token_id, 10);
    h.oracle.set_valid(&send_tx, false);
    h.fund(ALICE, 3, 1_000);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();
    h.reconciler.reconcile(ALICE).await.unwrap();

    assert!(balances.per_token.is_empty());
    assert_eq!(balances.base_currency_available, 1_000);
    let spendable = h.reconciler.spendable_utxos(ALICE);
    assert_eq!(spendable.len(), 1);
    assert_eq!(spendable[0].outpoint.txid, txid(3));
    assert!(h.reconciler.token_utxos(ALICE, &token_id).is_empty());
    // The verdict is final; the oracle is not asked again
    assert_eq!(h.oracle.calls().len(), 1);
}

#[tokio::test]
async fn test_zero_amount_send_is_a_zero_balance() {
    let h = Harness::new();
    let token_id = issue_token(&h);
    let send_tx = receive_tokens(&h, 2, &token_id, 0);
    h.oracle.set_valid(&send_tx, true);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(balances.per_token.get(&token_id), Some(&Decimal::ZERO));
}

#[tokio::test]
async fn test_malformed_genesis_quarantines_token_outputs() {
    let h = Harness::new();
    let token_id = txid(TOKEN);
    // The "genesis" transaction carries a MINT payload
    h.chain.add_token_transaction(
        &token_id,
        mint_script(&txid(901), None, 5).unwrap(),
        1,
    );
    let send_tx = receive_tokens(&h, 2, &token_id, 10);
    h.oracle.set_valid(&send_tx, true);
    h.fund(ALICE, 3, 1_000);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();

    assert!(balances.per_token.is_empty());
    assert_eq!(balances.base_currency_available, 1_000);
    let token_output = h
        .reconciler
        .utxos(ALICE)
        .into_iter()
        .find(|u| u.outpoint.txid == send_tx)
        .unwrap();
    assert!(token_output.quarantined);
    assert!(!token_output.spendable);
    assert!(matches!(
        h.reconciler.state().token_metadata.get(&token_id),
        Some(TokenMetadataEntry::Malformed { .. })
    ));
    assert!(h.reconciler.token_metadata(&token_id).is_none());

    // Not retried every pass
    h.reconciler.reconcile(ALICE).await.unwrap();
    assert_eq!(h.chain.tx_fetches(&token_id), 1);
    assert_eq!(h.chain.tx_fetches(&send_tx), 1);
}

#[tokio::test]
async fn test_undecodable_payload_quarantines_output() {
    let h = Harness::new();
    let id = txid(5);
    let mut payload = vec![0x6a, 0x04];
    payload.extend_from_slice(b"SLP\0");
    payload.extend_from_slice(&[0x01, 0x01, 0x04]);
    payload.extend_from_slice(b"BURN");
    h.chain.add_token_transaction(&id, payload, 1);
    h.chain.add_utxo(ALICE, &id, 1, 546);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();
    h.reconciler.reconcile(ALICE).await.unwrap();

    assert_eq!(balances.base_currency_available, 0);
    assert!(h.reconciler.utxos(ALICE)[0].quarantined);
    assert!(h.oracle.calls().is_empty());
    assert_eq!(h.chain.tx_fetches(&id), 1);
}

#[tokio::test]
async fn test_unfetchable_transaction_is_retried_next_pass() {
    let h = Harness::new();
    let outpoint = h.fund(ALICE, 1, 10_000);
    h.chain.fail_transaction(&outpoint.txid);

    let balances = h.reconciler.reconcile(ALICE).await.unwrap();
    assert_eq!(balances.base_currency_available, 0);
    assert!(h.reconciler.utxos(ALICE).is_empty());

    h.chain.heal_transaction(&outpoint.txid);
    let balances = h.reconciler.reconcile(ALICE).await.unwrap();
    assert_eq!(balances.base_currency_available, 10_000);
}

#[tokio::test]
async fn test_utxo_fetch_failure_keeps_previous_state() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    h.reconciler.reconcile(ALICE).await.unwrap();

    h.chain.fail_utxo_fetch(Some(NetworkError::Timeout));
    let result = h.reconciler.reconcile(ALICE).await;

    assert!(result.is_err());
    assert_eq!(
        h.reconciler.balances(ALICE).unwrap().base_currency_available,
        10_000
    );
}

#[tokio::test]
async fn test_addresses_are_reconciled_independently() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    h.fund(BOB, 2, 3_000);
    h.reconciler.track(ALICE);
    h.reconciler.track(BOB);

    let results = h.reconciler.reconcile_all().await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(h.reconciler.balances(BOB).unwrap().base_currency_available, 3_000);
}

#[tokio::test]
async fn test_subscribers_see_committed_balances() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    let mut updates = h.reconciler.subscribe();

    h.reconciler.reconcile(ALICE).await.unwrap();

    assert!(updates.has_changed().unwrap());
    let state = updates.borrow_and_update().clone();
    assert_eq!(state.accounts[ALICE].balances.base_currency_available, 10_000);
}

#[tokio::test]
async fn test_concurrent_passes_for_one_address_are_serialized() {
    let h = Harness::new();
    h.fund(ALICE, 1, 10_000);
    let reconciler = h.reconciler.clone();

    let (a, b) = tokio::join!(reconciler.reconcile(ALICE), h.reconciler.reconcile(ALICE));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(h.reconciler.utxos(ALICE).len(), 1);
}

#[tokio::test]
async fn test_snapshot_is_persisted_and_restored() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("accounts.json");

    let chain = MockChain::new();
    let oracle = MockOracle::new();
    chain.add_plain_transaction(&txid(1), 1);
    chain.add_utxo(ALICE, &txid(1), 0, 8_000);

    let reconciler = AccountReconciler::new(chain.clone(), oracle.clone(), &settings())
        .with_snapshot(path.clone())
        .unwrap();
    reconciler.reconcile(ALICE).await.unwrap();
    assert!(path.exists());

    let restored = AccountReconciler::new(Arc::new(MockChain::default()), oracle, &settings())
        .with_snapshot(path)
        .unwrap();
    assert_eq!(restored.state(), reconciler.state());
    assert_eq!(
        restored.balances(ALICE).unwrap().base_currency_available,
        8_000
    );
}
