//! Incoming transfer history sync

use slp_wallet_backend::account::{AccountReconciler, IncomingToken, ReconcileError};
use slp_wallet_backend::chain::{HistoricalOutput, RawHistoricalTx};

use crate::common::{send_payload, settings, txid, Harness, MockChain, MockOracle, ALICE, BOB};

fn output(address: &str, amount: u64) -> HistoricalOutput {
    HistoricalOutput {
        address: address.to_string(),
        amount,
    }
}

fn payment(n: u64, height: Option<u32>, from: &str, outputs: Vec<HistoricalOutput>) -> RawHistoricalTx {
    RawHistoricalTx {
        txid: txid(n),
        block_height: height,
        input_addresses: vec![from.to_string()],
        outputs,
        output_scripts: Vec::new(),
    }
}

#[tokio::test]
async fn test_incoming_payment_is_recorded() {
    let h = Harness::new();
    h.indexer.push(payment(
        1,
        Some(100),
        BOB,
        vec![output(ALICE, 5_000), output(BOB, 1_200)],
    ));

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].txid, txid(1));
    assert_eq!(transfers[0].amount_sats, 5_000);
    assert_eq!(transfers[0].block_height, Some(100));
    assert!(transfers[0].token.is_none());
    assert_eq!(h.reconciler.incoming_transfers(ALICE), transfers);
}

#[tokio::test]
async fn test_incoming_token_quantity_is_decoded() {
    let h = Harness::new();
    let token_id = txid(900);
    let mut tx = payment(
        2,
        Some(101),
        BOB,
        vec![output("", 0), output(ALICE, 546), output(BOB, 546)],
    );
    tx.output_scripts = vec![hex::encode(send_payload(&token_id, &[40, 60]))];
    h.indexer.push(tx);

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert_eq!(
        transfers[0].token,
        Some(IncomingToken {
            token_id,
            quantity: 40,
        })
    );
    assert_eq!(transfers[0].amount_sats, 546);
}

#[tokio::test]
async fn test_self_funded_transactions_are_skipped() {
    let h = Harness::new();
    h.indexer.push(payment(
        3,
        Some(100),
        ALICE,
        vec![output(BOB, 1_000), output(ALICE, 8_000)],
    ));

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert!(transfers.is_empty());
}

#[tokio::test]
async fn test_cursor_advances_and_repeats_are_deduplicated() {
    let h = Harness::new();
    h.indexer
        .push(payment(1, Some(100), BOB, vec![output(ALICE, 1_000)]));
    h.indexer
        .push(payment(2, Some(120), BOB, vec![output(ALICE, 2_000)]));

    let first = h.reconciler.sync_history(ALICE).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(h.reconciler.state().accounts[ALICE].synced_block, 120);

    // The indexer reports the tip block again on the next call
    h.indexer
        .push(payment(3, None, BOB, vec![output(ALICE, 3_000)]));
    let second = h.reconciler.sync_history(ALICE).await.unwrap();

    assert_eq!(second.len(), 1);
    assert_eq!(second[0].txid, txid(3));
    assert_eq!(h.reconciler.incoming_transfers(ALICE).len(), 3);
    assert_eq!(h.indexer.calls()[1], (ALICE.to_string(), 120));
}

#[tokio::test]
async fn test_transactions_not_paying_the_address_are_ignored() {
    let h = Harness::new();
    h.indexer
        .push(payment(4, Some(100), BOB, vec![output(BOB, 1_000)]));

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert!(transfers.is_empty());
    assert_eq!(h.reconciler.state().accounts[ALICE].synced_block, 100);
}

#[tokio::test]
async fn test_sync_without_indexer_fails() {
    let reconciler = AccountReconciler::new(MockChain::new(), MockOracle::new(), &settings());

    let result = reconciler.sync_history(ALICE).await;

    assert!(matches!(result, Err(ReconcileError::NoHistoryIndexer)));
}

#[tokio::test]
async fn test_overflowing_token_quantities_are_skipped() {
    let h = Harness::new();
    let token_id = txid(900);
    let mut tx = payment(
        5,
        Some(102),
        BOB,
        vec![output("", 0), output(ALICE, 546), output(ALICE, 546)],
    );
    tx.output_scripts = vec![hex::encode(send_payload(&token_id, &[u64::MAX, u64::MAX]))];
    h.indexer.push(tx);
    h.indexer
        .push(payment(6, Some(103), BOB, vec![output(ALICE, 2_000)]));

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].txid, txid(6));
    assert_eq!(h.reconciler.state().accounts[ALICE].synced_block, 103);
}

#[tokio::test]
async fn test_overflowing_base_amounts_are_skipped() {
    let h = Harness::new();
    h.indexer.push(payment(
        7,
        Some(104),
        BOB,
        vec![output(ALICE, u64::MAX), output(ALICE, 1)],
    ));

    let transfers = h.reconciler.sync_history(ALICE).await.unwrap();

    assert!(transfers.is_empty());
}
