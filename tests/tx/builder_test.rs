//! Coin selection and fee estimation

use slp_wallet_backend::script::decode_output_script;
use slp_wallet_backend::tx::{
    build_base_send, build_token_send, estimate_fee, BuildError, FeePolicy, TxOutputSpec,
};
use slp_wallet_backend::types::{OutPoint, TokenOperation, TokenOutputInfo, Utxo};

use crate::common::{txid, ALICE, BOB};

const POLICY: FeePolicy = FeePolicy {
    fee_rate: 1,
    dust_limit: 546,
};

fn coin(n: u64, amount: u64) -> Utxo {
    let mut utxo = Utxo::unclassified(OutPoint::new(txid(n), 0), amount, ALICE);
    utxo.spendable = true;
    utxo
}

fn token_coin(n: u64, quantity: u64) -> Utxo {
    let mut utxo = Utxo::unclassified(OutPoint::new(txid(n), 1), 546, ALICE);
    utxo.token_info = Some(TokenOutputInfo {
        token_id: txid(900),
        operation: TokenOperation::Send,
        quantity,
        is_mint_baton: false,
    });
    utxo.token_valid = Some(true);
    utxo
}

#[test]
fn test_fee_estimate_by_shape() {
    assert_eq!(estimate_fee(1, 2, None, 1), Some(226));
    assert_eq!(estimate_fee(2, 3, Some(40), 2), Some(914));
    assert_eq!(estimate_fee(0, 0, None, 5), Some(50));
}

#[test]
fn test_single_input_send_with_change() {
    let tx = build_base_send(&[coin(1, 100_000)], ALICE, BOB, 50_000, POLICY).unwrap();

    assert_eq!(tx.fee, 226);
    assert_eq!(
        tx.outputs,
        vec![
            TxOutputSpec::payment(BOB, 50_000),
            TxOutputSpec::payment(ALICE, 100_000 - 50_000 - 226),
        ]
    );
    assert_eq!(tx.total_input(), tx.total_output() + tx.fee);
}

#[test]
fn test_change_below_dust_goes_to_fee() {
    let tx = build_base_send(&[coin(1, 50_326)], ALICE, BOB, 50_000, POLICY).unwrap();

    assert_eq!(tx.outputs, vec![TxOutputSpec::payment(BOB, 50_000)]);
    assert_eq!(tx.fee, 326);
}

#[test]
fn test_largest_outputs_selected_first() {
    let candidates = [coin(1, 10_000), coin(2, 60_000), coin(3, 30_000)];

    let tx = build_base_send(&candidates, ALICE, BOB, 50_000, POLICY).unwrap();

    assert_eq!(tx.input_outpoints(), vec![OutPoint::new(txid(2), 0)]);
}

#[test]
fn test_multiple_inputs_when_needed() {
    let candidates = [coin(1, 30_000), coin(2, 30_000)];

    let tx = build_base_send(&candidates, ALICE, BOB, 50_000, POLICY).unwrap();

    assert_eq!(tx.inputs.len(), 2);
    assert_eq!(tx.fee, 374);
    assert_eq!(tx.paid_to(ALICE), 9_626);
}

#[test]
fn test_insufficient_funds() {
    let result = build_base_send(&[coin(1, 50_100)], ALICE, BOB, 50_000, POLICY);

    match result {
        Err(BuildError::InsufficientFunds { needed, available }) => {
            assert_eq!(needed, 50_192);
            assert_eq!(available, 50_100);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_dust_payment_rejected() {
    let result = build_base_send(&[coin(1, 100_000)], ALICE, BOB, 545, POLICY);
    assert!(matches!(result, Err(BuildError::InvalidAmount(_))));
}

#[test]
fn test_token_send_layout_and_change() {
    let tokens = [token_coin(1, 50), token_coin(2, 70)];
    let base = [coin(3, 10_000)];

    let tx = build_token_send(&tokens, &base, ALICE, BOB, &txid(900), 100, POLICY).unwrap();

    let script = match &tx.outputs[0] {
        TxOutputSpec::Data { script } => script.clone(),
        other => panic!("expected data output, got {:?}", other),
    };
    assert_eq!(decode_output_script(&script, "ff", 1).unwrap().quantity, 100);
    assert_eq!(decode_output_script(&script, "ff", 2).unwrap().quantity, 20);

    assert_eq!(tx.outputs[1], TxOutputSpec::payment(BOB, 546));
    assert_eq!(tx.outputs[2], TxOutputSpec::payment(ALICE, 546));
    assert_eq!(tx.inputs.len(), 3);
    assert_eq!(tx.total_input(), tx.total_output() + tx.fee);

    let expected_fee = estimate_fee(3, 3, Some(script.len()), 1).unwrap();
    assert_eq!(tx.fee, expected_fee);
}

#[test]
fn test_exact_token_amount_has_no_token_change() {
    let tokens = [token_coin(1, 100)];
    let base = [coin(3, 10_000)];

    let tx = build_token_send(&tokens, &base, ALICE, BOB, &txid(900), 100, POLICY).unwrap();

    let script = match &tx.outputs[0] {
        TxOutputSpec::Data { script } => script.clone(),
        other => panic!("expected data output, got {:?}", other),
    };
    assert!(decode_output_script(&script, "ff", 2).is_err());
    // Recipient dust plus base change
    assert_eq!(tx.outputs.len(), 3);
    assert_eq!(tx.paid_to(BOB), 546);
}

#[test]
fn test_insufficient_tokens() {
    let result = build_token_send(
        &[token_coin(1, 30)],
        &[coin(3, 10_000)],
        ALICE,
        BOB,
        &txid(900),
        31,
        POLICY,
    );

    assert!(matches!(
        result,
        Err(BuildError::InsufficientTokens {
            needed: 31,
            available: 30,
            ..
        })
    ));
}

#[test]
fn test_amount_plus_fee_overflow_is_rejected() {
    let result = build_base_send(&[coin(1, 100_000)], ALICE, BOB, u64::MAX, POLICY);

    assert!(matches!(result, Err(BuildError::InvalidAmount(_))));
}

#[test]
fn test_fee_overflow_is_rejected() {
    assert_eq!(estimate_fee(1, 2, None, u64::MAX), None);

    let policy = FeePolicy {
        fee_rate: u64::MAX / 100,
        dust_limit: 546,
    };
    let result = build_base_send(&[coin(1, 100_000)], ALICE, BOB, 50_000, policy);

    assert!(matches!(result, Err(BuildError::InvalidAmount(_))));
}
