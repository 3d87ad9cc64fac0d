//! Recovery of records left behind by an interrupted process

use std::sync::Arc;

use slp_wallet_backend::storage::TxStorage;
use slp_wallet_backend::tx::{
    ErrorKind, TxFailure, TxParams, TxStateManager, TxStatus, APPROVED_AT_BOOT_MESSAGE,
};

use crate::common::{settings, Harness, ALICE, BOB, NETWORK_ID};

fn open(dir: &std::path::Path) -> TxStateManager {
    TxStateManager::new(TxStorage::open(dir).unwrap(), &settings(), NETWORK_ID)
}

#[test]
fn test_approved_records_fail_on_boot() {
    let temp_dir = tempfile::tempdir().unwrap();

    let approved_id = {
        let state = open(temp_dir.path());
        let meta = state
            .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 5_000)))
            .unwrap();
        state.set_loading_defaults(&meta.id, false).unwrap();
        state.set_tx_status_approved(&meta.id).unwrap();
        meta.id
    };

    let state = open(temp_dir.path());
    assert_eq!(state.get_tx(&approved_id).unwrap().status(), TxStatus::Approved);

    let recovery = state
        .recover_on_boot(|_| panic!("no record is loading defaults"))
        .unwrap();

    assert_eq!(recovery.failed, 1);
    let meta = state.get_tx(&approved_id).unwrap();
    assert_eq!(meta.status(), TxStatus::Failed);
    let error = meta.err().unwrap();
    assert_eq!(error.message, APPROVED_AT_BOOT_MESSAGE);
    assert_eq!(error.kind, ErrorKind::InvariantViolation);
}

#[test]
fn test_loading_defaults_are_recomputed_on_boot() {
    let state = Arc::new(TxStateManager::new(
        TxStorage::in_memory().unwrap(),
        &settings(),
        NETWORK_ID,
    ));
    let stuck = state
        .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 5_000)))
        .unwrap();
    assert!(stuck.loading_defaults);

    let h = Harness::with_state(settings(), state);
    let recovery = h.controller.init().unwrap();

    assert_eq!(recovery.defaults_restored, 1);
    assert_eq!(recovery.failed, 0);
    let meta = h.controller.get_tx(&stuck.id).unwrap();
    assert!(!meta.loading_defaults);
    assert_eq!(meta.params.fee_rate, Some(settings().fee_rate_sat_per_byte));
    assert_eq!(meta.status(), TxStatus::Unapproved);
}

#[test]
fn test_defaults_that_cannot_be_filled_fail_the_record() {
    let state = TxStateManager::new(TxStorage::in_memory().unwrap(), &settings(), NETWORK_ID);
    let stuck = state
        .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 5_000)))
        .unwrap();

    let recovery = state
        .recover_on_boot(|_| Err(TxFailure::new(ErrorKind::Validation, "no fee rate")))
        .unwrap();

    assert_eq!(recovery.failed, 1);
    let meta = state.get_tx(&stuck.id).unwrap();
    assert_eq!(meta.status(), TxStatus::Failed);
    assert_eq!(meta.err().unwrap().kind, ErrorKind::Validation);
}

#[test]
fn test_settled_records_are_left_alone() {
    let state = TxStateManager::new(TxStorage::in_memory().unwrap(), &settings(), NETWORK_ID);
    let meta = state
        .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 5_000)))
        .unwrap();
    state.set_loading_defaults(&meta.id, false).unwrap();
    let rejected = state
        .add_tx(state.generate_tx_meta(TxParams::send(ALICE, BOB, 6_000)))
        .unwrap();
    state.set_tx_status_rejected(&rejected.id).unwrap();

    let recovery = state.recover_on_boot(|m| Ok(m.params.clone())).unwrap();

    assert_eq!(recovery.defaults_restored, 0);
    assert_eq!(recovery.failed, 0);
    assert_eq!(state.get_tx(&meta.id).unwrap().status(), TxStatus::Unapproved);
    assert_eq!(
        state.get_tx(&rejected.id).unwrap().status(),
        TxStatus::Rejected
    );
}
