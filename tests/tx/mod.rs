//! Transaction lifecycle tests

pub mod boot_recovery_test;
pub mod builder_test;
pub mod pending_tracker_test;
