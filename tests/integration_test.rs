// tests/integration_test.rs

//! Integration tests for the watchdog cluster coordinator.
//!
//! These tests spin up real `quorumd::watchdog::eventloop::EventLoop`
//! instances bound to loopback TCP and a temp-dir Unix socket, and drive
//! them through the local IPC protocol the way the surrounding pooler
//! process would.

mod integration {
    pub mod cluster_scenarios;
    pub mod test_helpers;
}
