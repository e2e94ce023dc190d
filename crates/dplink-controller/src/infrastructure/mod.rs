//! Infrastructure layer for the controller.
//!
//! Contains the adapters that sit outside the state machine: TOML
//! configuration storage and the simulated hardware used by `dplink-sim`
//! and the tests.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `dplink_core`; the application layer only imports it from test code.

pub mod simulated;
pub mod storage;
