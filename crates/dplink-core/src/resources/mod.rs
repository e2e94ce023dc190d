//! Process-wide pipeline resources shared by every connection.
//!
//! See [`ledger::ResourceLedger`] for the admission algorithm.

pub mod ledger;
