//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the controller's TOML file in
//! the platform configuration directory and falls back to defaults on first
//! run.

pub mod config;
