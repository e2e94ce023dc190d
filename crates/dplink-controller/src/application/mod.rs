//! Application layer: the connection lifecycle and its orchestration.
//!
//! Everything here depends on the hardware only through the collaborator
//! traits in [`hardware`]; concrete implementations live in
//! `infrastructure`.
//!
//! # Sub-modules
//!
//! - **`connection`**   – The per-link state machine: host bring-up, hotplug
//!   high/low, stream enable/disable, teardown, suspend and resume.
//!
//! - **`dispatcher`**   – Entry point for external stimuli; routes them onto
//!   the task queue and owns its worker.
//!
//! - **`task_queue`**   – Ordered single-worker queue with per-connection
//!   cancellation and a drain barrier.
//!
//! - **`notification`** – Connect/disconnect delivery with bounded
//!   acknowledgement waits and one resend.
//!
//! - **`hdcp_auth`**    – Content-protection sub-state-machine.
//!
//! - **`mst`**          – Multi-stream time-slot programming and topology
//!   callbacks.
//!
//! - **`registry`**     – Attached connections, injected into the dispatcher.
//!
//! - **`hardware`**     – Collaborator traits and the [`hardware::Hardware`]
//!   bundle.
//!
//! - **`timing`**       – Unit-scaled delays and timeouts.

pub mod connection;
pub mod dispatcher;
pub mod hardware;
pub mod hdcp_auth;
pub mod mst;
pub mod notification;
pub mod registry;
pub mod task_queue;
pub mod timing;
