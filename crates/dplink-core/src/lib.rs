//! # dplink-core
//!
//! Shared domain model for the display-link connection controller.
//!
//! This crate has zero dependencies on async runtimes, hardware access or
//! user-space transports.  Everything in it can be unit-tested in isolation.
//!
//! # Architecture overview
//!
//! A display-link *source* (this system) drives a removable *sink* (a
//! monitor) over a physical cable.  The controller crate reacts to cable
//! events and sequences the hardware; this crate defines the state it
//! reasons about:
//!
//! - **`domain`** – The per-connection model: the multi-facet
//!   [`SessionState`], the active [`StreamTable`], the [`HdcpContext`] with
//!   its version negotiation, and the MST time-slot allocator.
//!
//! - **`resources`** – The process-wide [`ResourceLedger`] that admits or
//!   rejects display modes against the platform's mixer and compression-block
//!   budgets.  It is the only object shared by more than one connection.

pub mod domain;
pub mod resources;

// Re-export the most-used types at the crate root so callers can write
// `dplink_core::SessionState` instead of `dplink_core::domain::session::SessionState`.
pub use domain::hdcp::{HdcpContext, HdcpState, HdcpVersion, SourceCapability};
pub use domain::mst::{SlotAllocation, SlotAllocator, SlotError, MST_PAYLOAD_SLOTS};
pub use domain::session::{ConnectionId, SessionError, SessionState};
pub use domain::stream::{Stream, StreamId, StreamTable, StreamTableError};
pub use resources::ledger::{
    ConnectionReservation, LedgerError, LedgerSnapshot, PlatformCapacity, Reservation,
    ReservationGrant, Resource, ResourceLedger, ResourceRequest,
};
