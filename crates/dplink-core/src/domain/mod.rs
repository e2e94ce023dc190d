//! Domain entities for a single display-link connection.
//!
//! This module contains pure state and rules with no infrastructure
//! dependencies.  The controller crate owns instances of these types behind
//! its session lock; nothing here locks or blocks.

/// Independent boolean facets describing where a connection is in its lifecycle.
pub mod session;

/// Active video streams carried by a connection.
pub mod stream;

/// Content-protection context and version negotiation.
pub mod hdcp;

/// Multi-stream transport time-slot allocation.
pub mod mst;
