//! ResourceLedger: admission control for mixers and compression blocks.
//!
//! Every display output on the platform draws from two fixed budgets:
//!
//! - **mixers** (layer mixers feeding a display interface), and
//! - **compression blocks** (DSC encoders).
//!
//! A mode is only accepted after the ledger has committed the resources it
//! needs.  The ledger keeps one reservation per connection; a new request
//! from the same connection *replaces* its previous reservation atomically,
//! so a connection never blocks its own growth.
//!
//! # Admission algorithm
//!
//! ```text
//! reserve(conn, request)
//!   ├─ zero mixers / compression on an incapable pipe  → reject
//!   ├─ free = capacity − (in_use − prior(conn))
//!   ├─ attempt(request)
//!   │    ├─ compression: merged count, else unmerged count
//!   │    └─ mixers
//!   ├─ compression did not fit → attempt(request without compression)  (once)
//!   └─ commit: in_use = in_use − prior + granted
//! ```
//!
//! The sum of all reservations never exceeds capacity: the check and the
//! commit happen under the same lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::session::ConnectionId;

/// One of the two scarce pipeline resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resource {
    Mixers,
    CompressionBlocks,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Mixers => f.write_str("mixers"),
            Resource::CompressionBlocks => f.write_str("compression blocks"),
        }
    }
}

/// Errors returned by [`ResourceLedger::reserve`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient {resource}: requested {requested}, available {available}")]
    ResourceExhausted {
        resource: Resource,
        requested: u32,
        available: u32,
    },
    #[error("compression requested on a pipe that cannot compress")]
    UnsupportedCombination,
    #[error("a mode needs at least one mixer")]
    ZeroMixers,
}

/// What a mode needs, as derived by the (external) topology rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub mixers: u32,
    /// Compression blocks wanted; `0` for an uncompressed mode.
    pub compression_blocks: u32,
    /// Whether the pipe can drive a compressed stream at all.
    pub compression_capable: bool,
    /// Whether the topology may split the stream across one encoder per mixer.
    pub merge_capable: bool,
}

impl ResourceRequest {
    /// An empty request.
    pub fn none() -> Self {
        Self::default()
    }

    /// An uncompressed request for `mixers` mixers.
    pub fn mixers(mixers: u32) -> Self {
        Self {
            mixers,
            ..Self::default()
        }
    }

    /// A compressed request.
    pub fn compressed(mixers: u32, compression_blocks: u32, merge_capable: bool) -> Self {
        Self {
            mixers,
            compression_blocks,
            compression_capable: true,
            merge_capable,
        }
    }

    pub fn wants_compression(&self) -> bool {
        self.compression_blocks > 0
    }

    /// The same request with compression dropped.
    pub fn without_compression(&self) -> Self {
        Self {
            compression_blocks: 0,
            ..*self
        }
    }

    /// Sum of two requests (used to aggregate all streams of a connection).
    ///
    /// Capability flags only matter for parts that want compression, so a
    /// stream without compression never vetoes another stream's request.
    pub fn combine(&self, other: &ResourceRequest) -> ResourceRequest {
        let capable = |r: &ResourceRequest| !r.wants_compression() || r.compression_capable;
        let mergeable = |r: &ResourceRequest| !r.wants_compression() || r.merge_capable;
        ResourceRequest {
            mixers: self.mixers + other.mixers,
            compression_blocks: self.compression_blocks + other.compression_blocks,
            compression_capable: capable(self) && capable(other),
            merge_capable: mergeable(self) && mergeable(other),
        }
    }
}

/// Platform budget for each resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformCapacity {
    pub mixers: u32,
    pub compression_blocks: u32,
}

/// An amount of committed resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub mixers: u32,
    pub compression_blocks: u32,
}

impl Reservation {
    fn max(self, other: Reservation) -> Reservation {
        Reservation {
            mixers: self.mixers.max(other.mixers),
            compression_blocks: self.compression_blocks.max(other.compression_blocks),
        }
    }

    fn fits_within(self, capacity: PlatformCapacity) -> bool {
        self.mixers <= capacity.mixers && self.compression_blocks <= capacity.compression_blocks
    }
}

/// Result of a successful [`ResourceLedger::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReservationGrant {
    pub reservation: Reservation,
    /// Compression was requested but had to be dropped for lack of blocks.
    pub compression_dropped: bool,
    /// The merged (one block per mixer) topology was granted.
    pub merged: bool,
}

/// Current and peak reservation of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionReservation {
    pub current: Reservation,
    pub high_water: Reservation,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub capacity: PlatformCapacity,
    pub in_use: Reservation,
    pub high_water: Reservation,
    /// Per-connection reservations sorted by connection id.
    pub connections: Vec<(ConnectionId, ConnectionReservation)>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    in_use: Reservation,
    high_water: Reservation,
    per_connection: HashMap<ConnectionId, ConnectionReservation>,
}

/// Lock-protected ledger shared by every connection.
///
/// The lock is a plain `std::sync::Mutex`: critical sections are short and
/// never await.  Callers holding a connection's session lock may take it;
/// the reverse order is never used.
#[derive(Debug)]
pub struct ResourceLedger {
    capacity: PlatformCapacity,
    inner: Mutex<LedgerInner>,
}

impl ResourceLedger {
    pub fn new(capacity: PlatformCapacity) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn capacity(&self) -> PlatformCapacity {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        // A panic while holding the lock cannot leave the counters half-written:
        // every mutation is a single assignment after all checks passed.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits `request` for `connection`, replacing its prior reservation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ResourceExhausted`] when the mixer budget (or,
    /// after the compression retry, nothing else) cannot satisfy the request,
    /// [`LedgerError::UnsupportedCombination`] for compression on an
    /// incapable pipe, and [`LedgerError::ZeroMixers`] for an empty mode.
    /// On error the ledger is unchanged.
    pub fn reserve(
        &self,
        connection: ConnectionId,
        request: &ResourceRequest,
    ) -> Result<ReservationGrant, LedgerError> {
        if request.mixers == 0 {
            return Err(LedgerError::ZeroMixers);
        }
        if request.wants_compression() && !request.compression_capable {
            return Err(LedgerError::UnsupportedCombination);
        }

        let mut inner = self.lock();
        let prior = inner
            .per_connection
            .get(&connection)
            .map(|r| r.current)
            .unwrap_or_default();
        let free = Reservation {
            mixers: self.capacity.mixers - (inner.in_use.mixers - prior.mixers),
            compression_blocks: self.capacity.compression_blocks
                - (inner.in_use.compression_blocks - prior.compression_blocks),
        };

        let grant = match attempt(request, free) {
            Err(LedgerError::ResourceExhausted {
                resource: Resource::CompressionBlocks,
                requested,
                available,
            }) => {
                warn!(
                    %connection,
                    requested, available, "compression budget exhausted; retrying without compression"
                );
                let mut grant = attempt(&request.without_compression(), free)?;
                grant.compression_dropped = true;
                grant
            }
            other => other?,
        };

        let in_use = Reservation {
            mixers: inner.in_use.mixers - prior.mixers + grant.reservation.mixers,
            compression_blocks: inner.in_use.compression_blocks - prior.compression_blocks
                + grant.reservation.compression_blocks,
        };
        debug_assert!(in_use.fits_within(self.capacity));
        inner.in_use = in_use;
        inner.high_water = inner.high_water.max(in_use);
        let entry = inner.per_connection.entry(connection).or_default();
        entry.current = grant.reservation;
        entry.high_water = entry.high_water.max(grant.reservation);

        debug!(
            %connection,
            mixers = grant.reservation.mixers,
            compression_blocks = grant.reservation.compression_blocks,
            "reservation committed"
        );
        Ok(grant)
    }

    /// Releases `connection`'s reservation, returning what it held.
    ///
    /// The connection's high-water mark is kept until [`forget`](Self::forget).
    pub fn release(&self, connection: ConnectionId) -> Reservation {
        let mut inner = self.lock();
        let Some(entry) = inner.per_connection.get_mut(&connection) else {
            return Reservation::default();
        };
        let released = std::mem::take(&mut entry.current);
        inner.in_use.mixers -= released.mixers;
        inner.in_use.compression_blocks -= released.compression_blocks;
        debug!(
            %connection,
            mixers = released.mixers,
            compression_blocks = released.compression_blocks,
            "reservation released"
        );
        released
    }

    /// Releases and drops every record of `connection` (device detach).
    pub fn forget(&self, connection: ConnectionId) {
        self.release(connection);
        self.lock().per_connection.remove(&connection);
    }

    /// Current reservation of `connection`.
    pub fn reservation(&self, connection: ConnectionId) -> Reservation {
        self.lock()
            .per_connection
            .get(&connection)
            .map(|r| r.current)
            .unwrap_or_default()
    }

    /// Current and peak reservation of `connection`.
    pub fn usage(&self, connection: ConnectionId) -> ConnectionReservation {
        self.lock()
            .per_connection
            .get(&connection)
            .copied()
            .unwrap_or_default()
    }

    pub fn in_use(&self) -> Reservation {
        self.lock().in_use
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.lock();
        let mut connections: Vec<_> = inner
            .per_connection
            .iter()
            .map(|(id, r)| (*id, *r))
            .collect();
        connections.sort_by_key(|(id, _)| *id);
        LedgerSnapshot {
            capacity: self.capacity,
            in_use: inner.in_use,
            high_water: inner.high_water,
            connections,
        }
    }

    /// Verifies that per-connection reservations add up to `in_use` and that
    /// `in_use` fits the platform capacity.
    pub fn check_invariant(&self) -> bool {
        let inner = self.lock();
        let sum = inner
            .per_connection
            .values()
            .fold(Reservation::default(), |acc, r| Reservation {
                mixers: acc.mixers + r.current.mixers,
                compression_blocks: acc.compression_blocks + r.current.compression_blocks,
            });
        sum == inner.in_use && sum.fits_within(self.capacity)
    }
}

/// One admission attempt against the `free` budget.
fn attempt(request: &ResourceRequest, free: Reservation) -> Result<ReservationGrant, LedgerError> {
    let mut merged = false;
    let mut compression_blocks = 0;

    if request.wants_compression() {
        let merge_count = if request.merge_capable && request.mixers >= 2 {
            request.compression_blocks.max(request.mixers)
        } else {
            request.compression_blocks
        };
        if merge_count <= free.compression_blocks {
            merged = merge_count != request.compression_blocks;
            compression_blocks = merge_count;
        } else if request.compression_blocks <= free.compression_blocks {
            compression_blocks = request.compression_blocks;
        } else {
            return Err(LedgerError::ResourceExhausted {
                resource: Resource::CompressionBlocks,
                requested: request.compression_blocks,
                available: free.compression_blocks,
            });
        }
    }

    if request.mixers > free.mixers {
        return Err(LedgerError::ResourceExhausted {
            resource: Resource::Mixers,
            requested: request.mixers,
            available: free.mixers,
        });
    }

    Ok(ReservationGrant {
        reservation: Reservation {
            mixers: request.mixers,
            compression_blocks,
        },
        compression_dropped: false,
        merged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ledger(mixers: u32, compression_blocks: u32) -> ResourceLedger {
        ResourceLedger::new(PlatformCapacity {
            mixers,
            compression_blocks,
        })
    }

    #[test]
    fn test_reserve_commits_mixers() {
        // Arrange
        let ledger = make_ledger(4, 2);
        let conn = ConnectionId::new();

        // Act
        let grant = ledger.reserve(conn, &ResourceRequest::mixers(2)).unwrap();

        // Assert
        assert_eq!(grant.reservation.mixers, 2);
        assert_eq!(ledger.in_use().mixers, 2);
        assert!(ledger.check_invariant());
    }

    #[test]
    fn test_second_connection_rejected_when_mixers_exhausted() {
        let ledger = make_ledger(3, 0);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        ledger.reserve(a, &ResourceRequest::mixers(2)).unwrap();

        let result = ledger.reserve(b, &ResourceRequest::mixers(2));

        assert_eq!(
            result,
            Err(LedgerError::ResourceExhausted {
                resource: Resource::Mixers,
                requested: 2,
                available: 1,
            })
        );
        assert_eq!(ledger.in_use().mixers, 2, "failed reserve must not commit");
        assert!(ledger.check_invariant());
    }

    #[test]
    fn test_own_prior_reservation_does_not_block_growth() {
        let ledger = make_ledger(3, 0);
        let conn = ConnectionId::new();
        ledger.reserve(conn, &ResourceRequest::mixers(2)).unwrap();

        let grant = ledger.reserve(conn, &ResourceRequest::mixers(3)).unwrap();

        assert_eq!(grant.reservation.mixers, 3);
        assert_eq!(ledger.in_use().mixers, 3);
    }

    #[test]
    fn test_compression_dropped_when_blocks_exhausted() {
        let ledger = make_ledger(4, 1);
        let other = ConnectionId::new();
        ledger
            .reserve(other, &ResourceRequest::compressed(1, 1, false))
            .unwrap();
        let conn = ConnectionId::new();

        let grant = ledger
            .reserve(conn, &ResourceRequest::compressed(1, 1, false))
            .unwrap();

        assert!(grant.compression_dropped);
        assert_eq!(grant.reservation.compression_blocks, 0);
        assert_eq!(ledger.in_use().compression_blocks, 1);
    }

    #[test]
    fn test_merge_uses_one_block_per_mixer_when_available() {
        let ledger = make_ledger(4, 2);
        let conn = ConnectionId::new();

        let grant = ledger
            .reserve(conn, &ResourceRequest::compressed(2, 1, true))
            .unwrap();

        assert!(grant.merged);
        assert_eq!(grant.reservation.compression_blocks, 2);
    }

    #[test]
    fn test_merge_falls_back_to_unmerged_count() {
        let ledger = make_ledger(4, 1);
        let conn = ConnectionId::new();

        let grant = ledger
            .reserve(conn, &ResourceRequest::compressed(2, 1, true))
            .unwrap();

        assert!(!grant.merged);
        assert!(!grant.compression_dropped);
        assert_eq!(grant.reservation.compression_blocks, 1);
    }

    #[test]
    fn test_compression_on_incapable_pipe_is_unsupported() {
        let ledger = make_ledger(4, 2);
        let request = ResourceRequest {
            mixers: 1,
            compression_blocks: 1,
            compression_capable: false,
            merge_capable: false,
        };

        let result = ledger.reserve(ConnectionId::new(), &request);

        assert_eq!(result, Err(LedgerError::UnsupportedCombination));
    }

    #[test]
    fn test_zero_mixers_rejected() {
        let ledger = make_ledger(4, 2);
        let result = ledger.reserve(ConnectionId::new(), &ResourceRequest::mixers(0));
        assert_eq!(result, Err(LedgerError::ZeroMixers));
    }

    #[test]
    fn test_release_returns_held_amount() {
        let ledger = make_ledger(4, 2);
        let conn = ConnectionId::new();
        ledger.reserve(conn, &ResourceRequest::mixers(2)).unwrap();

        let released = ledger.release(conn);

        assert_eq!(released.mixers, 2);
        assert_eq!(ledger.in_use(), Reservation::default());
        assert!(ledger.check_invariant());
    }

    #[test]
    fn test_release_unknown_connection_is_noop() {
        let ledger = make_ledger(4, 2);
        assert_eq!(ledger.release(ConnectionId::new()), Reservation::default());
    }

    #[test]
    fn test_high_water_survives_release() {
        let ledger = make_ledger(4, 2);
        let conn = ConnectionId::new();
        ledger.reserve(conn, &ResourceRequest::mixers(3)).unwrap();
        ledger.release(conn);

        let snapshot = ledger.snapshot();

        assert_eq!(snapshot.high_water.mixers, 3);
        assert_eq!(snapshot.connections[0].1.high_water.mixers, 3);
        assert_eq!(snapshot.connections[0].1.current.mixers, 0);
    }

    #[test]
    fn test_forget_removes_connection_record() {
        let ledger = make_ledger(4, 2);
        let conn = ConnectionId::new();
        ledger.reserve(conn, &ResourceRequest::mixers(1)).unwrap();

        ledger.forget(conn);

        assert!(ledger.snapshot().connections.is_empty());
        assert_eq!(ledger.in_use().mixers, 0);
    }
}
