//! Active-stream table for one connection.
//!
//! A single-stream (SST) connection carries exactly one stream.  With
//! multi-stream transport (MST) the same physical link carries up to `N`
//! streams, each with its own virtual channel and time-slot range.
//!
//! The table is indexed by [`StreamId`] and iterates in id order, which gives
//! deterministic HDCP registration and teardown order.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::resources::ledger::ResourceRequest;

/// Identifies a stream within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(pub u8);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// One active stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub id: StreamId,
    /// Index of the panel (display object) this stream scans out.
    pub panel: u8,
    /// 1-based virtual channel id; `1` for SST.
    pub virtual_channel: u8,
    /// First MST time slot, `0` when no slots are programmed.
    pub start_slot: u8,
    /// Number of MST time slots, `0` when no slots are programmed.
    pub slot_count: u8,
    /// Pipeline resources this stream contributes to the connection reservation.
    pub resources: ResourceRequest,
}

/// Errors returned by [`StreamTable`] mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamTableError {
    #[error("{0} is already active")]
    Duplicate(StreamId),
    #[error("stream table is full ({max} streams)")]
    Full { max: usize },
}

/// Table of the streams currently armed for display.
#[derive(Debug, Clone)]
pub struct StreamTable {
    streams: BTreeMap<StreamId, Stream>,
    max_streams: usize,
}

impl StreamTable {
    /// Creates an empty table holding at most `max_streams` entries.
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            max_streams: max_streams.max(1),
        }
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    /// Adds a stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamTableError::Duplicate`] if the id is already present and
    /// [`StreamTableError::Full`] if the table is at capacity.
    pub fn insert(&mut self, stream: Stream) -> Result<(), StreamTableError> {
        if self.streams.contains_key(&stream.id) {
            return Err(StreamTableError::Duplicate(stream.id));
        }
        if self.streams.len() >= self.max_streams {
            return Err(StreamTableError::Full {
                max: self.max_streams,
            });
        }
        self.streams.insert(stream.id, stream);
        Ok(())
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Iterates over active streams in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    /// Ids of every active stream, in id order.
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Smallest virtual channel id (1-based) not used by any active stream.
    pub fn next_virtual_channel(&self) -> u8 {
        (1..=u8::MAX)
            .find(|vc| self.streams.values().all(|s| s.virtual_channel != *vc))
            .unwrap_or(u8::MAX)
    }

    /// Combined resource requirement of every active stream.
    pub fn aggregate_request(&self) -> ResourceRequest {
        self.streams
            .values()
            .fold(ResourceRequest::none(), |acc, s| acc.combine(&s.resources))
    }

    /// Removes every stream and returns them in id order.
    pub fn drain(&mut self) -> Vec<Stream> {
        std::mem::take(&mut self.streams).into_values().collect()
    }
}
