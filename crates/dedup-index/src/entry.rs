use std::fmt;

use dedup_types::Digest;
use serde::{Deserialize, Serialize};

/// Stable identifier assigned to a registered name.
///
/// Segment files are registered by path, so a segment's id is the
/// `StreamId` of its path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

/// Identifier of a segment file.
pub type SegmentId = StreamId;

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a block's record lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Segment holding the record.
    pub segment: SegmentId,
    /// Byte offset of the record's length prefix.
    pub offset: u64,
}

/// A staged insert: a new digest and where its record was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub digest: Digest,
    pub segment: SegmentId,
    pub offset: u64,
}

impl PendingEntry {
    pub fn new(digest: Digest, segment: SegmentId, offset: u64) -> Self {
        Self {
            digest,
            segment,
            offset,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            segment: self.segment,
            offset: self.offset,
        }
    }
}

/// A stored index entry.
///
/// `count` is informational; resolution only needs the location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub location: Location,
    pub count: u32,
}

impl IndexEntry {
    /// Initial occurrence count for a freshly inserted digest.
    pub const INITIAL_COUNT: u32 = 1;

    pub fn new(location: Location) -> Self {
        Self {
            location,
            count: Self::INITIAL_COUNT,
        }
    }
}
