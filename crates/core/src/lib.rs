//! Kubist core types: change events, resource snapshots and document identity.

#![forbid(unsafe_code)]

use std::fmt;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};

mod object;

pub use object::{document_id, ResourceObject};

/// Kind of transition carried by a [`Delta`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Replay of existing state from a (re)list or periodic resync; an upsert.
    Sync,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Sync => "sync",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeltaKind::Added => "Added",
            DeltaKind::Updated => "Updated",
            DeltaKind::Deleted => "Deleted",
            DeltaKind::Sync => "Sync",
        })
    }
}

/// One observed transition of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: ResourceObject,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: ResourceObject) -> Self {
        Self { kind, object }
    }

    pub fn document_id(&self) -> String {
        self.object.document_id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("object is not a JSON map")]
    NotAnObject,
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("malformed resourceVersion {version:?}: {source}")]
    MalformedVersion {
        version: String,
        #[source]
        source: ParseIntError,
    },
}

/// Parse a resourceVersion token as an unsigned integer.
///
/// The API server only promises opaque tokens, but the reflection protocol
/// relies on them being numerically comparable per object.
pub fn parse_resource_version(rv: &str) -> Result<u64, CoreError> {
    rv.trim().parse::<u64>().map_err(|source| CoreError::MalformedVersion {
        version: rv.to_string(),
        source,
    })
}

/// Maps a document id onto one of a fixed number of apply lanes.
///
/// Every event for a given id lands on the same lane, so a single lane task
/// sees all of that document's events in arrival order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanePlanner {
    lanes: usize,
}

impl LanePlanner {
    pub fn new(lanes: usize) -> Self {
        Self { lanes: lanes.max(1) }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Lane index for `id` using 64-bit FNV-1a.
    pub fn lane(&self, id: &str) -> usize {
        if self.lanes <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325;
        for b in id.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.lanes as u64) as usize
    }
}
