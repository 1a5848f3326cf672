use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identifier of one batch envelope. Also used to derive multipart boundaries.
/// Never sent on the wire by itself; `Display` renders the hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

/// Position of a pending request inside its batch, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestSeq(u64);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    pub fn from_uuid(value: Uuid) -> Self {
        BatchId(value)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSeq {
    pub fn new(value: u64) -> Self {
        RequestSeq(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Display for RequestSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestSeq {
    fn from(value: u64) -> Self {
        RequestSeq::new(value)
    }
}

/// Hands out monotonically increasing sequence numbers starting at 1.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        SequenceAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> RequestSeq {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        RequestSeq::new(id)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
