//! Sequence provider trait and the fixed-sequence provider.

use std::net::IpAddr;
use std::time::SystemTime;

use crate::error::{KnockError, KnockResult};

/// Source of the expected knock sequence.
///
/// Implementations must be deterministic: the same `(source, at)` pair
/// always yields the same sequence.
pub trait SequenceProvider: Send {
    /// Return the ordered ports `source` must knock at time `at`.
    fn sequence(&self, source: IpAddr, at: SystemTime) -> Vec<u16>;
}

/// A fixed sequence shared by every source, regardless of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSequence {
    ports: Vec<u16>,
}

impl StaticSequence {
    /// Create a static provider. The sequence must not be empty.
    pub fn new(ports: Vec<u16>) -> KnockResult<Self> {
        if ports.is_empty() {
            return Err(KnockError::config("Static knock sequence must not be empty"));
        }
        Ok(Self { ports })
    }
}

impl SequenceProvider for StaticSequence {
    fn sequence(&self, _source: IpAddr, _at: SystemTime) -> Vec<u16> {
        self.ports.clone()
    }
}
