//! Knock sequence derivation.
//!
//! A [`SequenceProvider`] maps a source address and a point in time to the
//! ordered list of ports that source is expected to knock.

mod provider;
mod time_based;

pub use provider::{SequenceProvider, StaticSequence};
pub use time_based::{SequenceConfig, TimeBasedSequence};
