//! Knock sequence validation.
//!
//! [`StateTracker`] follows individual sources through one expected
//! sequence; [`CredentialDispatcher`] runs one tracker per configured
//! identity and reports which identity, if any, a knock completes.

mod dispatcher;
mod state;

pub use dispatcher::{CredentialDispatcher, Identity};
pub use state::{RepeatPolicy, StateTracker, TrackerConfig};
