//! Multi-identity knock dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use tracing::debug;

use crate::error::{KnockError, KnockResult};
use crate::listen::KnockEvent;
use crate::sequence::{SequenceConfig, SequenceProvider, TimeBasedSequence};

use super::{StateTracker, TrackerConfig};

/// A named credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub secret: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One [`StateTracker`] per identity, each bound to that identity's secret.
///
/// Every event is fed to every tracker so that each one sees the complete
/// stream from a source, even after another identity has completed.
#[derive(Debug)]
pub struct CredentialDispatcher {
    trackers: BTreeMap<String, StateTracker<TimeBasedSequence>>,
}

impl CredentialDispatcher {
    /// Build trackers for `identities`.
    ///
    /// # Arguments
    ///
    /// * `identities` - Named secrets, one tracker each
    /// * `sequence` - Sequence shape shared by all identities
    /// * `tracker` - Timing and mistake policy shared by all identities
    ///
    /// # Errors
    ///
    /// Returns [`KnockError::Config`] if:
    /// - No identity is given
    /// - A name is empty or used twice
    /// - A secret is empty
    /// - `sequence` or `tracker` fails validation
    pub fn new(
        identities: impl IntoIterator<Item = Identity>,
        sequence: SequenceConfig,
        tracker: TrackerConfig,
    ) -> KnockResult<Self> {
        let mut trackers = BTreeMap::new();

        for identity in identities {
            if identity.name.is_empty() {
                return Err(KnockError::config("Identity name must not be empty"));
            }
            if identity.secret.is_empty() {
                return Err(KnockError::config(format!(
                    "Identity '{}' has an empty secret",
                    identity.name
                )));
            }
            if trackers.contains_key(&identity.name) {
                return Err(KnockError::config(format!(
                    "Duplicate identity '{}'",
                    identity.name
                )));
            }

            let provider = TimeBasedSequence::new(sequence, identity.secret)?;
            trackers.insert(identity.name, StateTracker::new(provider, tracker)?);
        }

        if trackers.is_empty() {
            return Err(KnockError::config("At least one identity must be configured"));
        }

        debug!(identities = trackers.len(), "Credential dispatcher ready");
        Ok(Self { trackers })
    }

    /// Feed one knock to every identity's tracker.
    ///
    /// Returns the name of the first identity (in name order) whose
    /// sequence this knock completes.
    pub fn check_sequence(&mut self, source: IpAddr, port: u16, at: SystemTime) -> Option<&str> {
        let mut completed = None;
        for (name, tracker) in self.trackers.iter_mut() {
            if tracker.check_sequence(source, port, at) && completed.is_none() {
                completed = Some(name.as_str());
            }
        }
        completed
    }

    /// [`check_sequence`](Self::check_sequence) for a received event.
    pub fn check(&mut self, event: &KnockEvent) -> Option<&str> {
        self.check_sequence(event.source, event.port, event.timestamp)
    }

    /// Names of the configured identities, in dispatch order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.trackers.keys().map(String::as_str)
    }

    /// Expected sequence for `identity` from `source` at `at`.
    pub fn expected_sequence(
        &self,
        identity: &str,
        source: IpAddr,
        at: SystemTime,
    ) -> Option<Vec<u16>> {
        self.trackers
            .get(identity)
            .map(|tracker| tracker.provider().sequence(source, at))
    }

    /// Rotation window containing `at`.
    pub fn window_index(&self, at: SystemTime) -> u64 {
        self.trackers
            .values()
            .next()
            .map(|tracker| tracker.provider().window_index(at))
            .unwrap_or(0)
    }
}
