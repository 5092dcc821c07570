//! Per-source knock sequence tracking.
//!
//! A [`StateTracker`] follows every source address independently through
//! its expected sequence, recomputing that sequence on each event so that
//! window rotation is picked up without any timer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::trace;

use crate::error::{KnockError, KnockResult};
use crate::sequence::SequenceProvider;

/// What to do with an attempt that arrives sooner than `min_interval`
/// after the previous one from the same source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    /// Drop all progress for the source.
    #[default]
    Reset,
    /// Silently ignore a quick repeat of the last accepted port (a client
    /// retransmitting the same knock); any other quick attempt resets.
    Forgive,
}

/// Timing and fault tolerance for a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Dead time after the last attempt beyond which progress restarts.
    pub timeout: Duration,
    /// Minimum spacing between two attempts from the same source.
    pub min_interval: Duration,
    /// Wrong ports tolerated back to back before progress is dropped.
    pub max_consecutive_mistakes: u32,
    pub repeat_policy: RepeatPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            min_interval: Duration::from_secs(1),
            max_consecutive_mistakes: 3,
            repeat_policy: RepeatPolicy::Reset,
        }
    }
}

impl TrackerConfig {
    /// `timeout` must be strictly longer than `min_interval`, otherwise no
    /// two consecutive knocks could ever be accepted.
    pub fn validate(&self) -> KnockResult<()> {
        if self.timeout <= self.min_interval {
            return Err(KnockError::config(format!(
                "Tracker timeout ({:?}) must be longer than min_interval ({:?})",
                self.timeout, self.min_interval
            )));
        }
        Ok(())
    }
}

/// Progress of one source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceState {
    hits: usize,
    last_attempt: SystemTime,
    consecutive_mistakes: u32,
}

impl SourceState {
    fn fresh(at: SystemTime, min_interval: Duration) -> Self {
        Self {
            hits: 0,
            // Back-dated so the first attempt is never "too quick".
            last_attempt: at.checked_sub(min_interval).unwrap_or(SystemTime::UNIX_EPOCH),
            consecutive_mistakes: 0,
        }
    }

    fn restart(&mut self) {
        self.hits = 0;
        self.consecutive_mistakes = 0;
    }
}

/// Validates knocks from many sources against one sequence provider.
///
/// Not synchronized: every call must come from the single task that owns
/// the tracker.
#[derive(Debug)]
pub struct StateTracker<P> {
    provider: P,
    config: TrackerConfig,
    sources: HashMap<IpAddr, SourceState>,
    last_sweep: Option<SystemTime>,
}

impl<P: SequenceProvider> StateTracker<P> {
    /// Create a tracker after validating `config`.
    pub fn new(provider: P, config: TrackerConfig) -> KnockResult<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            sources: HashMap::new(),
            last_sweep: None,
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Record a knock on `port` from `source` at `at`.
    ///
    /// Returns `true` only for the call that completes the sequence; the
    /// source is then back to idle.
    pub fn check_sequence(&mut self, source: IpAddr, port: u16, at: SystemTime) -> bool {
        self.sweep(at);

        let config = self.config;
        let sequence = self.provider.sequence(source, at);
        let state = self
            .sources
            .entry(source)
            .or_insert_with(|| SourceState::fresh(at, config.min_interval));

        if at < state.last_attempt + config.min_interval {
            let is_repeat = state.hits > 0 && sequence.get(state.hits - 1) == Some(&port);
            if config.repeat_policy == RepeatPolicy::Forgive && is_repeat {
                trace!(%source, port, "Ignoring quick repeat of last accepted port");
                return false;
            }
            trace!(%source, port, hits = state.hits, "Attempt too quick, resetting source");
            self.sources.remove(&source);
            return false;
        }

        if at >= state.last_attempt + config.timeout {
            if state.hits > 0 {
                trace!(%source, hits = state.hits, "Knock sequence timed out");
            }
            state.restart();
        }

        if state.hits >= sequence.len() {
            return false;
        }

        if sequence[state.hits] == port {
            state.hits += 1;
            state.consecutive_mistakes = 0;
            state.last_attempt = at;

            if state.hits == sequence.len() {
                state.hits = 0;
                return true;
            }
            return false;
        }

        state.consecutive_mistakes += 1;
        if state.consecutive_mistakes > config.max_consecutive_mistakes {
            trace!(
                %source,
                hits = state.hits,
                mistakes = state.consecutive_mistakes,
                "Mistake budget exhausted, resetting progress"
            );
            state.restart();
        }
        state.last_attempt = at;
        false
    }

    /// Number of sources currently holding state.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Drop sources idle for two timeouts, at most once per `timeout` of
    /// event time.
    ///
    /// Events stamped on different ports can reach the tracker slightly out
    /// of order. A dropped entry would have been restarted by any event
    /// stamped less than one timeout before `now`, so outcomes only change
    /// if events arrive more than a full timeout out of order.
    fn sweep(&mut self, now: SystemTime) {
        let timeout = self.config.timeout;
        match self.last_sweep {
            Some(last) if now < last + timeout => return,
            _ => {}
        }
        self.last_sweep = Some(now);

        let idle_limit = timeout * 2;
        let before = self.sources.len();
        self.sources
            .retain(|_, state| now < state.last_attempt + idle_limit);
        let removed = before - self.sources.len();
        if removed > 0 {
            trace!(removed, remaining = self.sources.len(), "Swept idle knock sources");
        }
    }
}
