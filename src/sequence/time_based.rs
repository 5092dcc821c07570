//! Time-rotating, secret-derived knock sequences.
//!
//! The sequence for a source is derived from a SHA-1 digest over the shared
//! secret, the textual source address and the index of the current rotation
//! window:
//!
//! ```text
//! window  = floor(unix_seconds / rotation_seconds)
//! block0  = SHA1(secret || source || decimal(window))
//! blockK  = SHA1(secret || source || decimal(window) || be_u32(K))   K >= 1
//! port[i] = min_port + be_u16(material[2i..2i+2]) mod (max_port - min_port)
//! ```
//!
//! Extra blocks are only computed when the sequence needs more than the 20
//! bytes of a single digest, so sequences of up to 10 ports depend on
//! `block0` alone.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY, SHA1_OUTPUT_LEN};
use serde::Deserialize;

use crate::error::{KnockError, KnockResult};

use super::SequenceProvider;

/// Shape of the derived sequences, shared by all identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SequenceConfig {
    /// Lowest port a sequence may contain (inclusive).
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    /// Upper bound of the port range (exclusive).
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    /// Length of a rotation window in seconds.
    #[serde(default = "default_rotation_seconds")]
    pub rotation_seconds: u64,
    /// Number of ports in a sequence.
    #[serde(default = "default_length")]
    pub length: usize,
}

fn default_min_port() -> u16 {
    16000
}

fn default_max_port() -> u16 {
    65535
}

fn default_rotation_seconds() -> u64 {
    15
}

fn default_length() -> usize {
    10
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
            rotation_seconds: default_rotation_seconds(),
            length: default_length(),
        }
    }
}

impl SequenceConfig {
    /// Validate the port range, rotation interval and sequence length.
    pub fn validate(&self) -> KnockResult<()> {
        if self.min_port >= self.max_port {
            return Err(KnockError::config(format!(
                "Invalid sequence port range: min_port {} must be below max_port {}",
                self.min_port, self.max_port
            )));
        }
        if self.rotation_seconds == 0 {
            return Err(KnockError::config(
                "Sequence rotation_seconds must be greater than zero",
            ));
        }
        if self.length == 0 {
            return Err(KnockError::config("Sequence length must be greater than zero"));
        }
        Ok(())
    }

    fn span(&self) -> u16 {
        self.max_port - self.min_port
    }
}

/// Sequence provider bound to one identity's secret.
#[derive(Clone)]
pub struct TimeBasedSequence {
    config: SequenceConfig,
    secret: String,
}

impl fmt::Debug for TimeBasedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeBasedSequence")
            .field("config", &self.config)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl TimeBasedSequence {
    /// Create a provider after validating `config`.
    pub fn new(config: SequenceConfig, secret: impl Into<String>) -> KnockResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            secret: secret.into(),
        })
    }

    /// Index of the rotation window containing `at`. Times before the epoch
    /// fall into window 0.
    pub fn window_index(&self, at: SystemTime) -> u64 {
        let seconds = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        seconds / self.config.rotation_seconds
    }

    /// Sequence for `source` in an explicit rotation window.
    pub fn sequence_for_window(&self, source: IpAddr, window: u64) -> Vec<u16> {
        let material = self.digest_material(source, window);
        let span = self.config.span();

        material
            .chunks_exact(2)
            .take(self.config.length)
            .map(|pair| {
                let value = u16::from_be_bytes([pair[0], pair[1]]);
                self.config.min_port + value % span
            })
            .collect()
    }

    /// Concatenated digest blocks, at least two bytes per port.
    fn digest_material(&self, source: IpAddr, window: u64) -> Vec<u8> {
        let seed = format!("{}{}{}", self.secret, source, window);
        let needed = self.config.length * 2;
        let mut material = Vec::with_capacity(needed + SHA1_OUTPUT_LEN);

        let mut block: u32 = 0;
        while material.len() < needed {
            let mut ctx = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
            ctx.update(seed.as_bytes());
            if block > 0 {
                ctx.update(&block.to_be_bytes());
            }
            material.extend_from_slice(ctx.finish().as_ref());
            block += 1;
        }

        material
    }
}

impl SequenceProvider for TimeBasedSequence {
    fn sequence(&self, source: IpAddr, at: SystemTime) -> Vec<u16> {
        self.sequence_for_window(source, self.window_index(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn provider(secret: &str) -> TimeBasedSequence {
        TimeBasedSequence::new(
            SequenceConfig {
                min_port: 49152,
                max_port: 65535,
                rotation_seconds: 15,
                length: 4,
            },
            secret,
        )
        .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // 2022-10-31T15:00:00Z
    fn base_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_667_228_400)
    }

    #[test]
    fn test_fixed_inputs_are_reproducible() {
        let p = provider("TestSalt");
        let first = p.sequence(ip("192.168.1.1"), base_time());
        for _ in 0..10 {
            assert_eq!(p.sequence(ip("192.168.1.1"), base_time()), first);
        }
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn test_same_window_same_sequence() {
        let p = provider("TestSalt");
        // base_time is window-aligned; +10s stays inside the 15s window
        assert_eq!(
            p.sequence(ip("192.168.1.1"), base_time()),
            p.sequence(ip("192.168.1.1"), base_time() + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_window_changes_sequence() {
        let p = provider("TestSalt");
        assert_ne!(
            p.sequence(ip("192.168.1.1"), base_time()),
            p.sequence(ip("192.168.1.1"), base_time() + Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_source_changes_sequence() {
        let p = provider("TestSalt");
        assert_ne!(
            p.sequence(ip("192.168.1.1"), base_time()),
            p.sequence(ip("192.168.1.2"), base_time())
        );
    }

    #[test]
    fn test_sampled_collision_rate_is_negligible() {
        let a = provider("alpha-secret");
        let b = provider("bravo-secret");
        let mut secret_collisions = 0;
        let mut source_collisions = 0;
        let mut window_collisions = 0;

        for window in 0..2_000u64 {
            let base = a.sequence_for_window(ip("10.1.2.3"), window);
            if base == b.sequence_for_window(ip("10.1.2.3"), window) {
                secret_collisions += 1;
            }
            if base == a.sequence_for_window(ip("10.1.2.4"), window) {
                source_collisions += 1;
            }
            if base == a.sequence_for_window(ip("10.1.2.3"), window + 1) {
                window_collisions += 1;
            }
        }

        assert_eq!(secret_collisions, 0);
        assert_eq!(source_collisions, 0);
        assert_eq!(window_collisions, 0);
    }

    #[test]
    fn test_ports_stay_in_range() {
        let config = SequenceConfig {
            min_port: 16000,
            max_port: 16010,
            rotation_seconds: 30,
            length: 12,
        };
        let p = TimeBasedSequence::new(config, "range").unwrap();
        for window in 0..1_000 {
            for port in p.sequence_for_window(ip("172.16.0.9"), window) {
                assert!((16000..16010).contains(&port), "port {} out of range", port);
            }
        }
    }

    #[test]
    fn test_port_distribution_is_near_uniform() {
        let config = SequenceConfig {
            min_port: 20000,
            max_port: 20100,
            rotation_seconds: 15,
            length: 4,
        };
        let p = TimeBasedSequence::new(config, "TestSalt").unwrap();
        let windows = 50_000u64;

        let mut counts: HashMap<u16, u64> = HashMap::new();
        for window in 0..windows {
            for port in p.sequence_for_window(ip("192.168.1.1"), window) {
                *counts.entry(port).or_default() += 1;
            }
        }

        let buckets = u64::from(config.max_port - config.min_port);
        assert_eq!(counts.len() as u64, buckets);

        let expected = windows * config.length as u64 / buckets;
        let tolerance = expected / 10;
        let within = counts
            .values()
            .filter(|&&c| c >= expected - tolerance && c <= expected + tolerance)
            .count() as u64;
        assert!(
            within * 100 >= buckets * 95,
            "only {} of {} ports within 10% of {}",
            within,
            buckets,
            expected
        );
    }

    #[test]
    fn test_long_sequences_extend_digest() {
        let short = TimeBasedSequence::new(
            SequenceConfig {
                length: 10,
                ..SequenceConfig::default()
            },
            "extend",
        )
        .unwrap();
        let long = TimeBasedSequence::new(
            SequenceConfig {
                length: 25,
                ..SequenceConfig::default()
            },
            "extend",
        )
        .unwrap();

        let s = short.sequence(ip("10.0.0.1"), base_time());
        let l = long.sequence(ip("10.0.0.1"), base_time());
        assert_eq!(l.len(), 25);
        assert_eq!(&l[..10], &s[..]);
    }

    #[test]
    fn test_window_index() {
        let p = provider("TestSalt");
        assert_eq!(p.window_index(UNIX_EPOCH + Duration::from_secs(29)), 1);
        assert_eq!(p.window_index(UNIX_EPOCH + Duration::from_secs(30)), 2);
        assert_eq!(p.window_index(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cases = [
            SequenceConfig {
                min_port: 5000,
                max_port: 5000,
                ..SequenceConfig::default()
            },
            SequenceConfig {
                rotation_seconds: 0,
                ..SequenceConfig::default()
            },
            SequenceConfig {
                length: 0,
                ..SequenceConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                TimeBasedSequence::new(config, "x"),
                Err(KnockError::Config { .. })
            ));
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", provider("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
