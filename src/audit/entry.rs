//! Audit entry types.

use std::net::IpAddr;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A completed knock, as recorded in the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct GrantEntry {
    /// RFC 3339 time of the completing knock.
    pub timestamp: String,
    /// Unique identifier for this grant.
    pub grant_id: Uuid,
    /// Identity whose sequence was completed.
    pub identity: String,
    /// Source address that knocked.
    pub source: IpAddr,
    /// Last port of the sequence.
    pub port: u16,
    /// Rotation window the sequence belonged to.
    pub window: u64,
}

impl GrantEntry {
    pub fn new(
        at: SystemTime,
        identity: impl Into<String>,
        source: IpAddr,
        port: u16,
        window: u64,
    ) -> Self {
        let timestamp: DateTime<Utc> = at.into();
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            grant_id: Uuid::new_v4(),
            identity: identity.into(),
            source,
            port,
            window,
        }
    }
}
