//! Audit logging module.
//!
//! Records every completed knock sequence as a JSON line so grants can be
//! reviewed independently of the daemon's diagnostic logs.

mod entry;
mod logger;

pub use entry::GrantEntry;
pub use logger::AuditLogger;
