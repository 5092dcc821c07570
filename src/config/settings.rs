//! Configuration settings for the knock daemon.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{KnockError, KnockResult};
use crate::listen::ListenerConfig;
use crate::sequence::SequenceConfig;
use crate::tracker::{Identity, RepeatPolicy, TrackerConfig};

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Knock port listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    /// Address the knock sockets bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// First port to bind. Defaults to `sequence.min_port`.
    pub start_port: Option<u16>,
    /// Last port to bind. Defaults to `sequence.max_port - 1`.
    pub end_port: Option<u16>,
    /// Event queue capacity between the sockets and the worker.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Timing policy for knock validation.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
    /// Idle time in milliseconds after which a partial knock is forgotten.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Minimum spacing in milliseconds between knocks from one source.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Wrong ports tolerated in a row before a partial knock is dropped.
    #[serde(default = "default_max_consecutive_mistakes")]
    pub max_consecutive_mistakes: u32,
    /// Handling of knocks arriving faster than `min_interval_ms`.
    #[serde(default)]
    pub repeat_policy: RepeatPolicy,
}

/// A configured identity. Exactly one of `secret` and `secret_path` must
/// be set.
#[derive(Clone, Deserialize)]
pub struct IdentityConfig {
    pub name: String,
    /// Inline shared secret.
    pub secret: Option<String>,
    /// File holding the shared secret; must be readable by its owner only.
    pub secret_path: Option<PathBuf>,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("name", &self.name)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_path", &self.secret_path)
            .finish()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Audit logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Whether completed knocks are written to the audit log.
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Path to the audit log file.
    #[serde(default = "default_audit_log_path")]
    pub log_path: PathBuf,
}

// Default value functions
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_queue_depth() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_max_consecutive_mistakes() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/knockd/grants.log")
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            start_port: None,
            end_port: None,
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_consecutive_mistakes: default_max_consecutive_mistakes(),
            repeat_policy: RepeatPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            log_path: default_audit_log_path(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns [`KnockError::Config`] if:
    /// - The file does not exist or cannot be read
    /// - The TOML is malformed
    /// - Validation fails (ranges, timing, identities)
    pub fn load<P: AsRef<Path>>(path: P) -> KnockResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KnockError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            KnockError::Config { message } => {
                KnockError::config(format!("{} (in '{}')", message, path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> KnockResult<Self> {
        let settings: Settings = toml::from_str(content)
            .map_err(|e| KnockError::config(format!("Failed to parse config: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    fn validate(&self) -> KnockResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(KnockError::config(format!(
                "Invalid log level '{}'. Valid levels: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(KnockError::config(format!(
                "Invalid log format '{}'. Valid formats: {:?}",
                self.logging.format, valid_formats
            )));
        }

        self.sequence.validate()?;
        self.tracker_config().validate()?;

        let listener = self.listener_config();
        listener.validate()?;
        // Every port a sequence can contain must be observable.
        let highest = self.sequence.max_port - 1;
        if listener.start_port > self.sequence.min_port || listener.end_port < highest {
            return Err(KnockError::config(format!(
                "Listener ports {}-{} do not cover the sequence range {}-{}",
                listener.start_port, listener.end_port, self.sequence.min_port, highest
            )));
        }

        if self.identities.is_empty() {
            return Err(KnockError::config(
                "At least one [[identities]] entry must be configured",
            ));
        }
        let mut names = HashSet::new();
        for identity in &self.identities {
            if identity.name.trim().is_empty() {
                return Err(KnockError::config("Identity name must not be empty"));
            }
            if !names.insert(identity.name.as_str()) {
                return Err(KnockError::config(format!(
                    "Duplicate identity '{}'",
                    identity.name
                )));
            }
            match (&identity.secret, &identity.secret_path) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(KnockError::config(format!(
                        "Identity '{}' must set exactly one of 'secret' or 'secret_path'",
                        identity.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Listener configuration with the port range resolved.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_address: self.listener.bind_address,
            start_port: self.listener.start_port.unwrap_or(self.sequence.min_port),
            end_port: self
                .listener
                .end_port
                .unwrap_or(self.sequence.max_port.saturating_sub(1)),
            queue_depth: self.listener.queue_depth,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            timeout: Duration::from_millis(self.tracker.timeout_ms),
            min_interval: Duration::from_millis(self.tracker.min_interval_ms),
            max_consecutive_mistakes: self.tracker.max_consecutive_mistakes,
            repeat_policy: self.tracker.repeat_policy,
        }
    }

    /// Resolve every identity's secret, reading secret files as needed.
    pub fn load_identities(&self) -> KnockResult<Vec<Identity>> {
        self.identities
            .iter()
            .map(|identity| {
                let secret = match (&identity.secret, &identity.secret_path) {
                    (Some(secret), _) => secret.clone(),
                    (None, Some(path)) => load_secret(path)?,
                    (None, None) => {
                        return Err(KnockError::config(format!(
                            "Identity '{}' has no secret",
                            identity.name
                        )))
                    }
                };
                if secret.is_empty() {
                    return Err(KnockError::config(format!(
                        "Identity '{}' has an empty secret",
                        identity.name
                    )));
                }
                Ok(Identity::new(identity.name.clone(), secret))
            })
            .collect()
    }
}

/// Read a shared secret from a file.
///
/// The file must not be accessible to group or others. Trailing line
/// breaks are stripped.
fn load_secret(path: &Path) -> KnockResult<String> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        KnockError::config(format!(
            "Failed to read secret metadata from {}: {}",
            path.display(),
            e
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(KnockError::config(format!(
                "Secret file {} has insecure permissions {:04o}, expected 0600 or 0400",
                path.display(),
                mode & 0o777
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let content = std::fs::read_to_string(path).map_err(|e| {
        KnockError::config(format!(
            "Failed to read secret from {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
        [sequence]
        min_port = 20000
        max_port = 20100

        [[identities]]
        name = "admin"
        secret = "password"
    "#;

    #[test]
    fn test_default_values() {
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_log_format(), "pretty");
        assert_eq!(default_queue_depth(), 1);
    }

    #[test]
    fn test_minimal_config_resolves_defaults() {
        let settings = Settings::from_toml(MINIMAL).unwrap();

        let listener = settings.listener_config();
        assert_eq!(listener.start_port, 20000);
        assert_eq!(listener.end_port, 20099);
        assert_eq!(listener.queue_depth, 1);

        let tracker = settings.tracker_config();
        assert_eq!(tracker.timeout, Duration::from_secs(10));
        assert_eq!(tracker.min_interval, Duration::from_secs(1));
        assert_eq!(tracker.max_consecutive_mistakes, 3);
        assert_eq!(tracker.repeat_policy, RepeatPolicy::Reset);

        assert_eq!(settings.sequence.rotation_seconds, 15);
        assert_eq!(settings.sequence.length, 10);

        let identities = settings.load_identities().unwrap();
        assert_eq!(identities, vec![Identity::new("admin", "password")]);
    }

    #[test]
    fn test_full_config() {
        let settings = Settings::from_toml(
            r#"
            [listener]
            bind_address = "127.0.0.1"
            start_port = 30000
            end_port = 30010
            queue_depth = 4

            [sequence]
            min_port = 30000
            max_port = 30010
            rotation_seconds = 30
            length = 6

            [tracker]
            timeout_ms = 5000
            min_interval_ms = 250
            max_consecutive_mistakes = 0
            repeat_policy = "forgive"

            [[identities]]
            name = "alice"
            secret = "a"

            [[identities]]
            name = "bob"
            secret = "b"

            [logging]
            level = "debug"
            format = "json"

            [audit]
            enabled = false
            log_path = "/tmp/grants.log"
            "#,
        )
        .unwrap();

        assert_eq!(settings.listener.bind_address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(settings.tracker_config().repeat_policy, RepeatPolicy::Forgive);
        assert_eq!(settings.tracker_config().min_interval, Duration::from_millis(250));
        assert_eq!(settings.identities.len(), 2);
        assert!(!settings.audit.enabled);
        assert_eq!(settings.logging.format, "json");
    }

    #[test]
    fn test_listener_must_cover_sequence_range() {
        let result = Settings::from_toml(
            r#"
            [listener]
            start_port = 20000
            end_port = 20050

            [sequence]
            min_port = 20000
            max_port = 20100

            [[identities]]
            name = "admin"
            secret = "password"
            "#,
        );
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }

    #[test]
    fn test_identities_required() {
        let result = Settings::from_toml("[sequence]\nmin_port = 20000\nmax_port = 20100\n");
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }

    #[test]
    fn test_identity_needs_exactly_one_secret_source() {
        let both = r#"
            [[identities]]
            name = "admin"
            secret = "password"
            secret_path = "/etc/knockd/admin.secret"
        "#;
        let neither = r#"
            [[identities]]
            name = "admin"
        "#;
        assert!(Settings::from_toml(both).is_err());
        assert!(Settings::from_toml(neither).is_err());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let result = Settings::from_toml(
            r#"
            [[identities]]
            name = "admin"
            secret = "one"

            [[identities]]
            name = "admin"
            secret = "two"
            "#,
        );
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }

    #[test]
    fn test_invalid_timing_rejected() {
        let result = Settings::from_toml(
            r#"
            [tracker]
            timeout_ms = 500
            min_interval_ms = 1000

            [[identities]]
            name = "admin"
            secret = "password"
            "#,
        );
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = Settings::from_toml(&format!("{}\n[logging]\nlevel = \"loud\"\n", MINIMAL));
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }

    #[test]
    fn test_unknown_repeat_policy_rejected() {
        let result = Settings::from_toml(&format!(
            "{}\n[tracker]\nrepeat_policy = \"sometimes\"\n",
            MINIMAL
        ));
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_loading() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let secret_path = temp_dir.path().join("admin.secret");
        std::fs::write(&secret_path, "from-file\n").unwrap();
        std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let settings = Settings::from_toml(&format!(
            "[[identities]]\nname = \"admin\"\nsecret_path = \"{}\"\n",
            secret_path.display()
        ))
        .unwrap();

        let identities = settings.load_identities().unwrap();
        assert_eq!(identities[0].secret, "from-file");
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_secret_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let secret_path = temp_dir.path().join("admin.secret");
        std::fs::write(&secret_path, "leaky").unwrap();
        std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let settings = Settings::from_toml(&format!(
            "[[identities]]\nname = \"admin\"\nsecret_path = \"{}\"\n",
            secret_path.display()
        ))
        .unwrap();

        assert!(matches!(
            settings.load_identities(),
            Err(KnockError::Config { .. })
        ));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = Settings::load(temp_dir.path().join("absent.toml"));
        assert!(matches!(result, Err(KnockError::Config { .. })));
    }
}
