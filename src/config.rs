//! Broker configuration.
//!
//! The storage root is always a constructor parameter. Tunables live in an
//! optional `settings.json` next to `MQManager.json`; a missing file means
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings file name inside the broker root.
pub const SETTINGS_FILE: &str = "settings.json";

/// Environment variable the CLI reads the broker root from.
pub const HOME_ENV: &str = "DIRMQ_HOME";

/// How recoverable failures are reported to callers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log the failure and hand back an empty/absent result.
    #[default]
    Lenient,
    /// Return the failure as an `Err`.
    Strict,
}

impl ErrorPolicy {
    pub fn is_strict(self) -> bool {
        self == ErrorPolicy::Strict
    }

    /// Apply the policy to a recoverable result.
    pub(crate) fn recover<T>(
        self,
        context: &str,
        result: Result<T>,
        fallback: impl FnOnce() -> T,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.is_strict() => Err(e),
            Err(e) => {
                tracing::warn!("{}: {}", context, e);
                Ok(fallback())
            }
        }
    }
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::Lenient => write!(f, "lenient"),
            ErrorPolicy::Strict => write!(f, "strict"),
        }
    }
}

/// Which key decides the "oldest" pending message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Filesystem creation time (modification time where unsupported),
    /// ties broken by the timestamp in the file name.
    #[default]
    FileCreated,
    /// The creation timestamp embedded in the message file name.
    CreationTimestamp,
}

/// Tunables shared by every exchange and queue of one broker root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerOptions {
    pub error_policy: ErrorPolicy,
    pub ordering: OrderingMode,
    /// Serialize scan-select-delete per queue with a lock file.
    pub exclusive_dequeue: bool,
    pub lock_timeout_ms: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Lenient,
            ordering: OrderingMode::FileCreated,
            exclusive_dequeue: true,
            lock_timeout_ms: 5000,
        }
    }
}

impl BrokerOptions {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingMode) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_exclusive_dequeue(mut self, exclusive: bool) -> Self {
        self.exclusive_dequeue = exclusive;
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }
}

/// Everything needed to open a broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub root: PathBuf,
    pub options: BrokerOptions,
}

impl BrokerConfig {
    /// Configuration with default options.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            options: BrokerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    /// Load options from `<root>/settings.json`, falling back to defaults.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = settings_path(&root);

        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::new(root));
        }

        let content = std::fs::read_to_string(&path)?;
        let options: BrokerOptions = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        validate_options(&options)?;

        tracing::debug!("Loaded settings from {}", path.display());
        Ok(Self { root, options })
    }

    /// Write the options to `<root>/settings.json`.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let content = serde_json::to_string_pretty(&self.options)?;
        std::fs::write(settings_path(&self.root), content)?;
        Ok(())
    }
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(SETTINGS_FILE)
}

/// Per-user default root (used by the CLI when nothing else is given).
pub fn default_root() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("org", "dirmq", "dirmq")
        .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(dirs.data_dir().join("broker"))
}

fn validate_options(options: &BrokerOptions) -> Result<()> {
    if options.exclusive_dequeue && options.lock_timeout_ms == 0 {
        return Err(Error::Config(
            "lock_timeout_ms must be positive when exclusive_dequeue is enabled".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::load(dir.path()).unwrap();

        assert_eq!(config.options, BrokerOptions::default());
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            settings_path(dir.path()),
            r#"{ "error_policy": "strict", "ordering": "creation_timestamp" }"#,
        )
        .unwrap();

        let config = BrokerConfig::load(dir.path()).unwrap();
        assert_eq!(config.options.error_policy, ErrorPolicy::Strict);
        assert_eq!(config.options.ordering, OrderingMode::CreationTimestamp);
        assert!(config.options.exclusive_dequeue);
        assert_eq!(config.options.lock_timeout_ms, 5000);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let options = BrokerOptions::default()
            .with_exclusive_dequeue(false)
            .with_lock_timeout_ms(250);
        BrokerConfig::new(dir.path()).with_options(options.clone()).save().unwrap();

        let loaded = BrokerConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.options, options);
    }

    #[test]
    fn rejects_zero_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(settings_path(dir.path()), r#"{ "lock_timeout_ms": 0 }"#).unwrap();

        assert!(matches!(BrokerConfig::load(dir.path()), Err(Error::Config(_))));
    }

    #[test]
    fn lenient_policy_swallows() {
        let out = ErrorPolicy::Lenient
            .recover("test", Err::<u32, _>(Error::NotFound("x".into())), || 7)
            .unwrap();
        assert_eq!(out, 7);

        let err = ErrorPolicy::Strict.recover("test", Err::<u32, _>(Error::NotFound("x".into())), || 7);
        assert!(matches!(err, Err(Error::NotFound(_))));
    }
}
