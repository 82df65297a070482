//! Engine configuration file parsing (.blocksync.toml)
//!
//! The file lives at the scope root. A missing file yields the defaults.
//! Scope rules and the conflict policy are read once per engine and handed
//! to sessions as immutable snapshots.

use std::path::Path;
use std::time::Duration;

use crate::chunker::ChunkConfig;
use crate::conflict::ConflictPolicy;
use crate::error::{Result, SyncError};
use crate::retry::RetryConfig;
use crate::scope::ScopeRule;
use crate::store::RetentionPolicy;

/// Config file name
pub const CONFIG_FILE: &str = ".blocksync.toml";

/// Engine configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of this client, used for conflict copies and write stamps
    pub client_name: String,
    pub chunking: ChunkConfig,
    pub limits: Limits,
    /// Sessions processed in parallel
    pub workers: usize,
    /// Concurrent block transfers within one session
    pub block_fanout: usize,
    pub retry: RetrySettings,
    pub retention: RetentionSettings,
    pub conflict_policy: ConflictPolicy,
    /// Selective sync rules
    #[serde(rename = "scope")]
    pub scope_rules: Vec<ScopeRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            chunking: ChunkConfig::default(),
            limits: Limits::default(),
            workers: 4,
            block_fanout: 8,
            retry: RetrySettings::default(),
            retention: RetentionSettings::default(),
            conflict_policy: ConflictPolicy::KeepBoth,
            scope_rules: Vec::new(),
        }
    }
}

fn default_client_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "this device".to_string())
}

/// Per-file capacity limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Limits {
    /// Largest file the engine will sync, in bytes
    pub max_file_size: u64,
    /// Largest block count a single manifest may hold
    pub max_blocks: usize,
    /// Map size of the local block store, in bytes; derived from
    /// `max_file_size` when unset
    pub block_store_size: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: 2 * 1024 * 1024 * 1024,
            max_blocks: 1_000_000,
            block_store_size: None,
        }
    }
}

/// Smallest derived block store map size
const MIN_BLOCK_STORE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Map sizes are rounded up to this, a multiple of every OS page size
const MAP_ALIGN: u64 = 64 * 1024;

/// Versions of a largest-allowed file the derived map size holds
const BLOCK_STORE_VERSIONS: u64 = 4;

impl Limits {
    /// Map size for the local block store
    #[must_use]
    pub fn block_store_map_size(&self) -> usize {
        let size = self.block_store_size.unwrap_or_else(|| {
            self.max_file_size
                .saturating_mul(BLOCK_STORE_VERSIONS)
                .max(MIN_BLOCK_STORE_SIZE)
        });
        let aligned = size.div_ceil(MAP_ALIGN).saturating_mul(MAP_ALIGN);
        usize::try_from(aligned).unwrap_or(usize::MAX)
    }

    fn validate(&self) -> Result<()> {
        let Some(size) = self.block_store_size else {
            return Ok(());
        };
        if size < self.max_file_size.saturating_mul(2) {
            return Err(SyncError::Config(format!(
                "limits.block_store_size ({size}) must hold two versions of \
                 limits.max_file_size ({})",
                self.max_file_size
            )));
        }
        Ok(())
    }
}

/// Backoff settings for transient transfer failures
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            factor: 2.0,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(SyncError::Config(format!(
                "retry.factor must be a finite number >= 1.0, got {}",
                self.factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            factor: settings.factor,
        }
    }
}

/// How much manifest history is kept per path
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_versions: usize,
    /// Versions older than this are evicted (the current one never is)
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_versions: 25,
            max_age_secs: Some(30 * 24 * 60 * 60),
        }
    }
}

impl From<RetentionSettings> for RetentionPolicy {
    fn from(settings: RetentionSettings) -> Self {
        Self {
            max_versions: settings.max_versions,
            max_age: settings.max_age_secs.map(Duration::from_secs),
        }
    }
}

impl EngineConfig {
    /// Load config from the scope root.
    ///
    /// Returns default config if .blocksync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate config text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("{CONFIG_FILE}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".into()));
        }
        if self.block_fanout == 0 {
            return Err(SyncError::Config("block_fanout must be at least 1".into()));
        }
        if self.retention.max_versions == 0 {
            return Err(SyncError::Config(
                "retention.max_versions must be at least 1".into(),
            ));
        }
        if self.client_name.trim().is_empty() {
            return Err(SyncError::Config("client_name must not be empty".into()));
        }
        if self.client_name.contains(['/', '\\', '\0']) || self.client_name.contains("..") {
            return Err(SyncError::Config(
                "client_name must not contain path separators or `..`".into(),
            ));
        }
        self.limits.validate()?;
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
client_name = "laptop"
workers = 2
block_fanout = 4
conflict_policy = "last_write_wins"

[chunking]
min_size = 1024
avg_size = 8192
max_size = 65536

[limits]
max_file_size = 1048576

[retry]
max_attempts = 3

[retention]
max_versions = 10

[[scope]]
prefix = "Documents"
included = true

[[scope]]
prefix = "Documents/Archive"
included = false
priority = 5
"#;

        let config = EngineConfig::parse(toml).unwrap();
        assert_eq!(config.client_name, "laptop");
        assert_eq!(config.workers, 2);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriteWins);
        assert_eq!(config.chunking.avg_size, 8192);
        // Unspecified fields in a table fall back to defaults
        assert_eq!(config.chunking.single_block_threshold, 4 * 4096);
        assert_eq!(config.limits.max_file_size, 1_048_576);
        assert_eq!(config.limits.max_blocks, Limits::default().max_blocks);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert_eq!(config.retention.max_versions, 10);
        assert_eq!(config.scope_rules.len(), 2);
        assert_eq!(config.scope_rules[1].path_prefix, "Documents/Archive");
        assert!(!config.scope_rules[1].included);
        assert_eq!(config.scope_rules[1].priority, 5);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = EngineConfig::parse("").unwrap();
        assert!(config.scope_rules.is_empty());
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepBoth);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::parse("workers = 0").is_err());
        assert!(EngineConfig::parse("[chunking]\nmin_size = 1").is_err());
        assert!(EngineConfig::parse("conflict_policy = \"coin_flip\"").is_err());
    }

    #[test]
    fn test_block_store_map_size() {
        let gib = 1024 * 1024 * 1024;
        let limits = Limits::default();
        assert_eq!(limits.block_store_map_size() as u64, 8 * gib);
        assert!(limits.block_store_map_size() as u64 >= 2 * limits.max_file_size);

        let small = Limits {
            max_file_size: 1_000,
            ..Limits::default()
        };
        assert_eq!(small.block_store_map_size() as u64, 4 * gib);

        let explicit = Limits {
            block_store_size: Some(gib + 1),
            ..Limits::default()
        };
        assert_eq!(explicit.block_store_map_size() as u64, gib + MAP_ALIGN);

        let config = EngineConfig::parse("[limits]\nblock_store_size = 17179869184").unwrap();
        assert_eq!(config.limits.block_store_map_size() as u64, 16 * gib);
        assert!(matches!(
            EngineConfig::parse("[limits]\nblock_store_size = 1048576"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bad_retry_and_client_name() {
        for retry in [
            "factor = -1.0",
            "factor = 0.5",
            "factor = nan",
            "factor = inf",
            "initial_delay_ms = 10\nmax_delay_ms = 5",
        ] {
            let text = format!("[retry]\n{retry}");
            assert!(
                matches!(EngineConfig::parse(&text), Err(SyncError::Config(_))),
                "{retry:?} accepted"
            );
        }
        assert!(EngineConfig::parse("[retry]\nfactor = 1.0").is_ok());

        for name in ["../up", "a/b", "a\\b", ".."] {
            let text = format!("client_name = {name:?}");
            assert!(EngineConfig::parse(&text).is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.workers, 4);
    }
}
