//! Node configuration.
//!
//! Settings come from an optional YAML file; any field left out takes its
//! default, and command-line flags override individual fields afterwards.

use crate::observability::LogFormat;
use anyhow::{bail, Context};
use keel_git::{PackOptions, PushPolicy, ServeOptions};
use keel_storage::CacheConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a Keel node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Directory holding one `<name>.git` directory per repository. Without
    /// it, repositories live in memory and vanish on exit.
    pub data_dir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Seconds a request body may stall before the session fails.
    pub idle_timeout_secs: u64,
    /// Rules for pushes.
    pub push: PushConfig,
    /// Pack generation for fetches.
    pub pack: PackConfig,
    /// Object read cache for on-disk repositories.
    pub cache: CacheSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            idle_timeout_secs: 60,
            push: PushConfig::default(),
            pack: PackConfig::default(),
            cache: CacheSettings::default(),
        }
    }
}

/// Push settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    /// Apply all ref updates of a push or none.
    pub atomic: bool,
    /// Refuse non-fast-forward updates.
    pub deny_non_fast_forwards: bool,
    /// Refuse ref deletions.
    pub deny_deletes: bool,
    /// Refuse deleting the branch `HEAD` points at.
    pub deny_delete_current: bool,
    /// Create a repository on first push to an unknown name.
    pub auto_create: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        let policy = PushPolicy::default();
        Self {
            atomic: policy.atomic,
            deny_non_fast_forwards: policy.deny_non_fast_forwards,
            deny_deletes: policy.deny_deletes,
            deny_delete_current: policy.deny_delete_current,
            auto_create: true,
        }
    }
}

/// Pack generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackConfig {
    /// Delta-compress outgoing packs.
    pub deltas: bool,
    /// Delta search window.
    pub window: usize,
    /// Longest delta chain produced.
    pub max_depth: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        let options = PackOptions::default();
        Self {
            deltas: options.use_deltas,
            window: options.window,
            max_depth: options.max_depth,
        }
    }
}

/// Object cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Maximum cached objects per repository.
    pub max_objects: usize,
    /// Maximum cached payload bytes per repository.
    pub max_size_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            max_objects: config.max_objects,
            max_size_bytes: config.max_size_bytes,
        }
    }
}

impl NodeConfig {
    /// Loads `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_timeout_secs == 0 {
            bail!("idle_timeout_secs must be positive");
        }
        if self.pack.deltas && self.pack.window == 0 {
            bail!("pack.window must be positive when deltas are enabled");
        }
        if self.cache.max_objects == 0 {
            bail!("cache.max_objects must be positive");
        }
        if !matches!(
            self.log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            bail!("unknown log level {:?}", self.log_level);
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Ref update rules for the protocol engine.
    pub fn push_policy(&self) -> PushPolicy {
        PushPolicy {
            atomic: self.push.atomic,
            deny_non_fast_forwards: self.push.deny_non_fast_forwards,
            deny_deletes: self.push.deny_deletes,
            deny_delete_current: self.push.deny_delete_current,
        }
    }

    /// Pack settings for the protocol engine.
    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            use_deltas: self.pack.deltas,
            window: self.pack.window,
            max_depth: self.pack.max_depth,
            ..PackOptions::default()
        }
    }

    /// Engine options for a stateful (stdio) session.
    pub fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            pack: self.pack_options(),
            policy: self.push_policy(),
            ..ServeOptions::default()
        }
    }

    /// Cache settings for on-disk repositories.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_objects: self.cache.max_objects,
            max_size_bytes: self.cache.max_size_bytes,
            ..CacheConfig::default()
        }
    }
}
