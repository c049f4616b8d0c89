//! Session configuration with file overrides.
//!
//! Defaults are always usable; a missing config file is normal and an
//! unreadable one only costs the overrides, never the session.

use std::path::PathBuf;

use serde::Deserialize;

use outrun_protocol::SystemPaths;

fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".outrun")
        .join("cache")
}

const fn default_max_entries() -> usize {
    1024
}

const fn default_max_size() -> u64 {
    20 * 1024 * 1024 * 1024
}

const fn default_pool_size() -> usize {
    4
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_prefetch_entries() -> usize {
    256
}

const fn default_prefetch_bytes() -> u64 {
    128 * 1024 * 1024
}

const fn default_min_ratio() -> f64 {
    0.85
}

fn default_system_paths() -> Vec<String> {
    SystemPaths::DEFAULT_PREFIXES
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Cache sizing and placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_entries: usize,
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_entries: default_max_entries(),
            max_size: default_max_size(),
        }
    }
}

/// RPC client tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub pool_size: usize,
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Bulk fetch bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_entries: default_prefetch_entries(),
            max_bytes: default_prefetch_bytes(),
        }
    }
}

/// Blob compression threshold.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub min_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_ratio: default_min_ratio(),
        }
    }
}

/// Everything the session consumes at start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub rpc: RpcConfig,
    pub prefetch: PrefetchConfig,
    pub compression: CompressionConfig,
    pub system_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rpc: RpcConfig::default(),
            prefetch: PrefetchConfig::default(),
            compression: CompressionConfig::default(),
            system_paths: default_system_paths(),
        }
    }
}

impl Config {
    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".outrun")
            .join("config.json")
    }

    /// Loads overrides from a JSON file, falling back to defaults.
    #[must_use]
    pub fn load(path: &std::path::Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "config unreadable, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file");
                Self::default()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "config unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// The system-path predicate this config describes.
    #[must_use]
    pub fn system_paths(&self) -> SystemPaths {
        SystemPaths::new(self.system_paths.iter().cloned())
    }
}
