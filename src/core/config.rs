//! VFS configuration
//!
//! All keys are optional; missing ones take the defaults below. Keys use
//! camelCase so the same document can be shared with other bindings:
//!
//! ```toml
//! cacheBytes = 33554432
//! pageSize = 32768
//! maxRetries = 3
//! prefetchDepth = 4
//! ```

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Smallest page size SQLite can work with
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest fetch granularity accepted
pub const MAX_PAGE_SIZE: u32 = 1 << 20;

/// Name the VFS registers under unless configured otherwise
pub const DEFAULT_VFS_NAME: &str = "web";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct VfsConfig {
    /// Page cache capacity in bytes
    #[validate(range(min = 512))]
    pub cache_bytes: u64,

    /// Fetch granularity in bytes (power of two)
    #[validate(range(min = 512, max = 1048576))]
    pub page_size: u32,

    /// Retries after the first attempt for transient failures
    #[validate(range(max = 32))]
    pub max_retries: u32,

    /// Pages fetched ahead once a stride is detected (0 disables prefetch)
    #[validate(range(max = 256))]
    pub prefetch_depth: u32,

    /// Accesses that must share one positive stride before prefetching
    #[validate(range(min = 2, max = 16))]
    pub prefetch_window: u32,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// Bearer token sent with every request
    pub auth_token: Option<String>,

    pub user_agent: String,

    /// Accept writes into an in-memory overlay instead of refusing them
    pub overlay: bool,

    #[validate(range(min = 1, max = 64))]
    pub worker_threads: u32,

    #[validate(length(min = 1, max = 64))]
    pub vfs_name: String,

    pub make_default: bool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        VfsConfig {
            cache_bytes: 64 * 1024 * 1024,
            page_size: 32 * 1024,
            max_retries: 4,
            prefetch_depth: 4,
            prefetch_window: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            auth_token: None,
            user_agent: format!("sqlite-web-vfs/{}", env!("CARGO_PKG_VERSION")),
            overlay: false,
            worker_threads: 2,
            vfs_name: DEFAULT_VFS_NAME.to_string(),
            make_default: false,
        }
    }
}

impl VfsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: VfsConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Field ranges plus the cross-field rules the derive cannot express
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "pageSize {} is not a power of two",
                self.page_size
            )));
        }
        if self.cache_bytes < self.page_size as u64 {
            return Err(ConfigError::Invalid(format!(
                "cacheBytes {} cannot hold a single {}-byte page",
                self.cache_bytes, self.page_size
            )));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retryBaseDelayMs {} exceeds retryMaxDelayMs {}",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.vfs_name.contains('\0') {
            return Err(ConfigError::Invalid("vfsName contains a NUL byte".into()));
        }

        Ok(())
    }

    pub fn page_size_bytes(&self) -> usize {
        self.page_size as usize
    }

    pub fn cache_capacity(&self) -> usize {
        usize::try_from(self.cache_bytes).unwrap_or(usize::MAX)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
