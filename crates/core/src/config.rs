//! Engine configuration, loaded from an optional TOML file with CLI/env
//! overrides applied above it (the process shell owns precedence; this
//! module only defines the shape and defaults).

use serde::Deserialize;

fn default_listing_ttl() -> u64 {
    30
}
fn default_meta_ttl() -> u64 {
    300
}
fn default_max_open() -> usize {
    16
}
fn default_max_extract_elements() -> u64 {
    25_000_000
}
fn default_exact_line_points() -> u64 {
    20_000
}
fn default_heatmap_max_side() -> u32 {
    1024
}
fn default_concurrent_requests() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    S3,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub base_dir: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_listing_ttl")]
    pub listing_ttl_seconds: u64,
    #[serde(default = "default_meta_ttl")]
    pub meta_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { listing_ttl_seconds: default_listing_ttl(), meta_ttl_seconds: default_meta_ttl() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadersConfig {
    #[serde(default = "default_max_open")]
    pub max_open: usize,
}

impl Default for ReadersConfig {
    fn default() -> Self {
        Self { max_open: default_max_open() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_extract_elements")]
    pub max_extract_elements: u64,
    #[serde(default = "default_exact_line_points")]
    pub exact_line_points: u64,
    #[serde(default = "default_heatmap_max_side")]
    pub heatmap_max_side: u32,
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_extract_elements: default_max_extract_elements(),
            exact_line_points: default_exact_line_points(),
            heatmap_max_side: default_heatmap_max_side(),
            concurrent_requests: default_concurrent_requests(),
        }
    }
}

/// Top-level configuration, deserialized from TOML. Unknown keys are
/// ignored (forward compatibility); `storage` has no `Default` because the
/// selected mode determines which of its fields are actually required —
/// that validation happens in `validate()`, not at deserialize time.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub readers: ReadersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("storage.mode=local requires storage.base_dir")]
    MissingBaseDir,
    #[error("storage.mode=s3 requires storage.endpoint, storage.bucket, storage.access_key and storage.secret_key")]
    MissingS3Fields,
}

impl ServiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Required fields for the selected `storage.mode` are enforced here
    /// rather than at deserialize time, since the grammar differs per mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.mode {
            StorageMode::Local => {
                if self.storage.base_dir.is_none() {
                    return Err(ConfigError::MissingBaseDir);
                }
            }
            StorageMode::S3 => {
                let s = &self.storage;
                if s.endpoint.is_none()
                    || s.bucket.is_none()
                    || s.access_key.is_none()
                    || s.secret_key.is_none()
                {
                    return Err(ConfigError::MissingS3Fields);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mode_requires_base_dir() {
        let toml = r#"
            [storage]
            mode = "local"
        "#;
        let err = ServiceConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBaseDir));
    }

    #[test]
    fn defaults_fill_in_when_sections_are_absent() {
        let toml = r#"
            [storage]
            mode = "local"
            base_dir = "/data"
        "#;
        let config = ServiceConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.cache.listing_ttl_seconds, 30);
        assert_eq!(config.limits.concurrent_requests, 32);
        assert_eq!(config.readers.max_open, 16);
    }
}
