//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use filenvault_common::{Error, Result};

/// Default service gateway.
pub const DEFAULT_API_BASE: &str = "https://gateway.filen.io";

/// Client settings, loadable from a JSON file.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the API gateway.
    pub api_base: String,
    /// Timeout for a single HTTP call, in seconds.
    pub request_timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// First backoff delay, in milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
    /// Where transfers spool encrypted chunks.
    pub scratch_dir: Option<PathBuf>,
    /// PBKDF2 rounds for master-key derivation.
    pub kdf_iterations: u32,
}

impl ClientConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        filenvault_crypto::ChunkGeometry::new(self.chunk_size)?;
        filenvault_crypto::KdfParams::new(self.kdf_iterations)?;
        Ok(())
    }

    /// Parsed API base URL.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.api_base)
            .map_err(|e| Error::InvalidInput(format!("Invalid api_base '{}': {}", self.api_base, e)))
    }

    /// Per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Initial retry delay.
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    /// Scratch directory, falling back to the platform cache dir and then
    /// the OS temp dir.
    pub fn scratch_root(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("filenvault")
            .join("scratch")
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_secs: 10,
            max_retries: 3,
            retry_initial_delay_ms: 2000,
            chunk_size: filenvault_crypto::CHUNK_SIZE,
            scratch_dir: None,
            kdf_iterations: filenvault_crypto::kdf::DEFAULT_ITERATIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url().unwrap().as_str(), "https://gateway.filen.io/");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.chunk_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"max_retries": 5, "scratch_dir": "/tmp/fv"}"#).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.scratch_root(), PathBuf::from("/tmp/fv"));
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_rejects_weak_kdf_and_odd_chunks() {
        let config = ClientConfig {
            kdf_iterations: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            api_base: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            chunk_size: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
