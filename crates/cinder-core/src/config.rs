use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable that overrides `engine.base_url`.
pub const ENGINE_URL_ENV: &str = "CINDER_ENGINE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CinderConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8765".into()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_query_timeout_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_retained_terminal")]
    pub max_retained_terminal: usize,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_max_jobs() -> usize {
    256
}
fn default_retention_secs() -> u64 {
    600
}
fn default_max_retained_terminal() -> usize {
    64
}
fn default_cancel_grace_secs() -> u64 {
    30
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            retention_secs: default_retention_secs(),
            max_retained_terminal: default_max_retained_terminal(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressingConfig {
    #[serde(default = "default_root")]
    pub default_root: String,
}

fn default_root() -> String {
    "/obj".into()
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            default_root: default_root(),
        }
    }
}

impl CinderConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: CinderConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `explicit` if given, otherwise from the first file found in
    /// the search path. No file at all means defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            return Self::from_file(path);
        }
        match search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading config");
                Self::from_file(&path)
            }
            None => {
                tracing::debug!("No cinder.toml found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply `CINDER_ENGINE_URL` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(ENGINE_URL_ENV)
            && !url.trim().is_empty()
        {
            self.engine.base_url = url.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.engine.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "engine.base_url must be an http(s) URL, got `{url}`"
            )));
        }
        if self.jobs.max_jobs == 0 {
            return Err(ConfigError::Invalid("jobs.max_jobs must be at least 1".into()));
        }
        if !self.addressing.default_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "addressing.default_root must be absolute, got `{}`",
                self.addressing.default_root
            )));
        }
        Ok(())
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("cinder.toml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("cinder").join("cinder.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: CinderConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.base_url, "http://127.0.0.1:8765");
        assert_eq!(config.engine.request_timeout_secs, 30);
        assert_eq!(config.jobs.max_jobs, 256);
        assert_eq!(config.addressing.default_root, "/obj");
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[engine]
base_url = "http://10.0.0.5:9000"
request_timeout_secs = 10
lock_timeout_ms = 250
query_timeout_ms = 500

[jobs]
max_jobs = 8
retention_secs = 60
max_retained_terminal = 4
cancel_grace_secs = 5

[addressing]
default_root = "/stage"
"#;
        let config: CinderConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.base_url, "http://10.0.0.5:9000");
        assert_eq!(config.engine.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.engine.query_timeout(), Duration::from_millis(500));
        assert_eq!(config.jobs.max_jobs, 8);
        assert_eq!(config.jobs.cancel_grace(), Duration::from_secs(5));
        assert_eq!(config.addressing.default_root, "/stage");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: CinderConfig = toml::from_str("[jobs]\nmax_jobs = 3\n").unwrap();
        assert_eq!(config.jobs.max_jobs, 3);
        assert_eq!(config.jobs.retention_secs, 600);
        assert_eq!(config.engine.lock_timeout_ms, 5000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = CinderConfig::default();
        config.engine.base_url = "127.0.0.1:8765".into();
        assert!(config.validate().is_err());

        let mut config = CinderConfig::default();
        config.jobs.max_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = CinderConfig::default();
        config.addressing.default_root = "obj".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(&path, "[engine]\nbase_url = \"http://localhost:7000\"\n").unwrap();
        let config = CinderConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.base_url, "http://localhost:7000");
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(&path, "[engine\nbase_url = 3").unwrap();
        assert!(matches!(
            CinderConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn discover_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = CinderConfig::discover(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert!(err.to_string().contains("config"));
    }
}
