//! Configuration for the `parley` binary.
//!
//! Sources, later ones winning:
//! - built-in defaults
//! - `~/.config/parley/config.toml`, or the file given with `--config`
//! - `PARLEY_*` environment variables, e.g. `PARLEY_CORRELATION__REQUEST_TIMEOUT_MS`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use parley_correlation::CorrelationConfig;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "PARLEY";

/// Load generator defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadgenConfig {
    /// Total requests to send
    pub requests: usize,
    /// Requests in flight at once
    pub concurrency: usize,
    /// Request body size in bytes
    pub payload_size: usize,
}

impl Default for LoadgenConfig {
    fn default() -> Self {
        Self {
            requests: 1_000,
            concurrency: 64,
            payload_size: 64,
        }
    }
}

/// Everything the binary can be configured with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub correlation: CorrelationConfig,
    pub loadgen: LoadgenConfig,
}

impl Settings {
    /// Load settings from the default or given file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Load settings with an explicit environment, for tests.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(default_path) = Self::config_file_path() {
                    builder = builder
                        .add_source(File::from(default_path).format(FileFormat::Toml).required(false));
                }
            }
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        tracing::debug!(?settings, "Loaded configuration");
        Ok(settings)
    }

    /// Default config file location, if the platform has a config directory.
    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parley").join("config.toml"))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_correlation::CorrelationMode;
    use std::io::Write;

    fn empty_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn test_defaults_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let settings = Settings::load_from(Some(&path), empty_env()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.correlation.mode, CorrelationMode::TransportAssigned);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[correlation]
mode = "provisional"
request_timeout_ms = 750

[loadgen]
concurrency = 8
"#
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path()), empty_env()).unwrap();
        assert_eq!(settings.correlation.mode, CorrelationMode::Provisional);
        assert_eq!(settings.correlation.request_timeout_ms, 750);
        assert_eq!(settings.correlation.sweep_interval_ms, 1_000);
        assert_eq!(settings.loadgen.concurrency, 8);
        assert_eq!(settings.loadgen.requests, 1_000);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[correlation]\nrequest_timeout_ms = 750").unwrap();

        let env = HashMap::from([
            (
                "PARLEY_CORRELATION__REQUEST_TIMEOUT_MS".to_string(),
                "1500".to_string(),
            ),
            ("PARLEY_LOADGEN__REQUESTS".to_string(), "10".to_string()),
        ]);
        let settings = Settings::load_from(Some(file.path()), Some(env)).unwrap();
        assert_eq!(settings.correlation.request_timeout_ms, 1_500);
        assert_eq!(settings.loadgen.requests, 10);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Settings::load_from(Some(&path), empty_env()).is_err());
    }

    #[test]
    fn test_toml_output_parses_back() {
        let rendered = Settings::default().to_toml().unwrap();
        assert!(rendered.contains("[correlation]"));
        assert!(rendered.contains("mode = \"transport_assigned\""));
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, Settings::default());
    }
}
