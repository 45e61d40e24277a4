use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// How the background progress thread idles when there is no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// Busy-poll, yielding between cycles.
    Polling,
    /// Sleep `progress_interval_us` between idle cycles.
    #[default]
    Sleeping,
}

/// Settings for a context and the workers created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UcxxConfig {
    /// Default for endpoints created without an explicit choice.
    pub endpoint_error_handling: bool,
    pub progress_mode: ProgressMode,
    pub progress_interval_us: u64,
    /// Opaque options forwarded to the transport's own configuration.
    pub transport_options: BTreeMap<String, String>,
}

impl Default for UcxxConfig {
    fn default() -> Self {
        Self {
            endpoint_error_handling: true,
            progress_mode: ProgressMode::Sleeping,
            progress_interval_us: 100,
            transport_options: BTreeMap::new(),
        }
    }
}

impl UcxxConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| Error::Config(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| Error::Config(e.to_string())),
            _ => Err(Error::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = UcxxConfig::default();
        assert!(config.endpoint_error_handling);
        assert_eq!(config.progress_mode, ProgressMode::Sleeping);
        assert_eq!(config.progress_interval_us, 100);
        assert!(config.transport_options.is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
endpoint_error_handling = false
progress_mode = "polling"

[transport_options]
TLS = "tcp"
RNDV_THRESH = "8192"
"#
        )
        .unwrap();

        let config = UcxxConfig::from_file(file.path()).unwrap();
        assert!(!config.endpoint_error_handling);
        assert_eq!(config.progress_mode, ProgressMode::Polling);
        assert_eq!(config.progress_interval_us, 100);
        assert_eq!(config.transport_options.get("TLS").map(String::as_str), Some("tcp"));
        assert_eq!(config.transport_options.len(), 2);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "progress_interval_us": 250, "transport_options": {{ "TLS": "shm" }} }}"#
        )
        .unwrap();

        let config = UcxxConfig::from_file(file.path()).unwrap();
        assert!(config.endpoint_error_handling);
        assert_eq!(config.progress_interval_us, 250);
        assert_eq!(config.transport_options.get("TLS").map(String::as_str), Some("shm"));
    }

    #[test]
    fn test_from_file_bad_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            UcxxConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file_malformed() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "progress_mode = 42").unwrap();
        assert!(matches!(
            UcxxConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
