//! Service configuration (optional JSON file plus environment overrides).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VoxlinkError};

const DEFAULT_REGION: &str = "westus";
const DEFAULT_HOST_SUFFIX: &str = "stt.speech.microsoft.com";
const DEFAULT_LANGUAGE: &str = "en-US";

/// Recognition endpoint flavour. Selects the URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    /// Single utterance, short silence timeout.
    #[default]
    Interactive,
    /// Long-running, continuous turns.
    Conversation,
    /// Continuous with punctuation commands.
    Dictation,
}

impl RecognitionMode {
    pub fn path_segment(self) -> &'static str {
        match self {
            RecognitionMode::Interactive => "interactive",
            RecognitionMode::Conversation => "conversation",
            RecognitionMode::Dictation => "dictation",
        }
    }

    /// Whether turns keep looping after a `turn.end`.
    pub fn is_continuous(self) -> bool {
        !matches!(self, RecognitionMode::Interactive)
    }
}

/// Result payload detail requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Simple => "simple",
            OutputFormat::Detailed => "detailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServiceConfig {
    pub region: String,
    pub host_suffix: String,
    /// Full `wss://` endpoint. Overrides `region`/`host_suffix` when set.
    pub endpoint: Option<String>,
    pub language: String,
    pub recognition_mode: RecognitionMode,
    pub output_format: OutputFormat,
    pub subscription_key: Option<String>,
    /// Sample rate audio is sent at (Hz).
    pub target_sample_rate: u32,
    /// Duration of each audio chunk pushed by capture sources (ms).
    pub chunk_duration_ms: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.into(),
            host_suffix: DEFAULT_HOST_SUFFIX.into(),
            endpoint: None,
            language: DEFAULT_LANGUAGE.into(),
            recognition_mode: RecognitionMode::Interactive,
            output_format: OutputFormat::Simple,
            subscription_key: None,
            target_sample_rate: 16_000,
            chunk_duration_ms: 100,
        }
    }
}

impl ServiceConfig {
    pub fn normalize(&mut self) {
        self.region = non_empty_or(self.region.trim(), DEFAULT_REGION);
        self.host_suffix = non_empty_or(self.host_suffix.trim().trim_matches('.'), DEFAULT_HOST_SUFFIX);
        self.language = non_empty_or(self.language.trim(), DEFAULT_LANGUAGE);
        self.endpoint = trimmed_option(self.endpoint.take());
        self.subscription_key = trimmed_option(self.subscription_key.take());
        self.target_sample_rate = self.target_sample_rate.clamp(8_000, 48_000);
        self.chunk_duration_ms = self.chunk_duration_ms.clamp(10, 1_000);
    }

    /// Override fields from `VOXLINK_*` environment variables, then normalise.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("VOXLINK_REGION") {
            self.region = region;
        }
        if let Ok(language) = std::env::var("VOXLINK_LANGUAGE") {
            self.language = language;
        }
        if let Ok(endpoint) = std::env::var("VOXLINK_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(key) = std::env::var("VOXLINK_SUBSCRIPTION_KEY") {
            self.subscription_key = Some(key);
        }
        self.normalize();
    }

    /// Rejects configurations that cannot produce a connection.
    ///
    /// # Errors
    /// `VoxlinkError::Config` when the endpoint is not a `ws`/`wss` URL.
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            let url = url::Url::parse(endpoint)
                .map_err(|e| VoxlinkError::Config(format!("endpoint '{endpoint}': {e}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(VoxlinkError::Config(format!(
                    "endpoint scheme must be ws or wss, got '{}'",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn trimmed_option(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Load from `path`, falling back to defaults when the file is missing or corrupt.
pub fn load_config(path: &Path) -> ServiceConfig {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<ServiceConfig>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring unreadable config: {e}");
            ServiceConfig::default()
        }),
        Err(_) => ServiceConfig::default(),
    };
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &ServiceConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("absent.json"));
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(load_config(&path), ServiceConfig::default());
    }

    #[test]
    fn partial_file_is_merged_with_defaults_and_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"region":" eastus ","recognitionMode":"conversation","chunkDurationMs":5,"subscriptionKey":"  "}"#,
        )
        .expect("write");

        let config = load_config(&path);
        assert_eq!(config.region, "eastus");
        assert_eq!(config.recognition_mode, RecognitionMode::Conversation);
        assert_eq!(config.chunk_duration_ms, 10);
        assert_eq!(config.subscription_key, None);
        assert_eq!(config.language, "en-US");
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = ServiceConfig {
            language: "de-DE".into(),
            output_format: OutputFormat::Detailed,
            ..ServiceConfig::default()
        };
        save_config(&path, &config).expect("save");
        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn validate_rejects_http_endpoints() {
        let mut config = ServiceConfig {
            endpoint: Some("https://example.com/speech".into()),
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(VoxlinkError::Config(_))));
        config.endpoint = Some("wss://example.com/speech".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn interactive_is_the_only_single_shot_mode() {
        assert!(!RecognitionMode::Interactive.is_continuous());
        assert!(RecognitionMode::Conversation.is_continuous());
        assert!(RecognitionMode::Dictation.is_continuous());
    }
}
