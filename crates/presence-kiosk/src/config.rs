//! Kiosk configuration: TOML file, then `PRESENCE_*` environment overrides.

use crate::gallery::GalleryPolicy;
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;
use presence_core::{DEFAULT_EMBEDDING_DIM, DEFAULT_MATCH_THRESHOLD};
use presence_hw::{Constraints, FacingMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device path (default: /dev/video0).
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            facing: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint returning enrolled faces.
    pub gallery_url: String,
    /// Endpoint accepting `{employeeId, mode}` attendance events.
    pub report_url: String,
    /// Bearer token for both endpoints.
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Maximum Euclidean distance for an accepted match.
    pub match_threshold: f32,
    pub embedding_dim: usize,
    /// Detection cadence.
    pub poll_interval_ms: u64,
    pub gallery_refresh_secs: u64,
    pub gallery_retry_secs: u64,
    pub gallery_retry_limit: u32,
    /// How long the camera may take to deliver its first frame.
    pub ready_timeout_secs: u64,
    /// Consecutive failed attempts before manual entry is offered.
    pub manual_entry_after: u32,
    pub report_retry_delay_ms: u64,
    /// How long a recognized name stays on screen before a new session may start.
    pub confirmation_window_ms: u64,
    pub camera: CameraConfig,
    /// Directory containing the face model files.
    pub model_dir: PathBuf,
    /// Files the extractor needs under `model_dir`.
    pub model_files: Vec<String>,
    pub model_load_attempts: u32,
    pub model_load_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gallery_url: "http://localhost:3000/api/attendance/faces".to_string(),
            report_url: "http://localhost:3000/api/attendance".to_string(),
            api_token: None,
            request_timeout_secs: 10,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            poll_interval_ms: 2000,
            gallery_refresh_secs: 30,
            gallery_retry_secs: 5,
            gallery_retry_limit: 5,
            ready_timeout_secs: 10,
            manual_entry_after: 5,
            report_retry_delay_ms: 3000,
            confirmation_window_ms: 3000,
            camera: CameraConfig::default(),
            model_dir: default_model_dir(),
            model_files: vec![
                "face_detector.onnx".to_string(),
                "face_embedder.onnx".to_string(),
            ],
            model_load_attempts: 3,
            model_load_backoff_ms: 500,
        }
    }
}

/// `$XDG_DATA_HOME/presence/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence/models")
}

impl Config {
    /// Load `path` if given (defaults otherwise), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `PRESENCE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("PRESENCE_GALLERY_URL") {
            self.gallery_url = v;
        }
        if let Some(v) = lookup("PRESENCE_REPORT_URL") {
            self.report_url = v;
        }
        if let Some(v) = lookup("PRESENCE_API_TOKEN") {
            self.api_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("PRESENCE_CAMERA_DEVICE") {
            self.camera.device = v;
        }
        if let Some(v) = lookup("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_MODEL_FILES") {
            self.model_files = v
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("PRESENCE_CAMERA_FACING") {
            self.camera.facing = match v.trim() {
                "user" => FacingMode::User,
                "environment" => FacingMode::Environment,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "PRESENCE_CAMERA_FACING".to_string(),
                        value: v,
                    })
                }
            };
        }

        let l = &lookup;
        override_parsed(l, "PRESENCE_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        override_parsed(l, "PRESENCE_MATCH_THRESHOLD", &mut self.match_threshold)?;
        override_parsed(l, "PRESENCE_EMBEDDING_DIM", &mut self.embedding_dim)?;
        override_parsed(l, "PRESENCE_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_parsed(l, "PRESENCE_GALLERY_REFRESH_SECS", &mut self.gallery_refresh_secs)?;
        override_parsed(l, "PRESENCE_GALLERY_RETRY_SECS", &mut self.gallery_retry_secs)?;
        override_parsed(l, "PRESENCE_GALLERY_RETRY_LIMIT", &mut self.gallery_retry_limit)?;
        override_parsed(l, "PRESENCE_READY_TIMEOUT_SECS", &mut self.ready_timeout_secs)?;
        override_parsed(l, "PRESENCE_MANUAL_ENTRY_AFTER", &mut self.manual_entry_after)?;
        override_parsed(l, "PRESENCE_REPORT_RETRY_DELAY_MS", &mut self.report_retry_delay_ms)?;
        override_parsed(l, "PRESENCE_CONFIRMATION_WINDOW_MS", &mut self.confirmation_window_ms)?;
        override_parsed(l, "PRESENCE_CAMERA_WIDTH", &mut self.camera.width)?;
        override_parsed(l, "PRESENCE_CAMERA_HEIGHT", &mut self.camera.height)?;
        override_parsed(l, "PRESENCE_MODEL_LOAD_ATTEMPTS", &mut self.model_load_attempts)?;
        override_parsed(l, "PRESENCE_MODEL_LOAD_BACKOFF_MS", &mut self.model_load_backoff_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be non-zero".into()));
        }
        let durations = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("gallery_refresh_secs", self.gallery_refresh_secs),
            ("gallery_retry_secs", self.gallery_retry_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera width and height must be non-zero".into()));
        }
        if self.gallery_url.is_empty() || self.report_url.is_empty() {
            return Err(ConfigError::Invalid("gallery_url and report_url are required".into()));
        }
        Ok(())
    }

    /// Copy safe to print: the API token is masked.
    pub fn redacted(&self) -> Self {
        Self {
            api_token: self.api_token.as_ref().map(|_| "********".to_string()),
            ..self.clone()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn constraints(&self) -> Constraints {
        Constraints {
            device: Some(self.camera.device.clone()),
            width: self.camera.width,
            height: self.camera.height,
            facing: Some(self.camera.facing),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            threshold: self.match_threshold,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            manual_entry_after: self.manual_entry_after,
            report_retry_delay: Duration::from_millis(self.report_retry_delay_ms),
            confirmation_window: Duration::from_millis(self.confirmation_window_ms),
            constraints: self.constraints(),
        }
    }

    pub fn gallery_policy(&self) -> GalleryPolicy {
        GalleryPolicy {
            refresh_interval: Duration::from_secs(self.gallery_refresh_secs),
            retry_delay: Duration::from_secs(self.gallery_retry_secs),
            retry_limit: self.gallery_retry_limit,
        }
    }

    pub fn model_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.model_load_attempts,
            initial_delay: Duration::from_millis(self.model_load_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let session = config.session();
        assert_eq!(session.threshold, 0.6);
        assert_eq!(session.poll_interval, Duration::from_secs(2));
        assert_eq!(session.manual_entry_after, 5);
        assert_eq!(config.gallery_policy(), GalleryPolicy::default());
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            gallery_url = "https://hr.example/api/faces"
            match_threshold = 0.5

            [camera]
            device = "/dev/video2"
            facing = "environment"
            "#,
        )
        .unwrap();
        assert_eq!(config.gallery_url, "https://hr.example/api/faces");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.camera.device, "/dev/video2");
        assert_eq!(config.camera.facing, FacingMode::Environment);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.poll_interval_ms, 2000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("PRESENCE_MATCH_THRESHOLD", "0.45"),
                ("PRESENCE_CAMERA_DEVICE", "/dev/video4"),
                ("PRESENCE_API_TOKEN", "abc"),
                ("PRESENCE_POLL_INTERVAL_MS", " 2500 "),
            ]))
            .unwrap();
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.camera.device, "/dev/video4");
        assert_eq!(config.api_token.as_deref(), Some("abc"));
        assert_eq!(config.session().poll_interval, Duration::from_millis(2500));
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("PRESENCE_MANUAL_ENTRY_AFTER", "five")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { ref key, .. } if key == "PRESENCE_MANUAL_ENTRY_AFTER"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = Config {
            match_threshold: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            match_threshold: f32::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_cover_timing_and_retry_keys() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("PRESENCE_REQUEST_TIMEOUT_SECS", "4"),
                ("PRESENCE_GALLERY_RETRY_LIMIT", "2"),
                ("PRESENCE_REPORT_RETRY_DELAY_MS", "1500"),
                ("PRESENCE_CONFIRMATION_WINDOW_MS", "5000"),
                ("PRESENCE_CAMERA_FACING", "environment"),
                ("PRESENCE_MODEL_FILES", "a.onnx, b.onnx"),
                ("PRESENCE_MODEL_LOAD_ATTEMPTS", "6"),
            ]))
            .unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(4));
        assert_eq!(config.gallery_policy().retry_limit, 2);
        let session = config.session();
        assert_eq!(session.report_retry_delay, Duration::from_millis(1500));
        assert_eq!(session.confirmation_window, Duration::from_secs(5));
        assert_eq!(session.constraints.facing, Some(FacingMode::Environment));
        assert_eq!(config.model_files, vec!["a.onnx", "b.onnx"]);
        assert_eq!(config.model_retry_policy().max_attempts, 6);
    }

    #[test]
    fn test_validate_rejects_zero_gallery_timers() {
        for config in [
            Config {
                gallery_refresh_secs: 0,
                ..Config::default()
            },
            Config {
                gallery_retry_secs: 0,
                ..Config::default()
            },
        ] {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("gallery_")));
        }
    }

    #[test]
    fn test_redacted_masks_token() {
        let config = Config {
            api_token: Some("s3cret".into()),
            ..Config::default()
        };
        let printed = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("api_token"));
        assert_eq!(Config::default().redacted().api_token, None);
    }
}
