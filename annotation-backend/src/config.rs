use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;
use unified_detector::YoloConfig;

use crate::pipeline::DispatcherConfig;

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:8080,http://127.0.0.1:8080,http://localhost:8081,http://127.0.0.1:8081";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
    pub room_model: YoloConfig,
    pub wall_model: YoloConfig,
    pub window_door_model: YoloConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let model = |path: &str| YoloConfig {
            endpoint: format!("http://127.0.0.1:8500/predict/{}", path),
            ..YoloConfig::default()
        };

        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            allowed_origins: split_origins(DEFAULT_ALLOWED_ORIGINS),
            max_upload_bytes: 10 * 1024 * 1024,
            room_model: model("room"),
            wall_model: model("wall"),
            window_door_model: model("window_door"),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                                   |
    /// |--------------------------|-------------------------------------------|
    /// | `BIND_ADDR`              | `0.0.0.0:3000`                            |
    /// | `ALLOWED_ORIGINS`        | localhost dev ports                       |
    /// | `MAX_UPLOAD_BYTES`       | `10485760`                                |
    /// | `ROOM_MODEL_URL`         | `http://127.0.0.1:8500/predict/room`        |
    /// | `WALL_MODEL_URL`         | `http://127.0.0.1:8500/predict/wall`        |
    /// | `WINDOW_DOOR_MODEL_URL`  | `http://127.0.0.1:8500/predict/window_door` |
    /// | `INFERENCE_TIMEOUT_SECS` | `120`                                     |
    /// | `PIPELINE_CONCURRENCY`   | `4`                                       |
    /// | `STAGE_MAX_ATTEMPTS`     | `3`                                       |
    /// | `STAGE_RETRY_BACKOFF_MS` | `500`                                     |
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let timeout_secs: u64 = parse_env("INFERENCE_TIMEOUT_SECS", defaults.room_model.timeout_secs)?;
        let model = |key: &str, mut config: YoloConfig| {
            if let Ok(endpoint) = std::env::var(key) {
                config.endpoint = endpoint;
            }
            config.timeout_secs = timeout_secs;
            config
        };

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|s| split_origins(&s))
                .unwrap_or(defaults.allowed_origins),
            max_upload_bytes: parse_env("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            room_model: model("ROOM_MODEL_URL", defaults.room_model),
            wall_model: model("WALL_MODEL_URL", defaults.wall_model),
            window_door_model: model("WINDOW_DOOR_MODEL_URL", defaults.window_door_model),
            dispatcher: DispatcherConfig {
                concurrency: parse_env("PIPELINE_CONCURRENCY", defaults.dispatcher.concurrency)?,
                max_attempts: parse_env("STAGE_MAX_ATTEMPTS", defaults.dispatcher.max_attempts)?,
                retry_backoff: Duration::from_millis(parse_env(
                    "STAGE_RETRY_BACKOFF_MS",
                    defaults.dispatcher.retry_backoff.as_millis() as u64,
                )?),
            },
        })
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}
