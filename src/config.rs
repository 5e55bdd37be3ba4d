//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! A few deployment-platform variables (HOST, PORT, WEATHERAPI_KEY) are
//! honored without the APP_ prefix.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::auth::UserContext;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sessions: SessionsConfig,
    pub wakeword: WakeWordConfig,
    pub tools: ToolsConfig,
    pub weather: WeatherConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection admission settings.
///
/// When `introspection_url` is set, tokens presented on the WebSocket
/// upgrade are resolved through that external identity service. Otherwise
/// the static token table is used (development and tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub introspection_url: Option<String>,
    #[serde(default)]
    pub static_tokens: HashMap<String, UserContext>,
}

/// Bounded-wait settings for the remote-call layers.
///
/// These are the only two sources of bounded waiting in the system:
/// correlation-bus commands and tool-proxy calls. Exceeding either bound
/// resolves the waiter with a structured error, never leaves it dangling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub command_timeout_secs: u64,
    pub tool_proxy_timeout_secs: u64,
}

impl SessionsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn tool_proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_proxy_timeout_secs)
    }
}

/// Wake word pipeline configuration.
///
/// Clients send 24kHz 16-bit mono PCM; detection models consume 16kHz
/// frames of `frame_size` samples. Both intermediate buffers are hard-capped
/// so memory stays bounded regardless of input burst size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeWordConfig {
    pub source_sample_rate: u32,
    pub target_sample_rate: u32,
    pub frame_size: usize,
    pub detection_threshold: f32,
    pub max_buffer_seconds: u32,
    pub max_pending_frames: usize,
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub models: Vec<String>,
}

impl WakeWordConfig {
    /// Hard cap on the pre-resampling buffer, in samples.
    pub fn max_source_samples(&self) -> usize {
        self.source_sample_rate as usize * self.max_buffer_seconds as usize
    }

    /// Hard cap on the post-resampling buffer, in samples.
    pub fn max_target_samples(&self) -> usize {
        self.frame_size * self.max_pending_frames
    }

    /// Source-rate samples retained across resampling calls (~100ms) to
    /// avoid discontinuities at chunk boundaries.
    pub fn tail_samples(&self) -> usize {
        self.source_sample_rate as usize / 10
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Tool-proxy settings: which tool namespaces an HTTP caller may address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub allowed_namespaces: Vec<String>,
}

/// Third-party weather passthrough settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthConfig::default(),
            sessions: SessionsConfig {
                command_timeout_secs: 15,
                tool_proxy_timeout_secs: 30,
            },
            wakeword: WakeWordConfig {
                source_sample_rate: 24000, // clients stream 24kHz PCM
                target_sample_rate: 16000, // detection models expect 16kHz
                frame_size: 1280,
                detection_threshold: 0.2,
                max_buffer_seconds: 5,
                max_pending_frames: 10,
                queue_capacity: 64,
                poll_interval_ms: 100,
                models: vec!["default".to_string()],
            },
            tools: ToolsConfig {
                allowed_namespaces: vec!["filesystem".to_string(), "google".to_string()],
            },
            weather: WeatherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, then config.toml, then environment.
    ///
    /// Deployment platforms commonly inject HOST / PORT / WEATHERAPI_KEY
    /// without the APP_ prefix, so those are applied as explicit overrides.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("WEATHERAPI_KEY") {
            settings = settings.set_override("weather.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense before the server
    /// starts serving traffic.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sessions.command_timeout_secs == 0 || self.sessions.tool_proxy_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Session timeouts must be greater than 0"));
        }

        if self.wakeword.source_sample_rate == 0 || self.wakeword.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("Wake word sample rates must be greater than 0"));
        }

        if self.wakeword.frame_size == 0 {
            return Err(anyhow::anyhow!("Wake word frame size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.wakeword.detection_threshold)
            || self.wakeword.detection_threshold == 0.0
        {
            return Err(anyhow::anyhow!(
                "Wake word detection threshold must be in (0.0, 1.0]"
            ));
        }

        if self.wakeword.queue_capacity == 0 || self.wakeword.max_pending_frames == 0 {
            return Err(anyhow::anyhow!(
                "Wake word queue capacity and pending frame cap must be greater than 0"
            ));
        }

        if self.tools.allowed_namespaces.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one tool namespace must be allowed"
            ));
        }

        Ok(())
    }
}
