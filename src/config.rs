//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Well-known variables for credentials and deployment platforms
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `XFYUN_APP_ID`, `XFYUN_API_KEY`, `XFYUN_API_SECRET`, `XFYUN_RTASR_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_ENDPOINTING__IDLE_TIMEOUT_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Credentials have no defaults: a gateway without them refuses to start.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use url::Url;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, upstream, endpointing,
/// performance, heartbeat) keeps each concern readable on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub endpointing: EndpointingConfig,
    pub performance: PerformanceConfig,
    pub heartbeat: HeartbeatConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the upstream speech cloud lives and how to authenticate with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub recognition: RecognitionUpstreamConfig,
    pub synthesis: SynthesisUpstreamConfig,
}

/// Real-time transcription endpoint (signed with appid + timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionUpstreamConfig {
    pub url: String,
    pub app_id: String,
    pub api_key: String,
}

/// Streaming synthesis endpoint (signed with host + date + request-line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisUpstreamConfig {
    pub url: String,
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub voice: VoiceConfig,
}

/// Voice parameters sent with every synthesis request.
///
/// ## Fields:
/// - `vcn`: Voice id on the upstream side
/// - `speed` / `volume` / `pitch`: 0-100 scales, 50 is neutral
/// - `oral_level`: How colloquial the delivery is ("low", "mid", "high")
/// - `sample_rate` / `channels` / `bit_depth`: Raw PCM output format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceConfig {
    pub vcn: String,
    pub speed: u8,
    pub volume: u8,
    pub pitch: u8,
    pub oral_level: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

/// Silence-based endpointing for recognition sessions.
///
/// ## Fields:
/// - `min_capture_ms`: Never auto-stop before this much capture time has passed
/// - `idle_timeout_ms`: Auto-stop once no new transcript arrived for longer than this
/// - `poll_interval_ms`: How often the silence monitor checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointingConfig {
    pub min_capture_ms: u64,
    pub idle_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Server-wide cap on live speech sessions (both kinds)
/// - `connect_timeout_secs`: Upper bound on opening an upstream connection
/// - `event_channel_capacity`: Buffered session events per browser connection
/// - `command_channel_capacity`: Buffered commands (audio frames) per recognition session
/// - `pending_audio_frames`: Audio frames kept while the upstream is still starting
/// - `registry_shards`: Number of independently locked partitions of the session registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub connect_timeout_secs: u64,
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
    pub pending_audio_frames: usize,
    pub registry_shards: usize,
}

/// Browser connection liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start from environment variables alone.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                recognition: RecognitionUpstreamConfig {
                    url: "ws://rtasr.xfyun.cn/v1/ws".to_string(),
                    app_id: String::new(),
                    api_key: String::new(),
                },
                synthesis: SynthesisUpstreamConfig {
                    url: "wss://cbm01.cn-huabei-1.xf-yun.com/v1/private/mcd9m97e6".to_string(),
                    app_id: String::new(),
                    api_key: String::new(),
                    api_secret: String::new(),
                    voice: VoiceConfig::default(),
                },
            },
            endpointing: EndpointingConfig {
                min_capture_ms: 8_000,
                idle_timeout_ms: 3_000,
                poll_interval_ms: 200,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 200,
                connect_timeout_secs: 10,
                event_channel_capacity: 256,
                command_channel_capacity: 256,
                pending_audio_frames: 64,
                registry_shards: 16,
            },
            heartbeat: HeartbeatConfig {
                interval_secs: 30,
                timeout_secs: 60,
            },
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            vcn: "x4_lingxiaoqi_oral".to_string(),
            speed: 50,
            volume: 80,
            pitch: 50,
            oral_level: "mid".to_string(),
            sample_rate: 24_000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl EndpointingConfig {
    pub fn min_capture(&self) -> Duration {
        Duration::from_millis(self.min_capture_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PerformanceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST/PORT and the upstream credentials
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_ENDPOINTING__IDLE_TIMEOUT_MS=2500`: Shorter silence window
    /// - `APP_UPSTREAM__SYNTHESIS__VOICE__VCN=x4_xiaoyan`: Different voice
    /// - `XFYUN_APP_ID=...`: App id for both upstream services
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // One console project usually owns both services, so the app id is shared.
        if let Ok(app_id) = env::var("XFYUN_APP_ID") {
            settings = settings
                .set_override("upstream.recognition.app_id", app_id.clone())?
                .set_override("upstream.synthesis.app_id", app_id)?;
        }

        if let Ok(api_key) = env::var("XFYUN_API_KEY") {
            settings = settings.set_override("upstream.synthesis.api_key", api_key)?;
        }

        if let Ok(api_secret) = env::var("XFYUN_API_SECRET") {
            settings = settings.set_override("upstream.synthesis.api_secret", api_secret)?;
        }

        if let Ok(rtasr_key) = env::var("XFYUN_RTASR_API_KEY") {
            settings = settings.set_override("upstream.recognition.api_key", rtasr_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Capacities and timeouts are greater than 0
    /// - The silence monitor polls faster than the idle threshold it enforces
    /// - Upstream URLs parse and use a WebSocket scheme
    /// - Every credential is present
    ///
    /// ## Why validate:
    /// A bad credential discovered at the first browser connection would surface as
    /// an upstream error for every client; catching it at startup fails once, loudly.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if self.performance.event_channel_capacity == 0 || self.performance.command_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Channel capacities must be greater than 0"));
        }

        if self.performance.registry_shards == 0 {
            return Err(anyhow::anyhow!("Registry shard count must be greater than 0"));
        }

        if self.heartbeat.interval_secs == 0 || self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat timeout ({}s) must exceed a non-zero interval ({}s)",
                self.heartbeat.timeout_secs,
                self.heartbeat.interval_secs
            ));
        }

        let endpointing = &self.endpointing;
        if endpointing.idle_timeout_ms == 0 || endpointing.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Endpointing thresholds must be greater than 0"));
        }
        if endpointing.poll_interval_ms >= endpointing.idle_timeout_ms {
            return Err(anyhow::anyhow!(
                "Silence poll interval ({}ms) must be shorter than the idle timeout ({}ms)",
                endpointing.poll_interval_ms,
                endpointing.idle_timeout_ms
            ));
        }

        validate_ws_url("upstream.recognition.url", &self.upstream.recognition.url)?;
        validate_ws_url("upstream.synthesis.url", &self.upstream.synthesis.url)?;

        let credentials = [
            ("upstream.recognition.app_id", &self.upstream.recognition.app_id),
            ("upstream.recognition.api_key", &self.upstream.recognition.api_key),
            ("upstream.synthesis.app_id", &self.upstream.synthesis.app_id),
            ("upstream.synthesis.api_key", &self.upstream.synthesis.api_key),
            ("upstream.synthesis.api_secret", &self.upstream.synthesis.api_secret),
        ];
        for (name, value) in credentials {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("Missing upstream credential: {}", name));
            }
        }

        Ok(())
    }

    /// A copy that is safe to log or serve over HTTP.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        copy.upstream.recognition.api_key = redact(&copy.upstream.recognition.api_key);
        copy.upstream.synthesis.api_key = redact(&copy.upstream.synthesis.api_key);
        copy.upstream.synthesis.api_secret = redact(&copy.upstream.synthesis.api_secret);
        copy
    }
}

fn validate_ws_url(name: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("{} is not a valid URL ({}): {}", name, raw, e))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(anyhow::anyhow!("{} must use ws:// or wss://, got {}://", name, other)),
    }
    if url.host_str().is_none() {
        return Err(anyhow::anyhow!("{} has no host", name));
    }
    Ok(())
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.recognition.app_id = "testapp".to_string();
    config.upstream.recognition.api_key = "rtasr-key".to_string();
    config.upstream.synthesis.app_id = "testapp".to_string();
    config.upstream.synthesis.api_key = "tts-key".to_string();
    config.upstream.synthesis.api_secret = "tts-secret".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration has the expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.endpointing.min_capture(), Duration::from_secs(8));
        assert_eq!(config.endpointing.idle_timeout(), Duration::from_secs(3));
        assert_eq!(config.upstream.synthesis.voice.sample_rate, 24_000);
    }

    /// Defaults ship without credentials, so they must not validate on their own.
    #[test]
    fn test_missing_credentials_rejected() {
        let config = AppConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Missing upstream credential"));

        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = test_config();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.endpointing.poll_interval_ms = 3_000;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.upstream.synthesis.url = "https://example.com/tts".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.upstream.recognition.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let redacted = test_config().redacted();
        assert_eq!(redacted.upstream.synthesis.api_secret, "********");
        assert_eq!(redacted.upstream.recognition.api_key, "********");
        assert_eq!(redacted.upstream.synthesis.app_id, "testapp");
    }
}
