use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Clip recorder settings, shared by all sources
    pub recorder: RecorderConfig,
    /// Live sources; one recording session each
    pub sources: Vec<SourceConfig>,
    /// WebRTC signaling settings
    pub signaling: SignalingConfig,
    /// Web server settings
    pub web: WebConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig::default(),
            sources: vec![SourceConfig::default()],
            signaling: SignalingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        let r = &self.recorder;
        if r.fps == 0 || r.window_secs == 0 {
            return Err("recorder.fps and recorder.window_secs must be positive".to_string());
        }
        if r.queue_capacity == 0 {
            return Err("recorder.queue_capacity must be positive".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err("source id must not be empty".to_string());
            }
            if !seen.insert(source.id.as_str()) {
                return Err(format!("duplicate source id '{}'", source.id));
            }
        }
        if self.signaling.connect_attempts == 0 {
            return Err("signaling.connect_attempts must be positive".to_string());
        }
        Ok(())
    }
}

/// Clip recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    /// Nominal source frame rate, sizes the lookback buffer
    pub fps: u32,
    /// Lookback window in seconds; clips stop 2 × window after the last trigger
    pub window_secs: u32,
    /// Directory clips are written to
    pub output_dir: String,
    /// Clip file name prefix, `{prefix}{source_id}_{sequence}.{ext}`
    pub file_prefix: String,
    /// Clip file extension
    pub extension: String,
    /// Bound on waiting for an in-flight start/finish (milliseconds)
    pub wait_start_ms: u64,
    /// Pause before a trigger re-evaluates after a settle (milliseconds)
    pub retry_tick_ms: u64,
    /// Settle waits before a trigger gives up with a conflict
    pub max_retries: u32,
    /// Clip sub-graph queue depth (samples)
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            window_secs: 2,
            output_dir: "/videos".to_string(),
            file_prefix: "event_".to_string(),
            extension: "mjpeg".to_string(),
            wait_start_ms: 3000,
            retry_tick_ms: 1,
            max_retries: 1,
            queue_capacity: 256,
        }
    }
}

/// Live source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Source identifier used by `record`
    pub id: String,
    /// Flow point name; `appsink_{id}` when empty
    pub sink_name: String,
    /// Drive the flow point from a built-in test-pattern generator
    pub synthetic: bool,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Also feed this source into the distribution point for streaming
    pub distribute: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: "0".to_string(),
            sink_name: String::new(),
            synthetic: true,
            fps: 30,
            width: 320,
            height: 240,
            distribute: true,
        }
    }
}

impl SourceConfig {
    pub fn sink_name(&self) -> String {
        if self.sink_name.is_empty() {
            format!("appsink_{}", self.id)
        } else {
            self.sink_name.clone()
        }
    }
}

/// Codec announced for the outgoing WebRTC track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamCodec {
    #[default]
    Vp8,
    H264,
}

/// WebRTC signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Signaling server WebSocket URL
    pub server_url: String,
    /// Our id, sent as `HELLO <id>`
    pub client_id: u32,
    /// Socket connect attempts before `open` fails
    pub connect_attempts: u32,
    /// Pause between connect attempts (milliseconds)
    pub retry_delay_ms: u64,
    /// Bound on waiting for the streaming sub-graph to attach (milliseconds)
    pub attach_timeout_ms: u64,
    /// Flow point the streaming sub-graph attaches to
    pub distribution_point: String,
    /// STUN servers for ICE
    pub stun_servers: Vec<String>,
    pub codec: StreamCodec,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8443".to_string(),
            client_id: 105,
            connect_attempts: 10,
            retry_delay_ms: 1000,
            attach_timeout_ms: 5000,
            distribution_point: "connection".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            codec: StreamCodec::Vp8,
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}
