use std::{collections::BTreeMap, env, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigErrorKind, Error},
    tier::QualityTier,
};

/// Top level configuration of the server. Every section falls back to its [`Default`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub video: VideoConfig,
    pub webrtc: WebRTCConfig,
    pub probe: ProbeConfig,
    pub adaptive: AdaptiveConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host name or IP address announced to clients in viewer and mobile URLs.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_host: "localhost".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.public_host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConfig {
    /// Tier used when a streamer registers without naming one.
    pub default_preset: String,
    pub presets: BTreeMap<String, QualityTier>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        let presets = [
            QualityTier::new("480p30", 854, 480, 30, 1_000_000, 1_500_000, 2_500_000),
            QualityTier::new("720p30", 1280, 720, 30, 2_000_000, 3_500_000, 5_000_000),
            QualityTier::new("720p60", 1280, 720, 60, 3_000_000, 5_000_000, 7_000_000),
            QualityTier::new("1080p30", 1920, 1080, 30, 4_000_000, 6_000_000, 8_000_000),
            QualityTier::new("1080p60", 1920, 1080, 60, 6_000_000, 9_000_000, 12_000_000),
        ]
        .into_iter()
        .map(|tier| (tier.id.clone(), tier))
        .collect();

        Self {
            default_preset: "720p30".to_string(),
            presets,
        }
    }
}

/// ICE server list and friends. Only forwarded to clients, never interpreted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebRTCConfig {
    pub ice_servers: serde_json::Value,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: serde_json::json!([]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeConfig {
    pub duration_ms: u64,
    pub safety_margin_ms: u64,
    pub chunk_size: usize,
    /// Capacity assumed when a probe times out without counting a single byte.
    pub fallback_capacity_mbps: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            duration_ms: 5000,
            safety_margin_ms: 1000,
            chunk_size: 64 * 1024,
            fallback_capacity_mbps: 5.0,
        }
    }
}

impl ProbeConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Hard deadline after which a running probe is force completed.
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.duration_ms + self.safety_margin_ms)
    }
}

/// Constants of the client side bitrate control loop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdaptiveConfig {
    pub loss_threshold_percent: f64,
    pub congestion_window_ms: u64,
    pub recovery_interval_ms: u64,
    pub step_down_percent: u64,
    pub step_up_percent: u64,
    pub floor_percent: u64,
    pub stats_interval_ms: u64,
    pub initial_ramp_percents: Vec<u64>,
    pub initial_ramp_interval_ms: u64,
    pub transition_steps: u64,
    pub transition_interval_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            loss_threshold_percent: 5.0,
            congestion_window_ms: 3000,
            recovery_interval_ms: 5000,
            step_down_percent: 85,
            step_up_percent: 120,
            floor_percent: 50,
            stats_interval_ms: 2000,
            initial_ramp_percents: vec![50, 80, 100],
            initial_ramp_interval_ms: 500,
            transition_steps: 10,
            transition_interval_ms: 200,
        }
    }
}

impl AdaptiveConfig {
    pub fn congestion_window(&self) -> Duration {
        Duration::from_millis(self.congestion_window_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn initial_ramp_interval(&self) -> Duration {
        Duration::from_millis(self.initial_ramp_interval_ms)
    }

    pub fn transition_interval(&self) -> Duration {
        Duration::from_millis(self.transition_interval_ms)
    }

    /// Rejects values the control loop cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.step_down_percent == 0 || self.step_down_percent >= 100 {
            return Err(Error::new_config(
                format!("stepDownPercent must be in 1..100, got {}", self.step_down_percent),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        if self.step_up_percent <= 100 {
            return Err(Error::new_config(
                format!("stepUpPercent must exceed 100, got {}", self.step_up_percent),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        if self.transition_steps == 0 || self.initial_ramp_percents.is_empty() {
            return Err(Error::new_config(
                "ramp schedules must have at least one step".to_string(),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        if self.floor_percent == 0 || self.floor_percent > 100 {
            return Err(Error::new_config(
                format!("floorPercent must be in 1..=100, got {}", self.floor_percent),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        for (name, value) in [
            ("statsIntervalMs", self.stats_interval_ms),
            ("initialRampIntervalMs", self.initial_ramp_interval_ms),
            ("transitionIntervalMs", self.transition_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::new_config(
                    format!("{} must be non-zero", name),
                    ConfigErrorKind::InvalidValueError,
                ));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Parses a JSON document and validates it.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let mut config: Config = serde_json::from_str(text)?;
        for (id, tier) in config.video.presets.iter_mut() {
            tier.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads the JSON file at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Loads the file named by `LOCALSTREAM_CONFIG` (default `config.json`) and applies
    /// `HOST`, `PORT` and `PUBLIC_HOST` overrides.
    pub fn from_env() -> Result<Self, Error> {
        let path = env::var("LOCALSTREAM_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let mut config = Self::load(path)?;
        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            config.server.port = port.parse().map_err(|e| {
                Error::new_config(
                    format!("failed to parse PORT {}: {}", port, e),
                    ConfigErrorKind::InvalidValueError,
                )
            })?;
        }
        if let Ok(public_host) = env::var("PUBLIC_HOST") {
            config.server.public_host = public_host;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        for tier in self.video.presets.values() {
            tier.validate()?;
        }
        if !self.video.presets.contains_key(&self.video.default_preset) {
            return Err(Error::new_config(
                format!("default preset {} is not a configured preset", self.video.default_preset),
                ConfigErrorKind::InvalidTierError,
            ));
        }
        if self.probe.duration_ms == 0 || self.probe.chunk_size == 0 {
            return Err(Error::new_config(
                "probe duration and chunk size must be non-zero".to_string(),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        let fallback = self.probe.fallback_capacity_mbps;
        if fallback.is_nan() || fallback < 0.0 {
            return Err(Error::new_config(
                format!(
                    "fallbackCapacityMbps must be non-negative, got {}",
                    self.probe.fallback_capacity_mbps
                ),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        self.adaptive.validate()
    }
}
