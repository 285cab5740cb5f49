//! TOML configuration for the streamer binary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vrs_core::config::{BufferConfig, CaptureConfig, EncoderConfig, NetworkConfig, PipelineConfig};

/// Top-level configuration loaded from a TOML file.
///
/// The pipeline tables mirror [`PipelineConfig`]; `[logging]` is only
/// read by the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
    pub logging: LoggingConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"info,vrs_core::server=debug"`.
    pub level: String,
    /// Log a stats line every this many seconds; 0 disables it.
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 5,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl StreamerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Runs before the subscriber is installed, so problems go to stderr.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Defaults as TOML text.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            capture: self.capture.clone(),
            encoder: self.encoder.clone(),
            network: self.network.clone(),
            buffers: self.buffers.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vrs_core::QualityPreset;

    #[test]
    fn default_config_serializes() {
        let text = StreamerConfig::default_toml().unwrap();
        assert!(text.contains("[network]"));
        assert!(text.contains("port = 8765"));
        assert!(text.contains("[logging]"));
        assert!(text.contains("preset = \"low_latency\""));
    }

    #[test]
    fn roundtrip_config() {
        let text = StreamerConfig::default_toml().unwrap();
        let parsed: StreamerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 8765);
        assert_eq!(parsed.network.http_port, 8080);
        assert_eq!(parsed.capture.target_fps, 60);
        assert_eq!(parsed.encoder.quality, 55);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: StreamerConfig = toml::from_str(
            r#"
            [encoder]
            preset = "balanced"
            stereo = false

            [network]
            max_clients = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.encoder.preset, QualityPreset::Balanced);
        assert!(!parsed.encoder.stereo);
        assert_eq!(parsed.network.max_clients, 2);
        assert_eq!(parsed.network.port, 8765);
        assert_eq!(parsed.logging.level, "info");

        let pipeline = parsed.to_pipeline_config();
        assert_eq!(pipeline.network.max_clients, 2);
        assert!(!pipeline.encoder.stereo);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = StreamerConfig::load(Path::new("/definitely/not/here.toml"));
        assert_eq!(cfg.network.port, 8765);
    }
}
