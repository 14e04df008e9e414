use anyhow::{Context, Result};
use biolink_lib::channels::{ChannelLayout, MAX_CHANNEL_COUNT};
use biolink_lib::device::SYNTHETIC_ADDRESS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Extension name meaning "run without an extension".
pub const NO_EXTENSION: &str = "None";
/// Largest sample table a run may preallocate.
pub const MAX_BUFFER_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sample rate must be positive")]
    SampleRate,
    #[error("maximum duration must be at least one minute")]
    Duration,
    #[error("no channel configured")]
    NoChannels,
    #[error("{0} channel slots configured, the device has {MAX_CHANNEL_COUNT}")]
    TooManyChannels(usize),
    #[error("sample timeout must be positive")]
    SampleTimeout,
    #[error("{frames} frames of {channels} channels exceed the {MAX_BUFFER_BYTES} byte sample buffer")]
    BufferTooLarge { frames: u64, channels: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    pub port: String,
    pub baud: u32,
    /// Event text that requests the end of the run.
    pub stop_token: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port().into(),
            baud: 115_200,
            stop_token: "#END".into(),
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM1"
    } else {
        "/dev/ttyUSB0"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub device_address: String,
    /// Eight named input slots, empty names are unused.
    pub channels: Vec<String>,
    pub sample_rate: u32,
    pub max_duration_min: u32,
    pub experiment_id: String,
    pub log_dir: PathBuf,
    pub serial: SerialConfig,
    pub extension: String,
    /// Free-form settings handed to the extension.
    pub extension_options: BTreeMap<String, String>,
    pub live_feed: bool,
    pub software_version: String,
    /// Longest wait for the next sample before the source counts as lost.
    pub sample_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut channels: Vec<String> = ["ecg", "eda", "bvp"].iter().map(|s| s.to_string()).collect();
        channels.resize(MAX_CHANNEL_COUNT, String::new());
        Self {
            device_address: SYNTHETIC_ADDRESS.into(),
            channels,
            sample_rate: 1000,
            max_duration_min: 60,
            experiment_id: "experiment".into(),
            log_dir: PathBuf::from("logs"),
            serial: SerialConfig::default(),
            extension: NO_EXTENSION.into(),
            extension_options: BTreeMap::new(),
            live_feed: true,
            software_version: env!("CARGO_PKG_VERSION").into(),
            sample_timeout_ms: 5_000,
        }
    }
}

impl RunConfig {
    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::new(&self.channels)
    }

    pub fn max_duration_frames(&self) -> u64 {
        u64::from(self.max_duration_min) * 60 * u64::from(self.sample_rate)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::SampleRate);
        }
        if self.max_duration_min == 0 {
            return Err(ConfigError::Duration);
        }
        if self.sample_timeout_ms == 0 {
            return Err(ConfigError::SampleTimeout);
        }
        let layout = self.layout();
        if layout.overflow() {
            return Err(ConfigError::TooManyChannels(self.channels.len()));
        }
        if layout.count() == 0 {
            return Err(ConfigError::NoChannels);
        }
        let frames = self.max_duration_frames();
        let bytes = frames
            .saturating_mul(layout.count() as u64)
            .saturating_mul(std::mem::size_of::<u16>() as u64);
        if bytes > MAX_BUFFER_BYTES {
            return Err(ConfigError::BufferTooLarge {
                frames,
                channels: layout.count(),
            });
        }
        Ok(())
    }
}

pub fn read_config(path: &Path) -> Result<RunConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_describe_an_hour_at_one_kilohertz() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_duration_frames(), 3_600_000);
        assert_eq!(config.layout().mask(), 0x07);
        assert_eq!(config.serial.stop_token, "#END");
        assert_eq!(config.extension, NO_EXTENSION);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
experiment_id = "stroop"
max_duration_min = 1
channels = ["ecg", "", "resp"]

[serial]
enabled = false

[extension_options]
count = "2"
"#,
        )
        .unwrap();
        let config = read_config(&path).unwrap();
        assert_eq!(config.experiment_id, "stroop");
        assert_eq!(config.max_duration_frames(), 60_000);
        assert_eq!(config.layout().header(), vec!["ecg", "resp"]);
        assert_eq!(config.layout().mask(), 0b101);
        assert!(!config.serial.enabled);
        assert_eq!(config.extension_options.get("count").map(String::as_str), Some("2"));
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.sample_rate, 1000);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = RunConfig {
            sample_rate: 0,
            ..RunConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SampleRate));
        config.sample_rate = 1000;
        config.channels = vec![String::new(); 8];
        assert_eq!(config.validate(), Err(ConfigError::NoChannels));
        config.channels = vec!["x".to_string(); 9];
        assert_eq!(config.validate(), Err(ConfigError::TooManyChannels(9)));
    }

    #[test]
    fn mistyped_duration_is_a_config_error_not_an_allocation() {
        let mut config = RunConfig {
            max_duration_min: 60_000,
            ..RunConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BufferTooLarge {
                frames: 3_600_000_000,
                channels: 3,
            })
        );
        config.max_duration_min = u32::MAX;
        config.channels = vec!["x".to_string(); 8];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooLarge { channels: 8, .. })
        ));
        // a full day at 1 kHz on three channels still fits
        config.max_duration_min = 24 * 60;
        config.channels = vec!["a".into(), "b".into(), "c".into()];
        config.validate().unwrap();
    }
}
