use std::path::{Path, PathBuf};
use std::time::Duration;

use entrain_core::stimulus::DEFAULT_SAMPLE_RATE;
use entrain_services::{ChannelMap, DeviceConfig, SessionConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub devices: DevicesConfig,
    pub session: SessionSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            devices: DevicesConfig::default(),
            session: SessionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub input_name: String,
    pub output_name: String,
    pub sample_rate: u32,
    pub mic_channel: usize,
    pub loopback_left_channel: usize,
    pub loopback_right_channel: usize,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            input_name: "experiment input".into(),
            output_name: "experiment output".into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            mic_channel: 0,
            loopback_left_channel: 1,
            loopback_right_channel: 2,
        }
    }
}

impl DevicesConfig {
    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap {
            mic: self.mic_channel,
            loopback_left: self.loopback_left_channel,
            loopback_right: self.loopback_right_channel,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
            sample_rate: self.sample_rate,
            max_input_channel: self.channel_map().max_channel() as u16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub response_window_ms: f64,
    pub ear_check: bool,
    pub await_operator: bool,
    pub trial_attempts: u32,
    pub max_consecutive_capture_failures: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            response_window_ms: defaults.response_window_ms,
            ear_check: defaults.ear_check,
            await_operator: defaults.await_operator,
            trial_attempts: defaults.trial_attempts,
            max_consecutive_capture_failures: defaults.max_consecutive_capture_failures,
        }
    }
}

impl SessionSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            response_window_ms: self.response_window_ms.max(0.0),
            ear_check: self.ear_check,
            await_operator: self.await_operator,
            trial_attempts: self.trial_attempts.max(1),
            max_consecutive_capture_failures: self.max_consecutive_capture_failures.max(1),
            practice_gap: Duration::from_secs(1),
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("entrain")
        .join("config.toml")
}

/// Missing file means defaults; a file that does not parse is an error
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.devices.sample_rate, 44100);
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "output_dir = \"/data/entrain\"\n[devices]\ninput_name = \"Scarlett\"\nloopback_right_channel = 3\n[session]\near_check = false\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/data/entrain"));
        assert_eq!(config.devices.input_name, "Scarlett");
        assert_eq!(config.devices.output_name, "experiment output");
        assert_eq!(config.devices.device_config().max_input_channel, 3);
        assert!(!config.session.ear_check);
        assert_eq!(config.session.session_config().max_consecutive_capture_failures, 3);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[devices]\nsample_rate = \"fast\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
