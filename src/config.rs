use anyhow::Context;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{detector::DetectorStrategy, tracker::TrackerOptions};

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub detector: DetectorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        for path in Self::candidates() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Config::default())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let doc: ConfigDocument = toml::from_str(data)?;
        Ok(doc.into())
    }

    fn candidates() -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(current_dir) = env::current_dir() {
            dirs.push(current_dir);
        }
        if let Ok(exe) = env::current_exe() {
            if let Some(dir) = exe.parent() {
                dirs.push(dir.to_path_buf());
            }
        }

        dirs.iter()
            .flat_map(|dir| {
                [
                    dir.join("config.toml"),
                    dir.join("config").join("config.toml"),
                    dir.join("config").join("media-tray.toml"),
                ]
            })
            .collect()
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            strategy: self.detector.strategy,
            poll_interval: self.detector.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    pub strategy: DetectorStrategy,
    pub poll_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            strategy: DetectorStrategy::Auto,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    detector: DetectorSection,
    #[serde(default)]
    logging: LoggingSection,
}

impl From<ConfigDocument> for Config {
    fn from(value: ConfigDocument) -> Self {
        let defaults = Config::default();
        Config {
            detector: DetectorConfig {
                strategy: value.detector.strategy.unwrap_or(defaults.detector.strategy),
                poll_interval_ms: value
                    .detector
                    .poll_interval_ms
                    .unwrap_or(defaults.detector.poll_interval_ms),
            },
            logging: LoggingConfig {
                filter: value.logging.filter.unwrap_or(defaults.logging.filter),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DetectorSection {
    strategy: Option<DetectorStrategy>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.detector.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn detector_section_is_read() {
        let config = Config::parse(
            r#"
            [detector]
            strategy = "polling"
            poll_interval_ms = 250

            [logging]
            filter = "media_tray=debug"
            "#,
        )
        .unwrap();

        let options = config.tracker_options();
        assert_eq!(options.strategy, DetectorStrategy::Polling);
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(config.logging.filter, "media_tray=debug");
    }

    #[test]
    fn poll_interval_is_clamped() {
        let fast = Config::parse("[detector]\npoll_interval_ms = 1").unwrap();
        assert_eq!(fast.detector.poll_interval(), Duration::from_millis(100));
        let slow = Config::parse("[detector]\npoll_interval_ms = 3600000").unwrap();
        assert_eq!(slow.detector.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        assert!(Config::parse("[detector]\nstrategy = \"sometimes\"").is_err());
    }

    #[test]
    fn load_from_reports_the_offending_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[detector\nstrategy = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err}").contains("config.toml"));
    }

    #[test]
    fn load_from_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media-tray.toml");
        fs::write(&path, "[detector]\nstrategy = \"event\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.detector.strategy, DetectorStrategy::Event);
    }
}
