//! Mood inference service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub models: ModelsConfig,
    pub locator: LocatorConfig,
    pub labels: LabelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Explicit artifact path; when absent the models directory is probed
    /// for the default filenames.
    pub artifact: Option<PathBuf>,
    pub dir: PathBuf,
    /// Device for the saved-graph backend.
    pub device: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocatorConfig {
    pub cascade: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelsConfig {
    /// External class-name table; defaults to `class_names.json` next to the
    /// executable when absent.
    pub class_names: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelsConfig {
                artifact: None,
                dir: PathBuf::from("models"),
                device: "CPU".to_string(),
            },
            locator: LocatorConfig {
                cascade: PathBuf::from("models/haarcascade_frontalface_default.xml"),
            },
            labels: LabelsConfig { class_names: None },
        }
    }
}
