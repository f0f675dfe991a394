use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::color::Theme;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_LINK_GLYPH: &str = "🔗";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub highlight: HighlightConfig,
    pub color: ColorConfig,
    pub navigation: NavigationConfig,
    pub pairing: PairingConfig,
    pub theme: ThemeConfig,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighlightConfig {
    /// Idle time after the last edit before the passive re-scan runs.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "debounce_ms")]
    pub debounce: Duration,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub grid_size: usize,
    /// Minimum ΔE94 between any two allocated colors.
    pub min_delta_e: f64,
    pub max_attempts: usize,
    pub light_alpha: f32,
    pub dark_alpha: f32,
    pub seed: Option<u64>,
}

impl ColorConfig {
    pub fn alpha_for(&self, theme: Theme) -> f32 {
        match theme {
            Theme::Dark => self.dark_alpha,
            Theme::Light => self.light_alpha,
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            grid_size: 10,
            min_delta_e: 2.3,
            max_attempts: 50,
            light_alpha: 0.35,
            dark_alpha: 0.4,
            seed: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub pulse_scale: f32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "pulse_hold_ms")]
    pub pulse_hold: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "pulse_settle_ms")]
    pub pulse_settle: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "scroll_ms")]
    pub scroll: Duration,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            pulse_scale: 1.5,
            pulse_hold: Duration::from_millis(500),
            pulse_settle: Duration::from_millis(300),
            scroll: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub glyph: String,
    /// Drop a half-formed pairing when its source editor closes.
    pub cancel_on_close: bool,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            glyph: DEFAULT_LINK_GLYPH.to_string(),
            cancel_on_close: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub dark: bool,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self { dark: true }
    }
}

impl Config {
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&source)
            .with_context(|| format!("invalid config {}", path.display()))?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Reads `path` when given, else `<config_dir>/config.toml` when it
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>, dirs: Option<&ProjectDirs>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match dirs.map(Self::default_path) {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    pub fn initial_theme(&self) -> Theme {
        Theme::from_dark_mode(self.theme.dark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.highlight.debounce, Duration::from_millis(1500));
        assert_eq!(config.color.grid_size, 10);
        assert_eq!(config.color.max_attempts, 50);
        assert_eq!(config.navigation.pulse_hold, Duration::from_millis(500));
        assert_eq!(config.pairing.glyph, "🔗");
        assert!(!config.pairing.cancel_on_close);
        assert_eq!(config.initial_theme(), Theme::Dark);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [highlight]
            debounce_ms = 250

            [color]
            seed = 11

            [theme]
            dark = false
            "#,
        )
        .unwrap();
        assert_eq!(config.highlight.debounce, Duration::from_millis(250));
        assert_eq!(config.color.seed, Some(11));
        assert_eq!(config.color.grid_size, 10);
        assert_eq!(config.initial_theme(), Theme::Light);
    }

    #[test]
    fn explicit_path_wins_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut config = Config::default();
        config.pairing.cancel_on_close = true;
        config.navigation.scroll = Duration::from_millis(120);
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = Config::load_or_default(Some(&path), None).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_an_error_only_when_requested() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(Config::load_or_default(Some(&missing), None).is_err());
        assert_eq!(Config::load_or_default(None, None).unwrap(), Config::default());
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = Config::from_toml("color = 3").unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse configuration"));
    }
}
