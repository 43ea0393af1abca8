// Configuration management for offtune
// TOML file under the user config dir, written out with defaults when missing

use anyhow::{Context, Result};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::model::AUDIO_EXTENSIONS;
use crate::scanner::{ScanOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_FILE_SIZE};
use crate::session::BridgeConfig;

const APP_DIR: &str = "offtune";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub music_directories: Vec<PathBuf>,
    /// Database, artwork cache and logs live here.
    pub data_dir: PathBuf,
    pub scanner: ScannerConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub recursive: bool,
    pub extensions: Vec<String>,
    pub max_file_size: u64,
    pub follow_symlinks: bool,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_interval_ms: u64,
    pub load_timeout_secs: u64,
    pub max_consecutive_errors: u32,
    /// A play counts once this much was heard...
    pub play_threshold_secs: u64,
    /// ...or this share of the track, whichever comes first.
    pub play_threshold_percent: u8,
    pub snapshot_interval_secs: u64,
    /// Fixed seed makes shuffle orders reproducible.
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub os_media_controls: bool,
    /// Volume factor while ducked; 0 disables ducking.
    pub duck_volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR);
        Self {
            music_directories: vec![dirs::audio_dir().unwrap_or_else(|| PathBuf::from("~/Music"))],
            data_dir,
            scanner: ScannerConfig::default(),
            playback: PlaybackConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: AUDIO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            follow_symlinks: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            load_timeout_secs: 10,
            max_consecutive_errors: 5,
            play_threshold_secs: 30,
            play_threshold_percent: 50,
            snapshot_interval_secs: 5,
            shuffle_seed: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            os_media_controls: true,
            duck_volume: 0.2,
        }
    }
}

impl Config {
    /// Load from the default location, creating the file with defaults if
    /// it does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
            .join(APP_DIR);
        Ok(config_dir.join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("offtune.db")
    }

    pub fn artwork_dir(&self) -> PathBuf {
        self.data_dir.join("artwork")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            recursive: self.scanner.recursive,
            extensions: self.scanner.extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            max_file_size: self.scanner.max_file_size,
            follow_symlinks: self.scanner.follow_symlinks,
            batch_size: self.scanner.batch_size.max(1),
            artwork_dir: Some(self.artwork_dir()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_millis(self.playback.tick_interval_ms.max(1)),
            load_timeout: Duration::from_secs(self.playback.load_timeout_secs),
            max_consecutive_errors: self.playback.max_consecutive_errors.max(1),
            shuffle_seed: self.playback.shuffle_seed,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            duck_factor: (self.session.duck_volume > 0.0).then_some(self.session.duck_volume.min(1.0)),
        }
    }
}
