//! Configuration file support for Locksmith.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/locksmith/config.toml`.
//! The `[keys]` section holds the deployment's card settings and is what
//! `ConfigStore` reads, saves and resets.

use crate::engine::{EngineSettings, PAYLOAD_BLOCKS};
use crate::{
    AccessBits, Error, FormatError, Key, KeyMaterial, LockNumberSequencer, Result,
    SetupBlockCodec,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub keys: Settings,

    #[serde(default)]
    pub sequence: LockNumberSequencer,

    #[serde(default)]
    pub setup: SetupConfig,

    #[serde(default)]
    pub data: DataConfig,
}

/// Card settings for one deployment
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "factory_key")]
    pub key_a: Key,

    #[serde(default = "factory_key")]
    pub key_b: Key,

    #[serde(default)]
    pub access_bits: AccessBits,

    #[serde(default = "default_payload_block", alias = "block")]
    pub payload_block: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_a: Key::FACTORY,
            key_b: Key::FACTORY,
            access_bits: AccessBits::TRANSPORT,
            payload_block: default_payload_block(),
        }
    }
}

impl Settings {
    /// Parse settings as typed by a user
    ///
    /// Keys must be 12 hex digits and access bits 8 hex digits.
    pub fn from_hex(
        key_a: &str,
        key_b: &str,
        access_bits: &str,
        payload_block: u8,
    ) -> std::result::Result<Self, FormatError> {
        let digits = access_bits.trim().len();
        if digits != 8 {
            return Err(FormatError::AccessLength(digits / 2));
        }
        let settings = Self {
            key_a: Key::from_hex(key_a)?,
            key_b: Key::from_hex(key_b)?,
            access_bits: AccessBits::from_hex(access_bits)?,
            payload_block,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), FormatError> {
        if !PAYLOAD_BLOCKS.contains(&self.payload_block) {
            return Err(FormatError::PayloadBlock {
                block: self.payload_block,
                reason: "payload block must be 33 or 62",
            });
        }
        self.access_bits.validate()
    }

    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial {
            key_a: self.key_a,
            key_b: self.key_b,
        }
    }
}

/// Setup card configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupConfig {
    /// Password stored on setup cards
    #[serde(default = "factory_key")]
    pub setup_key: Key,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            setup_key: Key::FACTORY,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

// Default value functions
fn factory_key() -> Key {
    Key::FACTORY
}

fn default_payload_block() -> u8 {
    62
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("locksmith")
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        Self::load_or_default(&Self::default_config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("locksmith").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save the configuration atomically: write a locked temp file, sync it,
    /// then rename it over `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Check every section before the engine is built from it
    pub fn validate(&self) -> Result<()> {
        self.keys.validate()?;
        self.sequence
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Engine parameters described by this configuration
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        self.validate()?;
        Ok(EngineSettings {
            keys: self.keys.key_material(),
            access_bits: self.keys.access_bits,
            payload_block: self.keys.payload_block,
            sequencer: self.sequence,
            wrap_lock_numbers: true,
            codec: SetupBlockCodec::new(self.setup.setup_key),
        })
    }
}

/// Persistent storage of the deployment's card settings
pub trait ConfigStore {
    /// Current settings, or factory settings when nothing was saved
    fn get_defaults(&self) -> Result<Settings>;

    fn save(&mut self, settings: &Settings) -> Result<()>;

    /// Replace saved settings with factory values and return them
    fn reset_to_factory(&mut self) -> Result<Settings>;
}

/// `ConfigStore` backed by the `[keys]` section of a config file.
/// Other sections are left untouched.
#[derive(Clone, Debug)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn get_defaults(&self) -> Result<Settings> {
        let config = Config::load_or_default(&self.path)?;
        config.keys.validate()?;
        Ok(config.keys)
    }

    fn save(&mut self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        let mut config = Config::load_or_default(&self.path)?;
        config.keys = *settings;
        config.save_to(&self.path)
    }

    fn reset_to_factory(&mut self) -> Result<Settings> {
        let mut config = Config::load_or_default(&self.path)?;
        config.keys = Settings::default();
        config.save_to(&self.path)?;
        tracing::info!("Card settings reset to factory defaults");
        Ok(config.keys)
    }
}
