use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::MentorLoopError;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub mentorloop: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const MENTORLOOP_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            mentorloop: Self::MENTORLOOP_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.mentorloop.clone();
        self.mentorloop = self.mentorloop.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.mentorloop.as_str()) {
            eprintln!(
                "Config error: mentorloop log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::MENTORLOOP_LEVEL
            );
            self.mentorloop = Self::MENTORLOOP_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Directory holding the database file. Empty means the data directory.
    pub dir: String,
}

impl DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig { dir: String::new() }
    }

    pub fn resolve_dir(&self, project_dirs: &ProjectDirs) -> PathBuf {
        let trimmed = self.dir.trim();
        if trimmed.is_empty() {
            project_dirs.data_local_dir().to_path_buf()
        } else {
            PathBuf::from(trimmed)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GamificationConfig {
    /// Points needed to advance one level
    pub level_threshold: u64,
}

impl GamificationConfig {
    pub const LEVEL_THRESHOLD: u64 = 100;

    pub fn with_threshold(level_threshold: u64) -> Self {
        let mut config = GamificationConfig { level_threshold };
        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        if self.level_threshold == 0 {
            eprintln!(
                "Config error: level_threshold of 0 is invalid - using default of '{}'",
                Self::LEVEL_THRESHOLD
            );
            self.level_threshold = Self::LEVEL_THRESHOLD;
        }
    }
}

impl Default for GamificationConfig {
    fn default() -> Self {
        GamificationConfig {
            level_threshold: Self::LEVEL_THRESHOLD,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub gamification: GamificationConfig,
}

impl Config {
    fn default_config() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            gamification: GamificationConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data directory,
    /// then applies `MENTORLOOP_` environment overrides (e.g. `MENTORLOOP_GAMIFICATION__LEVEL_THRESHOLD`).
    /// If the file is missing or fails to parse, defaults are used.
    /// Writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Self::default_config();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("MENTORLOOP_").split("__"));

        Self::extract_or_default(figment, default_config)
    }

    fn extract_or_default(figment: Figment, default_config: Config) -> Self {
        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!("Could not load configuration: {}. Using default configuration.", err);
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.gamification.ensure_valid();
    }

    /// Install the process-wide configuration. Only the first call wins.
    pub fn install(config: Config) -> Result<&'static Config, MentorLoopError> {
        CONFIG
            .set(config)
            .map_err(|_| MentorLoopError::Error("Configuration already installed".into()))?;
        Self::get()
    }

    pub fn get() -> Result<&'static Config, MentorLoopError> {
        CONFIG
            .get()
            .ok_or_else(|| MentorLoopError::Error("Configuration not loaded".into()))
    }
}
