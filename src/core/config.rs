//! Configuration data and disk I/O
//!
//! The config file holds user-created instruction entries (personas,
//! frameworks, linguistic controls), collaborator switches, and the default
//! connection id. Session and connection state itself lives in the store
//! snapshot, not here.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A reusable system-prompt fragment defining assistant identity and voice.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub category: String,
    pub system_prompt: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_custom: bool,
}

/// A reusable instruction fragment defining a reasoning approach.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Framework {
    pub id: String,
    pub name: String,
    pub category: String,
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_custom: bool,
}

/// A reusable instruction fragment constraining output style and tone.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LinguisticControl {
    pub id: String,
    pub name: String,
    pub category: String,
    pub system_instruction: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_custom: bool,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    /// Include the built-in instruction libraries shipped with the binary
    pub builtin_library: Option<bool>,
    /// User-defined personas, merged after the built-ins
    #[serde(default)]
    pub personas: Vec<Persona>,
    /// User-defined frameworks
    #[serde(default)]
    pub frameworks: Vec<Framework>,
    /// User-defined linguistic controls
    #[serde(default)]
    pub linguistic_controls: Vec<LinguisticControl>,
    /// Speak finished assistant replies through the speech collaborator
    pub voice_enabled: Option<bool>,
    /// Ground prompts with web-search results by default
    pub web_search: Option<bool>,
    /// Connection id selected at startup
    pub default_connection: Option<String>,
}

/// Get a user-friendly display string for a path, using `~` notation on
/// Unix-like systems when possible.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path_display(path), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path_display(path), source)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn StdError>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
            let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: config_path.clone(),
                source,
            })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn load() -> Result<Config, Box<dyn StdError>> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = config_path
            .parent()
            .ok_or("Config path has no parent directory")?;
        fs::create_dir_all(parent)?;

        let serialized = toml::to_string_pretty(self)?;

        // Write to a temp file in the same directory, then rename, so a
        // crash mid-write never truncates the existing config.
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(serialized.as_bytes())?;
        temp.flush()?;
        temp.persist(config_path)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), Box<dyn StdError>> {
        self.save_to_path(&default_config_path()?)
    }

    pub fn include_builtins(&self) -> bool {
        self.builtin_library.unwrap_or(true)
    }
}

fn project_dirs() -> Result<ProjectDirs, Box<dyn StdError>> {
    ProjectDirs::from("org", "permacommons", "parlance")
        .ok_or_else(|| "Could not determine a home directory for configuration".into())
}

pub fn default_config_path() -> Result<PathBuf, Box<dyn StdError>> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Location of the persisted session-store snapshot.
pub fn default_snapshot_path() -> Result<PathBuf, Box<dyn StdError>> {
    Ok(project_dirs()?.data_dir().join("store.json"))
}
