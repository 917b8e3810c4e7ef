use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tempfile::NamedTempFile;

use crate::core::config::data::{path_display, Config};

/// Overrides the platform config directory. Tests and sandboxed runs use it.
pub const CONFIG_DIR_ENV: &str = "SPARKCHAT_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: io::Error,
    },
    /// The file exists but is not a valid sparkchat config.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Serializing or atomically replacing the file failed.
    Write {
        path: PathBuf,
        source: Box<dyn StdError + Send + Sync>,
    },
    NoConfigDir,
}

impl ConfigError {
    fn write(path: &Path, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ConfigError::Write {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "could not read {}: {source}", path_display(path))
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config in {}: {source}", path_display(path))
            }
            ConfigError::Write { path, source } => {
                write!(f, "could not save {}: {source}", path_display(path))
            }
            ConfigError::NoConfigDir => write!(
                f,
                "no config directory for this platform (set {CONFIG_DIR_ENV} to choose one)"
            ),
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Write { source, .. } => Some(source.as_ref()),
            ConfigError::NoConfigDir => None,
        }
    }
}

impl Config {
    /// A missing file is not an error; every key falls back to its default.
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        let contents = match fs::read_to_string(config_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Writes through a temp file in the same directory so readers never see
    /// a half-written config.
    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|err| ConfigError::write(config_path, err))?;

        let contents =
            toml::to_string_pretty(self).map_err(|err| ConfigError::write(config_path, err))?;
        let mut staged =
            NamedTempFile::new_in(dir).map_err(|err| ConfigError::write(config_path, err))?;
        staged
            .write_all(contents.as_bytes())
            .and_then(|_| staged.as_file_mut().sync_all())
            .map_err(|err| ConfigError::write(config_path, err))?;
        staged
            .persist(config_path)
            .map_err(|err| ConfigError::write(config_path, err.error))?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|dir| !dir.is_empty()) {
            return Ok(PathBuf::from(dir).join(CONFIG_FILE));
        }
        ProjectDirs::from("org", "sparkchat", "sparkchat")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from_path(&Self::get_config_path()?)
    }
}
