use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::core::config::data::Config;
use crate::core::config::io::ConfigError;

#[derive(Default)]
struct Cached {
    config: Option<Config>,
    modified: Option<SystemTime>,
}

/// Cached view of one config file.
///
/// The cache is keyed on the file's mtime, so an edit made by another
/// `sparkchat set` while a chat is open is picked up on the next read. Every
/// edit goes load, mutate, then atomic save.
pub struct ConfigOrchestrator {
    path: PathBuf,
    cached: Mutex<Cached>,
}

impl ConfigOrchestrator {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(Cached::default()),
        }
    }

    pub fn for_default_path() -> Result<Self, ConfigError> {
        Config::get_config_path().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cached(&self) -> MutexGuard<'_, Cached> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load_with_cache(&self) -> Result<Config, ConfigError> {
        let mut cached = self.cached();
        let on_disk = modified_time(&self.path);
        match &cached.config {
            Some(config) if cached.modified == on_disk => Ok(config.clone()),
            _ => {
                let config = Config::load_from_path(&self.path)?;
                cached.modified = on_disk;
                cached.config = Some(config.clone());
                Ok(config)
            }
        }
    }

    pub fn persist(&self, config: Config) -> Result<(), ConfigError> {
        config.save_to_path(&self.path)?;
        let mut cached = self.cached();
        cached.modified = modified_time(&self.path);
        cached.config = Some(config);
        Ok(())
    }

    /// Applies `mutator` to the current config and saves the result. Nothing
    /// is written when the mutator fails.
    pub fn mutate<F, T>(&self, mutator: F) -> Result<T, Box<dyn Error>>
    where
        F: FnOnce(&mut Config) -> Result<T, Box<dyn Error>>,
    {
        let mut working = self.load_with_cache()?;
        let result = mutator(&mut working)?;
        self.persist(working)?;
        Ok(result)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}
