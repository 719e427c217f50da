// SPDX-License-Identifier: Apache-2.0
//! Filesystem-backed `ConfigStore` (uses the platform config directory).

use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;

use crate::{ConfigError, ConfigStore};

/// Store configs as JSON files under the platform config directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory (e.g.
    /// `~/.config/content-session`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "content-session", "content-session")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Create a store rooted at an explicit directory (for tests or
    /// callers that manage their own layout).
    pub fn at(base: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ConfigService, SessionConfig};

    #[test]
    fn round_trips_session_config_through_disk() {
        let dir = std::env::temp_dir().join(format!(
            "content-config-test-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
        ));
        let store = FsConfigStore::at(dir.clone()).unwrap();
        let service = ConfigService::new(store);

        let mut config = SessionConfig::default();
        config.max_concurrent_put_and_place_file_operations = 42;
        service.save_session_config(&config).unwrap();

        let loaded = service.load_session_config().unwrap();
        assert_eq!(loaded.max_concurrent_put_and_place_file_operations, 42);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_key_reports_not_found() {
        let dir = std::env::temp_dir().join(format!(
            "content-config-test-missing-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
        ));
        let store = FsConfigStore::at(dir.clone()).unwrap();
        assert!(matches!(store.load_raw("nope"), Err(ConfigError::NotFound)));
        let _ = fs::remove_dir_all(dir);
    }
}
