// SPDX-License-Identifier: Apache-2.0
//! In-memory `ConfigStore` for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{ConfigError, ConfigStore};

/// Keeps raw blobs in a `HashMap` behind a `Mutex`. Never touches disk.
#[derive(Default)]
pub struct MemoryConfigStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ConfigService, SessionConfig};

    #[test]
    fn load_before_save_is_not_found() {
        let store = MemoryConfigStore::new();
        assert!(matches!(store.load_raw("session"), Err(ConfigError::NotFound)));
    }

    #[test]
    fn service_falls_back_to_default_session_config() {
        let service = ConfigService::new(MemoryConfigStore::new());
        let config = service.load_session_config().unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let service = ConfigService::new(MemoryConfigStore::new());
        let mut config = SessionConfig::default();
        config.proactive_copy_max_retries = 9;
        service.save_session_config(&config).unwrap();
        assert_eq!(service.load_session_config().unwrap(), config);
    }
}
