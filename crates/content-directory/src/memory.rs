// SPDX-License-Identifier: Apache-2.0
//! Scriptable in-memory [`ContentLocationStore`] for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use content_types::{
    ContentHash, ContentHashWithSize, ContentLocationEntry, ContentSize, GetBulkOrigin,
    GetBulkResult, MachineId, MachineLocation, ReplicationAttributes, Urgency,
};
use rand::seq::SliceRandom;

use crate::{ContentLocationStore, DirectoryError, LookupOrigin};

struct State {
    entries: HashMap<ContentHash, ContentLocationEntry>,
    active_machines: HashMap<MachineId, MachineLocation>,
    designated: HashMap<ContentHash, Vec<MachineLocation>>,
    master: Option<MachineLocation>,
    fail_next_get_bulk: bool,
    fail_next_register: bool,
    global_serves_cold_storage: bool,
}

/// In-memory directory fake with injectable failure modes, so tests can
/// deterministically exercise `DirectoryError::Unavailable` and
/// `PinResult::ErrorFromTracker` / `PlaceOutcome::TrackerRegistrationFailed`.
pub struct InMemoryDirectory {
    self_id: MachineId,
    state: Mutex<State>,
}

impl InMemoryDirectory {
    /// Create an empty directory, assigning `self_id` to the local machine.
    pub fn new(self_id: MachineId) -> Self {
        Self {
            self_id,
            state: Mutex::new(State {
                entries: HashMap::new(),
                active_machines: HashMap::new(),
                designated: HashMap::new(),
                master: None,
                fail_next_get_bulk: false,
                fail_next_register: false,
                global_serves_cold_storage: false,
            }),
        }
    }

    /// Register `machine` as active at `location`.
    pub fn add_machine(&self, machine: MachineId, location: MachineLocation) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active_machines.insert(machine, location);
    }

    /// Set the elected master.
    pub fn set_master(&self, location: MachineLocation) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).master = Some(location);
    }

    /// Seed a hash's location record directly (bypassing registration).
    pub fn seed(&self, hash: ContentHash, locations: Option<Vec<MachineId>>, size: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(
            hash,
            ContentLocationEntry {
                size: ContentSize::Known(size),
                locations,
                last_access_time_utc: None,
                attributes: ReplicationAttributes::default(),
            },
        );
    }

    /// Seed designated (preferred) locations for a hash.
    pub fn seed_designated(&self, hash: ContentHash, locations: Vec<MachineLocation>) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .designated
            .insert(hash, locations);
    }

    /// Make the next `get_bulk` call fail once.
    pub fn fail_next_get_bulk(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_next_get_bulk = true;
    }

    /// Make the next `register_local_location` call fail once.
    pub fn fail_next_register(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_next_register = true;
    }

    /// Simulate the directory's global tier falling back to cold storage:
    /// every subsequent `get_bulk(.., LookupOrigin::Global)` reports
    /// `GetBulkOrigin::ColdStorage` instead of `Global` until disabled.
    pub fn set_global_serves_cold_storage(&self, flag: bool) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .global_serves_cold_storage = flag;
    }

    /// Snapshot of everything currently registered for `hash` (test helper).
    pub fn entry_for(&self, hash: &ContentHash) -> Option<ContentLocationEntry> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(hash)
            .cloned()
    }
}

#[async_trait]
impl ContentLocationStore for InMemoryDirectory {
    async fn get_bulk(
        &self,
        hashes: &[ContentHash],
        origin: LookupOrigin,
    ) -> Result<GetBulkResult, DirectoryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if std::mem::take(&mut state.fail_next_get_bulk) {
            return Err(DirectoryError::Unavailable("simulated outage".into()));
        }
        let origin_tag = match origin {
            LookupOrigin::Local => GetBulkOrigin::Local,
            LookupOrigin::Global if state.global_serves_cold_storage => GetBulkOrigin::ColdStorage,
            LookupOrigin::Global => GetBulkOrigin::Global,
        };
        let entries = hashes
            .iter()
            .map(|h| (*h, state.entries.get(h).cloned()))
            .collect();
        Ok(GetBulkResult {
            origin: origin_tag,
            entries,
        })
    }

    async fn register_local_location(
        &self,
        entries: &[ContentHashWithSize],
        _urgency: Urgency,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if std::mem::take(&mut state.fail_next_register) {
            return Err(DirectoryError::Unavailable("simulated registration outage".into()));
        }
        let self_id = self.self_id;
        for item in entries {
            let entry = state
                .entries
                .entry(item.hash)
                .or_insert_with(|| ContentLocationEntry {
                    size: item.size,
                    locations: Some(Vec::new()),
                    last_access_time_utc: None,
                    attributes: ReplicationAttributes::default(),
                });
            entry.size = item.size;
            let locations = entry.locations.get_or_insert_with(Vec::new);
            if !locations.contains(&self_id) {
                locations.push(self_id);
            }
        }
        Ok(())
    }

    async fn get_random_machine_location(&self, except: &[MachineId]) -> Option<MachineLocation> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let candidates: Vec<&MachineLocation> = state
            .active_machines
            .iter()
            .filter(|(id, _)| !except.contains(id))
            .map(|(_, loc)| loc)
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|l| (*l).clone())
    }

    async fn get_designated_locations(&self, hash: ContentHash) -> Option<Vec<MachineLocation>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .designated
            .get(&hash)
            .cloned()
    }

    async fn is_machine_active(&self, machine: MachineId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active_machines
            .contains_key(&machine)
    }

    async fn master(&self) -> Option<MachineLocation> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).master.clone()
    }

    fn self_machine_id(&self) -> MachineId {
        self.self_id
    }

    async fn resolve_location(&self, machine: MachineId) -> Option<MachineLocation> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active_machines
            .get(&machine)
            .cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use content_types::HashType;

    fn h(byte: u8) -> ContentHash {
        ContentHash::new(HashType::Blake3, [byte; 32])
    }

    #[tokio::test]
    async fn register_then_get_bulk_reports_self() {
        let dir = InMemoryDirectory::new(MachineId(1));
        dir.register_local_location(
            &[ContentHashWithSize {
                hash: h(1),
                size: ContentSize::Known(4),
            }],
            Urgency::Normal,
        )
        .await
        .unwrap();

        let result = dir.get_bulk(&[h(1)], LookupOrigin::Local).await.unwrap();
        let entry = result.entries[0].1.as_ref().unwrap();
        assert_eq!(entry.locations.as_deref(), Some(&[MachineId(1)][..]));
    }

    #[tokio::test]
    async fn unregistered_hash_is_none_not_empty() {
        let dir = InMemoryDirectory::new(MachineId(1));
        let result = dir.get_bulk(&[h(2)], LookupOrigin::Global).await.unwrap();
        assert!(result.entries[0].1.is_none());
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let dir = InMemoryDirectory::new(MachineId(1));
        dir.fail_next_get_bulk();
        assert!(dir.get_bulk(&[h(3)], LookupOrigin::Local).await.is_err());
        assert!(dir.get_bulk(&[h(3)], LookupOrigin::Local).await.is_ok());
    }

    #[tokio::test]
    async fn random_machine_excludes_requested_ids() {
        let dir = InMemoryDirectory::new(MachineId(1));
        dir.add_machine(MachineId(2), MachineLocation("m2".into()));
        dir.add_machine(MachineId(3), MachineLocation("m3".into()));

        for _ in 0..20 {
            let picked = dir.get_random_machine_location(&[MachineId(2)]).await;
            assert_eq!(picked, Some(MachineLocation("m3".into())));
        }
    }
}
