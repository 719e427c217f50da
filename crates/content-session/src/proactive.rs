// SPDX-License-Identifier: Apache-2.0
//! Proactive-copy engine (`spec.md` §4.5).
//!
//! Spreads a newly-local hash outward by attempting one inside-ring and one
//! outside-ring push, concurrently, each independently retried.

use std::collections::HashSet;
use std::sync::Arc;

use content_cas::LocalCas;
use content_config::{ProactiveCopyMode, SessionConfig};
use content_copier::Copier;
use content_directory::ContentLocationStore;
use content_types::{
    ContentHash, ContentLocationEntry, InRingStatus, MachineId, MachineLocation, ProactiveCopyResult,
    ProactiveCopyStatus, PushResult,
};

use crate::handles::EngineHandles;
use crate::lookup::get_bulk_single_stage;
use crate::ring::BuildId;

/// Target-selection randomness, injectable so tests can pin outcomes
/// (`spec.md` §9 "Randomness").
pub trait Rng: Send + Sync {
    /// Return an index in `0..len`. Implementations must never return an
    /// out-of-range index for `len > 0`; `len == 0` callers never use the
    /// result.
    fn choose_index(&self, len: usize) -> usize;
}

/// The production RNG, backed by `rand::thread_rng`.
#[derive(Debug, Default)]
pub struct ThreadRng;

impl Rng for ThreadRng {
    fn choose_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        use rand::Rng as _;
        rand::thread_rng().gen_range(0..len)
    }
}

/// Test double that replays a fixed sequence of indices, clamped modulo the
/// candidate list's length, falling back to index 0 once exhausted.
pub struct DeterministicRng {
    sequence: std::sync::Mutex<std::collections::VecDeque<usize>>,
}

impl DeterministicRng {
    /// Build a deterministic RNG that replays `sequence` in order.
    pub fn new(sequence: Vec<usize>) -> Self {
        Self {
            sequence: std::sync::Mutex::new(sequence.into()),
        }
    }
}

impl Rng for DeterministicRng {
    fn choose_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut seq = self.sequence.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let chosen = seq.pop_front().unwrap_or(0);
        chosen % len
    }
}

fn pick<'a, T>(rng: &dyn Rng, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        items.get(rng.choose_index(items.len()))
    }
}

fn is_same_location(a: Option<&MachineLocation>, b: &MachineLocation) -> bool {
    a == Some(b)
}

async fn resolve_excluded_locations(
    directory: &dyn ContentLocationStore,
    ids: &HashSet<MachineId>,
) -> HashSet<MachineLocation> {
    let mut resolved = HashSet::new();
    for id in ids {
        if let Some(location) = directory.resolve_location(*id).await {
            resolved.insert(location);
        }
    }
    resolved
}

/// One bulk-lookup call for a batch of hashes, as consumed by the
/// [`crate::nagle::BatchQueue`]: local stage first, escalating to the
/// global stage only for hashes whose local replica count is still below
/// `threshold` (`spec.md` §4.5 "Lookup").
pub(crate) async fn escalate_batch(
    directory: &dyn ContentLocationStore,
    threshold: u32,
    hashes: Vec<ContentHash>,
) -> Vec<Option<ContentLocationEntry>> {
    let local = match get_bulk_single_stage(directory, &hashes, content_directory::LookupOrigin::Local).await {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(error = %err, "local stage failed during proactive-copy lookup");
            content_types::GetBulkResult::degraded(content_types::GetBulkOrigin::Local, &hashes)
        }
    };

    let mut result: Vec<Option<ContentLocationEntry>> = local.entries.iter().map(|(_, e)| e.clone()).collect();
    let mut need_global = Vec::new();
    let mut need_global_idx = Vec::new();
    for (idx, (hash, entry)) in local.entries.iter().enumerate() {
        let count = entry.as_ref().map_or(0, ContentLocationEntry::replica_count) as u32;
        if count < threshold {
            need_global.push(*hash);
            need_global_idx.push(idx);
        }
    }

    if !need_global.is_empty() {
        let global = match get_bulk_single_stage(directory, &need_global, content_directory::LookupOrigin::Global).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "global stage failed during proactive-copy lookup");
                content_types::GetBulkResult::degraded(content_types::GetBulkOrigin::Global, &need_global)
            }
        };
        for (idx, (_, entry)) in need_global_idx.into_iter().zip(global.entries) {
            if entry.is_some() {
                result[idx] = entry;
            }
        }
    }

    result
}

async fn select_outside_ring_candidate(
    directory: &dyn ContentLocationStore,
    rng: &dyn Rng,
    hash: ContentHash,
    excluded_ids: &HashSet<MachineId>,
    master: Option<&MachineLocation>,
    use_preferred: bool,
) -> Result<MachineLocation, String> {
    let excluded: Vec<MachineId> = excluded_ids.iter().copied().collect();

    if use_preferred {
        if let Some(designated) = directory.get_designated_locations(hash).await {
            let excluded_locations = resolve_excluded_locations(directory, excluded_ids).await;
            let candidates: Vec<MachineLocation> = designated
                .into_iter()
                .filter(|loc| !excluded_locations.contains(loc) && !is_same_location(master, loc))
                .collect();
            if let Some(chosen) = pick(rng, &candidates) {
                return Ok(chosen.clone());
            }
        }
    }

    match directory.get_random_machine_location(&excluded).await {
        Some(loc) if !is_same_location(master, &loc) => Ok(loc),
        _ => Err("no outside-ring candidate available".to_string()),
    }
}

async fn select_inside_ring_candidate(
    directory: &dyn ContentLocationStore,
    rng: &dyn Rng,
    try_build_ring: bool,
    build_id: Option<BuildId>,
    replicated: &HashSet<MachineId>,
    ring_members: &[MachineId],
) -> Result<MachineLocation, InRingStatus> {
    if !try_build_ring || build_id.is_none() {
        return Err(InRingStatus::BuildIdNotSpecified);
    }
    if ring_members.is_empty() {
        return Err(InRingStatus::InRingMachineListIsEmpty);
    }

    let self_id = directory.self_machine_id();
    let mut candidates = Vec::new();
    for &id in ring_members {
        if id == self_id || replicated.contains(&id) {
            continue;
        }
        if directory.is_machine_active(id).await {
            candidates.push(id);
        }
    }

    if candidates.is_empty() {
        let all_already_covered = ring_members.iter().all(|id| *id == self_id || replicated.contains(id));
        return Err(if all_already_covered {
            InRingStatus::MachineAlreadyHasCopy
        } else {
            InRingStatus::MachineNotFound
        });
    }

    let chosen = *pick(rng, &candidates).unwrap_or(&candidates[0]);
    directory.resolve_location(chosen).await.ok_or(InRingStatus::MachineNotFound)
}

async fn push_with_retry(
    cas: &dyn LocalCas,
    copier: &dyn Copier,
    config: &SessionConfig,
    hash: ContentHash,
    target: MachineLocation,
) -> (PushResult, u32) {
    // Yield before starting so inside-ring and outside-ring pushes
    // interleave instead of one blocking the other (`spec.md` §4.5 "Push").
    tokio::task::yield_now().await;

    let mut retries = 0;
    loop {
        let result = if config.push_proactive_copies {
            match cas.open_stream(hash).await {
                Ok(Some(stream)) => copier.push_file(hash, &target, stream).await,
                Ok(None) => PushResult::SkipContentUnavailable,
                Err(err) => PushResult::Failed {
                    underlying: err.to_string(),
                },
            }
        } else {
            match copier.request_copy_file(hash, &target).await {
                Ok(()) => PushResult::Succeeded { size: None },
                Err(err) => PushResult::QualifiesForRetry {
                    underlying: err.to_string(),
                },
            }
        };

        let can_retry = matches!(result, PushResult::QualifiesForRetry { .. }) && retries < config.proactive_copy_max_retries;
        if can_retry {
            retries += 1;
            continue;
        }
        return (result, retries);
    }
}

impl EngineHandles {
    /// Attempt to spread `hash` to one outside-ring and one inside-ring
    /// target (`spec.md` §4.5). `reason` is carried only into tracing.
    pub(crate) async fn proactive_copy_if_needed(
        &self,
        hash: ContentHash,
        try_build_ring: bool,
        reason: &str,
    ) -> ProactiveCopyResult {
        if hash.is_sentinel() {
            return ProactiveCopyResult::not_required(hash);
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !in_flight.insert(hash) {
                tracing::debug!(%hash, reason, "proactive copy already in flight, skipping");
                return ProactiveCopyResult::not_required(hash);
            }
        }
        let _guard = InFlightGuard {
            hash,
            set: self.in_flight.clone(),
        };

        if try_build_ring {
            if let Some(build_id) = self.build_id {
                if self.ring.is_expired().await {
                    self.refresh_ring(build_id).await;
                }
            }
        }

        let entry = self.nagle.lookup(hash).await;
        let replica_count = entry.as_ref().map_or(0, ContentLocationEntry::replica_count) as u32;
        if replica_count >= self.config.proactive_copy_locations_threshold {
            tracing::debug!(%hash, reason, replica_count, "proactive copy not required, threshold met");
            return ProactiveCopyResult::not_required(hash);
        }

        let replicated: HashSet<MachineId> = entry.and_then(|e| e.locations).into_iter().flatten().collect();
        let master = self.directory.master().await;
        let ring_members = self.ring.get().await.unwrap_or_default();
        // Ring members are only folded into the exclusion set for the
        // outside-ring decision (`spec.md:135` scopes this augmentation to
        // outside-ring candidate selection); the inside-ring side excludes
        // only machines that already have the content, or the ring pool
        // would always appear fully covered.
        let mut excluded_outside = replicated.clone();
        for member in &ring_members {
            excluded_outside.insert(*member);
        }

        let mode = self.config.proactive_copy_mode;
        let outside = self.outside_ring_side(hash, &excluded_outside, master.as_ref(), mode);
        let inside = self.inside_ring_side(hash, try_build_ring, &replicated, &ring_members, mode);
        let (outside, inside) = tokio::join!(outside, inside);

        tracing::debug!(%hash, reason, ?outside, ?inside, "proactive copy attempt complete");
        ProactiveCopyResult { hash, outside, inside }
    }

    async fn refresh_ring(&self, build_id: BuildId) {
        let ring_hash = build_id.synthetic_hash();
        let lookup = crate::lookup::get_bulk_single_stage(self.directory.as_ref(), &[ring_hash], content_directory::LookupOrigin::Global).await;
        let members = match lookup {
            Ok(result) => result
                .entries
                .into_iter()
                .next()
                .and_then(|(_, entry)| entry)
                .and_then(|entry| entry.locations)
                .unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to refresh build ring snapshot");
                Vec::new()
            }
        };
        let mut members = members;
        let self_id = self.directory.self_machine_id();
        if !members.contains(&self_id) {
            members.push(self_id);
        }
        self.ring.refresh(members).await;
    }

    async fn outside_ring_side(
        &self,
        hash: ContentHash,
        replicated: &HashSet<MachineId>,
        master: Option<&MachineLocation>,
        mode: ProactiveCopyMode,
    ) -> ProactiveCopyStatus {
        if !mode.contains(ProactiveCopyMode::OUTSIDE_RING) {
            return ProactiveCopyStatus::Disabled;
        }
        match select_outside_ring_candidate(
            self.directory.as_ref(),
            self.rng.as_ref(),
            hash,
            replicated,
            master,
            self.config.proactive_copy_use_preferred_locations,
        )
        .await
        {
            Ok(target) => {
                let (result, retries) =
                    push_with_retry(self.cas.as_ref(), self.copier.as_ref(), &self.config, hash, target).await;
                ProactiveCopyStatus::Attempted { result, retries }
            }
            Err(reason) => ProactiveCopyStatus::NoCandidate(reason),
        }
    }

    async fn inside_ring_side(
        &self,
        hash: ContentHash,
        try_build_ring: bool,
        replicated: &HashSet<MachineId>,
        ring_members: &[MachineId],
        mode: ProactiveCopyMode,
    ) -> ProactiveCopyStatus {
        if !mode.contains(ProactiveCopyMode::INSIDE_RING) {
            return ProactiveCopyStatus::Disabled;
        }
        match select_inside_ring_candidate(
            self.directory.as_ref(),
            self.rng.as_ref(),
            try_build_ring,
            self.build_id,
            replicated,
            ring_members,
        )
        .await
        {
            Ok(target) => {
                let (result, retries) =
                    push_with_retry(self.cas.as_ref(), self.copier.as_ref(), &self.config, hash, target).await;
                ProactiveCopyStatus::Attempted { result, retries }
            }
            Err(status) => ProactiveCopyStatus::InRing(status),
        }
    }
}

struct InFlightGuard {
    hash: ContentHash,
    set: Arc<std::sync::Mutex<HashSet<ContentHash>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        set.remove(&self.hash);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_rng_replays_sequence_modulo_len() {
        let rng = DeterministicRng::new(vec![5, 1]);
        assert_eq!(rng.choose_index(3), 2);
        assert_eq!(rng.choose_index(3), 1);
        // exhausted sequence falls back to 0
        assert_eq!(rng.choose_index(3), 0);
    }

    #[test]
    fn pick_returns_none_for_empty_slice() {
        let rng = ThreadRng;
        let empty: Vec<u8> = Vec::new();
        assert!(pick(&rng, &empty).is_none());
    }
}
