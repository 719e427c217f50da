// SPDX-License-Identifier: Apache-2.0
//! Pin engine (`spec.md` §4.2).

use content_directory::LookupOrigin;
use content_types::{ContentHash, ContentHashWithSize, ContentLocationEntry, ContentSize, PinResult, Urgency};
use futures::stream::{self, StreamExt};

use crate::handles::EngineHandles;
use crate::lookup::get_locations;
use crate::{Session, SessionError};

/// Per-call pin tunables (`spec.md` §4.2 "Configuration options"), layered
/// on top of the session's ambient [`content_config::SessionConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PinOptions {
    /// Ask the local CAS and then the global directory for
    /// succeed-with-one-location existence before running the full pin
    /// algorithm on a detached scope.
    pub return_global_existence_fast: bool,
    /// Override the session's `proactive_copy_on_pin` default for this
    /// call. `None` defers to the session config.
    pub proactive_copy_on_pin: Option<bool>,
}

impl Default for PinOptions {
    fn default() -> Self {
        Self {
            return_global_existence_fast: false,
            proactive_copy_on_pin: None,
        }
    }
}

impl Session {
    /// Pin a single hash. See [`Session::pin_bulk`].
    pub async fn pin(&self, hash: ContentHash, urgency: Urgency, options: PinOptions) -> Result<PinResult, SessionError> {
        let mut results = self.pin_bulk(&[hash], urgency, options).await?;
        Ok(results.remove(0))
    }

    /// Pin every hash in `hashes`, in order (`spec.md` §4.2).
    pub async fn pin_bulk(
        &self,
        hashes: &[ContentHash],
        urgency: Urgency,
        options: PinOptions,
    ) -> Result<Vec<PinResult>, SessionError> {
        self.require_running().await?;
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let proactive_on_pin = options
            .proactive_copy_on_pin
            .unwrap_or(self.handles.config.proactive_copy_on_pin);

        if options.return_global_existence_fast {
            let fast = self.handles.pin_bulk_fast(hashes).await;
            let handles = self.handles.clone();
            let hashes_owned = hashes.to_vec();
            let inline = self.handles.config.inline_operations_for_tests;
            let continuation = async move {
                let (_results, needing_copy, needing_top_up) = handles.pin_bulk_main(&hashes_owned, urgency).await;
                handles.schedule_async_top_ups(needing_top_up).await;
                if proactive_on_pin {
                    handles.schedule_post_pin_copies(needing_copy, inline).await;
                }
            };
            if inline {
                continuation.await;
            } else {
                crate::detached::spawn_on_store(&self.store_token, continuation);
            }
            return Ok(fast);
        }

        let (results, needing_copy, needing_top_up) = self.handles.pin_bulk_main(hashes, urgency).await;
        let handles = self.handles.clone();
        let inline = self.handles.config.inline_operations_for_tests;
        let continuation = async move {
            handles.schedule_async_top_ups(needing_top_up).await;
            if proactive_on_pin {
                handles.schedule_post_pin_copies(needing_copy, inline).await;
            }
        };
        if inline {
            continuation.await;
        } else {
            crate::detached::spawn_on_store(&self.store_token, continuation);
        }
        Ok(results)
    }
}

/// Classification of one directory stage's entry against the pin
/// thresholds.
enum StageOutcome {
    /// Decision already reached; no further stage needed. The `bool` is
    /// whether an async copy-on-pin top-up is warranted (count within
    /// `async_copy_on_pin_threshold` of `pin_min_unverified_count`).
    Enough(PinResult, bool),
    /// Never registered, or registered with no current replicas. `true`
    /// means never registered (`spec.md` §1 "ContentLocationEntry": the
    /// null-vs-empty-list distinction is load-bearing for diagnostics).
    NotFound { never_registered: bool },
    /// Known replicas exist but below `pin_min_unverified_count`.
    BelowThreshold(u32),
}

impl EngineHandles {
    async fn pin_bulk_fast(&self, hashes: &[ContentHash]) -> Vec<PinResult> {
        let mut results = Vec::with_capacity(hashes.len());
        let mut need_global = Vec::new();
        let mut need_global_idx = Vec::new();

        for (idx, &hash) in hashes.iter().enumerate() {
            if hash.is_sentinel() {
                results.push(PinResult::EnoughReplicas {
                    count: 0,
                    note: "sentinel hash never needs a replica",
                });
                continue;
            }
            match self.cas.pin(hash, content_types::Urgency::Normal).await {
                Ok(put) if put.already_existed => {
                    results.push(PinResult::EnoughReplicas {
                        count: 1,
                        note: "local cache hit",
                    });
                }
                _ => {
                    results.push(PinResult::ContentNotFound {
                        replica_count: 0,
                        reason: "fast path: checking global directory".to_string(),
                    });
                    need_global.push(hash);
                    need_global_idx.push(idx);
                }
            }
        }

        if !need_global.is_empty() {
            if let Ok(global) = crate::lookup::get_bulk_single_stage(self.directory.as_ref(), &need_global, LookupOrigin::Global).await {
                for (idx, (_, entry)) in need_global_idx.into_iter().zip(global.entries) {
                    let count = entry.as_ref().map_or(0, ContentLocationEntry::replica_count) as u32;
                    if count >= 1 {
                        results[idx] = PinResult::EnoughReplicas {
                            count,
                            note: "global succeeds",
                        };
                    }
                }
            }
        }

        results
    }

    /// Runs the full pin algorithm and reports which hashes actually
    /// performed a copy (`SynchronousCopy`/`AsynchronousCopy`), for the
    /// caller to feed into the post-pin proactive-copy trigger
    /// (`spec.md` §4.2 step 4; the "`CopyLocally`" Open Question is
    /// resolved by gating on those two variants only, not `EnoughReplicas`
    /// — see `DESIGN.md`).
    async fn pin_bulk_main(&self, hashes: &[ContentHash], urgency: Urgency) -> (Vec<PinResult>, Vec<ContentHash>, Vec<ContentHash>) {
        let (local, global) = get_locations(&self.directory, hashes).await;

        let worker_count = self.config.pin_configuration.max_io_operations.max(1);
        let results: Vec<(ContentHash, PinResult, bool, Option<ContentHashWithSize>)> = stream::iter(hashes.iter().copied().enumerate())
            .map(|(idx, hash)| {
                let local_entry = local.entries.get(idx).and_then(|(_, e)| e.clone());
                let global_entry = global.entries.get(idx).and_then(|(_, e)| e.clone());
                self.pin_one(hash, urgency, local_entry, global_entry)
            })
            .buffer_unordered(worker_count)
            .collect::<Vec<_>>()
            .await;

        // `buffer_unordered` does not preserve input order; reassemble it.
        let mut by_hash: std::collections::HashMap<ContentHash, (PinResult, bool, Option<ContentHashWithSize>)> = results
            .into_iter()
            .map(|(hash, result, needs_top_up, to_register)| (hash, (result, needs_top_up, to_register)))
            .collect();
        let mut ordered = Vec::with_capacity(hashes.len());
        let mut needing_top_up = Vec::new();
        let mut to_register = Vec::new();
        for hash in hashes {
            let (result, needs_top_up, registration) = by_hash.remove(hash).unwrap_or((
                PinResult::ContentNotFound {
                    replica_count: 0,
                    reason: "result missing after dispatch".to_string(),
                },
                false,
                None,
            ));
            if needs_top_up {
                needing_top_up.push(*hash);
            }
            if let Some(entry) = registration {
                to_register.push(entry);
            }
            ordered.push(result);
        }

        // Every local-CAS hit in this batch is advertised to the directory
        // in one call, not one call per hash (`spec.md` §4.2 step 2
        // "(batched)"), mirroring `place_engine`'s registration batching.
        if !to_register.is_empty() {
            if let Err(err) = self.directory.register_local_location(&to_register, urgency).await {
                tracing::warn!(error = %err, count = to_register.len(), "batched local-hit registration failed");
            }
        }

        let needing_copy = hashes
            .iter()
            .zip(ordered.iter())
            .filter(|(_, result)| matches!(result, PinResult::SynchronousCopy { .. } | PinResult::AsynchronousCopy { .. }))
            .map(|(hash, _)| *hash)
            .collect();

        (ordered, needing_copy, needing_top_up)
    }

    /// Fires the post-pin proactive-copy trigger for every hash that
    /// actually copied locally. The caller already decided whether this
    /// runs inline or on a detached scope (`spec.md` §4.2 step 4); `inline`
    /// only affects logging context here.
    async fn schedule_post_pin_copies(&self, hashes: Vec<ContentHash>, inline: bool) {
        for hash in hashes {
            let reason = if inline { "post-pin (inline)" } else { "post-pin (detached)" };
            let _ = self.proactive_copy_if_needed(hash, true, reason).await;
        }
    }

    /// Runs the async copy-on-pin top-up for every hash whose replica count
    /// sits within `async_copy_on_pin_threshold` of `pin_min_unverified_count`
    /// (`spec.md` §4.2 step 3). Bound to whatever scope the caller already
    /// chose (inline or `spawn_on_store`), never spawned independently.
    async fn schedule_async_top_ups(&self, hashes: Vec<ContentHash>) {
        for hash in hashes {
            if let Err(reason) = self.copy_one_replica(hash, Urgency::Normal).await {
                tracing::warn!(%hash, reason, "async copy-on-pin top-up failed");
            }
        }
    }

    async fn pin_one(
        &self,
        hash: ContentHash,
        urgency: Urgency,
        local_entry: Option<ContentLocationEntry>,
        global_entry: Option<ContentLocationEntry>,
    ) -> (ContentHash, PinResult, bool, Option<ContentHashWithSize>) {
        if hash.is_sentinel() {
            return (
                hash,
                PinResult::EnoughReplicas {
                    count: 0,
                    note: "sentinel hash never needs a replica",
                },
                false,
                None,
            );
        }

        match self.cas.pin(hash, urgency).await {
            Ok(put) if put.already_existed => {
                // Local hit: "I also have this" is advertised to the
                // directory as part of the batch's single aggregated
                // registration call, not here (`pin_bulk_main`).
                return (
                    hash,
                    PinResult::EnoughReplicas {
                        count: 1,
                        note: "local cache hit",
                    },
                    false,
                    Some(ContentHashWithSize { hash, size: put.size }),
                );
            }
            Ok(_) | Err(_) => {}
        }

        let config = self.config.pin_configuration;
        let (result, needs_top_up) = self
            .remote_pin(hash, urgency, local_entry, config.use_local_locations_only_on_unverified_pin, global_entry)
            .await;
        (hash, result, needs_top_up, None)
    }

    async fn remote_pin(
        &self,
        hash: ContentHash,
        urgency: Urgency,
        local_entry: Option<ContentLocationEntry>,
        local_only: bool,
        global_entry: Option<ContentLocationEntry>,
    ) -> (PinResult, bool) {
        let config = self.config.pin_configuration;

        match self.evaluate_pin_stage(hash, &local_entry, config, false) {
            StageOutcome::Enough(result, needs_top_up) => return (result, needs_top_up),
            StageOutcome::NotFound { never_registered } if local_only => {
                let reason = if never_registered {
                    "local-only pin: never registered"
                } else {
                    "local-only pin: registered but empty"
                };
                return (
                    PinResult::ContentNotFound {
                        replica_count: 0,
                        reason: reason.to_string(),
                    },
                    false,
                );
            }
            StageOutcome::BelowThreshold(count) if local_only => {
                return (
                    PinResult::ContentNotFound {
                        replica_count: count,
                        reason: "local-only pin, below threshold".to_string(),
                    },
                    false,
                );
            }
            StageOutcome::NotFound { .. } | StageOutcome::BelowThreshold(_) => {}
        }

        match self.evaluate_pin_stage(hash, &global_entry, config, true) {
            StageOutcome::Enough(result, needs_top_up) => (result, needs_top_up),
            StageOutcome::NotFound { never_registered } => {
                let reason = if never_registered {
                    "never registered"
                } else {
                    "registered but empty"
                };
                (
                    PinResult::ContentNotFound {
                        replica_count: 0,
                        reason: reason.to_string(),
                    },
                    false,
                )
            }
            StageOutcome::BelowThreshold(count) => {
                let result = match self.copy_one_replica(hash, urgency).await {
                    Ok(()) => PinResult::SynchronousCopy { count },
                    Err(reason) => PinResult::ErrorFromTracker { count, underlying: reason },
                };
                (result, false)
            }
        }
    }

    /// Classifies one stage's entry against the pin thresholds. Warns only
    /// when `is_global_stage` (`spec.md` §4.2 step 3, log-spam rule).
    fn evaluate_pin_stage(
        &self,
        hash: ContentHash,
        entry: &Option<ContentLocationEntry>,
        config: content_config::PinConfiguration,
        is_global_stage: bool,
    ) -> StageOutcome {
        let Some(entry) = entry else {
            if is_global_stage {
                tracing::warn!(%hash, "pin: entry never registered at global stage");
            }
            return StageOutcome::NotFound { never_registered: true };
        };
        if entry.locations.as_ref().map_or(true, Vec::is_empty) {
            if is_global_stage {
                tracing::warn!(%hash, "pin: locations list empty at global stage");
            }
            return StageOutcome::NotFound { never_registered: false };
        }

        let count = entry.replica_count() as u32;
        if count >= config.pin_min_unverified_count {
            let needs_top_up = count < config.pin_min_unverified_count.saturating_add(config.async_copy_on_pin_threshold);
            return StageOutcome::Enough(PinResult::EnoughReplicas { count, note: "threshold met" }, needs_top_up);
        }

        StageOutcome::BelowThreshold(count)
    }

    /// Copy one replica of `hash` into the local CAS via the copier,
    /// registering it with the directory on success (`spec.md` §4.2 step 3).
    async fn copy_one_replica(&self, hash: ContentHash, urgency: Urgency) -> Result<(), String> {
        let (_local, global) = get_locations(&self.directory, std::slice::from_ref(&hash)).await;
        let mut resolved = Vec::new();
        if let Some(ids) = global.locations_for(&hash) {
            for id in ids {
                if let Some(location) = self.directory.resolve_location(*id).await {
                    resolved.push(location);
                }
            }
        }
        if resolved.is_empty() {
            return Err("no resolvable candidate locations".to_string());
        }

        let size = global
            .entries
            .iter()
            .find(|(h, _)| *h == hash)
            .and_then(|(_, e)| e.as_ref())
            .map_or(ContentSize::Unknown, |e| e.size);
        let landing = std::env::temp_dir().join(format!("pin-{hash}"));
        let request = content_copier::CopyRequest {
            hash,
            size,
            candidates: &resolved,
            landing_path: &landing,
            trusted_put: self.trusted_put(size),
            compression_size_threshold: Some(self.config.grpc_copy_compression_size_threshold),
        };
        let handler = crate::handles::CasLandedHandler {
            cas: self.cas.clone(),
            expected_hash: hash,
            trusted: request.trusted_put,
        };
        match self.copier.try_copy_and_put(request, &handler).await {
            Ok(put) => self
                .directory
                .register_local_location(&[ContentHashWithSize { hash, size: put.size }], urgency)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}
