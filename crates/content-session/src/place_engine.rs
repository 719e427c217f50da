// SPDX-License-Identifier: Apache-2.0
//! Place engine (`spec.md` §4.3).

use std::path::{Path, PathBuf};
use std::time::Duration;

use content_types::{
    AccessMode, ContentHash, ContentHashWithSize, ContentLocationEntry, ContentSize, GetBulkOrigin, MachineLocation,
    PlaceOutcome, PlaceResult, PlaceSource, PutResult, RealizationMode, ReplacementMode, Urgency,
};
use futures::stream::{self, StreamExt};

use crate::handles::{CasLandedHandler, EngineHandles};
use crate::lookup::get_locations;
use crate::{Session, SessionError};

/// One hash/destination pair in a bulk `place` call. Access mode,
/// replacement mode, realization mode, and urgency are uniform across the
/// whole batch (`spec.md` §4.3).
#[derive(Debug, Clone)]
pub struct PlaceRequest {
    /// The hash to materialize.
    pub hash: ContentHash,
    /// Destination path.
    pub path: PathBuf,
}

impl Session {
    /// Place a single hash at `path`. See [`Session::place_file_bulk`].
    pub async fn place_file(
        &self,
        hash: ContentHash,
        path: PathBuf,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Result<PlaceResult, SessionError> {
        let mut results = self
            .place_file_bulk(&[PlaceRequest { hash, path }], access, replacement, realization, urgency)
            .await?;
        Ok(results.remove(0))
    }

    /// Place every request in `requests`, in order (`spec.md` §4.3).
    pub async fn place_file_bulk(
        &self,
        requests: &[PlaceRequest],
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Result<Vec<PlaceResult>, SessionError> {
        self.require_running().await?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.handles.place_bulk(requests, access, replacement, realization, urgency).await)
    }
}

fn has_locations(entry: &Option<ContentLocationEntry>) -> bool {
    entry.as_ref().is_some_and(|e| e.locations.as_ref().is_some_and(|l| !l.is_empty()))
}

impl EngineHandles {
    async fn place_bulk(
        &self,
        requests: &[PlaceRequest],
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Vec<PlaceResult> {
        let hashes: Vec<ContentHash> = requests.iter().map(|r| r.hash).collect();
        let (local, global) = get_locations(&self.directory, &hashes).await;
        let global_origin = global.origin;

        let mut results: Vec<Option<PlaceResult>> = vec![None; requests.len()];
        let mut candidates = Vec::new();

        for (idx, request) in requests.iter().enumerate() {
            if request.hash == ContentHash::ABSENT_FILE {
                results[idx] = Some(PlaceResult {
                    hash: request.hash,
                    outcome: PlaceOutcome::PolicyViolation("absent-file sentinel cannot be placed"),
                    gate_wait: None,
                });
                continue;
            }
            let local_entry = local.entries.get(idx).and_then(|(_, e)| e.clone());
            let global_entry = global.entries.get(idx).and_then(|(_, e)| e.clone());
            // Filtering (`spec.md` §4.3): reject hashes with no locations on
            // record anywhere, before any I/O. The empty-content sentinel
            // always has trivial (empty) locations and is handled by its
            // own local-CAS round trip below, never by this rejection.
            if !request.hash.is_sentinel() && !has_locations(&local_entry) && !has_locations(&global_entry) {
                results[idx] = Some(PlaceResult {
                    hash: request.hash,
                    outcome: PlaceOutcome::NotFound {
                        reason: "metadata-records-not-found",
                    },
                    gate_wait: None,
                });
                continue;
            }
            candidates.push((idx, local_entry, global_entry));
        }

        let worker_count = self.config.max_concurrent_put_and_place_file_operations.max(1);
        let placed: Vec<(usize, PlaceResult, Option<ContentHashWithSize>)> = stream::iter(candidates.into_iter().map(
            |(idx, local_entry, global_entry)| {
                let request = &requests[idx];
                self.place_one(
                    request.hash,
                    &request.path,
                    access,
                    replacement,
                    realization,
                    urgency,
                    local_entry,
                    global_entry,
                    global_origin,
                )
                .map(move |(result, registration)| (idx, result, registration))
            },
        ))
        .buffer_unordered(worker_count)
        .collect()
        .await;

        let mut to_register: Vec<(usize, ContentHashWithSize)> = Vec::new();
        for (idx, result, registration) in placed {
            if let Some(entry) = registration {
                to_register.push((idx, entry));
            }
            results[idx] = Some(result);
        }

        // Each successful copy is recorded via a single batched call; a
        // registration failure fails every place that depended on it
        // (`spec.md` §4.3 step 3), but never rolls back the local copy.
        if !to_register.is_empty() {
            let entries: Vec<ContentHashWithSize> = to_register.iter().map(|(_, e)| *e).collect();
            if let Err(err) = self.directory.register_local_location(&entries, urgency).await {
                let underlying = err.to_string();
                for (idx, entry) in &to_register {
                    let gate_wait = results[*idx].as_ref().and_then(|r| r.gate_wait);
                    results[*idx] = Some(PlaceResult {
                        hash: entry.hash,
                        outcome: PlaceOutcome::TrackerRegistrationFailed {
                            underlying: underlying.clone(),
                        },
                        gate_wait,
                    });
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, result)| {
                result.unwrap_or_else(|| PlaceResult {
                    hash: requests[idx].hash,
                    outcome: PlaceOutcome::NotFound {
                        reason: "metadata-records-not-found",
                    },
                    gate_wait: None,
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_one(
        &self,
        hash: ContentHash,
        path: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        urgency: Urgency,
        local_entry: Option<ContentLocationEntry>,
        global_entry: Option<ContentLocationEntry>,
        global_origin: GetBulkOrigin,
    ) -> (PlaceResult, Option<ContentHashWithSize>) {
        let mut gate_wait = Duration::ZERO;

        let initial = {
            let guard = self.gate.acquire().await;
            gate_wait += guard.wait;
            self.cas.place_file(hash, path, access, replacement, realization, urgency).await
        };

        match initial {
            Ok(result) if !matches!(result.outcome, PlaceOutcome::NotFound { .. }) => {
                return (
                    PlaceResult {
                        gate_wait: Some(gate_wait),
                        ..result
                    },
                    None,
                );
            }
            Err(err) => {
                return (
                    PlaceResult {
                        hash,
                        outcome: PlaceOutcome::CopyFailed {
                            underlying: err.to_string(),
                        },
                        gate_wait: Some(gate_wait),
                    },
                    None,
                );
            }
            Ok(_) => {}
        }

        // The local CAS missed. The empty-content and absent-file hashes are
        // never copied (`spec.md` §4.3 filtering); the absent-file case was
        // already rejected above, so only the empty-content sentinel can
        // reach here, and a miss for it means the local CAS genuinely has no
        // representation for zero-byte content — report it as-is.
        if hash.is_sentinel() {
            return (
                PlaceResult {
                    hash,
                    outcome: PlaceOutcome::NotFound {
                        reason: "metadata-records-not-found",
                    },
                    gate_wait: Some(gate_wait),
                },
                None,
            );
        }

        let level1 = self.resolve_candidates(&local_entry).await;
        let level2_needed = level1.is_empty();
        let (copy_outcome, source) = if !level2_needed {
            (self.copy_and_put(hash, level1_size(&local_entry), &level1).await, PlaceSource::DatacenterCache)
        } else {
            let level2 = self.resolve_candidates(&global_entry).await;
            if level2.is_empty() {
                return (
                    PlaceResult {
                        hash,
                        outcome: PlaceOutcome::NotFound {
                            reason: "metadata-records-not-found",
                        },
                        gate_wait: Some(gate_wait),
                    },
                    None,
                );
            }
            let source = if global_origin == GetBulkOrigin::ColdStorage {
                PlaceSource::ColdStorage
            } else {
                PlaceSource::DatacenterCache
            };
            (self.copy_and_put(hash, level1_size(&global_entry), &level2).await, source)
        };

        let put = match copy_outcome {
            Ok(put) => put,
            Err(underlying) => {
                return (
                    PlaceResult {
                        hash,
                        outcome: PlaceOutcome::CopyFailed { underlying },
                        gate_wait: Some(gate_wait),
                    },
                    None,
                );
            }
        };

        let final_place = {
            let guard = self.gate.acquire().await;
            gate_wait += guard.wait;
            self.cas.place_file(hash, path, access, replacement, realization, urgency).await
        };

        match final_place {
            Ok(mut result) => {
                if matches!(result.outcome, PlaceOutcome::Placed { .. }) {
                    result.outcome = PlaceOutcome::Placed { source };
                }
                (
                    PlaceResult {
                        gate_wait: Some(gate_wait),
                        ..result
                    },
                    Some(ContentHashWithSize { hash, size: put.size }),
                )
            }
            Err(err) => (
                PlaceResult {
                    hash,
                    outcome: PlaceOutcome::CopyFailed {
                        underlying: err.to_string(),
                    },
                    gate_wait: Some(gate_wait),
                },
                // The copy did land locally even though the re-place failed;
                // still worth advertising to the directory.
                Some(ContentHashWithSize { hash, size: put.size }),
            ),
        }
    }

    async fn resolve_candidates(&self, entry: &Option<ContentLocationEntry>) -> Vec<MachineLocation> {
        let Some(entry) = entry else {
            return Vec::new();
        };
        let Some(ids) = &entry.locations else {
            return Vec::new();
        };
        let mut resolved = Vec::new();
        for id in ids {
            if let Some(location) = self.directory.resolve_location(*id).await {
                resolved.push(location);
            }
        }
        resolved
    }

    async fn copy_and_put(&self, hash: ContentHash, size: ContentSize, candidates: &[MachineLocation]) -> Result<PutResult, String> {
        let landing = std::env::temp_dir().join(format!("place-{hash}"));
        let request = content_copier::CopyRequest {
            hash,
            size,
            candidates,
            landing_path: &landing,
            trusted_put: self.trusted_put(size),
            compression_size_threshold: Some(self.config.grpc_copy_compression_size_threshold),
        };
        let handler = CasLandedHandler {
            cas: self.cas.clone(),
            expected_hash: hash,
            trusted: request.trusted_put,
        };
        self.copier.try_copy_and_put(request, &handler).await.map_err(|err| err.to_string())
    }
}

fn level1_size(entry: &Option<ContentLocationEntry>) -> ContentSize {
    entry.as_ref().map_or(ContentSize::Unknown, |e| e.size)
}
