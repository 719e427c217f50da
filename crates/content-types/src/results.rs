// SPDX-License-Identifier: Apache-2.0
//! Results exchanged between the session's engines and its collaborators.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{ContentHash, MachineId};

/// A blob's length, or the sentinel "caller didn't tell us".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentSize {
    /// Known length in bytes.
    Known(u64),
    /// Caller did not supply a length.
    Unknown,
}

impl ContentSize {
    /// The known length, or `None`.
    pub fn bytes(&self) -> Option<u64> {
        match self {
            ContentSize::Known(n) => Some(*n),
            ContentSize::Unknown => None,
        }
    }
}

/// A content hash paired with its (possibly unknown) length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashWithSize {
    /// The hash.
    pub hash: ContentHash,
    /// The length, if known.
    pub size: ContentSize,
}

/// Opaque bag of replication attributes the directory attaches to an entry.
/// The session never interprets these — only carries them through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAttributes(pub BTreeMap<String, String>);

/// The directory's record for one hash.
///
/// `locations: None` means "never registered"; `locations: Some(vec![])`
/// means "known, but every claimed replica is currently missing". The pin
/// and place engines branch on this distinction, so it must never be
/// collapsed into a single "empty" representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocationEntry {
    /// Blob length as last reported to the directory.
    pub size: ContentSize,
    /// Claimed replica machines, or `None` if never registered.
    pub locations: Option<Vec<MachineId>>,
    /// Last time any machine's claim on this entry was touched.
    #[serde(skip)]
    pub last_access_time_utc: Option<SystemTime>,
    /// Opaque replication attributes.
    pub attributes: ReplicationAttributes,
}

impl ContentLocationEntry {
    /// Number of claimed replicas, or 0 if never registered.
    pub fn replica_count(&self) -> usize {
        self.locations.as_ref().map_or(0, Vec::len)
    }

    /// `true` if this entry has never been registered with the directory
    /// (as opposed to registered-but-all-replicas-missing).
    pub fn is_unregistered(&self) -> bool {
        self.locations.is_none()
    }
}

/// Which tier of the directory produced a [`GetBulkResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetBulkOrigin {
    /// The session's own local-cache stage.
    Local,
    /// The global directory.
    Global,
    /// The global directory, serving from a cold-storage tier.
    ColdStorage,
}

/// Result of a bulk location lookup, in the same order and length as the
/// hashes requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBulkResult {
    /// Which tier produced this result.
    pub origin: GetBulkOrigin,
    /// `(hash, entry)` pairs, `entry` is `None` when the lookup failed for
    /// that hash (degraded result — see [`GetBulkResult::degraded`]).
    pub entries: Vec<(ContentHash, Option<ContentLocationEntry>)>,
}

impl GetBulkResult {
    /// Number of hashes carried by this result.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if this result carries no hashes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a degraded result for `hashes`: every entry is `None`,
    /// distinguishable from a registered-but-empty-locations entry.
    pub fn degraded(origin: GetBulkOrigin, hashes: &[ContentHash]) -> Self {
        Self {
            origin,
            entries: hashes.iter().map(|h| (*h, None)).collect(),
        }
    }

    /// Locations already seen for `hash` in this result, if any.
    pub fn locations_for(&self, hash: &ContentHash) -> Option<&[MachineId]> {
        self.entries
            .iter()
            .find(|(h, _)| h == hash)
            .and_then(|(_, entry)| entry.as_ref())
            .and_then(|entry| entry.locations.as_deref())
    }

    /// Remove locations already attempted in `other` (a prior lookup level)
    /// from each matching entry. Entry presence/absence (`None`-ness) is
    /// preserved from `self`; only the location list is narrowed.
    #[must_use]
    pub fn subtract(&self, other: &GetBulkResult) -> GetBulkResult {
        let entries = self
            .entries
            .iter()
            .map(|(hash, entry)| {
                let Some(entry) = entry else {
                    return (*hash, None);
                };
                let Some(locations) = &entry.locations else {
                    return (*hash, Some(entry.clone()));
                };
                let already_tried = other.locations_for(hash).unwrap_or(&[]);
                let remaining: Vec<MachineId> = locations
                    .iter()
                    .filter(|loc| !already_tried.contains(loc))
                    .copied()
                    .collect();
                (
                    *hash,
                    Some(ContentLocationEntry {
                        locations: Some(remaining),
                        ..entry.clone()
                    }),
                )
            })
            .collect();
        GetBulkResult {
            origin: self.origin,
            entries,
        }
    }

    /// Union two results for the same hash set, preserving the maximum
    /// information known about each hash (a `Some` entry always wins over a
    /// `None`, locations are unioned, the larger known size wins).
    #[must_use]
    pub fn merge(&self, other: &GetBulkResult) -> GetBulkResult {
        let entries = self
            .entries
            .iter()
            .map(|(hash, mine)| {
                let theirs = other
                    .entries
                    .iter()
                    .find(|(h, _)| h == hash)
                    .and_then(|(_, e)| e.as_ref());
                (*hash, merge_entry(mine.as_ref(), theirs))
            })
            .collect();
        GetBulkResult {
            origin: self.origin,
            entries,
        }
    }
}

fn merge_entry(
    mine: Option<&ContentLocationEntry>,
    theirs: Option<&ContentLocationEntry>,
) -> Option<ContentLocationEntry> {
    match (mine, theirs) {
        (None, None) => None,
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (Some(a), Some(b)) => {
            let locations = match (&a.locations, &b.locations) {
                (None, None) => None,
                (Some(v), None) | (None, Some(v)) => Some(v.clone()),
                (Some(av), Some(bv)) => {
                    let mut merged = av.clone();
                    for loc in bv {
                        if !merged.contains(loc) {
                            merged.push(*loc);
                        }
                    }
                    Some(merged)
                }
            };
            let size = match (a.size, b.size) {
                (ContentSize::Known(n), _) | (_, ContentSize::Known(n)) => ContentSize::Known(n),
                _ => ContentSize::Unknown,
            };
            let last_access_time_utc = match (a.last_access_time_utc, b.last_access_time_utc) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
            let mut attributes = a.attributes.0.clone();
            attributes.extend(b.attributes.0.clone());
            Some(ContentLocationEntry {
                size,
                locations,
                last_access_time_utc,
                attributes: ReplicationAttributes(attributes),
            })
        }
    }
}

/// Outcome of pinning a single hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinResult {
    /// No usable replica was found. `replica_count` is the count the
    /// directory reported (0 if never registered); `reason` distinguishes
    /// "never registered" from "registered but empty" for diagnostics.
    ContentNotFound {
        /// Replicas the directory reported, if any.
        replica_count: u32,
        /// Human-readable reason, distinct for null vs. empty locations.
        reason: String,
    },
    /// Replica count already meets policy; no copy was needed.
    EnoughReplicas {
        /// Replica count observed.
        count: u32,
        /// Short note on which rule satisfied the pin (e.g. "global succeeds").
        note: &'static str,
    },
    /// A replica was copied into the local CAS synchronously before return.
    SynchronousCopy {
        /// Replica count observed before the copy.
        count: u32,
    },
    /// A replica copy was scheduled asynchronously (fire-and-forget).
    AsynchronousCopy {
        /// Replica count observed before the async copy was scheduled.
        count: u32,
    },
    /// The copy succeeded but directory registration of the new replica
    /// failed; the local effect is real and is not rolled back.
    ErrorFromTracker {
        /// Replica count observed before the copy.
        count: u32,
        /// The directory's error, rendered.
        underlying: String,
    },
}

/// Outcome of a push (stream-push or request-copy) to one target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    /// The push completed; `size` is the pushed length if known.
    Succeeded {
        /// Pushed content length, if known.
        size: Option<u64>,
    },
    /// Proactive copy is disabled by configuration.
    Disabled,
    /// The content was evicted locally before the push could start.
    SkipContentUnavailable,
    /// A transient failure occurred; the caller may retry.
    QualifiesForRetry {
        /// The underlying error, rendered.
        underlying: String,
    },
    /// The push failed and should not be retried.
    Failed {
        /// The underlying error, rendered.
        underlying: String,
    },
}

/// Why an in-ring proactive-copy target could not be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InRingStatus {
    /// The session has no build id.
    BuildIdNotSpecified,
    /// The build ring's machine list is empty.
    InRingMachineListIsEmpty,
    /// No active machine remained after excluding those already replicated.
    MachineNotFound,
    /// Every in-ring machine already has a copy.
    MachineAlreadyHasCopy,
}

/// Status of one side (inside-ring or outside-ring) of a proactive copy
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProactiveCopyStatus {
    /// Proactive copy is disabled for this side by configuration.
    Disabled,
    /// Known replica count already met the threshold; no push attempted.
    NotRequired,
    /// No candidate target machine could be found.
    NoCandidate(String),
    /// In-ring-specific reason no target could be found.
    InRing(InRingStatus),
    /// A push was attempted (after `retries` qualifying-for-retry rounds).
    Attempted {
        /// Final push outcome.
        result: PushResult,
        /// Number of retries actually taken.
        retries: u32,
    },
}

/// Merged result of a `proactive_copy_if_needed` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProactiveCopyResult {
    /// The hash this result is for.
    pub hash: ContentHash,
    /// Outside-ring side outcome.
    pub outside: ProactiveCopyStatus,
    /// Inside-ring side outcome.
    pub inside: ProactiveCopyStatus,
}

impl ProactiveCopyResult {
    /// Build a "copy not required" result (known replicas already meet the
    /// threshold, or the hash was deduplicated against an in-flight push).
    pub fn not_required(hash: ContentHash) -> Self {
        Self {
            hash,
            outside: ProactiveCopyStatus::NotRequired,
            inside: ProactiveCopyStatus::NotRequired,
        }
    }
}

/// Where a successfully placed file's bytes ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceSource {
    /// Already present in the local CAS before `place` was called.
    LocalCache,
    /// Copied in from a peer machine during this `place` call.
    DatacenterCache,
    /// Copied in from the directory's cold-storage tier.
    ColdStorage,
}

/// Outcome of placing a single hash at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOutcome {
    /// The file was placed; `source` says where the bytes came from.
    Placed {
        /// Provenance of the placed bytes.
        source: PlaceSource,
    },
    /// No usable location was on record for this hash.
    NotFound {
        /// Fixed diagnostic — place does not distinguish null vs. empty
        /// locations the way pin does (see `spec.md` §4.3).
        reason: &'static str,
    },
    /// Every candidate source failed to copy.
    CopyFailed {
        /// The last candidate's error, rendered.
        underlying: String,
    },
    /// The copy succeeded but directory registration failed.
    TrackerRegistrationFailed {
        /// The directory's error, rendered.
        underlying: String,
    },
    /// The hash is the absent-file sentinel, or another disallowed input.
    PolicyViolation(&'static str),
}

/// Result of placing a single hash, with gate telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceResult {
    /// The hash this result is for.
    pub hash: ContentHash,
    /// The outcome.
    pub outcome: PlaceOutcome,
    /// Time spent waiting to acquire the put/place concurrency gate, if the
    /// path required I/O.
    pub gate_wait: Option<Duration>,
}

/// Result of a single `put_file`/`put_stream` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// The content hash assigned (or confirmed) by the local CAS.
    pub hash: ContentHash,
    /// Stored length.
    pub size: ContentSize,
    /// `true` if the content was already present in the local CAS.
    pub already_existed: bool,
    /// `true` if the new replica was registered with the directory.
    pub registered: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::HashType;

    fn hash(byte: u8) -> ContentHash {
        ContentHash::new(HashType::Blake3, [byte; 32])
    }

    fn entry(locations: Option<Vec<u32>>) -> ContentLocationEntry {
        ContentLocationEntry {
            size: ContentSize::Known(10),
            locations: locations.map(|v| v.into_iter().map(MachineId).collect()),
            last_access_time_utc: None,
            attributes: ReplicationAttributes::default(),
        }
    }

    #[test]
    fn subtract_removes_already_tried_locations() {
        let h = hash(1);
        let local = GetBulkResult {
            origin: GetBulkOrigin::Local,
            entries: vec![(h, Some(entry(Some(vec![1]))))],
        };
        let global = GetBulkResult {
            origin: GetBulkOrigin::Global,
            entries: vec![(h, Some(entry(Some(vec![1, 2]))))],
        };
        let result = global.subtract(&local);
        assert_eq!(
            result.locations_for(&h),
            Some(&[MachineId(2)][..])
        );
    }

    #[test]
    fn subtract_preserves_none_entries() {
        let h = hash(2);
        let local = GetBulkResult {
            origin: GetBulkOrigin::Local,
            entries: vec![(h, None)],
        };
        let global = GetBulkResult {
            origin: GetBulkOrigin::Global,
            entries: vec![(h, None)],
        };
        assert_eq!(global.subtract(&local).entries[0].1, None);
    }

    #[test]
    fn subtract_distinguishes_null_from_empty() {
        let h = hash(3);
        let local = GetBulkResult {
            origin: GetBulkOrigin::Local,
            entries: vec![(h, None)],
        };
        let global = GetBulkResult {
            origin: GetBulkOrigin::Global,
            entries: vec![(h, Some(entry(Some(vec![]))))],
        };
        let result = global.subtract(&local);
        let e = result.entries[0].1.as_ref().unwrap();
        assert!(!e.is_unregistered());
        assert_eq!(e.replica_count(), 0);
    }

    #[test]
    fn merge_unions_locations_and_prefers_some_over_none() {
        let h = hash(4);
        let a = GetBulkResult {
            origin: GetBulkOrigin::Local,
            entries: vec![(h, Some(entry(Some(vec![1]))))],
        };
        let b = GetBulkResult {
            origin: GetBulkOrigin::Global,
            entries: vec![(h, Some(entry(Some(vec![2]))))],
        };
        let merged = a.merge(&b);
        let locs = merged.entries[0].1.as_ref().unwrap().locations.clone().unwrap();
        assert_eq!(locs.len(), 2);
    }

    #[test]
    fn degraded_result_has_null_locations_for_every_hash() {
        let hashes = vec![hash(5), hash(6)];
        let result = GetBulkResult::degraded(GetBulkOrigin::Global, &hashes);
        assert_eq!(result.len(), 2);
        assert!(result.entries.iter().all(|(_, e)| e.is_none()));
    }
}
