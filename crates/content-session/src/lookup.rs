// SPDX-License-Identifier: Apache-2.0
//! Multi-level location lookup (`spec.md` §4.1).

use std::sync::Arc;

use content_directory::{ContentLocationStore, DirectoryError, LookupOrigin};
use content_types::{ContentHash, ContentLocationEntry, ContentSize, GetBulkOrigin, GetBulkResult, ReplicationAttributes};

/// A trivially-satisfied entry synthesized for the empty-content hash,
/// which the engines never actually look up (`spec.md` §4.1 edge case).
fn sentinel_entry() -> ContentLocationEntry {
    ContentLocationEntry {
        size: ContentSize::Known(0),
        locations: Some(Vec::new()),
        last_access_time_utc: None,
        attributes: ReplicationAttributes::default(),
    }
}

async fn stage(
    directory: &dyn ContentLocationStore,
    hashes: &[ContentHash],
    origin: LookupOrigin,
    bulk_origin: GetBulkOrigin,
) -> GetBulkResult {
    let (sentinels, normal): (Vec<ContentHash>, Vec<ContentHash>) =
        hashes.iter().copied().partition(ContentHash::is_sentinel);
    // The directory's own response origin is preserved (rather than always
    // stamping `bulk_origin`) so the global stage can report `ColdStorage`
    // when the directory served it from its cold tier (`spec.md` §4.3 step
    // 2 "label ... cold storage when origin is cold storage").
    let (resolved_origin, normal_result) = if normal.is_empty() {
        (bulk_origin, GetBulkResult {
            origin: bulk_origin,
            entries: Vec::new(),
        })
    } else {
        match directory.get_bulk(&normal, origin).await {
            Ok(result) => (result.origin, result),
            Err(err) => {
                tracing::warn!(error = %err, "directory lookup failed, returning degraded result");
                (bulk_origin, GetBulkResult::degraded(bulk_origin, &normal))
            }
        }
    };
    let mut normal_iter = normal_result.entries.into_iter();
    let entries = hashes
        .iter()
        .map(|hash| {
            if sentinels.contains(hash) {
                (*hash, Some(sentinel_entry()))
            } else {
                normal_iter
                    .next()
                    .unwrap_or((*hash, None))
            }
        })
        .collect();
    GetBulkResult {
        origin: resolved_origin,
        entries,
    }
}

/// Run the local stage, then the global stage subtracted against the
/// local stage's already-known locations. Returns `(local, global)` in
/// that order, both the same length/order as `hashes`.
///
/// An empty `hashes` slice returns two empty results without calling the
/// directory (`spec.md` §4.1 edge case).
pub async fn get_locations(
    directory: &Arc<dyn ContentLocationStore>,
    hashes: &[ContentHash],
) -> (GetBulkResult, GetBulkResult) {
    if hashes.is_empty() {
        let empty = |origin| GetBulkResult {
            origin,
            entries: Vec::new(),
        };
        return (empty(GetBulkOrigin::Local), empty(GetBulkOrigin::Global));
    }

    let local = stage(directory.as_ref(), hashes, LookupOrigin::Local, GetBulkOrigin::Local).await;
    let global_raw = stage(directory.as_ref(), hashes, LookupOrigin::Global, GetBulkOrigin::Global).await;
    let global = global_raw.subtract(&local);
    (local, global)
}

/// A single bulk call used by callers (e.g. the proactive-copy engine's
/// Nagle queue) that already know which tier they want.
pub async fn get_bulk_single_stage(
    directory: &dyn ContentLocationStore,
    hashes: &[ContentHash],
    origin: LookupOrigin,
) -> Result<GetBulkResult, DirectoryError> {
    let bulk_origin = match origin {
        LookupOrigin::Local => GetBulkOrigin::Local,
        LookupOrigin::Global => GetBulkOrigin::Global,
    };
    Ok(stage(directory, hashes, origin, bulk_origin).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use content_directory::memory::InMemoryDirectory;
    use content_types::{HashType, MachineId};

    fn h(byte: u8) -> ContentHash {
        ContentHash::new(HashType::Blake3, [byte; 32])
    }

    #[tokio::test]
    async fn empty_input_makes_no_call() {
        let dir: Arc<dyn ContentLocationStore> = Arc::new(InMemoryDirectory::new(MachineId(1)));
        let (local, global) = get_locations(&dir, &[]).await;
        assert_eq!(local.len(), 0);
        assert_eq!(global.len(), 0);
    }

    #[tokio::test]
    async fn global_stage_excludes_locations_already_seen_locally() {
        let dir = InMemoryDirectory::new(MachineId(1));
        let hash = h(1);
        dir.seed(hash, Some(vec![MachineId(2), MachineId(3)]), 10);
        let dir: Arc<dyn ContentLocationStore> = Arc::new(dir);

        // Local stage and global stage are served by the same fake here, so
        // subtraction against itself must yield no remaining locations.
        let (local, global) = get_locations(&dir, &[hash]).await;
        assert_eq!(local.locations_for(&hash).map(<[_]>::len), Some(2));
        assert_eq!(global.locations_for(&hash).map(<[_]>::len), Some(0));
    }

    #[tokio::test]
    async fn sentinel_hash_never_hits_directory() {
        let dir = InMemoryDirectory::new(MachineId(1));
        dir.fail_next_get_bulk();
        let dir: Arc<dyn ContentLocationStore> = Arc::new(dir);
        let (local, _global) = get_locations(&dir, &[ContentHash::EMPTY]).await;
        assert!(local.entries[0].1.is_some());
    }

    #[tokio::test]
    async fn directory_failure_produces_degraded_null_entries() {
        let dir = InMemoryDirectory::new(MachineId(1));
        dir.fail_next_get_bulk();
        let dir: Arc<dyn ContentLocationStore> = Arc::new(dir);
        let (local, _global) = get_locations(&dir, &[h(9)]).await;
        assert!(local.entries[0].1.is_none());
    }
}
