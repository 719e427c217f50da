// SPDX-License-Identifier: Apache-2.0
//! The cheaply-`Clone`-able bundle of collaborator handles every engine
//! operates on.
//!
//! `Session` itself owns the lifecycle state machine and the two
//! cancellation tokens; the actual pin/place/put/proactive algorithms are
//! implemented as inherent methods on [`EngineHandles`] so that a detached
//! (fire-and-forget) continuation can clone this bundle and keep working
//! after the originating call returns, without needing an `Arc<Session>`.

use std::collections::HashSet;
use std::sync::Arc;

use content_cas::LocalCas;
use content_config::SessionConfig;
use content_copier::Copier;
use content_directory::ContentLocationStore;
use content_types::ContentHash;

use crate::gate::Gate;
use crate::nagle::BatchQueue;
use crate::proactive::Rng;
use crate::ring::{BuildId, RingCache};

#[derive(Clone)]
pub(crate) struct EngineHandles {
    pub(crate) cas: Arc<dyn LocalCas>,
    pub(crate) directory: Arc<dyn ContentLocationStore>,
    pub(crate) copier: Arc<dyn Copier>,
    pub(crate) config: SessionConfig,
    pub(crate) gate: Gate,
    pub(crate) in_flight: Arc<std::sync::Mutex<HashSet<ContentHash>>>,
    pub(crate) ring: Arc<RingCache>,
    pub(crate) nagle: Arc<BatchQueue>,
    pub(crate) build_id: Option<BuildId>,
    pub(crate) rng: Arc<dyn Rng>,
}

impl EngineHandles {
    /// Whether a copy-and-put of `size` bytes may use a trusted put (skip
    /// re-hashing), per `spec.md` §4.3 copy-and-put detail: both the local
    /// CAS must support it and the size must stay under the configured
    /// threshold; an unknown size is treated as over threshold.
    pub(crate) fn trusted_put(&self, size: content_types::ContentSize) -> bool {
        self.cas.capabilities().trusted_put_supported
            && matches!(size, content_types::ContentSize::Known(n) if n < self.config.trusted_put_size_threshold)
    }
}

/// [`content_copier::LandedHandler`] that finishes a copy-and-put by handing
/// the landed bytes to the local CAS. Shared by the pin and place engines'
/// copy-and-put procedures (`spec.md` §4.2 step 3, §4.3 step 2).
///
/// Constructed fresh per copy attempt with the hash the candidate claimed to
/// hold: a trusted put takes that claim at face value, an untrusted one
/// re-hashes and rejects a landed blob that doesn't match, so
/// [`content_copier::Copier::try_copy_and_put`] advances to the next
/// candidate instead of silently storing mislabeled bytes.
pub(crate) struct CasLandedHandler {
    pub(crate) cas: Arc<dyn LocalCas>,
    pub(crate) expected_hash: ContentHash,
    pub(crate) trusted: bool,
}

impl content_copier::LandedHandler for CasLandedHandler {
    fn put<'a>(
        &'a self,
        path: &'a std::path::Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<content_types::PutResult, String>> + Send + 'a>> {
        Box::pin(async move {
            let put_hash = if self.trusted {
                content_cas::PutHash::Explicit(self.expected_hash)
            } else {
                content_cas::PutHash::ReHash(content_types::HashType::Blake3)
            };
            let result = self
                .cas
                .put_file(put_hash, path, content_types::RealizationMode::Copy, content_types::Urgency::Normal)
                .await
                .map_err(|err| err.to_string())?;
            if result.hash != self.expected_hash {
                return Err(format!("landed hash {} did not match expected {}", result.hash, self.expected_hash));
            }
            Ok(result)
        })
    }
}
