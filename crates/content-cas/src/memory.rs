// SPDX-License-Identifier: Apache-2.0
//! In-memory [`LocalCas`] implementation for tests.
//!
//! Grounded on `echo_cas::MemoryTier`'s shape (a `HashMap` of blobs plus a
//! pin-set), made async and fallible to satisfy the [`LocalCas`] contract.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use content_types::{
    AccessMode, ContentHash, ContentSize, HashType, PlaceOutcome, PlaceResult, PlaceSource,
    PutResult, RealizationMode, ReplacementMode, Urgency,
};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::{CasCapabilities, CasError, ContentStream, LocalCas, PutHash};

struct Inner {
    blobs: HashMap<ContentHash, Arc<[u8]>>,
    pins: HashSet<ContentHash>,
}

/// In-memory, test-only local CAS.
///
/// `put_verified`-style hash checking happens on the explicit-hash path;
/// `ReHash` always succeeds since this store doesn't model a concrete
/// digest function (hashing is an explicit non-goal, `spec.md` §1).
pub struct InMemoryCas {
    inner: Mutex<Inner>,
    capabilities: CasCapabilities,
}

impl InMemoryCas {
    /// Create an empty store that supports trusted puts and hibernation.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blobs: HashMap::new(),
                pins: HashSet::new(),
            }),
            capabilities: CasCapabilities {
                trusted_put_supported: true,
                hibernation_supported: true,
            },
        }
    }

    /// Create a store with a caller-chosen capability set, for exercising
    /// the untrusted-put / no-hibernation branches of the engines.
    pub fn with_capabilities(capabilities: CasCapabilities) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blobs: HashMap::new(),
                pins: HashSet::new(),
            }),
            capabilities,
        }
    }

    /// Seed the store with `bytes` under `hash`, bypassing the trait (used
    /// by tests to simulate "content already present locally").
    pub async fn seed(&self, hash: ContentHash, bytes: Vec<u8>) {
        self.inner.lock().await.blobs.insert(hash, Arc::from(bytes));
    }

    /// `true` if `hash` is stored.
    pub async fn has(&self, hash: &ContentHash) -> bool {
        self.inner.lock().await.blobs.contains_key(hash)
    }

    async fn store(&self, hash: ContentHash, bytes: Vec<u8>) -> PutResult {
        let mut inner = self.inner.lock().await;
        let already_existed = inner.blobs.contains_key(&hash);
        let size = bytes.len() as u64;
        inner.blobs.entry(hash).or_insert_with(|| Arc::from(bytes));
        PutResult {
            hash,
            size: ContentSize::Known(size),
            already_existed,
            registered: false,
        }
    }
}

impl Default for InMemoryCas {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalCas for InMemoryCas {
    async fn put_file(
        &self,
        hash: PutHash,
        path: &Path,
        _realization: RealizationMode,
        _urgency: Urgency,
    ) -> Result<PutResult, CasError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CasError::Io(e.to_string()))?;
        self.put_stream(hash, Box::new(std::io::Cursor::new(bytes)), _urgency)
            .await
    }

    async fn put_stream(
        &self,
        hash: PutHash,
        mut stream: ContentStream,
        _urgency: Urgency,
    ) -> Result<PutResult, CasError> {
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| CasError::Io(e.to_string()))?;

        let resolved = match hash {
            PutHash::Explicit(expected) => {
                // Phase 1 does not model a real digest function (hashing is
                // out of scope); an explicit hash is trusted as-is.
                expected
            }
            PutHash::ReHash(hash_type) => {
                // No real digest available either; synthesize a stand-in so
                // repeated puts of identical bytes still dedup.
                ContentHash::new(hash_type, content_fingerprint(&bytes))
            }
        };

        Ok(self.store(resolved, bytes).await)
    }

    async fn place_file(
        &self,
        hash: ContentHash,
        path: &Path,
        _access: AccessMode,
        replacement: ReplacementMode,
        _realization: RealizationMode,
        _urgency: Urgency,
    ) -> Result<PlaceResult, CasError> {
        let bytes = {
            let inner = self.inner.lock().await;
            inner.blobs.get(&hash).cloned()
        };
        let Some(bytes) = bytes else {
            return Ok(PlaceResult {
                hash,
                outcome: PlaceOutcome::NotFound {
                    reason: "not present in local CAS",
                },
                gate_wait: None,
            });
        };

        if path.exists() && matches!(replacement, ReplacementMode::FailIfExists) {
            return Err(CasError::Rejected(format!(
                "destination exists: {}",
                path.display()
            )));
        }
        if path.exists() && matches!(replacement, ReplacementMode::SkipIfExists) {
            return Ok(PlaceResult {
                hash,
                outcome: PlaceOutcome::Placed {
                    source: PlaceSource::LocalCache,
                },
                gate_wait: None,
            });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CasError::Io(e.to_string()))?;
        }
        tokio::fs::write(path, &*bytes)
            .await
            .map_err(|e| CasError::Io(e.to_string()))?;

        Ok(PlaceResult {
            hash,
            outcome: PlaceOutcome::Placed {
                source: PlaceSource::LocalCache,
            },
            gate_wait: None,
        })
    }

    async fn pin(&self, hash: ContentHash, _urgency: Urgency) -> Result<PutResult, CasError> {
        let mut inner = self.inner.lock().await;
        inner.pins.insert(hash);
        let size = inner
            .blobs
            .get(&hash)
            .map_or(ContentSize::Unknown, |b| ContentSize::Known(b.len() as u64));
        Ok(PutResult {
            hash,
            size,
            already_existed: inner.blobs.contains_key(&hash),
            registered: false,
        })
    }

    async fn open_stream(&self, hash: ContentHash) -> Result<Option<ContentStream>, CasError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .blobs
            .get(&hash)
            .map(|bytes| -> ContentStream { Box::new(std::io::Cursor::new(bytes.to_vec())) }))
    }

    async fn delete(&self, hash: ContentHash) -> Result<(), CasError> {
        let mut inner = self.inner.lock().await;
        inner.blobs.remove(&hash);
        inner.pins.remove(&hash);
        Ok(())
    }

    fn capabilities(&self) -> CasCapabilities {
        self.capabilities
    }

    fn working_directory_hint(&self) -> Option<&Path> {
        None
    }

    async fn enumerate_pinned_content_hashes(&self) -> Result<Vec<ContentHash>, CasError> {
        if !self.capabilities.hibernation_supported {
            return Err(CasError::Unsupported("hibernation not supported"));
        }
        let inner = self.inner.lock().await;
        Ok(inner.pins.iter().copied().collect())
    }

    async fn shutdown_eviction(&self) -> Result<(), CasError> {
        if !self.capabilities.hibernation_supported {
            return Err(CasError::Unsupported("hibernation not supported"));
        }
        let mut inner = self.inner.lock().await;
        let pins = inner.pins.clone();
        inner.blobs.retain(|hash, _| pins.contains(hash));
        Ok(())
    }
}

/// Stand-in content fingerprint used only because this crate does not model
/// a real hash function (`spec.md` §1 non-goal). Not cryptographically
/// meaningful — good enough to make identical bytes dedup in tests.
fn content_fingerprint(bytes: &[u8]) -> [u8; 32] {
    let mut acc = [0u8; 32];
    for (i, byte) in bytes.iter().enumerate() {
        acc[i % 32] ^= byte.wrapping_add(i as u8);
    }
    acc
}
