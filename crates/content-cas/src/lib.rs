// SPDX-License-Identifier: Apache-2.0
//! Local CAS adapter contract consumed by the distributed content session.
//!
//! This crate does not implement a real on-disk CAS (that is explicitly out
//! of scope — see `spec.md` §1) — it defines the [`LocalCas`] trait the
//! session programs against, plus an [`InMemoryCas`](memory::InMemoryCas)
//! test double used by `content-session`'s own test suite.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]

pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use content_types::{
    AccessMode, ContentHash, HashType, PlaceResult, PutResult, RealizationMode, ReplacementMode,
    Urgency,
};

/// A readable handle on a blob's bytes, as returned by [`LocalCas::open_stream`].
pub type ContentStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Either a caller-asserted hash (trusted put) or a request that the local
/// CAS compute the hash itself (untrusted put).
#[derive(Debug, Clone, Copy)]
pub enum PutHash {
    /// Caller asserts this is the content's hash; the CAS may verify it.
    Explicit(ContentHash),
    /// Caller does not know the hash; the CAS must compute one of this type.
    ReHash(HashType),
}

/// Capability flags the session queries explicitly instead of performing
/// the source's dynamic type checks (`spec.md` §9 design note).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CasCapabilities {
    /// The CAS can accept a caller-asserted hash/size without re-hashing.
    pub trusted_put_supported: bool,
    /// The CAS can enumerate pinned hashes and evict on shutdown.
    pub hibernation_supported: bool,
}

/// Errors surfaced by the local CAS contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CasError {
    /// Bytes did not match the asserted hash.
    #[error("[CAS_HASH_MISMATCH] expected {expected}, computed {computed}")]
    HashMismatch {
        /// The hash that was declared/expected.
        expected: ContentHash,
        /// The hash actually computed from the bytes.
        computed: ContentHash,
    },
    /// The requested hash is not present locally.
    #[error("content not found in local CAS")]
    NotFound,
    /// The underlying storage rejected the operation (disk full, permission,
    /// corruption).
    #[error("put rejected: {0}")]
    Rejected(String),
    /// I/O failure reading/writing local storage.
    #[error("io error: {0}")]
    Io(String),
    /// The operation requires a capability this CAS does not have.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Thin contract the session consumes for Put/Place/OpenStream/Pin of
/// single blobs on the current machine.
///
/// Implementations own hashing, deduplication, on-disk layout, and eviction
/// — all out of scope here (`spec.md` §1).
#[async_trait]
pub trait LocalCas: Send + Sync {
    /// Ingest the file at `path`. `hash` is either asserted (trusted put, if
    /// [`CasCapabilities::trusted_put_supported`]) or computed (re-hash).
    async fn put_file(
        &self,
        hash: PutHash,
        path: &Path,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Result<PutResult, CasError>;

    /// Ingest bytes from `stream`. Same hash semantics as [`put_file`](Self::put_file).
    async fn put_stream(
        &self,
        hash: PutHash,
        stream: ContentStream,
        urgency: Urgency,
    ) -> Result<PutResult, CasError>;

    /// Materialize `hash`'s bytes at `path`.
    async fn place_file(
        &self,
        hash: ContentHash,
        path: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Result<PlaceResult, CasError>;

    /// Pin `hash` locally, asserting it is present (or already is).
    async fn pin(&self, hash: ContentHash, urgency: Urgency) -> Result<PutResult, CasError>;

    /// Open a readable stream over `hash`'s bytes, or `None` if the blob was
    /// evicted (not an error — see [`content_types::ContentHash::is_sentinel`]
    /// and `spec.md` §4.5 push semantics).
    async fn open_stream(&self, hash: ContentHash) -> Result<Option<ContentStream>, CasError>;

    /// Remove `hash`'s bytes from local storage, if present. Used by
    /// `spec.md` §4.6 session shutdown to delete the build-id ring blob; a
    /// missing hash is not an error.
    async fn delete(&self, hash: ContentHash) -> Result<(), CasError>;

    /// Capability flags this implementation supports.
    fn capabilities(&self) -> CasCapabilities;

    /// Preferred scratch directory for staging copies, if any.
    fn working_directory_hint(&self) -> Option<&Path> {
        None
    }

    /// List pinned hashes, if [`CasCapabilities::hibernation_supported`].
    async fn enumerate_pinned_content_hashes(&self) -> Result<Vec<ContentHash>, CasError> {
        Err(CasError::Unsupported("hibernation not supported"))
    }

    /// Evict everything not pinned, if [`CasCapabilities::hibernation_supported`].
    async fn shutdown_eviction(&self) -> Result<(), CasError> {
        Err(CasError::Unsupported("hibernation not supported"))
    }
}
