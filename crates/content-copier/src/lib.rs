// SPDX-License-Identifier: Apache-2.0
//! Copier contract consumed by the distributed content session.
//!
//! Transport-level framing (compression algorithm, push/pull RPC encoding)
//! is explicitly out of scope (`spec.md` §1) — this crate defines the
//! [`Copier`] trait the session's place/pin/proactive-copy engines program
//! against, plus a [`ScriptedCopier`](memory::ScriptedCopier) fake for
//! tests.

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

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use content_cas::ContentStream;
use content_types::{ContentSize, MachineLocation, PushResult};
pub use content_types::ContentHash;

/// Errors surfaced by the copier contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CopyError {
    /// Every candidate source was tried and none produced a hash-matching
    /// copy.
    #[error("copy exhausted {attempted} candidate(s): {last_error}")]
    ExhaustedCandidates {
        /// Number of candidates attempted.
        attempted: usize,
        /// The last candidate's error, rendered.
        last_error: String,
    },
    /// No candidate sources were supplied.
    #[error("no candidate sources supplied")]
    NoCandidates,
}

/// A request to copy `hash` from one of `candidates` into `landing_path`.
pub struct CopyRequest<'a> {
    /// The hash to copy.
    pub hash: ContentHash,
    /// The blob's length, if known.
    pub size: ContentSize,
    /// Candidate source machines, tried in order until one succeeds.
    pub candidates: &'a [MachineLocation],
    /// Local path the bytes should land at before the put handler runs.
    pub landing_path: &'a Path,
    /// `true` if the final put may trust the declared hash/size rather than
    /// re-hash (`spec.md` §4.3 copy-and-put detail).
    pub trusted_put: bool,
    /// Compression is applied above this many bytes — a hint passed through
    /// to the transport, not interpreted here.
    pub compression_size_threshold: Option<u64>,
}

/// Caller-supplied hook invoked once bytes have landed at `landing_path`, to
/// perform the final put into the local CAS. `try_copy_and_put` calls this
/// once per candidate that lands successfully; if the put fails because the
/// landed bytes don't match `hash`, the copier advances to the next
/// candidate (`spec.md` §4.3).
pub trait LandedHandler: Send + Sync {
    /// Put the bytes now present at `path` into the local CAS.
    fn put<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<content_types::PutResult, String>> + Send + 'a>>;
}

/// Contract that moves bytes between machines on the session's behalf.
///
/// Implementations own transport framing, compression, and RPC encoding —
/// all out of scope here (`spec.md` §1).
#[async_trait]
pub trait Copier: Send + Sync {
    /// Try each of `request.candidates` in order until one produces a
    /// hash-matching copy that `handler` accepts.
    async fn try_copy_and_put(
        &self,
        request: CopyRequest<'_>,
        handler: &dyn LandedHandler,
    ) -> Result<content_types::PutResult, CopyError>;

    /// Push `hash`'s bytes (read from `stream`) to `target`.
    async fn push_file(
        &self,
        hash: ContentHash,
        target: &MachineLocation,
        stream: ContentStream,
    ) -> PushResult;

    /// Ask `target` to pull `hash` from this machine rather than receiving a
    /// push.
    async fn request_copy_file(
        &self,
        hash: ContentHash,
        target: &MachineLocation,
    ) -> Result<(), CopyError>;
}
