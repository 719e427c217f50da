// SPDX-License-Identifier: Apache-2.0
//! The distributed content session: the client-facing object a build
//! worker uses to read, write, pin, and proactively replicate
//! content-addressed blobs across a fleet of peer caches backed by a
//! central content-location directory.
//!
//! `Session` composes nine cooperating engines (see the module list below)
//! atop three collaborator contracts it does not implement itself: a local
//! CAS ([`content_cas::LocalCas`]), a content-location directory
//! ([`content_directory::ContentLocationStore`]), and a copier
//! ([`content_copier::Copier`]).

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

pub mod detached;
mod gate;
mod handles;
pub mod lookup;
mod nagle;
mod pin_engine;
mod place_engine;
mod put_engine;
pub mod proactive;
pub mod ring;

pub use pin_engine::PinOptions;
pub use place_engine::PlaceRequest;
pub use proactive::{DeterministicRng, Rng, ThreadRng};
pub use ring::BuildId;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use content_cas::{CasError, ContentStream, LocalCas, PutHash};
use content_config::SessionConfig;
use content_copier::Copier;
use content_directory::ContentLocationStore;
use content_types::{ContentHash, ContentHashWithSize, ContentSize, RealizationMode, Urgency};
use gate::Gate;
use handles::EngineHandles;
use nagle::BatchQueue;
use ring::RingCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The session's lifecycle (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Started,
    Running,
    ShuttingDown,
    Disposed,
}

/// Whole-call failures. Per-hash operation outcomes never use this type —
/// they're reified as per-hash result enums so one bad hash never fails the
/// rest of a batch (`spec.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was not in `Running` state when the operation was
    /// invoked.
    #[error("session is not running")]
    NotRunning,
    /// The operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
    /// The engine rejected the request outright (e.g. a pin/place/put of
    /// the absent-file sentinel).
    #[error("policy violation: {0}")]
    PolicyViolation(&'static str),
    /// The local CAS returned an error that isn't representable as a
    /// per-hash result (e.g. `start`'s ring-registration put).
    #[error("local CAS error: {0}")]
    Cas(#[from] CasError),
    /// Under `inline_operations_for_tests`, every post-put proactive-copy
    /// target failed (`spec.md` §4.4 step 3).
    #[error("proactive copy failed on every target: {0}")]
    ProactiveCopyFailed(String),
}

/// The long-lived object owning the engines (`spec.md` §3).
pub struct Session {
    pub(crate) handles: EngineHandles,
    state: Mutex<SessionState>,
    /// Token representing the enclosing store's lifetime. Detached
    /// (fire-and-forget) work is bound to a child of this token, never to
    /// `session_token`, so it outlives `shutdown` but not store disposal
    /// (`spec.md` §5, §9).
    pub(crate) store_token: CancellationToken,
    /// Token representing this session's own lifetime; cancelled by
    /// `shutdown`.
    session_token: CancellationToken,
}

impl Session {
    /// Build a new session. The session owns its own store-scoped
    /// cancellation token (cancelled only by [`Session::shutdown`] of the
    /// *last* session sharing it would, in a single-session deployment, be
    /// process lifetime) — callers embedding multiple sessions in one store
    /// should use [`Session::new_with_store_token`] to share one token
    /// across them.
    pub fn new(
        cas: Arc<dyn LocalCas>,
        directory: Arc<dyn ContentLocationStore>,
        copier: Arc<dyn Copier>,
        config: SessionConfig,
    ) -> Self {
        Self::new_with_store_token(cas, directory, copier, config, CancellationToken::new())
    }

    /// As [`Session::new`], but binds detached work to a caller-supplied
    /// store token shared across multiple sessions in the same process.
    pub fn new_with_store_token(
        cas: Arc<dyn LocalCas>,
        directory: Arc<dyn ContentLocationStore>,
        copier: Arc<dyn Copier>,
        config: SessionConfig,
        store_token: CancellationToken,
    ) -> Self {
        let gate = Gate::new(config.max_concurrent_put_and_place_file_operations);
        let ring = Arc::new(RingCache::new(config.proactive_copy_in_ring_machine_locations_expiry_cache()));
        let threshold = config.proactive_copy_locations_threshold;
        let batch_size = config.proactive_copy_get_bulk_batch_size;
        let interval = config.proactive_copy_get_bulk_interval();
        let nagle_directory = directory.clone();
        let nagle = Arc::new(BatchQueue::new(batch_size, interval, move |hashes| {
            let directory = nagle_directory.clone();
            async move { proactive::escalate_batch(directory.as_ref(), threshold, hashes).await }
        }));
        let session_token = store_token.child_token();
        let handles = EngineHandles {
            cas,
            directory,
            copier,
            config,
            gate,
            in_flight: Arc::new(std::sync::Mutex::new(HashSet::new())),
            ring,
            nagle,
            build_id: None,
            rng: Arc::new(ThreadRng),
        };
        Self {
            handles,
            state: Mutex::new(SessionState::Created),
            store_token,
            session_token,
        }
    }

    /// Inject a deterministic RNG for proactive-copy target selection
    /// (`spec.md` §9 "Randomness").
    pub fn with_rng(mut self, rng: Arc<dyn Rng>) -> Self {
        self.handles.rng = rng;
        self
    }

    /// The session's tuning knobs.
    pub fn config(&self) -> &SessionConfig {
        &self.handles.config
    }

    /// The build id this session was started with, if any.
    pub fn build_id(&self) -> Option<BuildId> {
        self.handles.build_id
    }

    pub(crate) async fn require_running(&self) -> Result<(), SessionError> {
        if *self.state.lock().await == SessionState::Running {
            Ok(())
        } else {
            Err(SessionError::NotRunning)
        }
    }

    /// Transition `Created → Started → Running`, registering the build-id
    /// ring blob if `build_id` is given (`spec.md` §4.6).
    pub async fn start(mut self, build_id: Option<BuildId>) -> Result<Self, SessionError> {
        {
            let mut state = self.state.lock().await;
            if *state != SessionState::Created {
                return Err(SessionError::PolicyViolation("session already started"));
            }
            *state = SessionState::Started;
        }
        self.handles.build_id = build_id;
        if let Some(build_id) = build_id {
            let hash = build_id.synthetic_hash();
            match self
                .handles
                .cas
                .put_file(PutHash::Explicit(hash), Path::new(""), RealizationMode::Any, Urgency::Normal)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    // The ring blob has no real bytes; a local CAS that
                    // insists on reading a path is free to reject this and
                    // the session still proceeds, relying solely on
                    // directory registration for ring membership.
                    tracing::debug!(error = %err, "ring blob put skipped");
                }
            }
            self.handles
                .directory
                .register_local_location(
                    &[ContentHashWithSize {
                        hash,
                        size: ContentSize::Known(0),
                    }],
                    Urgency::Normal,
                )
                .await
                .map_err(|err| {
                    tracing::warn!(error = %err, "failed to register build ring membership");
                    SessionError::PolicyViolation("ring registration failed")
                })?;
        }
        *self.state.lock().await = SessionState::Running;
        Ok(self)
    }

    /// Transition `Running → ShuttingDown → Disposed`, cancelling this
    /// session's own token (detached work survives — it is bound to the
    /// store token, not this one).
    pub async fn shutdown(self) -> Result<(), SessionError> {
        *self.state.lock().await = SessionState::ShuttingDown;
        if let Some(build_id) = self.handles.build_id {
            // Best-effort: the directory trims the entry on its own even if
            // this delete is lost.
            if let Err(err) = self.handles.cas.delete(build_id.synthetic_hash()).await {
                tracing::warn!(error = %err, "failed to delete build ring blob on shutdown");
            }
        }
        self.session_token.cancel();
        Ok(())
    }

    /// Open a stream over `hash`'s bytes, or `None` if evicted.
    pub async fn open_stream(&self, hash: ContentHash) -> Result<Option<ContentStream>, SessionError> {
        self.require_running().await?;
        Ok(self.handles.cas.open_stream(hash).await?)
    }

    /// List pinned hashes, delegated to the local CAS if it supports
    /// hibernation.
    pub async fn enumerate_pinned_content_hashes(&self) -> Result<Vec<ContentHash>, SessionError> {
        self.require_running().await?;
        Ok(self.handles.cas.enumerate_pinned_content_hashes().await?)
    }

    /// Evict everything not pinned, delegated to the local CAS if it
    /// supports hibernation.
    pub async fn shutdown_eviction(&self) -> Result<(), SessionError> {
        self.require_running().await?;
        Ok(self.handles.cas.shutdown_eviction().await?)
    }

    /// Current put/place gate occupancy, exposed for telemetry.
    pub fn gate_occupancy(&self) -> usize {
        self.handles.gate.occupancy()
    }
}
