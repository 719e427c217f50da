// SPDX-License-Identifier: Apache-2.0
//! Content-location directory contract consumed by the distributed content
//! session.
//!
//! This crate does not implement a durable, replicated directory service
//! (explicitly out of scope, `spec.md` §1) — it defines the
//! [`ContentLocationStore`] trait the session programs against, plus an
//! [`InMemoryDirectory`](memory::InMemoryDirectory) scriptable fake for
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

use async_trait::async_trait;
use content_types::{ContentHash, ContentHashWithSize, GetBulkResult, MachineId, MachineLocation, Urgency};

/// Tier a bulk lookup should be served from. `spec.md` §1 names this
/// `GetBulk(hashes, origin∈{Local,Global})` — request-side, a closed choice
/// of two; the response additionally distinguishes `ColdStorage`
/// (`content_types::GetBulkOrigin`) as a provenance the *global* tier may
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    /// Serve from the session's own local-cache registrations.
    Local,
    /// Serve from the global directory.
    Global,
}

/// Errors surfaced by the directory contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The bulk lookup or registration call failed (network, timeout,
    /// service error — the directory's transport owns the detail).
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Contract the session consumes for locating and registering replicas.
///
/// `spec.md` §6 names six primitives; this trait adds
/// [`self_machine_id`](Self::self_machine_id) and
/// [`resolve_location`](Self::resolve_location) as necessary adjuncts — the
/// spec's six calls are enough to decide *that* a machine should receive a
/// copy, but resolving a build-ring `MachineId` (learned only as an id list
/// from the build-id hash's locations) to a dialable `MachineLocation`
/// needs one more primitive than the spec enumerates. See `DESIGN.md`.
#[async_trait]
pub trait ContentLocationStore: Send + Sync {
    /// Bulk lookup of `hashes`' location records from `origin`.
    async fn get_bulk(
        &self,
        hashes: &[ContentHash],
        origin: LookupOrigin,
    ) -> Result<GetBulkResult, DirectoryError>;

    /// Advertise that the current machine now holds `entries`.
    async fn register_local_location(
        &self,
        entries: &[ContentHashWithSize],
        urgency: Urgency,
    ) -> Result<(), DirectoryError>;

    /// Pick a uniformly random active machine, excluding `except`, or
    /// `None` if no eligible machine exists.
    async fn get_random_machine_location(&self, except: &[MachineId]) -> Option<MachineLocation>;

    /// Designated (preferred) replica targets for `hash`, or `None` if the
    /// directory has no preference data for it.
    async fn get_designated_locations(&self, hash: ContentHash) -> Option<Vec<MachineLocation>>;

    /// `true` if `machine` is currently considered active.
    async fn is_machine_active(&self, machine: MachineId) -> bool;

    /// The elected leader machine, if any.
    async fn master(&self) -> Option<MachineLocation>;

    /// This session's own machine id, as assigned by the directory.
    fn self_machine_id(&self) -> MachineId;

    /// Resolve a machine id learned from a location list (e.g. build-ring
    /// membership) to a dialable location.
    async fn resolve_location(&self, machine: MachineId) -> Option<MachineLocation>;
}
