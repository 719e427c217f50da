// SPDX-License-Identifier: Apache-2.0
//! Shared data model for the distributed content session.
//!
//! Every other crate in this workspace (`content-cas`, `content-directory`,
//! `content-copier`, `content-session`) depends on this one and nothing
//! upward. Types here are intentionally inert: no I/O, no async, just the
//! identifiers and results the session's engines pass between each other.
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

mod hash;
mod location;
mod mode;
mod results;

pub use hash::{ContentHash, HashType, ShortHash, SHORT_HASH_LEN};
pub use location::{MachineId, MachineLocation};
pub use mode::{AccessMode, RealizationMode, ReplacementMode, Urgency};
pub use results::{
    ContentHashWithSize, ContentLocationEntry, ContentSize, GetBulkOrigin, GetBulkResult,
    InRingStatus, PinResult, PlaceOutcome, PlaceResult, PlaceSource, ProactiveCopyResult,
    ProactiveCopyStatus, PushResult, PutResult, ReplicationAttributes,
};
