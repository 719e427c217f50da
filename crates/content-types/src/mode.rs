// SPDX-License-Identifier: Apache-2.0
//! Closed-set tags the session threads through to the local CAS without
//! inspecting further.

use serde::{Deserialize, Serialize};

/// How urgently an operation should be treated by the directory (priority
/// hint, or a request to skip registration entirely).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    /// Ordinary priority.
    Low,
    /// Default priority for most operations.
    Normal,
    /// Force eager directory registration even if urgency would otherwise
    /// defer it (used by put when `register_eagerly_on_put` is set and the
    /// content was new).
    RegisterEagerly,
    /// Caller's hint that directory registration may be skipped for this
    /// operation.
    SkipRegisterContent,
}

impl Default for Urgency {
    fn default() -> Self {
        Self::Normal
    }
}

/// How a placed/put file should be realized on disk (hardlink, copy, etc).
/// Opaque to the session; passed through to the local CAS contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealizationMode {
    /// Let the local CAS pick its preferred realization.
    Any,
    /// Require a copy (never a hardlink/symlink).
    Copy,
    /// Require a hardlink where supported.
    Hardlink,
}

/// Access mode requested for a placed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// File may be opened read-only.
    ReadOnly,
    /// File must be writable after placement.
    Write,
}

/// What to do if the destination path of a place already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementMode {
    /// Fail if the destination exists.
    FailIfExists,
    /// Replace the existing destination.
    ReplaceExisting,
    /// Skip (treat as success) if the destination already exists.
    SkipIfExists,
}
