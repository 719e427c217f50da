// SPDX-License-Identifier: Apache-2.0
//! The session's closed enumeration of tuning knobs (`spec.md` §6).

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which side(s) of a proactive copy are attempted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProactiveCopyMode: u8 {
        /// No proactive copy is attempted.
        const DISABLED = 0;
        /// Push to a machine already in the build ring.
        const INSIDE_RING = 0b01;
        /// Push to a machine outside the build ring.
        const OUTSIDE_RING = 0b10;
        /// Both sides are attempted.
        const BOTH = Self::INSIDE_RING.bits() | Self::OUTSIDE_RING.bits();
    }
}

impl Default for ProactiveCopyMode {
    fn default() -> Self {
        ProactiveCopyMode::BOTH
    }
}

/// Tunables for the pin engine (`pin_configuration.*` in `spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfiguration {
    /// Replica count sufficient to call a pin successful without a
    /// synchronous copy.
    pub pin_min_unverified_count: u32,
    /// Extra replica headroom above `pin_min_unverified_count` above which
    /// no async top-up copy is scheduled.
    pub async_copy_on_pin_threshold: u32,
    /// When set, pin never falls back to the global directory tier — only
    /// local registrations are consulted.
    pub use_local_locations_only_on_unverified_pin: bool,
    /// Per-call parallelism for the remote-pin dispatch loop.
    pub max_io_operations: usize,
}

impl Default for PinConfiguration {
    fn default() -> Self {
        Self {
            pin_min_unverified_count: 1,
            async_copy_on_pin_threshold: 2,
            use_local_locations_only_on_unverified_pin: false,
            max_io_operations: 1,
        }
    }
}

/// Compression algorithm hint passed through to the copier's transport.
/// The session never inspects bytes to decide this; it's a declared
/// policy the copier is told to honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// gzip.
    Gzip,
    /// zstd.
    Zstd,
}

/// All tuning knobs the session recognizes (`spec.md` §6). Every field has
/// a default so a caller can start from `SessionConfig::default()` and
/// override only what it cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Size of the put/place concurrency gate.
    pub max_concurrent_put_and_place_file_operations: usize,
    /// Pin-engine tunables.
    pub pin_configuration: PinConfiguration,
    /// Which side(s) of a proactive copy are attempted.
    pub proactive_copy_mode: ProactiveCopyMode,
    /// Fire a proactive copy after a successful pin.
    pub proactive_copy_on_pin: bool,
    /// Fire a proactive copy after a successful put.
    pub proactive_copy_on_put: bool,
    /// Skip proactive copy once a hash already has at least this many
    /// known replicas.
    pub proactive_copy_locations_threshold: u32,
    /// Per-side retry budget for a proactive-copy attempt.
    pub proactive_copy_max_retries: u32,
    /// Prefer the directory's designated locations over a random pick.
    pub proactive_copy_use_preferred_locations: bool,
    /// Nagle batch size for proactive-copy bulk lookups.
    pub proactive_copy_get_bulk_batch_size: usize,
    /// Nagle batch interval, in milliseconds, for proactive-copy bulk
    /// lookups.
    pub proactive_copy_get_bulk_interval_millis: u64,
    /// Ring-membership snapshot TTL, in milliseconds.
    pub proactive_copy_in_ring_machine_locations_expiry_cache_millis: u64,
    /// Push bytes to the target rather than asking it to pull.
    pub push_proactive_copies: bool,
    /// Register at higher urgency immediately after a put that produced
    /// new content (rather than waiting for the normal registration
    /// cadence).
    pub register_eagerly_on_put: bool,
    /// Honor a caller's request to skip directory registration.
    pub respect_skip_register_hint: bool,
    /// Await normally-detached operations inline. Test-only; production
    /// callers should leave this `false`.
    pub inline_operations_for_tests: bool,
    /// Apply compression above this many bytes.
    pub grpc_copy_compression_size_threshold: u64,
    /// Compression algorithm hint.
    pub grpc_copy_compression_algorithm: CompressionAlgorithm,
    /// Below this many bytes, a copy-and-put may use a trusted put (skip
    /// re-hashing) when the local CAS supports it; at or above it, the
    /// engine always re-hashes regardless of capability (`spec.md` §4.3
    /// copy-and-put detail).
    pub trusted_put_size_threshold: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_put_and_place_file_operations: 8,
            pin_configuration: PinConfiguration::default(),
            proactive_copy_mode: ProactiveCopyMode::default(),
            proactive_copy_on_pin: true,
            proactive_copy_on_put: true,
            proactive_copy_locations_threshold: 3,
            proactive_copy_max_retries: 2,
            proactive_copy_use_preferred_locations: true,
            proactive_copy_get_bulk_batch_size: 32,
            proactive_copy_get_bulk_interval_millis: 50,
            proactive_copy_in_ring_machine_locations_expiry_cache_millis: 30_000,
            push_proactive_copies: true,
            register_eagerly_on_put: false,
            respect_skip_register_hint: true,
            inline_operations_for_tests: false,
            grpc_copy_compression_size_threshold: 64 * 1024,
            grpc_copy_compression_algorithm: CompressionAlgorithm::Gzip,
            trusted_put_size_threshold: 8 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// [`Self::proactive_copy_get_bulk_interval_millis`] as a [`Duration`].
    pub fn proactive_copy_get_bulk_interval(&self) -> Duration {
        Duration::from_millis(self.proactive_copy_get_bulk_interval_millis)
    }

    /// [`Self::proactive_copy_in_ring_machine_locations_expiry_cache_millis`]
    /// as a [`Duration`].
    pub fn proactive_copy_in_ring_machine_locations_expiry_cache(&self) -> Duration {
        Duration::from_millis(self.proactive_copy_in_ring_machine_locations_expiry_cache_millis)
    }
}
