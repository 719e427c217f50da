// SPDX-License-Identifier: Apache-2.0
//! Bounded concurrency gate shared by put-file and place-file paths
//! (`spec.md` §5 shared-resource policy).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore sized to `max_concurrent_put_and_place_file_operations`.
/// Covers every put-file and place-file path; put-stream is deliberately
/// ungated (small-count assumption, `spec.md` §4.4).
#[derive(Clone)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// Held permit plus the time spent waiting for it, reported out-of-band for
/// telemetry (`spec.md` §4.3/§5).
pub struct GateGuard {
    _permit: Option<OwnedSemaphorePermit>,
    /// Time spent waiting to acquire the permit.
    pub wait: Duration,
}

impl Gate {
    /// Create a gate with `size` permits (at least 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Acquire a permit, recording how long the caller waited.
    pub async fn acquire(&self) -> GateGuard {
        let started = Instant::now();
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_closed) => {
                // The gate's semaphore is never closed by this crate; this
                // path degrades to "unthrottled" rather than panicking.
                tracing::error!("put/place gate semaphore unexpectedly closed");
                None
            }
        };
        GateGuard {
            _permit: permit,
            wait: started.elapsed(),
        }
    }

    /// Number of permits currently checked out.
    pub fn occupancy(&self) -> usize {
        self.size.saturating_sub(self.semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupancy_reflects_held_permits() {
        let gate = Gate::new(2);
        let g1 = gate.acquire().await;
        assert_eq!(gate.occupancy(), 1);
        let g2 = gate.acquire().await;
        assert_eq!(gate.occupancy(), 2);
        drop(g1);
        assert_eq!(gate.occupancy(), 1);
        drop(g2);
        assert_eq!(gate.occupancy(), 0);
    }

    #[tokio::test]
    async fn zero_size_gate_still_grants_one_permit() {
        let gate = Gate::new(0);
        let _guard = gate.acquire().await;
        assert_eq!(gate.occupancy(), 1);
    }
}
