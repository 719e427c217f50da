// SPDX-License-Identifier: Apache-2.0
//! The "operation outlives its caller but not the store" primitive
//! (`spec.md` §5, §9 "Fire-and-forget scope").
//!
//! Fire-and-forget work (the fast-existence-pin continuation, async
//! copy-on-pin, proactive copy) must be bound to the **store's**
//! cancellation signal, never the session's own — that's the whole point
//! of this helper, and the design notes call it a mandatory correctness
//! condition for shutdown. The source's equivalent wraps this the same
//! way; the wrapper is preserved as a first-class primitive rather than
//! inlined at each call site.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Spawn `fut` bound to a **child** of `store_token`, so it observes
/// store-level cancellation but is never tied to a narrower (e.g.
/// session-level) token. Returns immediately; failures surface only to the
/// tracing/telemetry channel, per `spec.md` §7 propagation policy.
pub fn spawn_on_store<F>(store_token: &CancellationToken, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let child = store_token.child_token();
    tokio::spawn(async move {
        tokio::select! {
            () = child.cancelled() => {
                tracing::debug!("detached operation cancelled before completion");
            }
            () = fut => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn completes_normally_when_not_cancelled() {
        let store_token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = spawn_on_store(&store_token, async move {
            ran2.store(true, Ordering::SeqCst);
        });
        handle.await.unwrap_or(());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn session_teardown_does_not_cancel_detached_work() {
        let store_token = CancellationToken::new();
        let session_token = store_token.child_token();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let handle = spawn_on_store(&store_token, async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            ran2.store(true, Ordering::SeqCst);
        });

        // Dropping/cancelling the *session's* token must not affect work
        // spawned against the store's token.
        session_token.cancel();
        handle.await.unwrap_or(());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn store_cancellation_stops_detached_work() {
        let store_token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let handle = spawn_on_store(&store_token, async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            ran2.store(true, Ordering::SeqCst);
        });
        store_token.cancel();
        handle.await.unwrap_or(());
        assert!(!ran.load(Ordering::SeqCst));
    }
}
