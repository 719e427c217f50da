// SPDX-License-Identifier: Apache-2.0
//! Batched lookup queue feeding the proactive-copy engine (`spec.md` §4.5,
//! §9 "Batched lookup as a cooperative operator").
//!
//! A single-consumer bounded batcher: items flush after either `batch_size`
//! accumulate or `interval` elapses since the first item of the current
//! batch, whichever comes first. The consumer never runs more than one
//! lookup at a time (degree-of-parallelism 1, `spec.md` §5), and flushes
//! any partial batch when the producer side is dropped (shutdown).

use std::future::Future;
use std::time::Duration;

use content_types::{ContentHash, ContentLocationEntry};
use tokio::sync::{mpsc, oneshot};

struct QueueItem {
    hash: ContentHash,
    reply: oneshot::Sender<Option<ContentLocationEntry>>,
}

/// Handle used to enqueue per-hash lookups; the batching consumer runs on
/// its own spawned task for the handle's lifetime.
pub struct BatchQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
}

impl BatchQueue {
    /// Spawn the consumer loop. `lookup` performs one bulk call over a
    /// batch of hashes and must return entries in the same order.
    pub fn new<F, Fut>(batch_size: usize, interval: Duration, lookup: F) -> Self
    where
        F: Fn(Vec<ContentHash>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Option<ContentLocationEntry>>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(receiver, batch_size.max(1), interval, lookup));
        Self { sender }
    }

    /// Enqueue `hash` and await this batch's answer for it.
    pub async fn lookup(&self, hash: ContentHash) -> Option<ContentLocationEntry> {
        let (reply, reply_rx) = oneshot::channel();
        if self.sender.send(QueueItem { hash, reply }).is_err() {
            tracing::warn!("batch queue consumer is gone, treating lookup as a miss");
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }
}

async fn run<F, Fut>(
    mut receiver: mpsc::UnboundedReceiver<QueueItem>,
    batch_size: usize,
    interval: Duration,
    lookup: F,
) where
    F: Fn(Vec<ContentHash>) -> Fut,
    Fut: Future<Output = Vec<Option<ContentLocationEntry>>>,
{
    loop {
        let mut pending = Vec::new();
        match receiver.recv().await {
            Some(item) => pending.push(item),
            None => return,
        }

        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);
        loop {
            if pending.len() >= batch_size {
                break;
            }
            tokio::select! {
                biased;
                item = receiver.recv() => {
                    match item {
                        Some(item) => pending.push(item),
                        None => break,
                    }
                }
                () = &mut deadline => break,
            }
        }

        let hashes: Vec<ContentHash> = pending.iter().map(|item| item.hash).collect();
        let entries = lookup(hashes).await;
        for (item, entry) in pending.into_iter().zip(entries.into_iter().chain(std::iter::repeat(None))) {
            let _ = item.reply.send(entry);
        }
    }
}
