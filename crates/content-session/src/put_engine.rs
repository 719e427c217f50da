// SPDX-License-Identifier: Apache-2.0
//! Put engine (`spec.md` §4.4).

use std::path::Path;

use content_cas::{ContentStream, PutHash};
use content_types::{ContentHashWithSize, ProactiveCopyResult, ProactiveCopyStatus, PushResult, PutResult, RealizationMode, Urgency};

use crate::{Session, SessionError};

impl Session {
    /// Persist the file at `path` (`spec.md` §4.4). Gated by the shared
    /// put/place concurrency limit; put-stream is deliberately ungated.
    pub async fn put_file(
        &self,
        hash: PutHash,
        path: &Path,
        realization: RealizationMode,
        urgency: Urgency,
    ) -> Result<PutResult, SessionError> {
        self.require_running().await?;
        let put = {
            let _guard = self.handles.gate.acquire().await;
            self.handles.cas.put_file(hash, path, realization, urgency).await?
        };
        self.finish_put(put, urgency).await
    }

    /// Persist bytes read from `stream` (`spec.md` §4.4).
    pub async fn put_stream(&self, hash: PutHash, stream: ContentStream, urgency: Urgency) -> Result<PutResult, SessionError> {
        self.require_running().await?;
        let put = self.handles.cas.put_stream(hash, stream, urgency).await?;
        self.finish_put(put, urgency).await
    }

    async fn finish_put(&self, mut put: PutResult, urgency: Urgency) -> Result<PutResult, SessionError> {
        let config = self.handles.config.clone();
        let skip_register = config.respect_skip_register_hint && urgency == Urgency::SkipRegisterContent;

        if skip_register {
            put.registered = false;
        } else {
            let register_urgency = if config.register_eagerly_on_put && !put.already_existed {
                Urgency::RegisterEagerly
            } else {
                urgency
            };
            match self
                .handles
                .directory
                .register_local_location(&[ContentHashWithSize { hash: put.hash, size: put.size }], register_urgency)
                .await
            {
                Ok(()) => put.registered = true,
                Err(err) => {
                    tracing::warn!(hash = %put.hash, error = %err, "put: directory registration failed");
                    put.registered = false;
                }
            }
        }

        if put.registered && config.proactive_copy_on_put {
            let handles = self.handles.clone();
            let hash = put.hash;
            if config.inline_operations_for_tests {
                let result = handles.proactive_copy_if_needed(hash, true, "post-put (inline)").await;
                if all_attempted_sides_failed(&result) {
                    return Err(SessionError::ProactiveCopyFailed(format!(
                        "every proactive-copy target failed for {hash}"
                    )));
                }
            } else {
                let continuation = async move {
                    let _ = handles.proactive_copy_if_needed(hash, true, "post-put (detached)").await;
                };
                crate::detached::spawn_on_store(&self.store_token, continuation);
            }
        }

        Ok(put)
    }
}

/// `spec.md` §4.4 step 3: under inline testing, fail the put only if every
/// side that actually attempted a push failed. A side that never attempted
/// (disabled, threshold already met, no candidate) does not count.
fn all_attempted_sides_failed(result: &ProactiveCopyResult) -> bool {
    let attempted: Vec<&PushResult> = [&result.outside, &result.inside]
        .into_iter()
        .filter_map(|status| match status {
            ProactiveCopyStatus::Attempted { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    !attempted.is_empty() && attempted.iter().all(|result| !matches!(result, PushResult::Succeeded { .. }))
}
