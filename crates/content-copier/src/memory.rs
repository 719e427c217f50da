// SPDX-License-Identifier: Apache-2.0
//! Scriptable in-memory [`Copier`] for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use content_cas::ContentStream;
use content_types::{MachineLocation, PushResult};
use tokio::io::AsyncReadExt;

use crate::{ContentHash, CopyError, CopyRequest, Copier, LandedHandler};

struct State {
    remotes: HashMap<MachineLocation, HashMap<ContentHash, Vec<u8>>>,
    unreachable: HashSet<MachineLocation>,
    push_script: VecDeque<PushResult>,
    request_copy_failures: HashSet<MachineLocation>,
}

/// Deterministic [`Copier`] double. Sources are seeded explicitly; push and
/// request-copy outcomes can be scripted so retry-loop tests don't depend on
/// real network behavior.
pub struct ScriptedCopier {
    state: Mutex<State>,
}

impl ScriptedCopier {
    /// Create an empty copier with no seeded sources.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                remotes: HashMap::new(),
                unreachable: HashSet::new(),
                push_script: VecDeque::new(),
                request_copy_failures: HashSet::new(),
            }),
        }
    }

    /// Make `location` able to serve `hash` with `bytes` for `try_copy_and_put`.
    pub fn seed_remote(&self, location: MachineLocation, hash: ContentHash, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .remotes
            .entry(location)
            .or_default()
            .insert(hash, bytes);
    }

    /// Make copies from `location` always fail (simulating an unreachable
    /// or corrupt source), forcing the copier to advance to the next
    /// candidate.
    pub fn mark_unreachable(&self, location: MachineLocation) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unreachable
            .insert(location);
    }

    /// Queue the next `push_file` outcome. FIFO; when exhausted,
    /// `push_file` reports `Succeeded`.
    pub fn queue_push_result(&self, result: PushResult) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_script
            .push_back(result);
    }

    /// Make `request_copy_file` to `location` fail.
    pub fn fail_request_copy(&self, location: MachineLocation) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .request_copy_failures
            .insert(location);
    }
}

impl Default for ScriptedCopier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Copier for ScriptedCopier {
    async fn try_copy_and_put(
        &self,
        request: CopyRequest<'_>,
        handler: &dyn LandedHandler,
    ) -> Result<content_types::PutResult, CopyError> {
        if request.candidates.is_empty() {
            return Err(CopyError::NoCandidates);
        }
        let mut last_error = String::new();
        let mut attempted = 0usize;
        for candidate in request.candidates {
            attempted += 1;
            let bytes = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.unreachable.contains(candidate) {
                    last_error = format!("{candidate} unreachable");
                    continue;
                }
                state
                    .remotes
                    .get(candidate)
                    .and_then(|blobs| blobs.get(&request.hash))
                    .cloned()
            };
            let Some(bytes) = bytes else {
                last_error = format!("{candidate} does not have {}", request.hash);
                continue;
            };
            if let Some(parent) = request.landing_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if tokio::fs::write(request.landing_path, &bytes).await.is_err() {
                last_error = format!("{candidate}: failed to write landing path");
                continue;
            }
            match handler.put(request.landing_path).await {
                Ok(put_result) => return Ok(put_result),
                Err(err) => {
                    last_error = format!("{candidate}: {err}");
                }
            }
        }
        Err(CopyError::ExhaustedCandidates {
            attempted,
            last_error,
        })
    }

    async fn push_file(
        &self,
        _hash: ContentHash,
        _target: &MachineLocation,
        mut stream: ContentStream,
    ) -> PushResult {
        let mut bytes = Vec::new();
        if stream.read_to_end(&mut bytes).await.is_err() {
            return PushResult::Failed {
                underlying: "failed to read source stream".into(),
            };
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .push_script
            .pop_front()
            .unwrap_or(PushResult::Succeeded {
                size: Some(bytes.len() as u64),
            })
    }

    async fn request_copy_file(
        &self,
        _hash: ContentHash,
        target: &MachineLocation,
    ) -> Result<(), CopyError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.request_copy_failures.contains(target) {
            return Err(CopyError::ExhaustedCandidates {
                attempted: 1,
                last_error: format!("{target} refused request-copy"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use content_types::{ContentSize, HashType};
    use std::path::PathBuf;

    struct AcceptAll;
    impl LandedHandler for AcceptAll {
        fn put<'a>(
            &'a self,
            path: &'a Path,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<content_types::PutResult, String>> + Send + 'a>,
        > {
            Box::pin(async move {
                let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
                Ok(content_types::PutResult {
                    hash: ContentHash::new(HashType::Blake3, [9u8; 32]),
                    size: ContentSize::Known(bytes.len() as u64),
                    already_existed: false,
                    registered: false,
                })
            })
        }
    }

    fn h(byte: u8) -> ContentHash {
        ContentHash::new(HashType::Blake3, [byte; 32])
    }

    fn landing() -> PathBuf {
        std::env::temp_dir().join(format!("copier-test-{}-{}", std::process::id(), rand_suffix()))
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn advances_past_unreachable_candidate() {
        let copier = ScriptedCopier::new();
        let bad = MachineLocation("bad".into());
        let good = MachineLocation("good".into());
        copier.mark_unreachable(bad.clone());
        copier.seed_remote(good.clone(), h(1), b"payload".to_vec());

        let path = landing();
        let request = CopyRequest {
            hash: h(1),
            size: ContentSize::Known(7),
            candidates: &[bad, good],
            landing_path: &path,
            trusted_put: true,
            compression_size_threshold: None,
        };
        let result = copier.try_copy_and_put(request, &AcceptAll).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausts_all_candidates() {
        let copier = ScriptedCopier::new();
        let path = landing();
        let request = CopyRequest {
            hash: h(2),
            size: ContentSize::Unknown,
            candidates: &[MachineLocation("m1".into())],
            landing_path: &path,
            trusted_put: true,
            compression_size_threshold: None,
        };
        let result = copier.try_copy_and_put(request, &AcceptAll).await;
        assert!(matches!(result, Err(CopyError::ExhaustedCandidates { attempted: 1, .. })));
    }

    #[tokio::test]
    async fn push_file_defaults_to_succeeded() {
        let copier = ScriptedCopier::new();
        let result = copier
            .push_file(
                h(3),
                &MachineLocation("m1".into()),
                Box::new(std::io::Cursor::new(b"x".to_vec())),
            )
            .await;
        assert!(matches!(result, PushResult::Succeeded { .. }));
    }

    #[tokio::test]
    async fn push_file_honors_scripted_sequence() {
        let copier = ScriptedCopier::new();
        copier.queue_push_result(PushResult::QualifiesForRetry {
            underlying: "timeout".into(),
        });
        copier.queue_push_result(PushResult::Succeeded { size: Some(1) });

        let r1 = copier
            .push_file(
                h(4),
                &MachineLocation("m1".into()),
                Box::new(std::io::Cursor::new(b"x".to_vec())),
            )
            .await;
        assert!(matches!(r1, PushResult::QualifiesForRetry { .. }));

        let r2 = copier
            .push_file(
                h(4),
                &MachineLocation("m1".into()),
                Box::new(std::io::Cursor::new(b"x".to_vec())),
            )
            .await;
        assert!(matches!(r2, PushResult::Succeeded { .. }));
    }
}
