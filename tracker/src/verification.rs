//! Client-side verification of a single proof.
//!
//! A session downloads the proof and its verification key concurrently, runs
//! the verification primitive once, and settles in `success`, `failed` or
//! `error`. State changes go through [`VerificationState::apply`], which only
//! accepts forward edges; the side effects live in the spawned driver task.

use std::{collections::HashMap, sync::Arc, time::Duration};

use api_types::proofs::{ArtifactKind, ProofId, ProofRecord};
use log::{debug, error, warn};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    artifacts::ArtifactClient,
    download::{DownloadCanceller, DownloadError, DownloadProgress, DownloadSession, DownloadTiming},
    verifier::{ProofVerifier, VerifierError, VerifierResult, VerifyOutcome},
};

/// Phases in the order a session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPhase {
    Idle,
    Downloading,
    Verifying,
    Success,
    Failed,
    Error,
}

impl VerificationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerificationPhase::Success | VerificationPhase::Failed | VerificationPhase::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    Downloading {
        download: DownloadProgress,
    },
    Verifying {
        download: DownloadProgress,
    },
    Success {
        download: DownloadProgress,
        #[serde(serialize_with = "serialize_ms")]
        verify_duration: Duration,
    },
    Failed {
        download: DownloadProgress,
        #[serde(serialize_with = "serialize_ms")]
        verify_duration: Duration,
    },
    Error {
        download: DownloadProgress,
        #[serde(serialize_with = "serialize_opt_ms")]
        verify_duration: Option<Duration>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start,
    Progress(DownloadProgress),
    ArtifactsReady,
    Verified {
        is_valid: bool,
        duration: Duration,
    },
    Errored {
        message: String,
        verify_duration: Option<Duration>,
    },
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::Progress(_) => "progress",
            SessionEvent::ArtifactsReady => "artifacts_ready",
            SessionEvent::Verified { .. } => "verified",
            SessionEvent::Errored { .. } => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal verification transition from {from:?} on '{event}'")]
pub struct TransitionError {
    pub from: VerificationPhase,
    pub event: &'static str,
}

impl VerificationState {
    pub fn phase(&self) -> VerificationPhase {
        match self {
            VerificationState::Idle => VerificationPhase::Idle,
            VerificationState::Downloading { .. } => VerificationPhase::Downloading,
            VerificationState::Verifying { .. } => VerificationPhase::Verifying,
            VerificationState::Success { .. } => VerificationPhase::Success,
            VerificationState::Failed { .. } => VerificationPhase::Failed,
            VerificationState::Error { .. } => VerificationPhase::Error,
        }
    }

    /// Tri-state verdict: `None` until the primitive has answered.
    pub fn is_valid(&self) -> Option<bool> {
        match self {
            VerificationState::Success { .. } => Some(true),
            VerificationState::Failed { .. } => Some(false),
            _ => None,
        }
    }

    pub fn download(&self) -> DownloadProgress {
        match self {
            VerificationState::Idle => DownloadProgress::default(),
            VerificationState::Downloading { download }
            | VerificationState::Verifying { download }
            | VerificationState::Success { download, .. }
            | VerificationState::Failed { download, .. }
            | VerificationState::Error { download, .. } => *download,
        }
    }

    pub fn verify_duration(&self) -> Option<Duration> {
        match self {
            VerificationState::Success {
                verify_duration, ..
            }
            | VerificationState::Failed {
                verify_duration, ..
            } => Some(*verify_duration),
            VerificationState::Error {
                verify_duration, ..
            } => *verify_duration,
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            VerificationState::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Pure transition function. Only forward edges are legal.
    pub fn apply(&self, event: SessionEvent) -> Result<VerificationState, TransitionError> {
        let illegal = TransitionError {
            from: self.phase(),
            event: event.name(),
        };

        let next = match (self, event) {
            (VerificationState::Idle, SessionEvent::Start) => VerificationState::Downloading {
                download: DownloadProgress::default(),
            },
            (VerificationState::Downloading { download }, SessionEvent::Progress(update)) => {
                let download = if update.percent >= download.percent {
                    update
                } else {
                    *download
                };
                VerificationState::Downloading { download }
            }
            (VerificationState::Downloading { download }, SessionEvent::ArtifactsReady) => {
                VerificationState::Verifying {
                    download: DownloadProgress {
                        percent: 100.0,
                        bytes_per_sec: download.bytes_per_sec,
                    },
                }
            }
            (
                VerificationState::Verifying { download },
                SessionEvent::Verified { is_valid, duration },
            ) => {
                if is_valid {
                    VerificationState::Success {
                        download: *download,
                        verify_duration: duration,
                    }
                } else {
                    VerificationState::Failed {
                        download: *download,
                        verify_duration: duration,
                    }
                }
            }
            (
                VerificationState::Downloading { download }
                | VerificationState::Verifying { download },
                SessionEvent::Errored {
                    message,
                    verify_duration,
                },
            ) => VerificationState::Error {
                download: *download,
                verify_duration,
                message,
            },
            _ => return Err(illegal),
        };

        Ok(next)
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub artifacts: Arc<dyn ArtifactClient>,
    pub verifier: Arc<dyn ProofVerifier>,
    pub timing: DownloadTiming,
    /// Pinged after every published state change.
    pub updates: Arc<Notify>,
}

pub struct VerificationSession {
    proof_id: ProofId,
    expected_bytes: Option<u64>,
    ctx: SessionContext,
    state: watch::Sender<VerificationState>,
    canceller: DownloadCanceller,
}

impl VerificationSession {
    /// Starts verifying `proof`. The session is already `downloading` when
    /// this returns.
    pub fn spawn(proof: &ProofRecord, ctx: SessionContext) -> SessionHandle {
        let (state, receiver) = watch::channel(VerificationState::Idle);
        let session = VerificationSession {
            proof_id: proof.proof_id,
            expected_bytes: proof.size_bytes,
            ctx,
            state,
            canceller: DownloadCanceller::new(),
        };

        session.transition(SessionEvent::Start);
        let canceller = session.canceller.clone();
        let task = tokio::spawn(session.drive());

        SessionHandle {
            proof_id: proof.proof_id,
            state: receiver,
            canceller,
            task,
        }
    }

    async fn drive(self) {
        let (proof, vkey) = match self.download().await {
            Ok(artifacts) => artifacts,
            Err(DownloadError::Cancelled { .. }) => return,
            Err(err) => {
                warn!("proof {} artifacts unavailable: {err}", self.proof_id);
                self.transition(SessionEvent::Errored {
                    message: err.to_string(),
                    verify_duration: None,
                });
                return;
            }
        };

        if !self.transition(SessionEvent::ArtifactsReady) {
            return;
        }

        tokio::task::yield_now().await;
        let started = Instant::now();
        let verdict = self.verify(proof, vkey).await;
        let elapsed = started.elapsed();
        tokio::task::yield_now().await;

        match verdict {
            Ok(outcome) => {
                debug!(
                    "proof {} verified: valid={} (primitive reported {:.2?}, wall {:.2?})",
                    self.proof_id, outcome.is_valid, outcome.duration, elapsed
                );
                self.transition(SessionEvent::Verified {
                    is_valid: outcome.is_valid,
                    duration: elapsed,
                });
            }
            Err(err) => {
                warn!("proof {} verification raised: {err}", self.proof_id);
                self.transition(SessionEvent::Errored {
                    message: err.to_string(),
                    verify_duration: Some(elapsed),
                });
            }
        }
    }

    /// Runs the verifier on its own task so a panicking verifier still ends
    /// the session in `error`.
    async fn verify(&self, proof: Vec<u8>, vkey: Vec<u8>) -> VerifierResult<VerifyOutcome> {
        let verifier = Arc::clone(&self.ctx.verifier);
        let mut task = AbortOnDrop(tokio::spawn(async move {
            verifier.verify(&proof, &vkey).await
        }));
        match (&mut task.0).await {
            Ok(verdict) => verdict,
            Err(err) => Err(VerifierError::Join(err.to_string())),
        }
    }

    async fn download(&self) -> Result<(Vec<u8>, Vec<u8>), DownloadError> {
        let timing = self.ctx.timing;
        let proof_download = DownloadSession::new(
            ArtifactKind::Proof,
            self.proof_id,
            self.expected_bytes,
            timing,
            &self.canceller,
        );
        let vkey_download = DownloadSession::new(
            ArtifactKind::Vkey,
            self.proof_id,
            None,
            timing,
            &self.canceller,
        );
        let mut proof_progress = proof_download.subscribe();
        let mut vkey_progress = vkey_download.subscribe();

        let artifacts = self.ctx.artifacts.as_ref();
        let fetch = async {
            tokio::try_join!(proof_download.run(artifacts), vkey_download.run(artifacts))
        };
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                result = &mut fetch => return result,
                Ok(()) = proof_progress.changed() => {}
                Ok(()) = vkey_progress.changed() => {}
            }
            let combined = DownloadProgress::combine(
                *proof_progress.borrow_and_update(),
                *vkey_progress.borrow_and_update(),
            );
            self.transition(SessionEvent::Progress(combined));
        }
    }

    /// Applies `event` and publishes the result. Returns `false` once the
    /// session has been torn down or the event was rejected.
    fn transition(&self, event: SessionEvent) -> bool {
        if self.canceller.is_cancelled() {
            return false;
        }

        let current = self.state.borrow().clone();
        match current.apply(event) {
            Ok(next) => {
                if next != current {
                    if next.phase() != current.phase() {
                        debug!(
                            "proof {}: {:?} -> {:?}",
                            self.proof_id,
                            current.phase(),
                            next.phase()
                        );
                    }
                    self.state.send_replace(next);
                    self.ctx.updates.notify_one();
                }
                true
            }
            Err(err) => {
                error!("proof {}: {err}", self.proof_id);
                false
            }
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owner of a running session. Dropping it tears the session down: pending
/// fetches are abandoned and no further state is published.
pub struct SessionHandle {
    proof_id: ProofId,
    state: watch::Receiver<VerificationState>,
    canceller: DownloadCanceller,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn proof_id(&self) -> ProofId {
        self.proof_id
    }

    pub fn state(&self) -> VerificationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VerificationState> {
        self.state.clone()
    }

    /// Resolves with the terminal state, or the last published state if the
    /// session stopped without reaching one.
    pub async fn settled(&self) -> VerificationState {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if current.phase().is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return state.borrow().clone();
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.canceller.cancel();
        self.task.abort();
    }
}

/// At most one live session per proof.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ProofId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, proof_id: ProofId) -> bool {
        self.sessions.contains_key(&proof_id)
    }

    pub fn get(&self, proof_id: ProofId) -> Option<&SessionHandle> {
        self.sessions.get(&proof_id)
    }

    pub fn state(&self, proof_id: ProofId) -> Option<VerificationState> {
        self.sessions.get(&proof_id).map(SessionHandle::state)
    }

    /// Starts a session for `proof` unless one is already live. Returns
    /// whether a session was started.
    pub fn ensure(&mut self, proof: &ProofRecord, ctx: &SessionContext) -> bool {
        if self.sessions.contains_key(&proof.proof_id) {
            return false;
        }
        self.sessions
            .insert(proof.proof_id, VerificationSession::spawn(proof, ctx.clone()));
        true
    }

    /// Tears down the session for `proof_id`. Returns whether one was live.
    pub fn remove(&mut self, proof_id: ProofId) -> bool {
        self.sessions.remove(&proof_id).is_some()
    }

    /// Tears down every session whose proof fails `keep` and returns their ids.
    pub fn retain(&mut self, mut keep: impl FnMut(ProofId) -> bool) -> Vec<ProofId> {
        let dropped: Vec<ProofId> = self
            .sessions
            .keys()
            .copied()
            .filter(|proof_id| !keep(*proof_id))
            .collect();
        for proof_id in &dropped {
            self.sessions.remove(proof_id);
        }
        dropped
    }
}

fn serialize_ms<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

fn serialize_opt_ms<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => serialize_ms(duration, serializer),
        None => serializer.serialize_none(),
    }
}
