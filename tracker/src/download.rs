use std::{sync::Arc, time::Duration};

use api_types::proofs::{ArtifactKind, ProofId};
use log::debug;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval},
};

use crate::artifacts::{ArtifactClient, ArtifactError};

/// Synthetic progress never claims more than this before the bytes arrive.
const IN_FLIGHT_CEILING_PERCENT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTiming {
    /// Time the synthetic progress takes to reach its in-flight ceiling.
    pub progress_duration: Duration,
    pub tick: Duration,
}

impl Default for DownloadTiming {
    fn default() -> Self {
        Self {
            progress_duration: Duration::from_millis(2_000),
            tick: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DownloadProgress {
    pub percent: f64,
    pub bytes_per_sec: Option<f64>,
}

impl DownloadProgress {
    pub fn complete(&self) -> bool {
        self.percent >= 100.0
    }

    /// Progress of two downloads running side by side.
    pub fn combine(a: DownloadProgress, b: DownloadProgress) -> DownloadProgress {
        let bytes_per_sec = match (a.bytes_per_sec, b.bytes_per_sec) {
            (None, None) => None,
            (x, y) => Some(x.unwrap_or(0.0) + y.unwrap_or(0.0)),
        };
        DownloadProgress {
            percent: (a.percent + b.percent) / 2.0,
            bytes_per_sec,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("{kind} download for proof {proof_id} cancelled")]
    Cancelled { kind: ArtifactKind, proof_id: ProofId },
}

/// Shared cancel switch for one or more downloads.
#[derive(Debug, Clone)]
pub struct DownloadCanceller {
    flag: Arc<watch::Sender<bool>>,
}

impl DownloadCanceller {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

impl Default for DownloadCanceller {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress-tracked fetch of a single artifact.
pub struct DownloadSession {
    kind: ArtifactKind,
    proof_id: ProofId,
    expected_bytes: Option<u64>,
    timing: DownloadTiming,
    progress: watch::Sender<DownloadProgress>,
    cancel: watch::Receiver<bool>,
}

impl DownloadSession {
    pub fn new(
        kind: ArtifactKind,
        proof_id: ProofId,
        expected_bytes: Option<u64>,
        timing: DownloadTiming,
        canceller: &DownloadCanceller,
    ) -> Self {
        let (progress, _) = watch::channel(DownloadProgress::default());
        Self {
            kind,
            proof_id,
            expected_bytes,
            timing,
            progress,
            cancel: canceller.subscribe(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    pub async fn run(mut self, client: &dyn ArtifactClient) -> Result<Vec<u8>, DownloadError> {
        let started = Instant::now();
        let mut ticker = interval(self.timing.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let fetch = client.fetch_artifact(self.kind, self.proof_id);
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                biased;
                true = crate::wait_for_flag(&mut self.cancel, true) => {
                    debug!("{} download for proof {} cancelled", self.kind, self.proof_id);
                    return Err(DownloadError::Cancelled {
                        kind: self.kind,
                        proof_id: self.proof_id,
                    });
                }
                result = &mut fetch => {
                    let bytes = result?;
                    if bytes.is_empty() {
                        return Err(ArtifactError::Empty {
                            kind: self.kind,
                            proof_id: self.proof_id,
                        }
                        .into());
                    }
                    let elapsed = started.elapsed();
                    self.progress.send_replace(DownloadProgress {
                        percent: 100.0,
                        bytes_per_sec: throughput(bytes.len() as f64, elapsed),
                    });
                    debug!(
                        "{} download for proof {} finished: {} bytes in {:.2?}",
                        self.kind,
                        self.proof_id,
                        bytes.len(),
                        elapsed
                    );
                    return Ok(bytes);
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let percent = synthetic_percent(elapsed, self.timing.progress_duration);
                    let bytes_per_sec = self.expected_bytes.and_then(|expected| {
                        throughput(expected as f64 * percent / 100.0, elapsed)
                    });
                    self.progress.send_if_modified(|current| {
                        if percent > current.percent {
                            *current = DownloadProgress { percent, bytes_per_sec };
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }
}

/// Time-based estimate, capped below 100 until the bytes are in hand.
pub fn synthetic_percent(elapsed: Duration, progress_duration: Duration) -> f64 {
    if progress_duration.is_zero() {
        return IN_FLIGHT_CEILING_PERCENT;
    }
    let fraction = (elapsed.as_secs_f64() / progress_duration.as_secs_f64()).min(1.0);
    fraction * IN_FLIGHT_CEILING_PERCENT
}

fn throughput(bytes: f64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || bytes <= 0.0 {
        return None;
    }
    Some(bytes / secs)
}
