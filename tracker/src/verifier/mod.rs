use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use api_types::verifier::{VerifyRequest, VerifyResponse};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub is_valid: bool,
    /// Duration reported by the primitive itself.
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("failed to build HTTP client for verifier")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid verifier base url while constructing {path}")]
    InvalidEndpoint {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to submit verification request")]
    Request(#[source] reqwest::Error),
    #[error("verifier endpoint returned error status")]
    Status(#[source] reqwest::Error),
    #[error("failed to decode verifier response")]
    Decode(#[source] reqwest::Error),
    #[error("verification primitive raised: {0}")]
    Primitive(String),
    #[error("verification task aborted: {0}")]
    Join(String),
    #[error("no queued response in TestVerifier")]
    TestQueueEmpty,
}

pub type VerifierResult<T> = Result<T, VerifierError>;

/// Black-box cryptographic check of a proof against its verification key.
/// `Ok` with `is_valid = false` is a verdict, not an error.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, proof: &[u8], vkey: &[u8]) -> VerifierResult<VerifyOutcome>;
}

pub struct HttpVerifierClient {
    client: Client,
    base_url: Url,
}

impl HttpVerifierClient {
    pub fn new(base_url: Url) -> VerifierResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(VerifierError::ClientBuild)?;

        Ok(Self {
            client,
            base_url: crate::normalize_base_url(base_url),
        })
    }
}

#[async_trait]
impl ProofVerifier for HttpVerifierClient {
    async fn verify(&self, proof: &[u8], vkey: &[u8]) -> VerifierResult<VerifyOutcome> {
        let url = self
            .base_url
            .join("verify")
            .map_err(|source| VerifierError::InvalidEndpoint {
                path: "verify".to_string(),
                source,
            })?;

        let request = VerifyRequest {
            proof: BASE64_STANDARD.encode(proof),
            vkey: BASE64_STANDARD.encode(vkey),
        };

        let response: VerifyResponse = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(VerifierError::Request)?
            .error_for_status()
            .map_err(VerifierError::Status)?
            .json()
            .await
            .map_err(VerifierError::Decode)?;

        Ok(VerifyOutcome {
            is_valid: response.is_valid,
            duration: duration_from_ms(response.duration_ms),
        })
    }
}

type VerifyFn = dyn Fn(&[u8], &[u8]) -> Result<bool, String> + Send + Sync;

/// Runs a synchronous verification function on the blocking pool so a slow
/// check never stalls the tracker loop.
pub struct BlockingVerifier {
    verify_fn: Arc<VerifyFn>,
}

impl BlockingVerifier {
    pub fn new<F>(verify_fn: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            verify_fn: Arc::new(verify_fn),
        }
    }
}

#[async_trait]
impl ProofVerifier for BlockingVerifier {
    async fn verify(&self, proof: &[u8], vkey: &[u8]) -> VerifierResult<VerifyOutcome> {
        let verify_fn = Arc::clone(&self.verify_fn);
        let proof = proof.to_vec();
        let vkey = vkey.to_vec();

        let (verdict, duration) = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let verdict = verify_fn(&proof, &vkey);
            (verdict, started.elapsed())
        })
        .await
        .map_err(|err| VerifierError::Join(err.to_string()))?;

        let is_valid = verdict.map_err(VerifierError::Primitive)?;
        Ok(VerifyOutcome { is_valid, duration })
    }
}

/// Scripted verifier. Verdicts registered for specific proof bytes win;
/// otherwise queued verdicts are answered in order. Inputs are recorded.
#[derive(Clone, Debug, Default)]
pub struct TestVerifier {
    by_proof: Arc<Mutex<HashMap<Vec<u8>, Result<bool, String>>>>,
    responses: Arc<Mutex<VecDeque<Result<bool, String>>>>,
    inputs: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
}

impl TestVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue_verdict(&self, is_valid: bool) {
        self.responses.lock().await.push_back(Ok(is_valid));
    }

    pub async fn set_verdict_for(&self, proof: &[u8], is_valid: bool) {
        self.by_proof.lock().await.insert(proof.to_vec(), Ok(is_valid));
    }

    pub async fn set_failure_for(&self, proof: &[u8], message: impl Into<String>) {
        self.by_proof
            .lock()
            .await
            .insert(proof.to_vec(), Err(message.into()));
    }

    pub async fn enqueue_failure(&self, message: impl Into<String>) {
        self.responses.lock().await.push_back(Err(message.into()));
    }

    pub async fn inputs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inputs.lock().await.clone()
    }
}

#[async_trait]
impl ProofVerifier for TestVerifier {
    async fn verify(&self, proof: &[u8], vkey: &[u8]) -> VerifierResult<VerifyOutcome> {
        self.inputs.lock().await.push((proof.to_vec(), vkey.to_vec()));
        let scripted = self.by_proof.lock().await.get(proof).cloned();
        let next = match scripted {
            Some(verdict) => Some(verdict),
            None => self.responses.lock().await.pop_front(),
        };
        match next {
            Some(Ok(is_valid)) => Ok(VerifyOutcome {
                is_valid,
                duration: Duration::from_millis(1),
            }),
            Some(Err(message)) => Err(VerifierError::Primitive(message)),
            None => Err(VerifierError::TestQueueEmpty),
        }
    }
}

fn duration_from_ms(value: f64) -> Duration {
    if value > 0.0 {
        Duration::try_from_secs_f64(value / 1_000.0).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_from_ms_handles_garbage() {
        assert_eq!(duration_from_ms(1_500.0), Duration::from_millis(1_500));
        assert_eq!(duration_from_ms(-3.0), Duration::ZERO);
        assert_eq!(duration_from_ms(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_ms(f64::INFINITY), Duration::ZERO);
        assert_eq!(duration_from_ms(1e30), Duration::ZERO);
    }

    #[tokio::test]
    async fn blocking_verifier_runs_function() {
        let verifier = BlockingVerifier::new(|proof, vkey| {
            if vkey.is_empty() {
                return Err("empty vkey".to_owned());
            }
            Ok(proof.first() == vkey.first())
        });

        let outcome = verifier.verify(&[7, 1], &[7, 2]).await.expect("verify");
        assert!(outcome.is_valid);

        let outcome = verifier.verify(&[1], &[2]).await.expect("verify");
        assert!(!outcome.is_valid);

        let err = verifier.verify(&[1], &[]).await.expect_err("raises");
        assert!(matches!(err, VerifierError::Primitive(message) if message == "empty vkey"));
    }

    #[tokio::test]
    async fn test_verifier_replays_queue() {
        let verifier = TestVerifier::new();
        verifier.enqueue_verdict(false).await;
        verifier.enqueue_failure("garbled").await;

        let outcome = verifier.verify(b"p", b"v").await.expect("verify");
        assert!(!outcome.is_valid);
        assert!(matches!(
            verifier.verify(b"p", b"v").await,
            Err(VerifierError::Primitive(message)) if message == "garbled"
        ));
        assert!(matches!(
            verifier.verify(b"p", b"v").await,
            Err(VerifierError::TestQueueEmpty)
        ));
        assert_eq!(verifier.inputs().await.len(), 3);
    }
}
