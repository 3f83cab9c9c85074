use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use api_types::proofs::{ArtifactKind, ProofId};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Clone, Error)]
pub enum ArtifactError {
    #[error("failed to build HTTP client for artifact store")]
    ClientBuild(#[source] Arc<reqwest::Error>),
    #[error("{kind} artifact for proof {proof_id} not found")]
    NotFound { kind: ArtifactKind, proof_id: ProofId },
    #[error("{kind} artifact for proof {proof_id} is empty")]
    Empty { kind: ArtifactKind, proof_id: ProofId },
    #[error("failed to fetch {kind} artifact for proof {proof_id}: {message}")]
    Transport {
        kind: ArtifactKind,
        proof_id: ProofId,
        message: String,
    },
    #[error("invalid artifact endpoint '{path}': {message}")]
    InvalidEndpoint { path: String, message: String },
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Opaque byte fetch of proof and verification-key artifacts.
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    async fn fetch_artifact(&self, kind: ArtifactKind, proof_id: ProofId)
    -> ArtifactResult<Vec<u8>>;
}

#[derive(Clone, Debug)]
pub struct HttpArtifactClient {
    client: Client,
    base_url: Url,
}

impl HttpArtifactClient {
    pub fn new(base_url: Url) -> ArtifactResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| ArtifactError::ClientBuild(Arc::new(err)))?;
        Ok(Self {
            client,
            base_url: crate::normalize_base_url(base_url),
        })
    }

    fn endpoint(&self, kind: ArtifactKind, proof_id: ProofId) -> ArtifactResult<Url> {
        let path = format!("artifacts/{proof_id}/{kind}");
        self.base_url
            .join(&path)
            .map_err(|err| ArtifactError::InvalidEndpoint {
                path,
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl ArtifactClient for HttpArtifactClient {
    async fn fetch_artifact(
        &self,
        kind: ArtifactKind,
        proof_id: ProofId,
    ) -> ArtifactResult<Vec<u8>> {
        let url = self.endpoint(kind, proof_id)?;
        let transport = |err: reqwest::Error| ArtifactError::Transport {
            kind,
            proof_id,
            message: err.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ArtifactError::NotFound { kind, proof_id });
        }

        let bytes = response
            .error_for_status()
            .map_err(transport)?
            .bytes()
            .await
            .map_err(transport)?;

        Ok(bytes.to_vec())
    }
}

#[derive(Clone, Debug)]
enum TestArtifact {
    Bytes(Vec<u8>),
    Failure(ArtifactError),
}

/// In-memory artifact source. Unknown artifacts are reported as not found.
#[derive(Clone, Debug, Default)]
pub struct TestArtifactClient {
    artifacts: Arc<Mutex<HashMap<(ArtifactKind, ProofId), TestArtifact>>>,
    gates: Arc<Mutex<HashMap<ProofId, watch::Receiver<bool>>>>,
    calls: Arc<AtomicUsize>,
}

impl TestArtifactClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, kind: ArtifactKind, proof_id: ProofId, bytes: Vec<u8>) {
        self.artifacts
            .lock()
            .await
            .insert((kind, proof_id), TestArtifact::Bytes(bytes));
    }

    /// Registers both artifacts of a proof.
    pub async fn insert_pair(&self, proof_id: ProofId, proof: Vec<u8>, vkey: Vec<u8>) {
        self.insert(ArtifactKind::Proof, proof_id, proof).await;
        self.insert(ArtifactKind::Vkey, proof_id, vkey).await;
    }

    pub async fn fail(&self, kind: ArtifactKind, proof_id: ProofId, error: ArtifactError) {
        self.artifacts
            .lock()
            .await
            .insert((kind, proof_id), TestArtifact::Failure(error));
    }

    /// Holds every fetch for `proof_id` until the returned sender is set to `true`.
    pub async fn gate(&self, proof_id: ProofId) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().await.insert(proof_id, rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactClient for TestArtifactClient {
    async fn fetch_artifact(
        &self,
        kind: ArtifactKind,
        proof_id: ProofId,
    ) -> ArtifactResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().await.get(&proof_id).cloned();
        if let Some(mut gate) = gate {
            if !crate::wait_for_flag(&mut gate, true).await {
                return Err(ArtifactError::Transport {
                    kind,
                    proof_id,
                    message: "gate dropped".to_owned(),
                });
            }
        }

        match self.artifacts.lock().await.get(&(kind, proof_id)).cloned() {
            Some(TestArtifact::Bytes(bytes)) => Ok(bytes),
            Some(TestArtifact::Failure(error)) => Err(error),
            None => Err(ArtifactError::NotFound { kind, proof_id }),
        }
    }
}
