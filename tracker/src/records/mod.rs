use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use api_types::proofs::BlockRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Error)]
pub enum RecordsError {
    #[error("failed to build HTTP client for records service")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid records base url while joining path '{path}'")]
    InvalidEndpoint {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to query records window endpoint")]
    WindowRequest(#[source] reqwest::Error),
    #[error("records window endpoint returned error status")]
    WindowStatus(#[source] reqwest::Error),
    #[error("failed to decode records window response")]
    WindowDecode(#[source] reqwest::Error),
    #[error("failed to query block {block_number}")]
    BlockRequest {
        block_number: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("block endpoint returned error status for block {block_number}")]
    BlockStatus {
        block_number: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode block {block_number}")]
    BlockDecode {
        block_number: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("records service unavailable: {0}")]
    Unavailable(String),
}

pub type RecordsResult<T> = Result<T, RecordsError>;

/// Read side of the block/proof storage layer.
#[async_trait]
pub trait RecordsClient: Send + Sync {
    /// Newest `limit` blocks with their proofs.
    async fn fetch_proofs_window(&self, limit: usize) -> RecordsResult<Vec<BlockRecord>>;

    async fn fetch_block(&self, block_number: u64) -> RecordsResult<Option<BlockRecord>>;
}

#[derive(Clone, Debug)]
pub struct HttpRecordsClient {
    client: Client,
    base_url: Url,
}

impl HttpRecordsClient {
    pub fn new(base_url: Url) -> RecordsResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(RecordsError::ClientBuild)?;

        Ok(Self {
            client,
            base_url: crate::normalize_base_url(base_url),
        })
    }

    fn endpoint(&self, path: &str) -> RecordsResult<Url> {
        self.base_url
            .join(path)
            .map_err(|source| RecordsError::InvalidEndpoint {
                path: path.to_string(),
                source,
            })
    }
}

#[async_trait]
impl RecordsClient for HttpRecordsClient {
    async fn fetch_proofs_window(&self, limit: usize) -> RecordsResult<Vec<BlockRecord>> {
        let url = self.endpoint("blocks")?;

        let response = self
            .client
            .get(url)
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(RecordsError::WindowRequest)?
            .error_for_status()
            .map_err(RecordsError::WindowStatus)?;

        let blocks: Vec<BlockRecord> = response.json().await.map_err(RecordsError::WindowDecode)?;

        Ok(blocks)
    }

    async fn fetch_block(&self, block_number: u64) -> RecordsResult<Option<BlockRecord>> {
        let url = self.endpoint(&format!("blocks/{block_number}"))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| RecordsError::BlockRequest {
                block_number,
                source,
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response
            .error_for_status()
            .map_err(|source| RecordsError::BlockStatus {
                block_number,
                source,
            })?;

        let block: BlockRecord =
            response
                .json()
                .await
                .map_err(|source| RecordsError::BlockDecode {
                    block_number,
                    source,
                })?;

        Ok(Some(block))
    }
}

/// In-memory records source. Serves the configured blocks until told
/// otherwise; queued failures take precedence over the configured blocks.
#[derive(Clone, Debug)]
pub struct TestRecordsClient {
    blocks: Arc<Mutex<Vec<BlockRecord>>>,
    failures: Arc<Mutex<VecDeque<RecordsError>>>,
    window_calls: Arc<AtomicUsize>,
    gate: Arc<watch::Sender<bool>>,
}

impl TestRecordsClient {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            blocks: Arc::default(),
            failures: Arc::default(),
            window_calls: Arc::default(),
            gate: Arc::new(gate),
        }
    }

    pub async fn set_blocks(&self, blocks: Vec<BlockRecord>) {
        *self.blocks.lock().await = blocks;
    }

    pub async fn enqueue_failure(&self, error: RecordsError) {
        self.failures.lock().await.push_back(error);
    }

    pub fn window_calls(&self) -> usize {
        self.window_calls.load(Ordering::SeqCst)
    }

    /// Blocks every subsequent window fetch until [`Self::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }
}

impl Default for TestRecordsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordsClient for TestRecordsClient {
    async fn fetch_proofs_window(&self, limit: usize) -> RecordsResult<Vec<BlockRecord>> {
        self.window_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        crate::wait_for_flag(&mut gate, true).await;

        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut blocks = self.blocks.lock().await.clone();
        blocks.sort_by(|a, b| b.block_number.cmp(&a.block_number));
        blocks.truncate(limit);
        Ok(blocks)
    }

    async fn fetch_block(&self, block_number: u64) -> RecordsResult<Option<BlockRecord>> {
        Ok(self
            .blocks
            .lock()
            .await
            .iter()
            .find(|block| block.block_number == block_number)
            .cloned())
    }
}
