use std::{collections::HashMap, sync::Arc, time::Duration};

use api_types::proofs::{BlockRecord, ProofId, ProofRecord};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    sync::{Notify, watch},
    time::{MissedTickBehavior, interval},
};

use crate::{
    aggregator::{self, BlockAggregator, BlockSummary, ProofView},
    artifacts::ArtifactClient,
    clock::Clock,
    config::TrackerConfig,
    download::DownloadTiming,
    errors::TrackerError,
    reconcile::reconcile,
    records::RecordsClient,
    store::ProofRecordStore,
    verification::{SessionContext, SessionHandle, SessionRegistry, VerificationSession},
    verifier::ProofVerifier,
};

/// What a presentation layer renders: visible blocks, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerView {
    /// Bumped every time the published view changes.
    pub generation: u64,
    pub blocks: Vec<BlockSummary>,
}

impl TrackerView {
    pub fn block(&self, block_number: u64) -> Option<&BlockSummary> {
        self.blocks
            .iter()
            .find(|block| block.block_number == block_number)
    }

    pub fn proof(&self, proof_id: ProofId) -> Option<&ProofView> {
        self.blocks
            .iter()
            .flat_map(|block| block.proofs.iter())
            .find(|view| view.record.proof_id == proof_id)
    }

    /// Every proved proof on screen has finished verifying.
    pub fn is_settled(&self) -> bool {
        self.blocks
            .iter()
            .flat_map(|block| block.proofs.iter())
            .filter(|view| view.record.status.is_proved())
            .all(|view| view.display.is_terminal())
    }
}

/// Ties the store, the aggregator and the verification sessions together and
/// publishes the resulting [`TrackerView`].
pub struct ProofTracker {
    store: ProofRecordStore,
    aggregator: BlockAggregator,
    sessions: SessionRegistry,
    context: SessionContext,
    retention_tick: Duration,
    view: watch::Sender<TrackerView>,
}

impl ProofTracker {
    pub fn new(
        store: ProofRecordStore,
        artifacts: Arc<dyn ArtifactClient>,
        verifier: Arc<dyn ProofVerifier>,
        config: &TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (view, _) = watch::channel(TrackerView::default());
        Self {
            store,
            aggregator: BlockAggregator::new(config.retention_window(), clock),
            sessions: SessionRegistry::new(),
            context: SessionContext {
                artifacts,
                verifier,
                timing: config.download_timing(),
                updates: Arc::new(Notify::new()),
            },
            retention_tick: config.retention_tick(),
            view,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> TrackerView {
        self.view.borrow().clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, proof_id: ProofId) -> Option<&SessionHandle> {
        self.sessions.get(proof_id)
    }

    /// Discards the session for `proof_id` and starts a fresh one if the proof
    /// is still visible and proved. Returns whether a session was discarded.
    pub fn restart(&mut self, proof_id: ProofId) -> bool {
        let removed = self.sessions.remove(proof_id);
        if removed {
            info!("restarting verification of proof {proof_id}");
            self.refresh_view();
        }
        removed
    }

    /// Recomputes the visible set, reconciles sessions with it and publishes
    /// the view if anything changed.
    pub fn refresh_view(&mut self) -> TrackerView {
        let snapshot = self.store.snapshot();

        let sessions = &self.sessions;
        let visible = self.aggregator.visible_blocks(&snapshot, |proof| {
            reconcile(proof.status, sessions.state(proof.proof_id).as_ref())
        });

        // Only proved proofs in visible blocks may have a session.
        let wanted: HashMap<ProofId, &ProofRecord> = visible
            .iter()
            .flat_map(|block| block.proofs.iter())
            .filter(|proof| proof.status.is_proved())
            .map(|proof| (proof.proof_id, proof))
            .collect();

        for proof_id in self.sessions.retain(|proof_id| wanted.contains_key(&proof_id)) {
            debug!("verification session for proof {proof_id} torn down");
        }
        for proof in wanted.values() {
            if self.sessions.ensure(proof, &self.context) {
                info!(
                    "verifying proof {} of block {} ({})",
                    proof.proof_id, proof.block_number, proof.cluster_id
                );
            }
        }

        let blocks: Vec<BlockSummary> = visible
            .iter()
            .map(|block| self.summarize(block))
            .collect();

        self.view.send_if_modified(|current| {
            if current.blocks == blocks {
                return false;
            }
            current.generation += 1;
            current.blocks = blocks;
            true
        });
        self.view()
    }

    /// Waits until every visible proved proof has finished verifying.
    pub async fn settle(&mut self) -> TrackerView {
        let updates = Arc::clone(&self.context.updates);
        loop {
            let view = self.refresh_view();
            if view.is_settled() {
                return view;
            }
            updates.notified().await;
        }
    }

    /// Event loop. Recomputes the view whenever the store is refreshed, a
    /// session makes progress, or the retention tick fires. Keeps serving the
    /// last snapshot if the bridge goes away.
    pub async fn run(mut self, mut refreshed: watch::Receiver<u64>) {
        let updates = Arc::clone(&self.context.updates);
        let mut retention = interval(self.retention_tick);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bridge_alive = true;

        loop {
            tokio::select! {
                changed = refreshed.changed(), if bridge_alive => {
                    if changed.is_err() {
                        warn!("change bridge stopped, serving last known snapshot");
                        bridge_alive = false;
                        continue;
                    }
                }
                _ = updates.notified() => {}
                _ = retention.tick() => {}
            }
            self.refresh_view();
        }
    }

    fn summarize(&self, block: &BlockRecord) -> BlockSummary {
        self.aggregator.summarize(block, |proof| {
            let verification = if proof.status.is_proved() {
                self.sessions.state(proof.proof_id)
            } else {
                None
            };
            ProofView {
                record: proof.clone(),
                display: reconcile(proof.status, verification.as_ref()),
                verification,
            }
        })
    }
}

/// Fetches one block and verifies all of its proved proofs concurrently.
/// Resolves once every session has settled.
pub async fn verify_block(
    records: &dyn RecordsClient,
    artifacts: Arc<dyn ArtifactClient>,
    verifier: Arc<dyn ProofVerifier>,
    timing: DownloadTiming,
    block_number: u64,
) -> Result<BlockSummary, TrackerError> {
    let block = records
        .fetch_block(block_number)
        .await?
        .ok_or(TrackerError::BlockNotFound(block_number))?;

    let context = SessionContext {
        artifacts,
        verifier,
        timing,
        updates: Arc::new(Notify::new()),
    };
    let sessions: Vec<(ProofId, SessionHandle)> = block
        .proofs
        .iter()
        .filter(|proof| proof.status.is_proved())
        .map(|proof| {
            (
                proof.proof_id,
                VerificationSession::spawn(proof, context.clone()),
            )
        })
        .collect();
    info!(
        "verifying {} of {} proofs in block {block_number}",
        sessions.len(),
        block.proofs.len()
    );

    let mut settled = HashMap::new();
    for (proof_id, handle) in &sessions {
        settled.insert(*proof_id, handle.settled().await);
    }

    let proofs = block
        .proofs
        .iter()
        .map(|proof| {
            let verification = settled.remove(&proof.proof_id);
            ProofView {
                record: proof.clone(),
                display: reconcile(proof.status, verification.as_ref()),
                verification,
            }
        })
        .collect();

    Ok(BlockSummary::new(
        &block,
        aggregator::all_proved(&block),
        proofs,
    ))
}
