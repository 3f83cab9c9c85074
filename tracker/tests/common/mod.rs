#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use chrono::Utc;
use proof_tracker::{
    BlockRecord, ManualClock, ProofId, ProofRecord, ProofRecordStore, ProofStatus, ProofTracker,
    TrackerConfig, TrackerView, artifacts::TestArtifactClient, records::TestRecordsClient,
    verifier::TestVerifier,
};
use tokio::{sync::watch, time::timeout};

pub fn proof(proof_id: ProofId, block_number: u64, status: ProofStatus) -> ProofRecord {
    ProofRecord {
        proof_id,
        block_number,
        cluster_id: format!("cluster-{proof_id}"),
        team_id: format!("team-{}", proof_id % 3),
        status,
        size_bytes: status.is_proved().then_some(4_096),
        proving_time_ms: status.is_proved().then_some(12_000),
        queued_at: Some(Utc::now()),
        proving_at: None,
        proved_at: status.is_proved().then(Utc::now),
    }
}

pub fn block(block_number: u64, proofs: Vec<ProofRecord>) -> BlockRecord {
    BlockRecord {
        block_number,
        timestamp: Utc::now(),
        proofs,
    }
}

/// Bundles the in-memory collaborators a tracker needs.
pub struct Harness {
    pub store: ProofRecordStore,
    pub records: TestRecordsClient,
    pub artifacts: TestArtifactClient,
    pub verifier: TestVerifier,
    pub clock: ManualClock,
    pub config: TrackerConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: ProofRecordStore::new(),
            records: TestRecordsClient::new(),
            artifacts: TestArtifactClient::new(),
            verifier: TestVerifier::new(),
            clock: ManualClock::new(),
            config: TrackerConfig::default(),
        }
    }

    pub fn tracker(&self) -> ProofTracker {
        ProofTracker::new(
            self.store.clone(),
            Arc::new(self.artifacts.clone()),
            Arc::new(self.verifier.clone()),
            &self.config,
            Arc::new(self.clock.clone()),
        )
    }

    /// Registers artifacts for `proof_id` whose proof bytes the verifier
    /// answers with `is_valid`.
    pub async fn verifiable(&self, proof_id: ProofId, is_valid: bool) {
        let proof_bytes = proof_id.to_be_bytes().to_vec();
        self.artifacts
            .insert_pair(proof_id, proof_bytes.clone(), vec![0xaa; 32])
            .await;
        self.verifier.set_verdict_for(&proof_bytes, is_valid).await;
    }
}

pub fn assert_distributions_sum(view: &TrackerView) {
    for block in &view.blocks {
        assert_eq!(
            block.distribution.total(),
            block.total_proofs,
            "distribution of block {} does not add up",
            block.block_number
        );
        assert_eq!(block.total_proofs, block.proofs.len());
    }
}

/// Waits for a published view matching `predicate`.
pub async fn wait_for_view<F>(
    views: &mut watch::Receiver<TrackerView>,
    predicate: F,
) -> Result<TrackerView>
where
    F: Fn(&TrackerView) -> bool,
{
    timeout(Duration::from_secs(60), async {
        loop {
            let view = views.borrow_and_update().clone();
            assert_distributions_sum(&view);
            if predicate(&view) {
                return Ok(view);
            }
            views
                .changed()
                .await
                .context("tracker stopped publishing")?;
        }
    })
    .await
    .context("timed out waiting for tracker view")?
}

pub fn visible_blocks(view: &TrackerView) -> Vec<u64> {
    view.blocks.iter().map(|block| block.block_number).collect()
}

pub fn ensure_visible(view: &TrackerView, block_number: u64) -> Result<()> {
    ensure!(
        view.block(block_number).is_some(),
        "block {block_number} not visible: {:?}",
        visible_blocks(view)
    );
    Ok(())
}
