use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use api_types::proofs::{BlockRecord, DisplayStatus, ProofRecord};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::{clock::Clock, store::ProofSnapshot, verification::VerificationState};

/// Number of proofs of a block in each display status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusDistribution {
    counts: BTreeMap<DisplayStatus, usize>,
}

impl StatusDistribution {
    pub fn from_statuses(statuses: impl IntoIterator<Item = DisplayStatus>) -> Self {
        let mut distribution = Self::default();
        for status in statuses {
            *distribution.counts.entry(status).or_insert(0) += 1;
        }
        distribution
    }

    pub fn count(&self, status: DisplayStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Non-zero buckets in display order.
    pub fn iter(&self) -> impl Iterator<Item = (DisplayStatus, usize)> + '_ {
        self.counts.iter().map(|(status, count)| (*status, *count))
    }
}

impl fmt::Display for StatusDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (status, count) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{status}={count}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProofView {
    pub record: ProofRecord,
    pub display: DisplayStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockSummary {
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub total_proofs: usize,
    pub distribution: StatusDistribution,
    /// Every proof has been observed `proved` at least once.
    pub fully_proved: bool,
    pub proofs: Vec<ProofView>,
}

impl BlockSummary {
    pub fn new(block: &BlockRecord, fully_proved: bool, proofs: Vec<ProofView>) -> Self {
        let distribution = StatusDistribution::from_statuses(proofs.iter().map(|p| p.display));
        Self {
            block_number: block.block_number,
            timestamp: block.timestamp,
            total_proofs: proofs.len(),
            distribution,
            fully_proved,
            proofs,
        }
    }
}

/// Decides which blocks are visible and summarizes them.
///
/// Blocks are never removed from the store; the aggregator only hides them.
/// The instant a block is first seen with every proof `proved` is recorded
/// once and never reset. Once a block has been evicted it stays hidden for as
/// long as it remains in the snapshot, so tearing down its sessions cannot
/// bring it back.
pub struct BlockAggregator {
    retention: Duration,
    clock: Arc<dyn Clock>,
    fully_proved_at: HashMap<u64, Instant>,
    evicted: HashSet<u64>,
}

impl BlockAggregator {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention,
            clock,
            fully_proved_at: HashMap::new(),
            evicted: HashSet::new(),
        }
    }

    pub fn fully_proved_at(&self, block_number: u64) -> Option<Instant> {
        self.fully_proved_at.get(&block_number).copied()
    }

    pub fn is_evicted(&self, block_number: u64) -> bool {
        self.evicted.contains(&block_number)
    }

    /// Visible blocks, newest first. `display_of` yields the current display
    /// status of a proof.
    pub fn visible_blocks<'a, F>(
        &mut self,
        snapshot: &'a ProofSnapshot,
        display_of: F,
    ) -> Vec<&'a BlockRecord>
    where
        F: Fn(&ProofRecord) -> DisplayStatus,
    {
        let now = self.clock.now();

        self.fully_proved_at
            .retain(|block_number, _| snapshot.contains_block(*block_number));
        self.evicted
            .retain(|block_number| snapshot.contains_block(*block_number));

        let newest = snapshot.newest_block().map(|block| block.block_number);
        let mut visible = Vec::new();

        for block in snapshot.newest_first() {
            let block_number = block.block_number;
            if all_proved(block) && !self.fully_proved_at.contains_key(&block_number) {
                debug!("block {block_number} fully proved");
                self.fully_proved_at.insert(block_number, now);
            }

            if Some(block_number) == newest {
                visible.push(block);
                continue;
            }
            if self.evicted.contains(&block_number) {
                continue;
            }

            if self.should_retain(block, now, &display_of) {
                visible.push(block);
            } else {
                info!(
                    "block {block_number} evicted after {:?} retention",
                    self.retention
                );
                self.evicted.insert(block_number);
            }
        }

        visible
    }

    pub fn summarize<F>(&self, block: &BlockRecord, view_of: F) -> BlockSummary
    where
        F: Fn(&ProofRecord) -> ProofView,
    {
        let proofs = block.proofs.iter().map(view_of).collect();
        BlockSummary::new(
            block,
            self.fully_proved_at.contains_key(&block.block_number),
            proofs,
        )
    }

    fn should_retain<F>(&self, block: &BlockRecord, now: Instant, display_of: &F) -> bool
    where
        F: Fn(&ProofRecord) -> DisplayStatus,
    {
        let Some(proved_at) = self.fully_proved_at.get(&block.block_number) else {
            return true;
        };
        if block.proofs.iter().any(|proof| !display_of(proof).is_terminal()) {
            return true;
        }
        now.saturating_duration_since(*proved_at) < self.retention
    }
}

pub(crate) fn all_proved(block: &BlockRecord) -> bool {
    !block.proofs.is_empty() && block.proofs.iter().all(|proof| proof.status.is_proved())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use api_types::proofs::ProofStatus;

    fn proof(proof_id: u64, block_number: u64, status: ProofStatus) -> ProofRecord {
        ProofRecord {
            proof_id,
            block_number,
            cluster_id: format!("cluster-{proof_id}"),
            team_id: "team".to_owned(),
            status,
            size_bytes: None,
            proving_time_ms: None,
            queued_at: None,
            proving_at: None,
            proved_at: None,
        }
    }

    fn block(block_number: u64, statuses: &[ProofStatus]) -> BlockRecord {
        BlockRecord {
            block_number,
            timestamp: Utc::now(),
            proofs: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| proof(block_number * 10 + i as u64, block_number, *status))
                .collect(),
        }
    }

    fn aggregator(clock: &ManualClock) -> BlockAggregator {
        BlockAggregator::new(Duration::from_secs(60), Arc::new(clock.clone()))
    }

    fn numbers(blocks: &[&BlockRecord]) -> Vec<u64> {
        blocks.iter().map(|b| b.block_number).collect()
    }

    fn settled(_: &ProofRecord) -> DisplayStatus {
        DisplayStatus::Success
    }

    #[test]
    fn distribution_counts_sum_to_total() {
        let distribution = StatusDistribution::from_statuses([
            DisplayStatus::Queued,
            DisplayStatus::Proving,
            DisplayStatus::Queued,
            DisplayStatus::Error,
        ]);
        assert_eq!(distribution.count(DisplayStatus::Queued), 2);
        assert_eq!(distribution.count(DisplayStatus::Success), 0);
        assert_eq!(distribution.total(), 4);
        assert_eq!(distribution.to_string(), "queued=2 proving=1 error=1");
    }

    #[test]
    fn newest_block_is_always_visible() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let snapshot = ProofSnapshot::new(vec![block(7, &[ProofStatus::Proved])]);

        aggregator.visible_blocks(&snapshot, settled);
        clock.advance(Duration::from_secs(600));
        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![7]);
    }

    #[test]
    fn evicts_after_retention_window() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let snapshot = ProofSnapshot::new(vec![
            block(100, &[ProofStatus::Proved, ProofStatus::Proved]),
            block(101, &[ProofStatus::Queued]),
        ]);

        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101, 100]);

        clock.advance(Duration::from_secs(59));
        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101, 100]);

        clock.advance(Duration::from_secs(2));
        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101]);
        assert!(aggregator.is_evicted(100));

        // Sessions of an evicted block are torn down, so its proofs fall back
        // to `proved`. That must not re-admit the block.
        let visible = aggregator.visible_blocks(&snapshot, |_| DisplayStatus::Proved);
        assert_eq!(numbers(&visible), vec![101]);
    }

    #[test]
    fn in_flight_verification_keeps_block_visible() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let snapshot = ProofSnapshot::new(vec![
            block(100, &[ProofStatus::Proved, ProofStatus::Proved]),
            block(101, &[]),
        ]);
        let first = snapshot.block(100).map(|b| b.proofs[0].proof_id);

        aggregator.visible_blocks(&snapshot, settled);
        clock.advance(Duration::from_secs(300));

        let downloading = |proof: &ProofRecord| {
            if Some(proof.proof_id) == first {
                DisplayStatus::Success
            } else {
                DisplayStatus::Downloading
            }
        };
        let visible = aggregator.visible_blocks(&snapshot, downloading);
        assert_eq!(numbers(&visible), vec![101, 100]);

        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101]);
    }

    #[test]
    fn retention_clock_is_not_reset() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let snapshot = ProofSnapshot::new(vec![
            block(100, &[ProofStatus::Proved]),
            block(101, &[ProofStatus::Proving]),
        ]);

        aggregator.visible_blocks(&snapshot, settled);
        let recorded = aggregator.fully_proved_at(100).expect("recorded");

        clock.advance(Duration::from_secs(30));
        aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(aggregator.fully_proved_at(100), Some(recorded));

        clock.advance(Duration::from_secs(31));
        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101]);
    }

    #[test]
    fn partially_proved_block_never_starts_clock() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let snapshot = ProofSnapshot::new(vec![
            block(100, &[ProofStatus::Proved, ProofStatus::Proving]),
            block(101, &[ProofStatus::Queued]),
        ]);

        clock.advance(Duration::from_secs(3_600));
        let visible = aggregator.visible_blocks(&snapshot, settled);
        assert_eq!(numbers(&visible), vec![101, 100]);
        assert!(aggregator.fully_proved_at(100).is_none());
    }

    #[test]
    fn bookkeeping_is_pruned_when_blocks_leave_the_window() {
        let clock = ManualClock::new();
        let mut aggregator = aggregator(&clock);
        let before = ProofSnapshot::new(vec![
            block(100, &[ProofStatus::Proved]),
            block(101, &[ProofStatus::Queued]),
        ]);
        aggregator.visible_blocks(&before, settled);
        clock.advance(Duration::from_secs(61));
        aggregator.visible_blocks(&before, settled);
        assert!(aggregator.is_evicted(100));

        let after = ProofSnapshot::new(vec![block(101, &[ProofStatus::Queued])]);
        aggregator.visible_blocks(&after, settled);
        assert!(!aggregator.is_evicted(100));
        assert!(aggregator.fully_proved_at(100).is_none());
    }

    #[test]
    fn summary_distribution_matches_proof_count() {
        let clock = ManualClock::new();
        let aggregator = aggregator(&clock);
        let record = block(
            100,
            &[ProofStatus::Queued, ProofStatus::Proving, ProofStatus::Queued],
        );

        let summary = aggregator.summarize(&record, |proof| ProofView {
            record: proof.clone(),
            display: crate::reconcile::reconcile(proof.status, None),
            verification: None,
        });

        assert_eq!(summary.total_proofs, 3);
        assert_eq!(summary.distribution.total(), summary.total_proofs);
        assert_eq!(summary.distribution.count(DisplayStatus::Queued), 2);
        assert_eq!(summary.distribution.count(DisplayStatus::Proving), 1);
        assert!(!summary.fully_proved);
    }
}
