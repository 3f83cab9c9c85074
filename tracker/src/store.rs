use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use api_types::proofs::BlockRecord;

/// Immutable view of the proofs known for the current window, keyed by block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofSnapshot {
    blocks: BTreeMap<u64, BlockRecord>,
}

impl ProofSnapshot {
    pub fn new(blocks: impl IntoIterator<Item = BlockRecord>) -> Self {
        let mut by_number = BTreeMap::new();
        for block in blocks {
            by_number.insert(block.block_number, block);
        }
        Self { blocks: by_number }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, block_number: u64) -> Option<&BlockRecord> {
        self.blocks.get(&block_number)
    }

    pub fn newest_block(&self) -> Option<&BlockRecord> {
        self.blocks.values().next_back()
    }

    /// Blocks ordered by descending block number.
    pub fn newest_first(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values().rev()
    }

    pub fn contains_block(&self, block_number: u64) -> bool {
        self.blocks.contains_key(&block_number)
    }

    pub fn proof_count(&self) -> usize {
        self.blocks.values().map(|block| block.proofs.len()).sum()
    }
}

/// Holds the latest snapshot. Refetches replace it wholesale.
#[derive(Debug, Clone, Default)]
pub struct ProofRecordStore {
    current: Arc<RwLock<Arc<ProofSnapshot>>>,
}

impl ProofRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ProofSnapshot> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, snapshot: ProofSnapshot) {
        let next = Arc::new(snapshot);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_types::proofs::{ProofId, ProofRecord, ProofStatus};
    use chrono::Utc;

    fn proof(proof_id: ProofId, block_number: u64) -> ProofRecord {
        ProofRecord {
            proof_id,
            block_number,
            cluster_id: "cluster".to_owned(),
            team_id: "team".to_owned(),
            status: ProofStatus::Queued,
            size_bytes: None,
            proving_time_ms: None,
            queued_at: None,
            proving_at: None,
            proved_at: None,
        }
    }

    fn block(block_number: u64, proofs: Vec<ProofRecord>) -> BlockRecord {
        BlockRecord {
            block_number,
            timestamp: Utc::now(),
            proofs,
        }
    }

    #[test]
    fn snapshot_orders_newest_first() {
        let snapshot = ProofSnapshot::new(vec![
            block(100, vec![proof(1, 100)]),
            block(102, vec![proof(3, 102)]),
            block(101, vec![proof(2, 101)]),
        ]);
        let order: Vec<u64> = snapshot.newest_first().map(|b| b.block_number).collect();
        assert_eq!(order, vec![102, 101, 100]);
        assert_eq!(snapshot.newest_block().map(|b| b.block_number), Some(102));
        assert_eq!(snapshot.proof_count(), 3);
    }

    #[test]
    fn replace_does_not_touch_previous_readers() {
        let store = ProofRecordStore::new();
        store.replace(ProofSnapshot::new(vec![block(1, vec![proof(1, 1)])]));
        let before = store.snapshot();

        store.replace(ProofSnapshot::new(vec![block(2, vec![])]));

        assert!(before.contains_block(1));
        assert!(!before.contains_block(2));
        let after = store.snapshot();
        assert!(after.contains_block(2));
        assert!(!after.contains_block(1));
    }
}
