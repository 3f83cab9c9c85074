//! Realtime change bridge.
//!
//! Every change notification triggers a refetch of the whole window; nothing
//! is patched incrementally. Notifications that arrive while a refetch is in
//! flight collapse into a single follow-up refetch.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use api_types::changes::ChangeEvent;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    sync::{Notify, broadcast, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    records::{RecordsClient, RecordsError},
    store::{ProofRecordStore, ProofSnapshot},
};

const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ChangeFeedError {
    #[error("change feed is closed")]
    Closed,
    #[error("failed to subscribe to change feed: {0}")]
    Subscribe(String),
}

/// Source of realtime change notifications for proofs and blocks.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeSubscription, ChangeFeedError>;
}

/// A live subscription. Dropping it unsubscribes.
pub struct ChangeSubscription {
    events: broadcast::Receiver<ChangeEvent>,
    pump: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    pub fn new(events: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { events, pump: None }
    }

    /// Subscription fed by a background task that lives as long as it does.
    pub fn with_pump(events: broadcast::Receiver<ChangeEvent>, pump: JoinHandle<()>) -> Self {
        Self {
            events,
            pump: Some(pump),
        }
    }

    /// Next notification, or `None` once the feed has closed. Overflow is
    /// reported as a change since all that matters is that something changed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        match self.events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("change feed lagged by {skipped} notifications");
                Some(ChangeEvent::proof_updated())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// In-process feed. Whoever observes the storage layer publishes into it.
#[derive(Clone, Debug)]
pub struct ChannelChangeFeed {
    sender: Arc<Mutex<Option<broadcast::Sender<ChangeEvent>>>>,
}

impl ChannelChangeFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .as_ref()
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    /// Ends every subscription and rejects new ones.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

impl Default for ChannelChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
    async fn subscribe(&self) -> Result<ChangeSubscription, ChangeFeedError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = guard.as_ref().ok_or(ChangeFeedError::Closed)?;
        Ok(ChangeSubscription::new(sender.subscribe()))
    }
}

/// Feed for transports without push notifications: reports a change every
/// `period`.
#[derive(Clone, Debug)]
pub struct IntervalChangeFeed {
    period: Duration,
}

impl IntervalChangeFeed {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

#[async_trait]
impl ChangeFeed for IntervalChangeFeed {
    async fn subscribe(&self) -> Result<ChangeSubscription, ChangeFeedError> {
        if self.period.is_zero() {
            return Err(ChangeFeedError::Subscribe(
                "poll interval must be greater than zero".to_owned(),
            ));
        }

        let (sender, receiver) = broadcast::channel(1);
        let period = self.period;
        let pump = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if sender.send(ChangeEvent::proof_updated()).is_err() {
                    break;
                }
            }
        });

        Ok(ChangeSubscription::with_pump(receiver, pump))
    }
}

/// Keeps the store in sync with the records service.
pub struct ChangeBridge {
    records: Arc<dyn RecordsClient>,
    store: ProofRecordStore,
    window: usize,
}

impl ChangeBridge {
    pub fn new(records: Arc<dyn RecordsClient>, store: ProofRecordStore, window: usize) -> Self {
        Self {
            records,
            store,
            window,
        }
    }

    /// Fetches the newest window and replaces the store wholesale.
    pub async fn refetch_once(&self) -> Result<Arc<ProofSnapshot>, RecordsError> {
        let blocks = self.records.fetch_proofs_window(self.window).await?;
        let snapshot = ProofSnapshot::new(blocks);
        debug!(
            "refetched {} blocks with {} proofs",
            snapshot.len(),
            snapshot.proof_count()
        );
        self.store.replace(snapshot);
        Ok(self.store.snapshot())
    }

    /// Subscribes to `feed` and keeps refetching until the handle is dropped.
    /// An initial refetch is issued right away.
    pub fn spawn(self, feed: Arc<dyn ChangeFeed>) -> BridgeHandle {
        let (refreshed_tx, refreshed) = watch::channel(0u64);
        let pending = Arc::new(Notify::new());
        pending.notify_one();

        let refetcher = tokio::spawn(refetch_loop(self, Arc::clone(&pending), refreshed_tx));
        let listener = tokio::spawn(listen(feed, pending));

        BridgeHandle {
            refreshed,
            listener,
            refetcher,
        }
    }
}

async fn refetch_loop(bridge: ChangeBridge, pending: Arc<Notify>, refreshed: watch::Sender<u64>) {
    let mut generation = 0u64;
    loop {
        pending.notified().await;
        match bridge.refetch_once().await {
            Ok(_) => {
                generation += 1;
                refreshed.send_replace(generation);
            }
            Err(err) => {
                error!("failed to refetch proofs window: {err:?}");
            }
        }
    }
}

async fn listen(feed: Arc<dyn ChangeFeed>, pending: Arc<Notify>) {
    let mut subscription = match feed.subscribe().await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!("change feed unavailable, serving last known snapshot: {err}");
            return;
        }
    };
    info!("subscribed to change feed");

    while let Some(event) = subscription.recv().await {
        debug!("change notification: {:?} {:?}", event.entity, event.kind);
        pending.notify_one();
    }

    warn!("change feed closed, serving last known snapshot");
}

/// Running bridge. Dropping it stops both the listener and the refetcher.
pub struct BridgeHandle {
    refreshed: watch::Receiver<u64>,
    listener: JoinHandle<()>,
    refetcher: JoinHandle<()>,
}

impl BridgeHandle {
    /// Bumped after every successful refetch.
    pub fn refreshed(&self) -> watch::Receiver<u64> {
        self.refreshed.clone()
    }

    pub fn generation(&self) -> u64 {
        *self.refreshed.borrow()
    }

    /// The feed has closed or could not be subscribed to.
    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.listener.abort();
        self.refetcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TestRecordsClient;
    use api_types::proofs::BlockRecord;
    use chrono::Utc;

    fn block(block_number: u64) -> BlockRecord {
        BlockRecord {
            block_number,
            timestamp: Utc::now(),
            proofs: Vec::new(),
        }
    }

    async fn wait_for_generation(rx: &mut watch::Receiver<u64>, generation: u64) {
        while *rx.borrow_and_update() < generation {
            rx.changed().await.expect("bridge running");
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_refetch_populates_store() {
        let records = TestRecordsClient::new();
        records.set_blocks(vec![block(1), block(2)]).await;
        let store = ProofRecordStore::new();

        let handle = ChangeBridge::new(Arc::new(records.clone()), store.clone(), 3)
            .spawn(Arc::new(ChannelChangeFeed::new()));
        let mut refreshed = handle.refreshed();
        wait_for_generation(&mut refreshed, 1).await;

        assert_eq!(store.snapshot().len(), 2);
        assert_eq!(records.window_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_during_refetch_collapses_into_one() {
        let records = TestRecordsClient::new();
        records.set_blocks(vec![block(1)]).await;
        records.hold();
        let feed = ChannelChangeFeed::new();
        let store = ProofRecordStore::new();

        let handle = ChangeBridge::new(Arc::new(records.clone()), store.clone(), 3)
            .spawn(Arc::new(feed.clone()));
        settle().await;
        assert_eq!(records.window_calls(), 1);

        for _ in 0..5 {
            assert_eq!(feed.publish(ChangeEvent::proof_updated()), 1);
        }
        settle().await;

        records.release();
        let mut refreshed = handle.refreshed();
        wait_for_generation(&mut refreshed, 2).await;
        settle().await;

        assert_eq!(records.window_calls(), 2);
        assert_eq!(handle.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_keeps_previous_snapshot() {
        let records = TestRecordsClient::new();
        records.set_blocks(vec![block(5)]).await;
        let feed = ChannelChangeFeed::new();
        let store = ProofRecordStore::new();

        let handle = ChangeBridge::new(Arc::new(records.clone()), store.clone(), 3)
            .spawn(Arc::new(feed.clone()));
        let mut refreshed = handle.refreshed();
        wait_for_generation(&mut refreshed, 1).await;

        records
            .enqueue_failure(RecordsError::Unavailable("maintenance".to_owned()))
            .await;
        records.set_blocks(vec![block(5), block(6)]).await;
        feed.publish(ChangeEvent::block_inserted());
        settle().await;

        assert_eq!(handle.generation(), 1);
        assert_eq!(store.snapshot().len(), 1);

        feed.publish(ChangeEvent::proof_updated());
        wait_for_generation(&mut refreshed, 2).await;
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_feed_stops_listening_only() {
        let records = TestRecordsClient::new();
        records.set_blocks(vec![block(9)]).await;
        let feed = ChannelChangeFeed::new();

        let handle = ChangeBridge::new(Arc::new(records.clone()), ProofRecordStore::new(), 3)
            .spawn(Arc::new(feed.clone()));
        settle().await;
        assert!(handle.is_listening());

        feed.close();
        settle().await;
        assert!(!handle.is_listening());
        assert_eq!(handle.generation(), 1);
        assert!(feed.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn lagged_subscription_still_reports_a_change() {
        let feed = ChannelChangeFeed::with_capacity(1);
        let mut subscription = feed.subscribe().await.expect("subscribe");
        for _ in 0..4 {
            feed.publish(ChangeEvent::block_inserted());
        }

        let event = subscription.recv().await.expect("lagged");
        assert_eq!(event, ChangeEvent::proof_updated());
        let event = subscription.recv().await.expect("newest event");
        assert_eq!(event, ChangeEvent::block_inserted());
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_feed_still_triggers_refetch() {
        let records = TestRecordsClient::new();
        records.set_blocks(vec![block(1)]).await;
        let feed = ChannelChangeFeed::with_capacity(1);
        let store = ProofRecordStore::new();

        let handle = ChangeBridge::new(Arc::new(records.clone()), store.clone(), 3)
            .spawn(Arc::new(feed.clone()));
        let mut refreshed = handle.refreshed();
        wait_for_generation(&mut refreshed, 1).await;

        records.set_blocks(vec![block(1), block(2)]).await;
        for _ in 0..8 {
            feed.publish(ChangeEvent::block_inserted());
        }
        wait_for_generation(&mut refreshed, 2).await;

        assert!(records.window_calls() >= 2);
        assert_eq!(store.snapshot().len(), 2);
        assert!(handle.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_feed_ticks_until_dropped() {
        let feed = IntervalChangeFeed::new(Duration::from_secs(1));
        let mut subscription = feed.subscribe().await.expect("subscribe");

        let event = subscription.recv().await.expect("tick");
        assert_eq!(event, ChangeEvent::proof_updated());

        assert!(
            IntervalChangeFeed::new(Duration::ZERO)
                .subscribe()
                .await
                .is_err()
        );
    }
}
