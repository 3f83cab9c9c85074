pub mod aggregator;
pub mod artifacts;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod download;
pub mod errors;
pub mod reconcile;
pub mod records;
pub mod store;
pub mod tracker;
pub mod verification;
pub mod verifier;

pub use api_types::{
    changes::{ChangeEntity, ChangeEvent, ChangeKind},
    proofs::{ArtifactKind, BlockRecord, DisplayStatus, ProofId, ProofRecord, ProofStatus},
};
pub use aggregator::{BlockAggregator, BlockSummary, ProofView, StatusDistribution};
pub use bridge::{BridgeHandle, ChangeBridge, ChangeFeed, ChannelChangeFeed, IntervalChangeFeed};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use download::{DownloadProgress, DownloadTiming};
pub use errors::TrackerError;
pub use reconcile::reconcile;
pub use store::{ProofRecordStore, ProofSnapshot};
pub use tracker::{ProofTracker, TrackerView, verify_block};
pub use verification::{
    SessionContext, SessionHandle, VerificationPhase, VerificationSession, VerificationState,
};

use reqwest::Url;
use tokio::sync::watch;

/// Ensures `base_url` ends with `/` so relative joins keep its path.
pub(crate) fn normalize_base_url(base_url: Url) -> Url {
    let mut normalized = base_url;
    if !normalized.path().ends_with('/') {
        let mut path = normalized.path().trim_end_matches('/').to_owned();
        path.push('/');
        normalized.set_path(&path);
    }
    normalized
}

/// Waits until the flag equals `expected`. Returns `false` if the sender
/// went away first.
pub(crate) async fn wait_for_flag(rx: &mut watch::Receiver<bool>, expected: bool) -> bool {
    loop {
        let current = *rx.borrow_and_update();
        if current == expected {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}
