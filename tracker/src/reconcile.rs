use api_types::proofs::{DisplayStatus, ProofStatus};

use crate::verification::{VerificationPhase, VerificationState};

/// Merges the server lifecycle with the local verification outcome into the
/// single status shown for a proof.
///
/// Until the server reports `proved` the session is ignored, so a stale
/// session can never mask a lifecycle restart.
pub fn reconcile(status: ProofStatus, session: Option<&VerificationState>) -> DisplayStatus {
    match status {
        ProofStatus::Queued => DisplayStatus::Queued,
        ProofStatus::Proving => DisplayStatus::Proving,
        ProofStatus::Proved => match session.map(VerificationState::phase) {
            None | Some(VerificationPhase::Idle) => DisplayStatus::Proved,
            Some(VerificationPhase::Downloading) => DisplayStatus::Downloading,
            Some(VerificationPhase::Verifying) => DisplayStatus::Verifying,
            Some(VerificationPhase::Success) => DisplayStatus::Success,
            Some(VerificationPhase::Failed) => DisplayStatus::Failed,
            Some(VerificationPhase::Error) => DisplayStatus::Error,
        },
    }
}
