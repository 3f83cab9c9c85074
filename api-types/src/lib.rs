pub mod proofs {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, PickFirst, serde_as};
    use std::{fmt, str::FromStr};

    pub type ProofId = u64;

    /// Server-side proof lifecycle. Written by the prover teams, only ever
    /// observed by this system.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[serde(rename_all = "snake_case")]
    pub enum ProofStatus {
        Queued,
        Proving,
        Proved,
    }

    impl ProofStatus {
        pub fn is_proved(self) -> bool {
            matches!(self, ProofStatus::Proved)
        }
    }

    impl fmt::Display for ProofStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ProofStatus::Queued => write!(f, "queued"),
                ProofStatus::Proving => write!(f, "proving"),
                ProofStatus::Proved => write!(f, "proved"),
            }
        }
    }

    impl FromStr for ProofStatus {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value {
                "queued" => Ok(ProofStatus::Queued),
                "proving" => Ok(ProofStatus::Proving),
                "proved" => Ok(ProofStatus::Proved),
                other => Err(format!("unsupported proof status '{other}'")),
            }
        }
    }

    /// The single user-facing status of a proof. The string forms are a
    /// stable contract for presentation consumers.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[serde(rename_all = "snake_case")]
    pub enum DisplayStatus {
        Queued,
        Proving,
        Proved,
        Downloading,
        Verifying,
        Success,
        Failed,
        Error,
    }

    impl DisplayStatus {
        pub const ALL: [DisplayStatus; 8] = [
            DisplayStatus::Queued,
            DisplayStatus::Proving,
            DisplayStatus::Proved,
            DisplayStatus::Downloading,
            DisplayStatus::Verifying,
            DisplayStatus::Success,
            DisplayStatus::Failed,
            DisplayStatus::Error,
        ];

        /// Client verification has finished, one way or the other.
        pub fn is_terminal(self) -> bool {
            matches!(
                self,
                DisplayStatus::Success | DisplayStatus::Failed | DisplayStatus::Error
            )
        }
    }

    impl fmt::Display for DisplayStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let value = match self {
                DisplayStatus::Queued => "queued",
                DisplayStatus::Proving => "proving",
                DisplayStatus::Proved => "proved",
                DisplayStatus::Downloading => "downloading",
                DisplayStatus::Verifying => "verifying",
                DisplayStatus::Success => "success",
                DisplayStatus::Failed => "failed",
                DisplayStatus::Error => "error",
            };
            f.write_str(value)
        }
    }

    impl FromStr for DisplayStatus {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            DisplayStatus::ALL
                .into_iter()
                .find(|status| status.to_string() == value)
                .ok_or_else(|| format!("unsupported display status '{value}'"))
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ProofRecord {
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub proof_id: ProofId,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub block_number: u64,
        pub cluster_id: String,
        pub team_id: String,
        pub status: ProofStatus,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub size_bytes: Option<u64>,
        #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
        #[serde(default)]
        pub proving_time_ms: Option<u64>,
        #[serde(default)]
        pub queued_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub proving_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub proved_at: Option<DateTime<Utc>>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct BlockRecord {
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub block_number: u64,
        pub timestamp: DateTime<Utc>,
        #[serde(default)]
        pub proofs: Vec<ProofRecord>,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "snake_case")]
    pub enum ArtifactKind {
        Proof,
        Vkey,
    }

    impl fmt::Display for ArtifactKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ArtifactKind::Proof => write!(f, "proof"),
                ArtifactKind::Vkey => write!(f, "vkey"),
            }
        }
    }

    impl FromStr for ArtifactKind {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value {
                "proof" => Ok(ArtifactKind::Proof),
                "vkey" => Ok(ArtifactKind::Vkey),
                other => Err(format!("unsupported artifact kind '{other}'")),
            }
        }
    }
}

pub mod changes {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "snake_case")]
    pub enum ChangeEntity {
        Proof,
        Block,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "snake_case")]
    pub enum ChangeKind {
        Insert,
        Update,
    }

    /// A realtime notification. Carries no payload beyond "something changed".
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    pub struct ChangeEvent {
        pub entity: ChangeEntity,
        pub kind: ChangeKind,
    }

    impl ChangeEvent {
        pub fn new(entity: ChangeEntity, kind: ChangeKind) -> Self {
            Self { entity, kind }
        }

        pub fn proof_updated() -> Self {
            Self::new(ChangeEntity::Proof, ChangeKind::Update)
        }

        pub fn block_inserted() -> Self {
            Self::new(ChangeEntity::Block, ChangeKind::Insert)
        }
    }
}

pub mod verifier {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct VerifyRequest {
        /// Base64 encoded proof bytes.
        pub proof: String,
        /// Base64 encoded verification key bytes.
        pub vkey: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct VerifyResponse {
        pub is_valid: bool,
        #[serde(default)]
        pub duration_ms: f64,
    }
}
