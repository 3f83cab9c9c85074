use std::{sync::Arc, time::Duration};

mod render;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use proof_tracker::{
    ChangeBridge, IntervalChangeFeed, ProofRecordStore, ProofTracker, SystemClock, TrackerConfig,
    artifacts::HttpArtifactClient, records::HttpRecordsClient, verifier::HttpVerifierClient,
    verify_block,
};
use reqwest::Url;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about = "Follows block proofs and verifies them locally")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Records service base URL serving blocks and their proofs.
    #[arg(long, env = "RECORDS_URL", value_name = "URL", required = true)]
    records_url: Url,

    /// Artifact store base URL serving proof and verification key bytes.
    #[arg(long, env = "ARTIFACTS_URL", value_name = "URL", required = true)]
    artifacts_url: Url,

    /// Verifier service base URL.
    #[arg(long, env = "VERIFIER_URL", value_name = "URL", required = true)]
    verifier_url: Url,

    /// Print JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the newest blocks and verify proofs as they become proved.
    Watch(WatchArgs),
    /// Verify every proved proof of a single block and exit.
    VerifyBlock {
        /// Block number to verify.
        block_number: u64,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Interval between refetches of the block window.
    #[arg(
        long,
        env = "POLL_INTERVAL_MS",
        value_name = "MILLIS",
        default_value_t = 2_000
    )]
    poll_interval_ms: u64,

    /// Fetch once, wait for verification to finish, print and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Upper bound on how long `--once` waits for verification.
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    settle_timeout_secs: u64,
}

struct Collaborators {
    records: Arc<HttpRecordsClient>,
    artifacts: Arc<HttpArtifactClient>,
    verifier: Arc<HttpVerifierClient>,
}

impl Collaborators {
    fn connect(common: &CommonArgs) -> Result<Self> {
        let records = HttpRecordsClient::new(common.records_url.clone())
            .context("failed to construct records client")?;
        let artifacts = HttpArtifactClient::new(common.artifacts_url.clone())
            .context("failed to construct artifact client")?;
        let verifier = HttpVerifierClient::new(common.verifier_url.clone())
            .context("failed to construct verifier client")?;
        Ok(Self {
            records: Arc::new(records),
            artifacts: Arc::new(artifacts),
            verifier: Arc::new(verifier),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = TrackerConfig::from_env().context("invalid tracker configuration")?;
    let collaborators = Collaborators::connect(&cli.common)?;

    match cli.command {
        Command::Watch(args) => watch(collaborators, &config, args, cli.common.json).await,
        Command::VerifyBlock { block_number } => {
            let summary = verify_block(
                collaborators.records.as_ref(),
                collaborators.artifacts,
                collaborators.verifier,
                config.download_timing(),
                block_number,
            )
            .await
            .with_context(|| format!("failed to verify block {block_number}"))?;
            render::print_block(&summary, cli.common.json)
        }
    }
}

async fn watch(
    collaborators: Collaborators,
    config: &TrackerConfig,
    args: WatchArgs,
    json: bool,
) -> Result<()> {
    if args.poll_interval_ms == 0 {
        bail!("POLL_INTERVAL_MS must be greater than zero");
    }

    let store = ProofRecordStore::new();
    let mut tracker = ProofTracker::new(
        store.clone(),
        collaborators.artifacts,
        collaborators.verifier,
        config,
        Arc::new(SystemClock),
    );
    let bridge = ChangeBridge::new(collaborators.records, store, config.max_visible_blocks);

    if args.once {
        bridge
            .refetch_once()
            .await
            .context("failed to fetch proofs window")?;
        let view = timeout(Duration::from_secs(args.settle_timeout_secs), tracker.settle())
            .await
            .context("timed out waiting for verification to finish")?;
        return render::print_view(&view, json);
    }

    let feed = IntervalChangeFeed::new(Duration::from_millis(args.poll_interval_ms));
    let handle = bridge.spawn(Arc::new(feed));
    let mut views = tracker.subscribe();
    let runner = tokio::spawn(tracker.run(handle.refreshed()));
    info!(
        "watching newest {} blocks, polling every {} ms",
        config.max_visible_blocks, args.poll_interval_ms
    );

    let mut printer = render::ViewPrinter::new(json);
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    warn!("tracker stopped");
                    break;
                }
                let view = views.borrow_and_update().clone();
                printer.print_if_changed(&view)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
        }
    }

    runner.abort();
    Ok(())
}
