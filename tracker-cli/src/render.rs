use anyhow::{Context, Result};
use proof_tracker::{BlockSummary, ProofView, StatusDistribution, TrackerView};

pub fn print_view(view: &TrackerView, json: bool) -> Result<()> {
    if json {
        let rendered = serde_json::to_string(view).context("failed to serialize view")?;
        println!("{rendered}");
        return Ok(());
    }
    for block in &view.blocks {
        print_block_text(block);
    }
    Ok(())
}

pub fn print_block(summary: &BlockSummary, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(summary).context("failed to serialize block summary")?;
        println!("{rendered}");
        return Ok(());
    }
    print_block_text(summary);
    Ok(())
}

fn print_block_text(block: &BlockSummary) {
    println!(
        "block {} ({} proofs): {}",
        block.block_number, block.total_proofs, block.distribution
    );
    for proof in &block.proofs {
        println!("  {}", proof_line(proof));
    }
}

fn proof_line(view: &ProofView) -> String {
    let mut line = format!(
        "proof {} [{} / {}] {}",
        view.record.proof_id, view.record.team_id, view.record.cluster_id, view.display
    );
    if let Some(state) = &view.verification {
        let download = state.download();
        if !download.complete() {
            line.push_str(&format!(" {:.0}%", download.percent));
        }
        if let Some(duration) = state.verify_duration() {
            line.push_str(&format!(" verified in {} ms", duration.as_millis()));
        }
        if let Some(message) = state.error_message() {
            line.push_str(&format!(" ({message})"));
        }
    }
    line
}

/// Prints the view only when a block's status distribution moved, so download
/// progress ticks do not flood the terminal.
pub struct ViewPrinter {
    json: bool,
    last: Vec<(u64, StatusDistribution)>,
}

impl ViewPrinter {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            last: Vec::new(),
        }
    }

    pub fn print_if_changed(&mut self, view: &TrackerView) -> Result<()> {
        let current: Vec<(u64, StatusDistribution)> = view
            .blocks
            .iter()
            .map(|block| (block.block_number, block.distribution.clone()))
            .collect();
        if current == self.last {
            return Ok(());
        }
        self.last = current;
        print_view(view, self.json)
    }
}
