use std::collections::HashMap;

use lib_votes::Vote;
use tokio::sync::mpsc;

/// Running vote counts, kept for the shutdown summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VoteCounts {
    pub total: u64,
    pub per_option: HashMap<String, u64>,
}

impl VoteCounts {
    fn record(&mut self, vote: Vote) -> u64 {
        self.total += 1;
        let count = self.per_option.entry(vote.option).or_insert(0);
        *count += 1;
        *count
    }
}

/// Drains the vote channel until every producer is gone, logging each vote.
pub async fn run(mut votes: mpsc::Receiver<Vote>) -> VoteCounts {
    let mut counts = VoteCounts::default();
    while let Some(vote) = votes.recv().await {
        let option = vote.option.clone();
        let count = counts.record(vote);
        log::info!("Vote for '{}' ({} so far, {} total)", option, count, counts.total);
    }

    let mut summary: Vec<_> = counts.per_option.iter().collect();
    summary.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    log::info!("Vote channel closed after {} votes: {:?}", counts.total, summary);
    counts
}
