//! Consensus time calculation
//!
//! Turns the received times reported by peers into an agreed timestamp and
//! decides whether an event's claimed time is trustworthy. The decision
//! chain is, in order:
//!
//! 1. Participation below quorum: no decision.
//! 2. Most frequent exact value reaching quorum.
//! 3. Votes within tolerance of the claimed time reaching quorum: accept.
//! 4. Votes outside tolerance reaching quorum: reject at the mean.
//! 5. Mean of the values within one standard deviation of the mean.
//!
//! Shares in steps 2-4 are taken over the votes cast.

use std::collections::HashMap;

/// Default fraction of expected voters needed for a binding decision.
pub const DEFAULT_QUORUM: f64 = 0.66;

/// A consensus decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusTime {
    pub consensus_time: f64,
    /// Whether the claimed time agrees with the consensus
    pub acceptable: bool,
}

impl ConsensusTime {
    fn range_tested(consensus_time: f64, claimed: f64, tolerance: f64) -> Self {
        Self {
            consensus_time,
            acceptable: (consensus_time - claimed).abs() <= tolerance,
        }
    }
}

/// Calculate the consensus time for one event.
///
/// Returns `None` when fewer than `quorum` of `total_peers` have voted; the
/// caller waits for more votes or forces a decision later.
pub fn calculate_consensus_time(
    timestamps: &[f64],
    total_peers: usize,
    claimed: f64,
    tolerance: f64,
    quorum: f64,
) -> Option<ConsensusTime> {
    if timestamps.is_empty() || total_peers == 0 {
        return None;
    }
    if (timestamps.len() as f64) / (total_peers as f64) < quorum {
        return None;
    }

    let votes = timestamps.len() as f64;

    // Most frequent exact value
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for t in timestamps {
        *counts.entry(t.to_bits()).or_insert(0) += 1;
    }
    if let Some((bits, count)) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
    {
        if (*count as f64) / votes >= quorum {
            return Some(ConsensusTime::range_tested(
                f64::from_bits(*bits),
                claimed,
                tolerance,
            ));
        }
    }

    let affirmative = timestamps
        .iter()
        .filter(|t| (**t - claimed).abs() <= tolerance)
        .count() as f64;
    if affirmative / votes >= quorum {
        return Some(ConsensusTime {
            consensus_time: claimed,
            acceptable: true,
        });
    }

    let raw_mean = mean(timestamps);
    if (votes - affirmative) / votes >= quorum {
        return Some(ConsensusTime {
            consensus_time: raw_mean,
            acceptable: false,
        });
    }

    // Trimmed mean: drop values further than one population standard deviation
    let variance = timestamps
        .iter()
        .map(|t| (t - raw_mean).powi(2))
        .sum::<f64>()
        / votes;
    let std_dev = variance.sqrt();
    let trimmed: Vec<f64> = timestamps
        .iter()
        .copied()
        .filter(|t| (t - raw_mean).abs() <= std_dev)
        .collect();

    let consensus_time = if trimmed.len() >= 2 {
        mean(&trimmed)
    } else {
        raw_mean
    };
    Some(ConsensusTime::range_tested(consensus_time, claimed, tolerance))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
