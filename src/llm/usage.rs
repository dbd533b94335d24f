use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// USD per million tokens.
const INPUT_COST_PER_M: f64 = 0.50;
const OUTPUT_COST_PER_M: f64 = 3.00;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

impl Usage {
    pub fn cost(&self) -> f64 {
        cost_of(self.input_tokens, self.output_tokens)
    }
}

fn cost_of(input: u64, output: u64) -> f64 {
    (input as f64 * INPUT_COST_PER_M + output as f64 * OUTPUT_COST_PER_M) / 1_000_000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub sample_count: usize,
    pub total_count: usize,
    pub per_item_input: u64,
    pub per_item_output: u64,
    pub estimated_input: u64,
    pub estimated_output: u64,
    pub estimated_cost_usd: f64,
}

/// Token accumulator owned by one operation or batch run. Workers record into
/// it through a shared reference.
#[derive(Debug, Default)]
pub struct UsageLedger {
    input: AtomicU64,
    output: AtomicU64,
    calls: AtomicU64,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: Usage) {
        self.input.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output.fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.calls.fetch_add(usage.calls, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Usage {
        Usage {
            input_tokens: self.input.load(Ordering::Relaxed),
            output_tokens: self.output.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }

    pub fn summary(&self) -> UsageSummary {
        let usage = self.snapshot();
        UsageSummary {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            calls: usage.calls,
            cost_usd: round4(usage.cost()),
        }
    }

    /// Scales what this ledger recorded over `sample_count` items up to a run
    /// over `total_count` items.
    pub fn project(&self, sample_count: usize, total_count: usize) -> Option<CostEstimate> {
        if sample_count == 0 {
            return None;
        }
        let usage = self.snapshot();
        let per_item_input = usage.input_tokens / sample_count as u64;
        let per_item_output = usage.output_tokens / sample_count as u64;
        let estimated_input =
            (usage.input_tokens as f64 / sample_count as f64 * total_count as f64) as u64;
        let estimated_output =
            (usage.output_tokens as f64 / sample_count as f64 * total_count as f64) as u64;
        Some(CostEstimate {
            sample_count,
            total_count,
            per_item_input,
            per_item_output,
            estimated_input,
            estimated_output,
            estimated_cost_usd: round4(cost_of(estimated_input, estimated_output)),
        })
    }
}
