//! Weighted scenario step selection.
//!
//! [`ScenarioSelector`] precomputes cumulative weights once and picks a step
//! per iteration with a binary search over that table. Selection is stateless:
//! each virtual user passes its own RNG, so there is no shared lock on the
//! hot path.

use rand::prelude::*;

use crate::config::{TestConfig, TestStep};

/// Weighted random chooser over the steps of a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSelector {
    steps: Vec<TestStep>,
    /// `cumulative[i]` is the sum of effective weights of `steps[..=i]`.
    cumulative: Vec<u64>,
}

impl ScenarioSelector {
    /// Builds a selector over `steps`, or over a single step synthesized from
    /// `config` when `steps` is empty.
    pub fn new(config: &TestConfig, steps: &[TestStep]) -> Self {
        let steps = if steps.is_empty() {
            vec![TestStep::from_config(config)]
        } else {
            steps.to_vec()
        };
        let cumulative = steps
            .iter()
            .scan(0u64, |total, step| {
                *total = total.saturating_add(step.effective_weight());
                Some(*total)
            })
            .collect();
        Self { steps, cumulative }
    }

    /// Sum of all effective weights.
    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Returns the step owning `roll`, where `roll` is in `0..total_weight()`.
    ///
    /// Rolls past the end map to the last step.
    pub fn pick_at(&self, roll: u64) -> &TestStep {
        let idx = self
            .cumulative
            .partition_point(|&bound| bound <= roll)
            .min(self.steps.len() - 1);
        &self.steps[idx]
    }

    /// Picks a step using the caller's RNG.
    pub fn pick(&self, rng: &mut StdRng) -> &TestStep {
        let roll = rng.random_range(0..self.total_weight());
        self.pick_at(roll)
    }

    /// Picks a step using the thread-local RNG.
    pub fn next(&self) -> &TestStep {
        let roll = rand::rng().random_range(0..self.total_weight());
        self.pick_at(roll)
    }
}
