//! # Walk Engine
//!
//! Probabilistic traversal of the relation graph.
//!
//! A walk holds a current composition and an energy budget. Each step
//! gathers the relations incident to the current composition, turns their
//! ratings into weights, samples one and moves to its other endpoint,
//! paying `step_cost`.
//!
//! ## Weights
//!
//! `w = exp((rating - max_rating) / (temperature * RATING_TEMPERATURE_SCALE))`.
//! Low temperature approaches greedy choice of the best-rated relation,
//! high temperature approaches uniform choice. Below `GREEDY_TEMPERATURE`
//! the best-rated candidate is taken outright (ties go to the first in
//! candidate order).
//!
//! ## Termination
//!
//! A walk makes at most `min(max_steps, floor(energy / step_cost))` moves.
//! The terminal state says why it stopped.
//!
//! Given the same seed and the same graph snapshot, a walk is reproducible:
//! candidates are sorted before sampling and the generator is ChaCha8.

use crate::primitives::{GREEDY_TEMPERATURE, MAX_WALK_STEPS, RATING_TEMPERATURE_SCALE};
use crate::types::{ContentHash, SubstrateError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeMap;

/// A relation the walk could take from the current composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalkCandidate {
    pub relation: ContentHash,
    pub target: ContentHash,
    pub rating: i64,
}

/// Read access to relation adjacency.
pub trait RelationGraph {
    /// Every relation incident to `from`, with the endpoint it leads to.
    fn candidates(&self, from: &ContentHash) -> Result<Vec<WalkCandidate>, SubstrateError>;
}

/// In-memory adjacency, keyed by source composition.
impl RelationGraph for BTreeMap<ContentHash, Vec<WalkCandidate>> {
    fn candidates(&self, from: &ContentHash) -> Result<Vec<WalkCandidate>, SubstrateError> {
        Ok(self.get(from).cloned().unwrap_or_default())
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Walk parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkConfig {
    pub energy: f64,
    pub step_cost: f64,
    pub temperature: f64,
    pub max_steps: usize,
    pub seed: u64,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            energy: crate::primitives::DEFAULT_WALK_ENERGY,
            step_cost: crate::primitives::DEFAULT_STEP_COST,
            temperature: crate::primitives::DEFAULT_TEMPERATURE,
            max_steps: MAX_WALK_STEPS,
            seed: 0,
        }
    }
}

impl WalkConfig {
    pub fn validate(&self) -> Result<(), SubstrateError> {
        if !self.energy.is_finite() || self.energy < 0.0 {
            return Err(SubstrateError::InvalidConfig(format!(
                "walk energy must be finite and non-negative, got {}",
                self.energy
            )));
        }
        if !self.step_cost.is_finite() || self.step_cost <= 0.0 {
            return Err(SubstrateError::InvalidConfig(format!(
                "step cost must be finite and positive, got {}",
                self.step_cost
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SubstrateError::InvalidConfig(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if self.max_steps > MAX_WALK_STEPS {
            return Err(SubstrateError::InvalidConfig(format!(
                "max steps must be at most {MAX_WALK_STEPS}, got {}",
                self.max_steps
            )));
        }
        Ok(())
    }

    /// Upper bound on the number of moves of any walk under this config.
    #[must_use]
    pub fn max_step_bound(&self) -> usize {
        let affordable = (self.energy / self.step_cost).floor();
        if affordable >= self.max_steps as f64 {
            self.max_steps
        } else {
            affordable as usize
        }
    }
}

// =============================================================================
// STEPS
// =============================================================================

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalkTermination {
    EnergyExhausted,
    NoCandidates,
    MaxStepsReached,
}

impl WalkTermination {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            WalkTermination::EnergyExhausted => "energy-exhausted",
            WalkTermination::NoCandidates => "no-candidates",
            WalkTermination::MaxStepsReached => "max-steps-reached",
        }
    }
}

/// One move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkStep {
    pub from: ContentHash,
    pub relation: ContentHash,
    pub to: ContentHash,
    pub rating: i64,
    pub remaining_energy: f64,
}

/// Result of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Moved(WalkStep),
    Terminated(WalkTermination),
}

/// A finished walk.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkTrace {
    pub start: ContentHash,
    pub steps: Vec<WalkStep>,
    pub termination: WalkTermination,
}

impl WalkTrace {
    /// Visited compositions, start included.
    #[must_use]
    pub fn path(&self) -> Vec<ContentHash> {
        std::iter::once(self.start)
            .chain(self.steps.iter().map(|s| s.to))
            .collect()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// A walk in progress over `G`.
pub struct WalkEngine<'g, G: RelationGraph> {
    graph: &'g G,
    config: WalkConfig,
    current: ContentHash,
    steps: usize,
    rng: ChaCha8Rng,
    terminated: Option<WalkTermination>,
}

impl<'g, G: RelationGraph> WalkEngine<'g, G> {
    pub fn new(graph: &'g G, start: ContentHash, config: WalkConfig) -> Result<Self, SubstrateError> {
        config.validate()?;
        Ok(Self {
            graph,
            config,
            current: start,
            steps: 0,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            terminated: None,
        })
    }

    #[must_use]
    pub fn current(&self) -> ContentHash {
        self.current
    }

    /// Energy left after the moves made so far.
    #[must_use]
    pub fn remaining_energy(&self) -> f64 {
        self.config.energy - self.config.step_cost * self.steps as f64
    }

    /// Take one step. Once terminated, keeps returning the same state.
    pub fn step(&mut self) -> Result<StepOutcome, SubstrateError> {
        if let Some(reason) = self.terminated {
            return Ok(StepOutcome::Terminated(reason));
        }
        if self.steps >= self.config.max_steps {
            return Ok(self.terminate(WalkTermination::MaxStepsReached));
        }
        let next_spent = self.config.step_cost * (self.steps + 1) as f64;
        if next_spent > self.config.energy {
            return Ok(self.terminate(WalkTermination::EnergyExhausted));
        }

        let mut candidates = self.graph.candidates(&self.current)?;
        if candidates.is_empty() {
            return Ok(self.terminate(WalkTermination::NoCandidates));
        }
        candidates.sort_unstable();

        let chosen = self.select(&candidates);
        let step = WalkStep {
            from: self.current,
            relation: chosen.relation,
            to: chosen.target,
            rating: chosen.rating,
            remaining_energy: self.config.energy - next_spent,
        };
        self.current = chosen.target;
        self.steps += 1;
        tracing::trace!(
            from = %step.from.short(),
            to = %step.to.short(),
            rating = step.rating,
            "walk step"
        );
        Ok(StepOutcome::Moved(step))
    }

    /// Step until terminated.
    pub fn run(mut self) -> Result<WalkTrace, SubstrateError> {
        let start = self.current;
        let mut steps = Vec::new();
        loop {
            match self.step()? {
                StepOutcome::Moved(step) => steps.push(step),
                StepOutcome::Terminated(termination) => {
                    tracing::debug!(
                        steps = steps.len(),
                        termination = termination.name(),
                        "walk finished"
                    );
                    return Ok(WalkTrace {
                        start,
                        steps,
                        termination,
                    });
                }
            }
        }
    }

    fn terminate(&mut self, reason: WalkTermination) -> StepOutcome {
        self.terminated = Some(reason);
        StepOutcome::Terminated(reason)
    }

    fn select(&mut self, candidates: &[WalkCandidate]) -> WalkCandidate {
        let best = candidates
            .iter()
            .map(|c| c.rating)
            .max()
            .unwrap_or_default();
        let first_best = candidates
            .iter()
            .find(|c| c.rating == best)
            .copied()
            .unwrap_or(candidates[0]);

        if self.config.temperature < GREEDY_TEMPERATURE {
            return first_best;
        }

        let scale = self.config.temperature * RATING_TEMPERATURE_SCALE;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|c| ((c.rating.saturating_sub(best)) as f64 / scale).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return first_best;
        }

        let mut target = self.rng.r#gen::<f64>() * total;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            if target < *weight {
                return *candidate;
            }
            target -= weight;
        }
        // Rounding left a sliver past the last weight.
        candidates[candidates.len() - 1]
    }
}

// =============================================================================
// TESTS
// =============================================================================
