//! Search algorithms: the proposing/ingesting oracle driven by a run.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sledo_types::{
    CheckpointError, Metrics, ParameterDomain, ParameterSet, ParameterValue, SearchExhausted,
    SearchSpace, SledoResult, TrialId,
};
use std::collections::BTreeSet;

/// Feedback for one trial, as seen by a search algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Observed metrics in minimisation convention.
    Success(Metrics),
    /// The evaluation failed. Only delivered to algorithms whose
    /// [`SearchAlgorithm::handles_failures`] returns true.
    Failure { reason: String },
}

/// Common trait for all search algorithms.
///
/// `propose` and `observe` are never called concurrently; implementations do
/// not need internal synchronisation.
pub trait SearchAlgorithm: Send {
    /// Produce the next candidate to evaluate.
    fn propose(&mut self) -> Result<ParameterSet, SearchExhausted>;

    /// Ingest the outcome of a trial. Duplicate observations of the same
    /// trial id must be ignored.
    fn observe(&mut self, trial_id: TrialId, parameters: &ParameterSet, observation: &Observation);

    /// Whether the algorithm accepts [`Observation::Failure`]. Algorithms
    /// without this hook receive a penalty value instead.
    fn handles_failures(&self) -> bool {
        false
    }

    /// Opaque internal state for checkpoints.
    fn snapshot(&self) -> SledoResult<serde_json::Value>;

    /// Restore state produced by [`snapshot`](Self::snapshot).
    fn restore(&mut self, state: serde_json::Value) -> SledoResult<()>;

    /// Human-readable algorithm name.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Seeded RNG whose stream position survives a checkpoint.
#[derive(Debug, Clone)]
struct SeededRng {
    seed: u64,
    rng: ChaCha8Rng,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RngState {
    seed: u64,
    word_pos: u64,
}

impl SeededRng {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn state(&self) -> SledoResult<RngState> {
        let word_pos = u64::try_from(self.rng.get_word_pos()).map_err(|_| CheckpointError::Corrupt {
            message: "rng stream position overflows u64".to_string(),
        })?;
        Ok(RngState {
            seed: self.seed,
            word_pos,
        })
    }

    fn from_state(state: &RngState) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(state.seed);
        rng.set_word_pos(u128::from(state.word_pos));
        Self {
            seed: state.seed,
            rng,
        }
    }
}

fn sample_value<R: Rng>(domain: &ParameterDomain, rng: &mut R) -> ParameterValue {
    match domain {
        ParameterDomain::Continuous { low, high } => {
            ParameterValue::Float(rng.random_range(*low..=*high))
        }
        ParameterDomain::Discrete { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
        ParameterDomain::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterDomain::Categorical { values } => {
            let idx = rng.random_range(0..values.len());
            ParameterValue::from_json(values[idx].clone())
        }
    }
}

fn sample_parameters<R: Rng>(space: &SearchSpace, rng: &mut R) -> ParameterSet {
    space
        .parameters
        .iter()
        .map(|param| (param.name.clone(), sample_value(&param.domain, rng)))
        .collect()
}

// ---- Grid search ----

/// Exhaustive grid search; exhausts once every combination was proposed.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<ParameterSet>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GridState {
    cursor: usize,
    size: usize,
}

impl GridSearch {
    /// `float_steps` is the number of points per continuous dimension.
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            cursor: 0,
            combos: Self::build_grid(space, float_steps),
        }
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<ParameterSet> {
        let steps = float_steps.max(2);
        let linspace = |low: f64, high: f64| -> Vec<f64> {
            (0..steps)
                .map(|i| {
                    let t = i as f64 / (steps - 1) as f64;
                    low + t * (high - low)
                })
                .collect()
        };

        let mut result: Vec<ParameterSet> = vec![ParameterSet::new()];
        for param in &space.parameters {
            let axis: Vec<ParameterValue> = match &param.domain {
                ParameterDomain::Continuous { low, high } => linspace(*low, *high)
                    .into_iter()
                    .map(ParameterValue::Float)
                    .collect(),
                ParameterDomain::Discrete { low, high } => {
                    (*low..=*high).map(ParameterValue::Int).collect()
                }
                ParameterDomain::LogUniform { low, high } => linspace(low.ln(), high.ln())
                    .into_iter()
                    .map(|v| ParameterValue::Float(v.exp().clamp(*low, *high)))
                    .collect(),
                ParameterDomain::Categorical { values } => values
                    .iter()
                    .cloned()
                    .map(ParameterValue::from_json)
                    .collect(),
            };

            // Cartesian product
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.insert(param.name.clone(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
    }
}

impl SearchAlgorithm for GridSearch {
    fn propose(&mut self) -> Result<ParameterSet, SearchExhausted> {
        let combo = self.combos.get(self.cursor).cloned().ok_or_else(|| SearchExhausted {
            algorithm: self.name().to_string(),
        })?;
        self.cursor += 1;
        Ok(combo)
    }

    fn observe(&mut self, _trial_id: TrialId, _parameters: &ParameterSet, _observation: &Observation) {}

    fn handles_failures(&self) -> bool {
        true
    }

    fn snapshot(&self) -> SledoResult<serde_json::Value> {
        Ok(serde_json::to_value(GridState {
            cursor: self.cursor,
            size: self.combos.len(),
        })?)
    }

    fn restore(&mut self, state: serde_json::Value) -> SledoResult<()> {
        let state: GridState = serde_json::from_value(state)?;
        if state.size != self.combos.len() || state.cursor > state.size {
            return Err(CheckpointError::Corrupt {
                message: format!(
                    "grid state {}/{} does not match a grid of {} points",
                    state.cursor,
                    state.size,
                    self.combos.len()
                ),
            }
            .into());
        }
        self.cursor = state.cursor;
        Ok(())
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: SeededRng,
}

#[derive(Debug, Serialize, Deserialize)]
struct RandomState {
    rng: RngState,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self::with_seed(space, rand::random())
    }

    pub fn with_seed(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: SeededRng::new(seed),
        }
    }
}

impl SearchAlgorithm for RandomSearch {
    fn propose(&mut self) -> Result<ParameterSet, SearchExhausted> {
        Ok(sample_parameters(&self.space, &mut self.rng.rng))
    }

    fn observe(&mut self, _trial_id: TrialId, _parameters: &ParameterSet, _observation: &Observation) {}

    fn handles_failures(&self) -> bool {
        true
    }

    fn snapshot(&self) -> SledoResult<serde_json::Value> {
        Ok(serde_json::to_value(RandomState {
            rng: self.rng.state()?,
        })?)
    }

    fn restore(&mut self, state: serde_json::Value) -> SledoResult<()> {
        let state: RandomState = serde_json::from_value(state)?;
        self.rng = SeededRng::from_state(&state.rng);
        Ok(())
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (surrogate-model stub) ----

/// Sequential search that biases sampling toward the best observed point.
///
/// Tracks observed (params, objective) pairs and, with probability
/// `1 - exploration_weight`, perturbs the incumbent instead of sampling
/// uniformly. A full Gaussian-process backend can replace this behind the
/// same trait. Failed trials arrive as penalty values.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    objective_metric: String,
    exploration_weight: f64,
    rng: SeededRng,
    observed_ids: BTreeSet<TrialId>,
    observations: Vec<(ParameterSet, f64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BayesianState {
    rng: RngState,
    observed_ids: BTreeSet<TrialId>,
    observations: Vec<(ParameterSet, f64)>,
}

impl BayesianSearch {
    pub fn new(
        space: SearchSpace,
        objective_metric: impl Into<String>,
        exploration_weight: f64,
        seed: u64,
    ) -> Self {
        Self {
            space,
            objective_metric: objective_metric.into(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            rng: SeededRng::new(seed),
            observed_ids: BTreeSet::new(),
            observations: Vec::new(),
        }
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Lowest objective seen so far (observations are already minimisation
    /// convention).
    fn incumbent(&self) -> Option<&(ParameterSet, f64)> {
        self.observations
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self, base: ParameterSet) -> ParameterSet {
        let rng = &mut self.rng.rng;
        let mut perturbed = ParameterSet::new();

        for param in &self.space.parameters {
            let value = match (&param.domain, base.get(&param.name)) {
                (ParameterDomain::Continuous { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.random_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterDomain::Discrete { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.random_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterDomain::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = rng.random_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                // Choices and missing bases fall back to uniform sampling.
                (domain, _) => sample_value(domain, rng),
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

impl SearchAlgorithm for BayesianSearch {
    fn propose(&mut self) -> Result<ParameterSet, SearchExhausted> {
        let explore = self.rng.rng.random::<f64>() < self.exploration_weight;
        match self.incumbent() {
            Some((best, _)) if !explore => {
                let base = best.clone();
                Ok(self.exploit(base))
            }
            _ => Ok(sample_parameters(&self.space, &mut self.rng.rng)),
        }
    }

    fn observe(&mut self, trial_id: TrialId, parameters: &ParameterSet, observation: &Observation) {
        if !self.observed_ids.insert(trial_id) {
            return;
        }
        if let Observation::Success(metrics) = observation {
            if let Some(objective) = metrics.get(&self.objective_metric) {
                self.observations.push((parameters.clone(), *objective));
            }
        }
    }

    fn snapshot(&self) -> SledoResult<serde_json::Value> {
        Ok(serde_json::to_value(BayesianState {
            rng: self.rng.state()?,
            observed_ids: self.observed_ids.clone(),
            observations: self.observations.clone(),
        })?)
    }

    fn restore(&mut self, state: serde_json::Value) -> SledoResult<()> {
        let state: BayesianState = serde_json::from_value(state)?;
        self.rng = SeededRng::from_state(&state.rng);
        self.observed_ids = state.observed_ids;
        self.observations = state.observations;
        Ok(())
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
