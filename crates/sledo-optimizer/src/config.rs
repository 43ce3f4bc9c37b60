//! Run and experiment configuration.

use serde::{Deserialize, Serialize};
use sledo_types::{
    config_error, OptimisationMode, ParameterDescriptor, SearchSpace, SledoResult,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::evaluator::{CommandEvaluator, DesignEvaluator, TestFunction, TestFunctionEvaluator};
use crate::search::{BayesianSearch, GridSearch, RandomSearch, SearchAlgorithm};

/// Penalty used when nothing better is configured.
pub const DEFAULT_FAILURE_PENALTY: f64 = 1e10;

/// Value reported to a search algorithm without a failure hook when a trial
/// fails. Expressed in minimisation convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePenalty {
    /// A constant penalty for every metric. The default reports
    /// [`DEFAULT_FAILURE_PENALTY`], worse than any plausible observation.
    Fixed { value: f64 },
    /// Worst value observed so far for each metric, or `fallback` before any
    /// trial has succeeded.
    WorstObserved { fallback: f64 },
}

impl Default for FailurePenalty {
    fn default() -> Self {
        Self::Fixed {
            value: DEFAULT_FAILURE_PENALTY,
        }
    }
}

/// Top-level configuration for an optimisation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,

    /// Metrics every evaluation must report. The first one drives best-trial
    /// tracking.
    pub metric_names: Vec<String>,

    #[serde(default)]
    pub mode: OptimisationMode,

    pub max_total_trials: usize,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_trials: usize,

    /// Directory for checkpoints and other run output.
    pub output_dir: PathBuf,

    #[serde(default)]
    pub failure_penalty: FailurePenalty,

    /// Write a checkpoint to [`RunConfig::checkpoint_path`] when `run` returns.
    #[serde(default)]
    pub checkpoint_on_finish: bool,
}

fn default_concurrency() -> usize {
    1
}

impl RunConfig {
    pub fn new(name: impl Into<String>, metric: impl Into<String>, max_total_trials: usize) -> Self {
        let name = name.into();
        Self {
            output_dir: PathBuf::from(format!("./{name}")),
            name,
            metric_names: vec![metric.into()],
            mode: OptimisationMode::Minimise,
            max_total_trials,
            max_concurrent_trials: 1,
            failure_penalty: FailurePenalty::default(),
            checkpoint_on_finish: false,
        }
    }

    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric_names = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: OptimisationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_failure_penalty(mut self, penalty: FailurePenalty) -> Self {
        self.failure_penalty = penalty;
        self
    }

    pub fn with_checkpoint_on_finish(mut self, enabled: bool) -> Self {
        self.checkpoint_on_finish = enabled;
        self
    }

    /// Default checkpoint location: `<output_dir>/<name>.checkpoint`.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.checkpoint", self.name))
    }

    /// Names of the fields whose values differ from `other`.
    pub fn differing_fields(&self, other: &RunConfig) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name != other.name {
            fields.push("name");
        }
        if self.metric_names != other.metric_names {
            fields.push("metric_names");
        }
        if self.mode != other.mode {
            fields.push("mode");
        }
        if self.max_total_trials != other.max_total_trials {
            fields.push("max_total_trials");
        }
        if self.max_concurrent_trials != other.max_concurrent_trials {
            fields.push("max_concurrent_trials");
        }
        if self.output_dir != other.output_dir {
            fields.push("output_dir");
        }
        if self.failure_penalty != other.failure_penalty {
            fields.push("failure_penalty");
        }
        if self.checkpoint_on_finish != other.checkpoint_on_finish {
            fields.push("checkpoint_on_finish");
        }
        fields
    }

    /// The metric used to rank trials.
    pub fn primary_metric(&self) -> &str {
        self.metric_names.first().map(String::as_str).unwrap_or_default()
    }

    pub fn validate(&self) -> SledoResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error!("run name must not be empty"));
        }
        if self.metric_names.is_empty() {
            return Err(config_error!("at least one metric name is required"));
        }
        let mut seen = HashSet::new();
        for metric in &self.metric_names {
            if !seen.insert(metric.as_str()) {
                return Err(config_error!("duplicate metric name: {metric}"));
            }
        }
        if self.max_total_trials == 0 {
            return Err(config_error!("max_total_trials must be positive"));
        }
        if self.max_concurrent_trials == 0 {
            return Err(config_error!("max_concurrent_trials must be positive"));
        }
        if self.max_concurrent_trials > self.max_total_trials {
            return Err(config_error!(
                "max_concurrent_trials ({}) exceeds max_total_trials ({})",
                self.max_concurrent_trials,
                self.max_total_trials
            ));
        }
        let penalty = match self.failure_penalty {
            FailurePenalty::WorstObserved { fallback } => fallback,
            FailurePenalty::Fixed { value } => value,
        };
        if !penalty.is_finite() {
            return Err(config_error!("failure penalty must be finite"));
        }
        Ok(())
    }
}

/// Which search algorithm to drive the run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    Grid {
        #[serde(default = "default_grid_steps")]
        steps: usize,
    },
    Random {
        seed: Option<u64>,
    },
    Bayesian {
        seed: Option<u64>,
        #[serde(default = "default_exploration_weight")]
        exploration_weight: f64,
    },
}

fn default_grid_steps() -> usize {
    5
}

fn default_exploration_weight() -> f64 {
    0.3
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self::Bayesian {
            seed: None,
            exploration_weight: default_exploration_weight(),
        }
    }
}

impl AlgorithmConfig {
    pub fn build(&self, space: &SearchSpace, objective_metric: &str) -> Box<dyn SearchAlgorithm> {
        match self {
            Self::Grid { steps } => Box::new(GridSearch::new(space, *steps)),
            Self::Random { seed } => Box::new(RandomSearch::with_seed(
                space.clone(),
                seed.unwrap_or_else(rand::random),
            )),
            Self::Bayesian {
                seed,
                exploration_weight,
            } => Box::new(BayesianSearch::new(
                space.clone(),
                objective_metric,
                *exploration_weight,
                seed.unwrap_or_else(rand::random),
            )),
        }
    }
}

/// Which design evaluator scores each trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorConfig {
    TestFunction {
        function: TestFunction,
        #[serde(default)]
        inputs: Option<Vec<String>>,
        #[serde(default)]
        metric: Option<String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl EvaluatorConfig {
    pub fn build(&self) -> Arc<dyn DesignEvaluator> {
        match self {
            Self::TestFunction {
                function,
                inputs,
                metric,
            } => {
                let mut evaluator = TestFunctionEvaluator::new(*function);
                if let Some(inputs) = inputs {
                    evaluator = evaluator.with_inputs(inputs.iter().cloned());
                }
                if let Some(metric) = metric {
                    evaluator = evaluator.with_metric(metric.clone());
                }
                Arc::new(evaluator)
            }
            Self::Command {
                program,
                args,
                working_dir,
                timeout_secs,
            } => {
                let mut evaluator = CommandEvaluator::new(program.clone()).with_args(args.iter().cloned());
                if let Some(dir) = working_dir {
                    evaluator = evaluator.with_working_dir(dir.clone());
                }
                if let Some(secs) = timeout_secs {
                    evaluator = evaluator.with_timeout(Duration::from_secs(*secs));
                }
                Arc::new(evaluator)
            }
        }
    }
}

/// Everything the runner binary needs, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub run: RunConfig,
    pub search_space: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    pub evaluator: EvaluatorConfig,
    /// Resume from the run's default checkpoint when it exists.
    #[serde(default)]
    pub resume: bool,
}

impl ExperimentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> SledoResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.run.validate()?;
        Ok(config)
    }

    pub fn search_space(&self) -> SledoResult<SearchSpace> {
        Ok(SearchSpace::validate(&self.search_space)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sledo_types::SledoError;

    #[test]
    fn default_config_values() {
        let config = RunConfig::new("monoblock", "max_stress", 20);
        assert_eq!(config.max_concurrent_trials, 1);
        assert_eq!(config.mode, OptimisationMode::Minimise);
        assert_eq!(config.output_dir, PathBuf::from("./monoblock"));
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("./monoblock/monoblock.checkpoint")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_penalty_is_worse_than_any_observation() {
        let config = RunConfig::new("monoblock", "max_stress", 20);
        assert_eq!(
            config.failure_penalty,
            FailurePenalty::Fixed {
                value: DEFAULT_FAILURE_PENALTY
            }
        );

        let parsed: FailurePenalty =
            serde_json::from_str(r#"{"policy": "worst_observed", "fallback": 5.0}"#).unwrap();
        assert_eq!(parsed, FailurePenalty::WorstObserved { fallback: 5.0 });
    }

    #[test]
    fn differing_fields_lists_every_change() {
        let saved = RunConfig::new("monoblock", "max_stress", 20);
        assert!(saved.differing_fields(&saved.clone()).is_empty());

        let edited = saved
            .clone()
            .with_concurrency(4)
            .with_mode(OptimisationMode::Maximise);
        let mut budget = edited.clone();
        budget.max_total_trials = 40;
        assert_eq!(
            saved.differing_fields(&budget),
            vec!["mode", "max_total_trials", "max_concurrent_trials"]
        );
    }

    #[test]
    fn validate_rejects_bad_budgets() {
        let zero = RunConfig::new("r", "y1", 0);
        assert!(matches!(zero.validate(), Err(SledoError::Config(_))));

        let too_wide = RunConfig::new("r", "y1", 3).with_concurrency(4);
        assert!(matches!(too_wide.validate(), Err(SledoError::Config(_))));

        let no_slots = RunConfig::new("r", "y1", 3).with_concurrency(0);
        assert!(no_slots.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_metrics() {
        let none = RunConfig::new("r", "y1", 3).with_metrics(Vec::<String>::new());
        assert!(none.validate().is_err());

        let dup = RunConfig::new("r", "y1", 3).with_metrics(["y1", "y1"]);
        assert!(dup.validate().is_err());

        let nan = RunConfig::new("r", "y1", 3).with_failure_penalty(FailurePenalty::Fixed { value: f64::NAN });
        assert!(nan.validate().is_err());
    }

    #[test]
    fn experiment_config_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sledo.json");
        std::fs::write(
            &path,
            r#"{
                "run": {
                    "name": "three_hump_camel_optimiser",
                    "metric_names": ["y1"],
                    "max_total_trials": 5,
                    "output_dir": "results"
                },
                "search_space": [
                    {"name": "x1", "kind": "continuous", "bounds": [-5.0, 5.0]},
                    {"name": "x2", "kind": "continuous", "bounds": [-5.0, 5.0]}
                ],
                "algorithm": {"kind": "random", "seed": 4},
                "evaluator": {"kind": "test_function", "function": "three_hump_camel"}
            }"#,
        )
        .unwrap();

        let config = ExperimentConfig::from_json_file(&path).unwrap();
        assert_eq!(config.run.max_concurrent_trials, 1);
        assert_eq!(config.run.failure_penalty, FailurePenalty::default());
        assert_eq!(config.algorithm, AlgorithmConfig::Random { seed: Some(4) });
        assert!(!config.resume);

        let space = config.search_space().unwrap();
        assert_eq!(space.parameters.len(), 2);
        assert_eq!(config.algorithm.build(&space, "y1").name(), "random");
    }

    #[test]
    fn experiment_config_rejects_invalid_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{
                "run": {"name": "r", "metric_names": [], "max_total_trials": 5, "output_dir": "out"},
                "search_space": [],
                "evaluator": {"kind": "command", "program": "solver"}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            ExperimentConfig::from_json_file(&path),
            Err(SledoError::Config(_))
        ));
    }
}
