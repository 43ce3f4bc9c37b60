//! # sledo-optimizer
//!
//! Trial orchestration for SLEDO design optimisation.
//!
//! An [`OptimisationRun`] asks a [`SearchAlgorithm`] for candidate designs,
//! scores them with a [`DesignEvaluator`] under a [`ConcurrencyLimiter`], and
//! feeds every outcome back to the algorithm. Runs can be checkpointed at
//! trial boundaries and resumed with [`Checkpoint`].

mod checkpoint;
mod config;
mod evaluator;
mod limiter;
mod run;
mod search;
pub mod telemetry;

pub use checkpoint::{Checkpoint, CHECKPOINT_FORMAT, CHECKPOINT_VERSION};
pub use config::{
    AlgorithmConfig, EvaluatorConfig, ExperimentConfig, FailurePenalty, RunConfig,
    DEFAULT_FAILURE_PENALTY,
};
pub use evaluator::{CommandEvaluator, DesignEvaluator, TestFunction, TestFunctionEvaluator};
pub use limiter::{ConcurrencyLimiter, SlotPermit};
pub use run::{OptimisationRun, RunId, RunReport, StopHandle, Termination};
pub use search::{BayesianSearch, GridSearch, Observation, RandomSearch, SearchAlgorithm};
