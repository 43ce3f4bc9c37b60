//! The optimisation loop: proposes, dispatches, records and feeds back trials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sledo_types::{
    internal_error, EvaluationError, Metrics, ParameterSet, SearchSpace, SledoError, SledoResult,
    Trial, TrialId, TrialState,
};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::config::{FailurePenalty, RunConfig};
use crate::evaluator::DesignEvaluator;
use crate::limiter::{ConcurrencyLimiter, SlotPermit};
use crate::search::{Observation, SearchAlgorithm};

// Evaluator panics are recorded as failed trials, which requires unwinding.
#[cfg(not(panic = "unwind"))]
compile_error!("sledo-optimizer must be built with panic = \"unwind\"");

/// Unique optimisation run identifier.
pub type RunId = Uuid;

/// Why a run stopped dispatching trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// `max_total_trials` trials reached a terminal state.
    BudgetExhausted,
    /// The search algorithm ran out of candidates. A successful early finish.
    SearchExhausted,
    /// A stop was requested; the run can be resumed.
    StopRequested,
    /// A fatal configuration error halted the run.
    Fatal,
}

/// Cloneable handle used to ask a running loop to stop dispatching.
///
/// In-flight trials still run to completion.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Summary of a finished (or interrupted) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub name: String,
    pub termination: Option<Termination>,
    pub is_complete: bool,
    pub total_trials: usize,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    pub best_trial: Option<Trial>,
    pub peak_concurrency: usize,
}

type EvaluationOutcome = (Result<Metrics, EvaluationError>, SlotPermit);

enum LoopEvent {
    Completed(Result<(task::Id, EvaluationOutcome), JoinError>),
    SlotFree(SledoResult<SlotPermit>),
}

/// Owns the trials of one optimisation and drives the propose/evaluate/observe
/// cycle under the concurrency ceiling.
pub struct OptimisationRun {
    id: RunId,
    config: RunConfig,
    space: SearchSpace,
    algorithm: Box<dyn SearchAlgorithm>,
    trials: Vec<Trial>,
    next_trial_id: TrialId,
    is_complete: bool,
    termination: Option<Termination>,
    created_at: DateTime<Utc>,
    limiter: ConcurrencyLimiter,
    stop: StopHandle,
}

impl std::fmt::Debug for OptimisationRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisationRun")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("algorithm", &self.algorithm.name())
            .field("trials", &self.trials.len())
            .field("is_complete", &self.is_complete)
            .field("termination", &self.termination)
            .finish()
    }
}

/// Persisted pieces of a run, exchanged with [`Checkpoint`].
pub(crate) struct RunParts {
    pub id: RunId,
    pub config: RunConfig,
    pub space: SearchSpace,
    pub algorithm: Box<dyn SearchAlgorithm>,
    pub trials: Vec<Trial>,
    pub next_trial_id: TrialId,
    pub is_complete: bool,
    pub termination: Option<Termination>,
    pub created_at: DateTime<Utc>,
}

impl OptimisationRun {
    pub fn new(
        config: RunConfig,
        space: SearchSpace,
        algorithm: Box<dyn SearchAlgorithm>,
    ) -> SledoResult<Self> {
        config.validate()?;
        space.check()?;

        Ok(Self::from_parts(RunParts {
            id: Uuid::new_v4(),
            config,
            space,
            algorithm,
            trials: Vec::new(),
            next_trial_id: 0,
            is_complete: false,
            termination: None,
            created_at: Utc::now(),
        }))
    }

    pub(crate) fn from_parts(parts: RunParts) -> Self {
        let limiter = ConcurrencyLimiter::new(parts.config.max_concurrent_trials);
        Self {
            id: parts.id,
            config: parts.config,
            space: parts.space,
            algorithm: parts.algorithm,
            trials: parts.trials,
            next_trial_id: parts.next_trial_id,
            is_complete: parts.is_complete,
            termination: parts.termination,
            created_at: parts.created_at,
            limiter,
            stop: StopHandle::default(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn algorithm(&self) -> &dyn SearchAlgorithm {
        self.algorithm.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Every trial created so far, in id order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub(crate) fn next_trial_id(&self) -> TrialId {
        self.next_trial_id
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Trials currently awaiting their evaluator.
    pub fn dispatched_count(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.state == TrialState::Dispatched)
            .count()
    }

    /// Terminal trials in dispatch order.
    pub fn results(&self) -> SledoResult<Vec<&Trial>> {
        let terminal: Vec<&Trial> = self.trials.iter().filter(|t| t.is_terminal()).collect();
        if terminal.is_empty() {
            return Err(SledoError::NoResults);
        }
        Ok(terminal)
    }

    /// Best succeeded trial on the primary metric.
    pub fn best_trial(&self) -> Option<&Trial> {
        let metric = self.config.primary_metric();
        let mode = self.config.mode;
        self.trials
            .iter()
            .filter_map(|t| t.metric(metric).map(|value| (t, value)))
            .fold(None, |best: Option<(&Trial, f64)>, (trial, value)| match best {
                Some((_, incumbent)) if !mode.is_better(value, incumbent) => best,
                _ => Some((trial, value)),
            })
            .map(|(trial, _)| trial)
    }

    pub fn report(&self) -> RunReport {
        let count = |state: TrialState| self.trials.iter().filter(|t| t.state == state).count();
        RunReport {
            run_id: self.id,
            name: self.config.name.clone(),
            termination: self.termination,
            is_complete: self.is_complete,
            total_trials: self.trials.len(),
            trials_succeeded: count(TrialState::Succeeded),
            trials_failed: count(TrialState::Failed),
            best_trial: self.best_trial().cloned(),
            peak_concurrency: self.limiter.peak_in_flight(),
        }
    }

    /// Write a checkpoint to the configured default path.
    pub fn save_checkpoint(&self) -> SledoResult<PathBuf> {
        let path = self.config.checkpoint_path();
        Checkpoint::write_to(self, &path)?;
        Ok(path)
    }

    /// Drive the loop until the budget is spent, the search is exhausted, a
    /// stop is requested or a fatal error occurs. Every dispatched trial is
    /// terminal when this returns.
    ///
    /// Fatal errors are returned after in-flight trials drain; partial results
    /// stay readable through [`trials`](Self::trials).
    pub async fn run(&mut self, evaluator: Arc<dyn DesignEvaluator>) -> SledoResult<RunReport> {
        if self.is_complete {
            info!(run = %self.config.name, "run already complete, nothing to do");
            return Ok(self.report());
        }

        info!(
            run = %self.config.name,
            algorithm = self.algorithm.name(),
            max_total_trials = self.config.max_total_trials,
            max_concurrent_trials = self.config.max_concurrent_trials,
            resumed_trials = self.trials.len(),
            "starting optimisation run"
        );

        let limiter = self.limiter.clone();
        let mut in_flight: JoinSet<EvaluationOutcome> = JoinSet::new();
        let mut task_trials: HashMap<task::Id, usize> = HashMap::new();
        let mut halt: Option<Termination> = None;
        let mut fatal: Option<SledoError> = None;

        while self.trials.len() < self.config.max_total_trials {
            if self.stop.is_stop_requested() {
                info!(run = %self.config.name, "stop requested, no further dispatches");
                halt = Some(Termination::StopRequested);
                break;
            }

            // Completed trials are recorded before a new slot is handed out.
            let event = tokio::select! {
                biased;
                Some(joined) = in_flight.join_next_with_id() => LoopEvent::Completed(joined),
                permit = limiter.acquire() => LoopEvent::SlotFree(permit),
            };
            let permit = match event {
                LoopEvent::Completed(joined) => {
                    self.finish_task(joined, &mut task_trials)?;
                    continue;
                }
                LoopEvent::SlotFree(permit) => permit?,
            };

            let parameters = match self.algorithm.propose() {
                Ok(parameters) => parameters,
                Err(exhausted) => {
                    info!(run = %self.config.name, "{exhausted}, finishing early");
                    drop(permit);
                    halt = Some(Termination::SearchExhausted);
                    break;
                }
            };

            if let Some(reason) = self.proposal_violation(&parameters) {
                drop(permit);
                error!(run = %self.config.name, %reason, "invalid proposal, halting run");
                fatal = Some(SledoError::InvalidProposal {
                    algorithm: self.algorithm.name().to_string(),
                    reason,
                });
                halt = Some(Termination::Fatal);
                break;
            }

            let trial_id = self.next_trial_id;
            self.next_trial_id += 1;
            let mut trial = Trial::new(trial_id, parameters.clone());
            trial.mark_dispatched()?;
            self.trials.push(trial);
            debug!(trial_id, in_flight = limiter.in_flight(), "dispatching trial");

            let evaluator = Arc::clone(&evaluator);
            let handle = in_flight.spawn(async move {
                let outcome = evaluator.evaluate(&parameters).await;
                (outcome, permit)
            });
            task_trials.insert(handle.id(), self.trials.len() - 1);
        }

        while let Some(joined) = in_flight.join_next_with_id().await {
            self.finish_task(joined, &mut task_trials)?;
        }

        let termination = halt.unwrap_or(Termination::BudgetExhausted);
        self.termination = Some(termination);
        self.is_complete = termination != Termination::StopRequested;
        if termination == Termination::StopRequested {
            self.stop.reset();
        }

        let report = self.report();
        info!(
            run = %self.config.name,
            ?termination,
            total = report.total_trials,
            succeeded = report.trials_succeeded,
            failed = report.trials_failed,
            "optimisation run finished"
        );

        if self.config.checkpoint_on_finish {
            match self.save_checkpoint() {
                Ok(path) => info!(path = %path.display(), "checkpoint written"),
                Err(e) if fatal.is_some() => warn!(error = %e, "failed to write checkpoint"),
                Err(e) => return Err(e),
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn proposal_violation(&self, parameters: &ParameterSet) -> Option<String> {
        if self.space.is_complete_assignment(parameters) {
            return None;
        }
        if let Some(name) = parameters.keys().find(|name| self.space.get(name).is_none()) {
            return Some(format!("undeclared parameter {name}"));
        }
        if let Some(param) = self
            .space
            .parameters
            .iter()
            .find(|p| !parameters.contains_key(&p.name))
        {
            return Some(format!("missing parameter {}", param.name));
        }
        let (name, value) = parameters
            .iter()
            .find(|(name, value)| {
                self.space
                    .get(name)
                    .is_some_and(|param| !param.domain.admits(value))
            })?;
        Some(format!("value {value} for {name} lies outside its domain"))
    }

    fn finish_task(
        &mut self,
        joined: Result<(task::Id, EvaluationOutcome), JoinError>,
        task_trials: &mut HashMap<task::Id, usize>,
    ) -> SledoResult<()> {
        let (task_id, outcome, permit) = match joined {
            Ok((task_id, (outcome, permit))) => (task_id, outcome, Some(permit)),
            Err(err) => {
                let task_id = err.id();
                let message = if err.is_panic() {
                    let payload = err.into_panic();
                    payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic payload".to_string())
                } else {
                    "evaluation task was cancelled".to_string()
                };
                (task_id, Err(EvaluationError::Panicked { message }), None)
            }
        };

        let index = task_trials
            .remove(&task_id)
            .ok_or_else(|| internal_error!("no trial recorded for evaluation task {task_id}"))?;
        self.record_outcome(index, outcome)?;
        // Slot is released only after the algorithm has seen the outcome.
        drop(permit);
        Ok(())
    }

    fn record_outcome(
        &mut self,
        index: usize,
        outcome: Result<Metrics, EvaluationError>,
    ) -> SledoResult<()> {
        let outcome = outcome.and_then(|metrics| self.check_metrics(metrics));
        let mode = self.config.mode;
        let trial = self
            .trials
            .get_mut(index)
            .ok_or_else(|| internal_error!("trial index {index} out of range"))?;
        let trial_id = trial.id;
        let parameters = trial.parameters.clone();

        let observation = match outcome {
            Ok(metrics) => {
                let observed: Metrics = metrics
                    .iter()
                    .map(|(name, value)| (name.clone(), mode.to_minimisation(*value)))
                    .collect();
                trial.mark_succeeded(metrics)?;
                info!(trial_id, metrics = ?trial.metrics, "trial succeeded");
                Observation::Success(observed)
            }
            Err(err) => {
                let reason = err.to_string();
                trial.mark_failed(reason.clone())?;
                warn!(trial_id, error = %reason, "trial failed");
                if self.algorithm.handles_failures() {
                    Observation::Failure { reason }
                } else {
                    Observation::Success(self.penalty_metrics())
                }
            }
        };

        self.algorithm.observe(trial_id, &parameters, &observation);
        Ok(())
    }

    fn check_metrics(&self, metrics: Metrics) -> Result<Metrics, EvaluationError> {
        let expected: BTreeSet<&str> = self.config.metric_names.iter().map(String::as_str).collect();
        let found: BTreeSet<&str> = metrics.keys().map(String::as_str).collect();
        if expected != found {
            return Err(EvaluationError::MetricMismatch {
                expected: self.config.metric_names.clone(),
                found: metrics.keys().cloned().collect(),
            });
        }
        if let Some(name) = metrics
            .iter()
            .find(|(_, value)| !value.is_finite())
            .map(|(name, _)| name)
        {
            return Err(EvaluationError::NonFiniteMetric {
                metric: name.clone(),
            });
        }
        Ok(metrics)
    }

    /// Penalty reported for a failed trial, in minimisation convention.
    fn penalty_metrics(&self) -> Metrics {
        let mode = self.config.mode;
        self.config
            .metric_names
            .iter()
            .map(|name| {
                let value = match self.config.failure_penalty {
                    FailurePenalty::Fixed { value } => value,
                    FailurePenalty::WorstObserved { fallback } => self
                        .trials
                        .iter()
                        .filter_map(|t| t.metric(name))
                        .map(|v| mode.to_minimisation(v))
                        .reduce(f64::max)
                        .unwrap_or(fallback),
                };
                (name.clone(), value)
            })
            .collect()
    }
}
