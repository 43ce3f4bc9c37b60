//! Versioned JSON checkpoints of an optimisation run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sledo_types::{CheckpointError, SearchSpace, SledoResult, Trial, TrialId};
use std::path::Path;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::run::{OptimisationRun, RunId, RunParts, Termination};
use crate::search::SearchAlgorithm;

pub const CHECKPOINT_FORMAT: &str = "sledo-checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AlgorithmState {
    name: String,
    state: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    format: String,
    format_version: u32,
    run_id: RunId,
    created_at: DateTime<Utc>,
    saved_at: DateTime<Utc>,
    config: RunConfig,
    search_space: SearchSpace,
    algorithm: AlgorithmState,
    trials: Vec<Trial>,
    next_trial_id: TrialId,
    is_complete: bool,
    termination: Option<Termination>,
}

/// Serialises runs at trial boundaries and restores them.
///
/// A checkpoint is only taken when no trial is pending or dispatched, so a
/// resumed run never re-evaluates or loses an in-flight trial.
pub struct Checkpoint;

impl Checkpoint {
    pub fn save(run: &OptimisationRun) -> SledoResult<Vec<u8>> {
        let in_flight: Vec<TrialId> = run
            .trials()
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id)
            .collect();
        if !in_flight.is_empty() {
            return Err(CheckpointError::Unsafe {
                trial_ids: in_flight,
            }
            .into());
        }

        let file = CheckpointFile {
            format: CHECKPOINT_FORMAT.to_string(),
            format_version: CHECKPOINT_VERSION,
            run_id: run.id(),
            created_at: run.created_at(),
            saved_at: Utc::now(),
            config: run.config().clone(),
            search_space: run.search_space().clone(),
            algorithm: AlgorithmState {
                name: run.algorithm().name().to_string(),
                state: run.algorithm().snapshot()?,
            },
            trials: run.trials().to_vec(),
            next_trial_id: run.next_trial_id(),
            is_complete: run.is_complete(),
            termination: run.termination(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    /// Rebuild a run from checkpoint bytes, restoring `algorithm` in place.
    ///
    /// `algorithm` must be the same kind of algorithm that wrote the checkpoint.
    pub fn load(bytes: &[u8], mut algorithm: Box<dyn SearchAlgorithm>) -> SledoResult<OptimisationRun> {
        let raw: Value = serde_json::from_slice(bytes).map_err(corrupt)?;

        let format = raw.get("format").and_then(Value::as_str).unwrap_or("<none>");
        let version = raw.get("format_version").and_then(Value::as_u64);
        if format != CHECKPOINT_FORMAT || version != Some(u64::from(CHECKPOINT_VERSION)) {
            return Err(CheckpointError::Incompatible {
                found: format!("{format} v{}", version.map_or("?".to_string(), |v| v.to_string())),
                expected: format!("{CHECKPOINT_FORMAT} v{CHECKPOINT_VERSION}"),
            }
            .into());
        }

        let file: CheckpointFile = serde_json::from_value(raw).map_err(corrupt)?;
        if file.algorithm.name != algorithm.name() {
            return Err(CheckpointError::AlgorithmMismatch {
                expected: algorithm.name().to_string(),
                found: file.algorithm.name,
            }
            .into());
        }
        Self::check_consistency(&file)?;

        algorithm.restore(file.algorithm.state)?;
        debug!(
            run_id = %file.run_id,
            trials = file.trials.len(),
            "restored checkpoint"
        );

        Ok(OptimisationRun::from_parts(RunParts {
            id: file.run_id,
            config: file.config,
            space: file.search_space,
            algorithm,
            trials: file.trials,
            next_trial_id: file.next_trial_id,
            is_complete: file.is_complete,
            termination: file.termination,
            created_at: file.created_at,
        }))
    }

    /// Save to `path`, creating parent directories. The file is replaced
    /// atomically.
    pub fn write_to(run: &OptimisationRun, path: impl AsRef<Path>) -> SledoResult<()> {
        let path = path.as_ref();
        let bytes = Self::save(run)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("checkpoint.tmp");
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, path)?;
        info!(path = %path.display(), trials = run.trials().len(), "saved checkpoint");
        Ok(())
    }

    pub fn read_from(
        path: impl AsRef<Path>,
        algorithm: Box<dyn SearchAlgorithm>,
    ) -> SledoResult<OptimisationRun> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::load(&bytes, algorithm)
    }

    fn check_consistency(file: &CheckpointFile) -> SledoResult<()> {
        file.config.validate()?;
        file.search_space.check()?;

        if file.trials.len() > file.config.max_total_trials {
            return Err(CheckpointError::Corrupt {
                message: format!(
                    "{} trials exceed the budget of {}",
                    file.trials.len(),
                    file.config.max_total_trials
                ),
            }
            .into());
        }
        let mut previous: Option<TrialId> = None;
        for trial in &file.trials {
            if !trial.is_terminal() {
                return Err(CheckpointError::Unsafe {
                    trial_ids: vec![trial.id],
                }
                .into());
            }
            if previous.is_some_and(|p| trial.id <= p) || trial.id >= file.next_trial_id {
                return Err(CheckpointError::Corrupt {
                    message: format!("trial id {} is out of sequence", trial.id),
                }
                .into());
            }
            previous = Some(trial.id);
        }
        Ok(())
    }
}

fn corrupt(err: serde_json::Error) -> CheckpointError {
    CheckpointError::Corrupt {
        message: err.to_string(),
    }
}
