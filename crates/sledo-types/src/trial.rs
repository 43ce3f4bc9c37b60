//! Trial lifecycle and objective direction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::TrialError;
use crate::space::ParameterSet;

/// Trial identifier, monotonically increasing within a run.
pub type TrialId = u64;

/// Observed metric values keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// Whether we are minimising or maximising the objective metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimisationMode {
    Minimise,
    Maximise,
}

impl Default for OptimisationMode {
    fn default() -> Self {
        Self::Minimise
    }
}

impl OptimisationMode {
    /// Map a raw metric value onto the minimisation convention.
    pub fn to_minimisation(self, value: f64) -> f64 {
        match self {
            Self::Minimise => value,
            Self::Maximise => -value,
        }
    }

    /// Whether `candidate` improves on `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimise => candidate < incumbent,
            Self::Maximise => candidate > incumbent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A single proposed design point and its observed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub parameters: ParameterSet,
    pub state: TrialState,
    pub metrics: Option<Metrics>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: TrialId, parameters: ParameterSet) -> Self {
        Self {
            id,
            parameters,
            state: TrialState::Pending,
            metrics: None,
            error: None,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, from: TrialState, to: TrialState) -> Result<(), TrialError> {
        if self.state != from {
            return Err(TrialError::InvalidTransition {
                trial_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn mark_dispatched(&mut self) -> Result<(), TrialError> {
        self.transition(TrialState::Pending, TrialState::Dispatched)?;
        self.dispatched_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_succeeded(&mut self, metrics: Metrics) -> Result<(), TrialError> {
        self.transition(TrialState::Dispatched, TrialState::Succeeded)?;
        self.finished_at = Some(Utc::now());
        self.metrics = Some(metrics);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> Result<(), TrialError> {
        self.transition(TrialState::Dispatched, TrialState::Failed)?;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.as_ref()?.get(name).copied()
    }

    /// Wall-clock time between dispatch and the terminal transition.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.dispatched_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;

    #[test]
    fn trial_lifecycle() {
        let mut params = ParameterSet::new();
        params.insert("monoBThick".into(), ParameterValue::Float(3e-3));

        let mut trial = Trial::new(1, params);
        assert_eq!(trial.state, TrialState::Pending);

        trial.mark_dispatched().unwrap();
        assert_eq!(trial.state, TrialState::Dispatched);
        assert!(trial.dispatched_at.is_some());

        let mut metrics = Metrics::new();
        metrics.insert("max_stress".into(), 1.8e8);
        trial.mark_succeeded(metrics).unwrap();
        assert_eq!(trial.state, TrialState::Succeeded);
        assert!(trial.is_terminal());
        assert_eq!(trial.metric("max_stress"), Some(1.8e8));
        assert!(trial.duration().is_some());
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(0, ParameterSet::new());
        trial.mark_dispatched().unwrap();
        trial.mark_failed("solver diverged".into()).unwrap();
        assert_eq!(trial.state, TrialState::Failed);
        assert_eq!(trial.error.as_deref(), Some("solver diverged"));
        assert!(trial.metrics.is_none());
    }

    #[test]
    fn trial_rejects_skipped_and_repeated_transitions() {
        let mut trial = Trial::new(4, ParameterSet::new());
        let err = trial.mark_succeeded(Metrics::new()).unwrap_err();
        assert_eq!(
            err,
            TrialError::InvalidTransition {
                trial_id: 4,
                from: TrialState::Pending,
                to: TrialState::Succeeded,
            }
        );

        trial.mark_dispatched().unwrap();
        trial.mark_failed("boom".into()).unwrap();
        assert!(trial.mark_failed("again".into()).is_err());
        assert!(trial.mark_dispatched().is_err());
        assert_eq!(trial.error.as_deref(), Some("boom"));
    }

    #[test]
    fn mode_sign_convention() {
        assert_eq!(OptimisationMode::Minimise.to_minimisation(2.0), 2.0);
        assert_eq!(OptimisationMode::Maximise.to_minimisation(2.0), -2.0);
        assert!(OptimisationMode::Minimise.is_better(1.0, 2.0));
        assert!(OptimisationMode::Maximise.is_better(2.0, 1.0));
    }
}
