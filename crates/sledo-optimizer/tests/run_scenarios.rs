use async_trait::async_trait;
use sledo_optimizer::{
    AlgorithmConfig, BayesianSearch, Checkpoint, DesignEvaluator, ExperimentConfig, GridSearch,
    OptimisationRun, RandomSearch, RunConfig, StopHandle, Termination, TestFunction,
    TestFunctionEvaluator,
};
use sledo_types::{
    EvaluationError, Metrics, OptimisationMode, ParameterSet, SearchSpace, SledoError, TrialState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn camel_space() -> SearchSpace {
    SearchSpace::new()
        .add_continuous("x1", -5.0, 5.0)
        .add_continuous("x2", -5.0, 5.0)
}

fn camel() -> Arc<TestFunctionEvaluator> {
    Arc::new(TestFunctionEvaluator::new(TestFunction::ThreeHumpCamel))
}

fn run_config(dir: &TempDir, max_total: usize) -> RunConfig {
    RunConfig::new("camel", "y1", max_total).with_output_dir(dir.path())
}

struct AlwaysFails;

#[async_trait]
impl DesignEvaluator for AlwaysFails {
    async fn evaluate(&self, _parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        Err(EvaluationError::Other("mesh generation failed".into()))
    }
}

/// Sleeps a varying amount and records how many evaluations overlap.
struct Overlapping {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl DesignEvaluator for Overlapping {
    async fn evaluate(&self, _parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5 + (call as u64 % 4) * 5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Metrics::from([("y1".to_string(), call as f64)]))
    }
}

/// Delegates to the camel function and requests a stop after `limit` calls.
struct StopsAfter {
    limit: usize,
    calls: AtomicUsize,
    stop: StopHandle,
}

#[async_trait]
impl DesignEvaluator for StopsAfter {
    async fn evaluate(&self, parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.stop.request_stop();
        }
        camel().evaluate(parameters).await
    }
}

/// Fails every other call, otherwise evaluates the camel function.
#[derive(Default)]
struct FailsEveryOther {
    calls: AtomicUsize,
}

#[async_trait]
impl DesignEvaluator for FailsEveryOther {
    async fn evaluate(&self, parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(EvaluationError::Other("unphysical geometry".into()));
        }
        camel().evaluate(parameters).await
    }
}

#[tokio::test]
async fn sequential_camel_run_succeeds_in_dispatch_order() {
    let dir = TempDir::new().unwrap();
    let algorithm = Box::new(BayesianSearch::new(camel_space(), "y1", 0.3, 42));
    let mut run = OptimisationRun::new(run_config(&dir, 5), camel_space(), algorithm).unwrap();

    let report = run.run(camel()).await.unwrap();

    assert_eq!(report.termination, Some(Termination::BudgetExhausted));
    assert_eq!(report.trials_succeeded, 5);
    assert!(run.is_complete());
    let results = run.results().unwrap();
    assert_eq!(results.len(), 5);
    for (expected_id, trial) in results.iter().enumerate() {
        assert_eq!(trial.id, expected_id as u64);
        assert_eq!(trial.state, TrialState::Succeeded);
        assert!(camel_space().is_complete_assignment(&trial.parameters));
        assert!(trial.metric("y1").is_some());
    }
    assert_eq!(report.peak_concurrency, 1);
}

#[tokio::test]
async fn failing_evaluator_completes_with_only_failures() {
    let dir = TempDir::new().unwrap();
    let algorithm = Box::new(BayesianSearch::new(camel_space(), "y1", 0.3, 1));
    let mut run = OptimisationRun::new(run_config(&dir, 4), camel_space(), algorithm).unwrap();

    let report = run.run(Arc::new(AlwaysFails)).await.unwrap();

    assert!(run.is_complete());
    assert_eq!(report.trials_failed, 4);
    assert_eq!(report.trials_succeeded, 0);
    assert!(report.best_trial.is_none());
    assert!(run
        .results()
        .unwrap()
        .iter()
        .all(|t| t.state == TrialState::Failed && t.error.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_ceiling_is_respected() {
    let dir = TempDir::new().unwrap();
    let config = run_config(&dir, 10).with_concurrency(3);
    let algorithm = Box::new(RandomSearch::with_seed(camel_space(), 3));
    let mut run = OptimisationRun::new(config, camel_space(), algorithm).unwrap();
    let evaluator = Arc::new(Overlapping {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });

    let report = run.run(evaluator.clone()).await.unwrap();

    assert_eq!(report.total_trials, 10);
    assert!(run.trials().iter().all(|t| t.is_terminal()));
    assert!(evaluator.peak.load(Ordering::SeqCst) <= 3);
    assert!(report.peak_concurrency <= 3);
    assert_eq!(run.dispatched_count(), 0);
    assert_eq!(run.limiter().in_flight(), 0);
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let dir = TempDir::new().unwrap();

    let mut reference = OptimisationRun::new(
        run_config(&dir, 6),
        camel_space(),
        Box::new(RandomSearch::with_seed(camel_space(), 11)),
    )
    .unwrap();
    reference.run(camel()).await.unwrap();

    let mut interrupted = OptimisationRun::new(
        run_config(&dir, 6),
        camel_space(),
        Box::new(RandomSearch::with_seed(camel_space(), 11)),
    )
    .unwrap();
    let stopping = Arc::new(StopsAfter {
        limit: 3,
        calls: AtomicUsize::new(0),
        stop: interrupted.stop_handle(),
    });
    let report = interrupted.run(stopping).await.unwrap();
    assert_eq!(report.termination, Some(Termination::StopRequested));
    assert!(!interrupted.is_complete());
    assert_eq!(interrupted.trials().len(), 3);

    let path = interrupted.save_checkpoint().unwrap();
    drop(interrupted);

    // The seed here is overwritten by the checkpointed stream.
    let mut resumed =
        Checkpoint::read_from(&path, Box::new(RandomSearch::with_seed(camel_space(), 0))).unwrap();
    let report = resumed.run(camel()).await.unwrap();
    assert_eq!(report.termination, Some(Termination::BudgetExhausted));
    assert!(resumed.is_complete());

    let summarise = |run: &OptimisationRun| {
        run.trials()
            .iter()
            .map(|t| (t.id, t.parameters.clone(), t.metrics.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(summarise(&resumed), summarise(&reference));
}

#[tokio::test]
async fn grid_exhaustion_finishes_early() {
    let dir = TempDir::new().unwrap();
    let space = SearchSpace::new()
        .add_discrete("x1", 0, 2)
        .add_categorical("x2", vec![serde_json::json!(1), serde_json::json!(2)]);
    let algorithm = Box::new(GridSearch::new(&space, 3));
    let mut run = OptimisationRun::new(run_config(&dir, 20), space, algorithm).unwrap();

    let report = run.run(camel()).await.unwrap();

    assert_eq!(report.termination, Some(Termination::SearchExhausted));
    assert_eq!(report.total_trials, 6);
    assert!(run.is_complete());
}

#[tokio::test]
async fn maximise_ranks_best_trial_by_largest_value() {
    let dir = TempDir::new().unwrap();
    let config = run_config(&dir, 8).with_mode(OptimisationMode::Maximise);
    let algorithm = Box::new(RandomSearch::with_seed(camel_space(), 5));
    let mut run = OptimisationRun::new(config, camel_space(), algorithm).unwrap();

    let report = run.run(camel()).await.unwrap();

    let largest = run
        .trials()
        .iter()
        .filter_map(|t| t.metric("y1"))
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(report.best_trial.unwrap().metric("y1"), Some(largest));
}

#[tokio::test]
async fn bayesian_search_observes_penalties_for_failures() {
    let dir = TempDir::new().unwrap();
    let algorithm = Box::new(BayesianSearch::new(camel_space(), "y1", 1.0, 9));
    let mut run = OptimisationRun::new(run_config(&dir, 12), camel_space(), algorithm).unwrap();

    let report = run.run(Arc::new(FailsEveryOther::default())).await.unwrap();
    assert_eq!(report.trials_failed, 6);

    let state = run.algorithm().snapshot().unwrap();
    let observations = state["observations"].as_array().unwrap();
    assert_eq!(observations.len(), 12);

    let worst_success = run
        .trials()
        .iter()
        .filter_map(|t| t.metric("y1"))
        .fold(f64::NEG_INFINITY, f64::max);
    for (trial, observation) in run.trials().iter().zip(observations) {
        let observed = observation[1].as_f64().unwrap();
        match trial.metric("y1") {
            Some(value) => assert_eq!(observed, value),
            None => assert!(observed == 1e10 || observed <= worst_success),
        }
    }
    // The first trial fails before anything succeeded.
    assert_eq!(observations[0][1].as_f64(), Some(1e10));
}

#[tokio::test]
async fn checkpoint_on_finish_writes_default_path() {
    let dir = TempDir::new().unwrap();
    let config = run_config(&dir, 2).with_checkpoint_on_finish(true);
    let expected = config.checkpoint_path();
    let algorithm = Box::new(RandomSearch::with_seed(camel_space(), 2));
    let mut run = OptimisationRun::new(config, camel_space(), algorithm).unwrap();

    run.run(camel()).await.unwrap();

    assert!(expected.exists());
    let restored =
        Checkpoint::read_from(&expected, Box::new(RandomSearch::with_seed(camel_space(), 0)))
            .unwrap();
    assert!(restored.is_complete());
}

#[tokio::test]
async fn experiment_file_drives_a_full_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sledo.json");
    let experiment = serde_json::json!({
        "run": {
            "name": "sphere",
            "metric_names": ["y1"],
            "max_total_trials": 6,
            "max_concurrent_trials": 2,
            "output_dir": dir.path(),
        },
        "search_space": [
            {"name": "x1", "kind": "uniform", "bounds": [-1.0, 1.0]},
            {"name": "x2", "kind": "integer", "bounds": [-2, 2]},
        ],
        "algorithm": {"kind": "random", "seed": 4},
        "evaluator": {"kind": "test_function", "function": "sphere"},
    });
    std::fs::write(&path, serde_json::to_vec(&experiment).unwrap()).unwrap();

    let experiment = ExperimentConfig::from_json_file(&path).unwrap();
    assert_eq!(experiment.algorithm, AlgorithmConfig::Random { seed: Some(4) });
    let space = experiment.search_space().unwrap();
    let algorithm = experiment.algorithm.build(&space, experiment.run.primary_metric());
    let mut run = OptimisationRun::new(experiment.run.clone(), space, algorithm).unwrap();

    let report = run.run(experiment.evaluator.build()).await.unwrap();
    assert_eq!(report.trials_succeeded, 6);
    assert!(report.peak_concurrency <= 2);
}

#[tokio::test]
async fn results_are_unavailable_before_running() {
    let dir = TempDir::new().unwrap();
    let algorithm = Box::new(RandomSearch::with_seed(camel_space(), 2));
    let run = OptimisationRun::new(run_config(&dir, 2), camel_space(), algorithm).unwrap();
    assert!(matches!(run.results(), Err(SledoError::NoResults)));
}
