use std::path::PathBuf;

use anyhow::Context;
use sledo_optimizer::{telemetry, Checkpoint, ExperimentConfig, OptimisationRun, RunReport};
use sledo_types::{SledoError, SledoResult};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");

    let config_path =
        PathBuf::from(std::env::var("SLEDO_CONFIG").unwrap_or_else(|_| "sledo.json".to_string()));
    let experiment = ExperimentConfig::from_json_file(&config_path)
        .with_context(|| format!("loading experiment from {}", config_path.display()))?;

    let space = experiment.search_space()?;
    let algorithm = experiment
        .algorithm
        .build(&space, experiment.run.primary_metric());
    let evaluator = experiment.evaluator.build();

    let checkpoint_path = experiment.run.checkpoint_path();
    let mut run = if experiment.resume && checkpoint_path.exists() {
        info!(path = %checkpoint_path.display(), "resuming from checkpoint");
        let run = Checkpoint::read_from(&checkpoint_path, algorithm)
            .with_context(|| format!("reading checkpoint {}", checkpoint_path.display()))?;
        let drift = run.config().differing_fields(&experiment.run);
        if !drift.is_empty() {
            warn!(
                fields = ?drift,
                "experiment file disagrees with the checkpointed run, keeping the checkpoint's settings"
            );
        }
        run
    } else {
        OptimisationRun::new(experiment.run.clone(), space, algorithm)?
    };

    let stop = run.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight trials");
            stop.request_stop();
        }
    });

    let outcome = run.run(evaluator).await;
    let (report, halted) = conclude(&run, outcome)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match halted {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Persist the run and build its report, keeping partial results when the
/// run halted on a fatal error.
fn conclude(
    run: &OptimisationRun,
    outcome: SledoResult<RunReport>,
) -> anyhow::Result<(RunReport, Option<SledoError>)> {
    let (report, halted) = match outcome {
        Ok(report) => (report, None),
        Err(err) => {
            error!(error = %err, trials = run.trials().len(), "run halted");
            (run.report(), Some(err))
        }
    };

    if !run.config().checkpoint_on_finish {
        let path = run.save_checkpoint().context("writing checkpoint")?;
        info!(path = %path.display(), "checkpoint written");
    }

    Ok((report, halted))
}
