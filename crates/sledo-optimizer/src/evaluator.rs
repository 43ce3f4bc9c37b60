//! Design evaluators: the external procedure that scores a parameter set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sledo_types::{EvaluationError, Metrics, ParameterSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Scores a concrete design.
///
/// Implementations may take arbitrarily long, may fail for any reason, and are
/// not assumed to be idempotent: evaluating the same parameters twice may
/// return different values.
#[async_trait]
pub trait DesignEvaluator: Send + Sync {
    /// Evaluate a design. The returned keys must be exactly the metric names
    /// declared to the run.
    async fn evaluate(&self, parameters: &ParameterSet) -> Result<Metrics, EvaluationError>;
}

/// Closed-form benchmark functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFunction {
    /// `2x² - 1.05x⁴ + x⁶/6 + xy + y²`, global minimum 0 at the origin.
    ThreeHumpCamel,
    /// Sum of squares over any number of inputs.
    Sphere,
}

impl TestFunction {
    fn apply(self, inputs: &[f64]) -> Option<f64> {
        match self {
            Self::ThreeHumpCamel => match inputs {
                [x, y] => Some(
                    2.0 * x.powi(2) - 1.05 * x.powi(4) + x.powi(6) / 6.0 + x * y + y.powi(2),
                ),
                _ => None,
            },
            Self::Sphere => Some(inputs.iter().map(|v| v * v).sum()),
        }
    }
}

/// Evaluates a [`TestFunction`] on named parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TestFunctionEvaluator {
    function: TestFunction,
    inputs: Vec<String>,
    metric: String,
}

impl TestFunctionEvaluator {
    /// Reads inputs `x1`, `x2` and reports metric `y1` by default.
    pub fn new(function: TestFunction) -> Self {
        Self {
            function,
            inputs: vec!["x1".to_string(), "x2".to_string()],
            metric: "y1".to_string(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = metric.into();
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }
}

#[async_trait]
impl DesignEvaluator for TestFunctionEvaluator {
    async fn evaluate(&self, parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        let mut values = Vec::with_capacity(self.inputs.len());
        for name in &self.inputs {
            let value = parameters
                .get(name)
                .ok_or_else(|| EvaluationError::InvalidInput {
                    parameter: name.clone(),
                    message: "missing from parameter set".to_string(),
                })?;
            let value = value.as_f64().ok_or_else(|| EvaluationError::InvalidInput {
                parameter: name.clone(),
                message: format!("expected a number, got {value}"),
            })?;
            values.push(value);
        }

        let result = self
            .function
            .apply(&values)
            .ok_or_else(|| EvaluationError::InvalidInput {
                parameter: format!("{:?}", self.function),
                message: format!("unsupported input count {}", values.len()),
            })?;

        let mut metrics = Metrics::new();
        metrics.insert(self.metric.clone(), result);
        Ok(metrics)
    }
}

/// Runs an external program once per trial.
///
/// The parameter set is written to the child's stdin as a JSON object; the
/// last non-empty line of stdout must be a JSON object mapping metric names to
/// numbers. The optional timeout kills the child on expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn parse_metrics(stdout: &[u8]) -> Result<Metrics, EvaluationError> {
        let text = String::from_utf8_lossy(stdout);
        let line = text
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| EvaluationError::MalformedOutput {
                message: "evaluator produced no output".to_string(),
            })?;
        serde_json::from_str(line).map_err(|e| EvaluationError::MalformedOutput {
            message: format!("{e}: {line}"),
        })
    }
}

#[async_trait]
impl DesignEvaluator for CommandEvaluator {
    async fn evaluate(&self, parameters: &ParameterSet) -> Result<Metrics, EvaluationError> {
        let io_failure = |e: std::io::Error| EvaluationError::ProcessFailed {
            status: "io error".to_string(),
            stderr: e.to_string(),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let input = serde_json::to_vec(parameters)
            .map_err(|e| EvaluationError::Other(format!("cannot encode parameters: {e}")))?;

        debug!(program = %self.program, "spawning evaluator process");
        let mut child = command.spawn().map_err(io_failure)?;

        // The timeout covers feeding stdin too; a child that never reads it
        // would otherwise block a large write forever.
        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A child that ignores stdin may exit before reading it.
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            child.wait_with_output().await
        };

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| EvaluationError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => exchange.await,
        }
        .map_err(io_failure)?;

        if !output.status.success() {
            return Err(EvaluationError::ProcessFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse_metrics(&output.stdout)
    }
}
