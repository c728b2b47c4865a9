//! Bootstrap error taxonomy
//!
//! Cleanup and taint removal report "nothing to do" as typed outcomes, not errors.
//! Everything here aborts the remaining sequence and names the step that failed.

use crate::services::kubeadm::progress::Step;
use std::time::Duration;
use thiserror::Error;

/// A failed invocation of an external tool, carrying its diagnostics verbatim.
#[derive(Debug, Clone, Error)]
#[error("`{command}` failed{}: {}", exit_suffix(.exit_code), pick_diagnostics(.stdout, .stderr))]
pub struct ToolFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with exit code {}", code),
        None => String::new(),
    }
}

fn pick_diagnostics<'a>(stdout: &'a str, stderr: &'a str) -> &'a str {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        stdout.trim()
    } else {
        stderr
    }
}

impl ToolFailure {
    pub fn new(command: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    /// stderr when the tool wrote any, otherwise stdout
    pub fn diagnostics(&self) -> &str {
        pick_diagnostics(&self.stdout, &self.stderr)
    }
}

/// Errors that abort a bootstrap run.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Required tools or the container runtime are not available
    #[error("{step} precondition failed: {reason}")]
    Precondition { step: Step, reason: String },

    /// The bootstrap tool itself reported an error
    #[error("{step} failed: {source}")]
    BootstrapTool {
        step: Step,
        #[source]
        source: ToolFailure,
    },

    /// A readiness wait expired under strict policy
    #[error("{step} timed out after {}s waiting for {what}", secs(.waited))]
    ReadinessTimeout {
        step: Step,
        what: String,
        waited: Duration,
    },

    /// Any other required step failed
    #[error("{step} failed: {source:#}")]
    Step {
        step: Step,
        #[source]
        source: anyhow::Error,
    },
}

fn secs(waited: &Duration) -> u64 {
    waited.as_secs()
}

impl BootstrapError {
    pub fn step(&self) -> Step {
        match self {
            BootstrapError::Precondition { step, .. }
            | BootstrapError::BootstrapTool { step, .. }
            | BootstrapError::ReadinessTimeout { step, .. }
            | BootstrapError::Step { step, .. } => *step,
        }
    }

    pub(crate) fn step_failed(step: Step, source: anyhow::Error) -> Self {
        BootstrapError::Step { step, source }
    }
}

/// Attach a step name to an `anyhow` failure
pub(crate) trait StepContext<T> {
    fn in_step(self, step: Step) -> Result<T, BootstrapError>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn in_step(self, step: Step) -> Result<T, BootstrapError> {
        self.map_err(|e| BootstrapError::step_failed(step, e))
    }
}

impl<T> StepContext<T> for Result<T, ToolFailure> {
    fn in_step(self, step: Step) -> Result<T, BootstrapError> {
        self.map_err(|source| BootstrapError::BootstrapTool { step, source })
    }
}
