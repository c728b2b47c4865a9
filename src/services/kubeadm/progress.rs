//! Progress events emitted as each bootstrap step starts and finishes

use std::fmt;

/// Named steps of a bootstrap or join run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    DetectIdentity,
    Preconditions,
    Reset,
    RenderConfig,
    InitControlPlane,
    AwaitApiServer,
    ExtractCredentials,
    InstallOverlay,
    AwaitOverlay,
    RemoveTaints,
    JoinCluster,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::DetectIdentity => "detect-identity",
            Step::Preconditions => "preconditions",
            Step::Reset => "reset",
            Step::RenderConfig => "render-config",
            Step::InitControlPlane => "init-control-plane",
            Step::AwaitApiServer => "await-api-server",
            Step::ExtractCredentials => "extract-credentials",
            Step::InstallOverlay => "install-overlay",
            Step::AwaitOverlay => "await-overlay",
            Step::RemoveTaints => "remove-taints",
            Step::JoinCluster => "join-cluster",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Started,
    Completed,
    /// Operator declined the step
    Skipped,
    /// Nothing was present to act on
    NothingToDo,
    /// Step finished in a degraded state that does not abort the run
    Warned(String),
    Failed(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Started => f.write_str("started"),
            StepOutcome::Completed => f.write_str("completed"),
            StepOutcome::Skipped => f.write_str("skipped"),
            StepOutcome::NothingToDo => f.write_str("nothing-to-do"),
            StepOutcome::Warned(_) => f.write_str("warned"),
            StepOutcome::Failed(_) => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Receives progress events. Implementations must not fail the run.
pub trait ProgressSink {
    fn emit(&self, event: ProgressEvent);

    fn report(&self, step: Step, outcome: StepOutcome) {
        self.emit(ProgressEvent { step, outcome });
    }
}

/// Sink that writes structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        let step = event.step.as_str();
        match &event.outcome {
            StepOutcome::Warned(detail) => {
                tracing::warn!(step, outcome = %event.outcome, detail = %detail, "bootstrap step")
            }
            StepOutcome::Failed(detail) => {
                tracing::error!(step, outcome = %event.outcome, detail = %detail, "bootstrap step")
            }
            StepOutcome::Started => tracing::debug!(step, outcome = %event.outcome, "bootstrap step"),
            _ => tracing::info!(step, outcome = %event.outcome, "bootstrap step"),
        }
    }
}
