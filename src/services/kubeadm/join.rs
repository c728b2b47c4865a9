//! Join an existing cluster as a worker

use crate::config_manager::Settings;
use crate::error::{BootstrapError, StepContext};
use crate::services::kubeadm::cleanup::{self, ResetReport};
use crate::services::kubeadm::init::check_preconditions;
use crate::services::kubeadm::progress::{Step, StepOutcome};
use crate::services::kubeadm::tools::{JoinTarget, Toolkit};
use crate::services::kubeadm::types::{is_valid_bootstrap_token, OperatorContext};

fn validate_target(target: &JoinTarget) -> Result<(), BootstrapError> {
    let invalid = |reason: String| BootstrapError::Precondition {
        step: Step::JoinCluster,
        reason,
    };
    if target.endpoint.trim().is_empty() || !target.endpoint.contains(':') {
        return Err(invalid(format!(
            "control-plane endpoint must be HOST:PORT, got '{}'",
            target.endpoint
        )));
    }
    if !is_valid_bootstrap_token(&target.token) {
        return Err(invalid(
            "token must look like abcdef.0123456789abcdef".to_string(),
        ));
    }
    match target.ca_cert_hash.strip_prefix("sha256:") {
        Some(hex) if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) => Ok(()),
        _ => Err(invalid(
            "CA certificate hash must be sha256:<hex>".to_string(),
        )),
    }
}

/// Reset the node, then join it to the cluster at `target`. Uses the same
/// relaxed preflight and CRI socket as control-plane init.
pub fn join_cluster(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    operator: &OperatorContext,
    target: &JoinTarget,
) -> Result<ResetReport, BootstrapError> {
    let result = run_join(toolkit, settings, operator, target);
    if let Err(e) = &result {
        toolkit
            .progress
            .report(e.step(), StepOutcome::Failed(e.to_string()));
    }
    result
}

fn run_join(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    operator: &OperatorContext,
    target: &JoinTarget,
) -> Result<ResetReport, BootstrapError> {
    validate_target(target)?;
    check_preconditions(toolkit, settings, false)?;
    let reset = cleanup::reset_node(toolkit, settings, operator)?;

    toolkit.progress.report(Step::JoinCluster, StepOutcome::Started);
    println!("Joining cluster at {}...", target.endpoint);
    toolkit
        .tool
        .join(target, &settings.runtime.cri_socket, true)
        .in_step(Step::JoinCluster)?;
    toolkit
        .progress
        .report(Step::JoinCluster, StepOutcome::Completed);
    println!("✓ Node joined the cluster");
    Ok(reset)
}
