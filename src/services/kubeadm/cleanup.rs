//! Return a node to its pre-bootstrap state
//!
//! Removals are best-effort: absence is reported as `NotFound`, never as an error.
//! A failing `kubeadm reset` is logged and the manual removals still run.
//! Stopping and restarting services is fatal on failure because the next
//! phase needs a running runtime.

use crate::config_manager::Settings;
use crate::error::{BootstrapError, StepContext};
use crate::services::kubeadm::progress::{Step, StepOutcome};
use crate::services::kubeadm::tools::Toolkit;
use crate::services::kubeadm::types::OperatorContext;
use crate::utils::exec::{CleanupOutcome, CommandExecutor};
use anyhow::Context;

/// What each reset operation found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetReport {
    pub tool_reset: CleanupOutcome,
    pub cni_config: CleanupOutcome,
    pub operator_kube_dir: CleanupOutcome,
    pub node_agent_state: CleanupOutcome,
    pub control_plane_data: CleanupOutcome,
}

impl ResetReport {
    pub fn outcomes(&self) -> [CleanupOutcome; 5] {
        [
            self.tool_reset,
            self.cni_config,
            self.operator_kube_dir,
            self.node_agent_state,
            self.control_plane_data,
        ]
    }

    /// True when the node had nothing left over from a previous run
    pub fn was_clean(&self) -> bool {
        self.outcomes()
            .iter()
            .all(|o| *o == CleanupOutcome::NotFound)
    }
}

fn describe(outcome: CleanupOutcome, what: &str) {
    match outcome {
        CleanupOutcome::Removed => println!("  ✓ Removed {}", what),
        CleanupOutcome::NotFound => println!("  - No {} to remove", what),
    }
}

/// Whether kubeadm left anything behind for its own reset to undo
fn has_prior_state(exec: &dyn CommandExecutor, settings: &Settings) -> bool {
    let paths = &settings.paths;
    let exists = |p: &std::path::Path| exec.file_exists(p).unwrap_or(false);
    exists(&paths.admin_conf)
        || exists(&paths.kubelet_dir.join("config.yaml"))
        || exec.has_entries(&paths.etcd_dir).unwrap_or(false)
}

/// Bring the node to a clean pre-bootstrap state. Safe to run any number of times.
pub fn reset_node(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    operator: &OperatorContext,
) -> Result<ResetReport, BootstrapError> {
    let exec = toolkit.exec;
    let paths = &settings.paths;
    let runtime = &settings.runtime;
    toolkit.progress.report(Step::Reset, StepOutcome::Started);
    println!("Resetting node state...");

    // 1. kubeadm's own reset
    let had_state = has_prior_state(exec, settings);
    let tool_reset = match toolkit.tool.reset(true) {
        Ok(()) if had_state => CleanupOutcome::Removed,
        Ok(()) => CleanupOutcome::NotFound,
        Err(failure) => {
            // The manual removals below cover whatever kubeadm left behind
            tracing::warn!(
                error = %failure,
                had_state,
                "kubeadm reset failed, continuing with manual cleanup"
            );
            println!("  ⚠ kubeadm reset reported an error: {}", failure.diagnostics());
            if had_state {
                CleanupOutcome::Removed
            } else {
                CleanupOutcome::NotFound
            }
        }
    };
    describe(tool_reset, "previous kubeadm state");

    // 2. CNI configuration
    let cni_config = exec.clear_directory(&paths.cni_dir).in_step(Step::Reset)?;
    describe(cni_config, "CNI configuration");

    // 3. Operator's cached admin credential
    let operator_kube_dir = exec
        .remove_path(&operator.kube_dir())
        .in_step(Step::Reset)?;
    describe(operator_kube_dir, "cached kubeconfig");

    // 4. Stop node agent, then runtime
    for unit in [&runtime.node_agent_service, &runtime.runtime_service] {
        toolkit
            .services
            .stop(unit)
            .with_context(|| format!("Failed to stop {}", unit))
            .in_step(Step::Reset)?;
    }

    // 5. Node agent state and control-plane data
    let node_agent_state = exec
        .clear_directory(&paths.kubelet_dir)
        .in_step(Step::Reset)?;
    describe(node_agent_state, "kubelet state");
    let control_plane_data = exec.clear_directory(&paths.etcd_dir).in_step(Step::Reset)?;
    describe(control_plane_data, "etcd data");

    // 6. Runtime, node agent, then the low-level daemon
    let mut restarts = vec![&runtime.runtime_service, &runtime.node_agent_service];
    restarts.extend(runtime.low_level_service.as_ref());
    for unit in restarts {
        toolkit
            .services
            .restart(unit)
            .with_context(|| format!("Failed to restart {}", unit))
            .in_step(Step::Reset)?;
    }
    println!("✓ Services restarted");

    // Soft synchronization point for the daemons to come back
    let settle = runtime.settle_delay();
    if !settle.is_zero() {
        tracing::debug!(secs = settle.as_secs(), "waiting for services to settle");
        toolkit.clock.sleep(settle);
    }

    let report = ResetReport {
        tool_reset,
        cni_config,
        operator_kube_dir,
        node_agent_state,
        control_plane_data,
    };
    let outcome = if report.was_clean() {
        StepOutcome::NothingToDo
    } else {
        StepOutcome::Completed
    };
    toolkit.progress.report(Step::Reset, outcome);
    Ok(report)
}
