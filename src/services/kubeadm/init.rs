//! Control-plane initialization
//!
//! `Idle -> Resetting -> Configuring -> Initializing -> AwaitingReadiness ->
//! ExtractingCredentials -> Done`, with `Failed` reachable from any step.
//! No retries here; a caller wanting them wraps the whole run.

use crate::config_manager::Settings;
use crate::error::{BootstrapError, StepContext};
use crate::services::kubeadm::cleanup::{self, ResetReport};
use crate::services::kubeadm::progress::{Step, StepOutcome};
use crate::services::kubeadm::render;
use crate::services::kubeadm::tools::{parse_join_command, Toolkit, SKIP_KUBE_PROXY_PHASE};
use crate::services::kubeadm::types::{
    AdminCredential, BootstrapConfig, BootstrapToken, NodeIdentity, OperatorContext,
    OperatorDecisions,
};
use crate::services::kubeadm::wait::{wait_until, ReadinessCondition, WaitOutcome};
use anyhow::{Context, Result};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Idle,
    Resetting,
    Configuring,
    Initializing,
    AwaitingReadiness,
    ExtractingCredentials,
    Done,
    Failed,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::Idle => "idle",
            InitState::Resetting => "resetting",
            InitState::Configuring => "configuring",
            InitState::Initializing => "initializing",
            InitState::AwaitingReadiness => "awaiting-readiness",
            InitState::ExtractingCredentials => "extracting-credentials",
            InitState::Done => "done",
            InitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A freshly initialized control plane
#[derive(Debug, Clone)]
pub struct ControlPlane {
    pub config: BootstrapConfig,
    pub reset: ResetReport,
    /// False when the API server wait timed out under permissive policy
    pub api_ready: bool,
    pub credential: AdminCredential,
    /// None when kubeadm printed nothing parseable; the operator can mint one later
    pub join_token: Option<BootstrapToken>,
}

#[derive(Debug, Clone)]
pub enum InitOutcome {
    /// Operator chose not to make this node a control plane
    Skipped,
    Initialized(Box<ControlPlane>),
}

/// Verify the tools and runtime are in place before touching node state
pub fn check_preconditions(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    require_cluster_client: bool,
) -> Result<(), BootstrapError> {
    toolkit.progress.report(Step::Preconditions, StepOutcome::Started);
    let fail = |reason: String| BootstrapError::Precondition {
        step: Step::Preconditions,
        reason,
    };

    if !toolkit.tool.is_installed() {
        return Err(fail("kubeadm is not installed or not in PATH".to_string()));
    }
    if require_cluster_client && !toolkit.cluster.is_installed() {
        return Err(fail("kubectl is not installed or not in PATH".to_string()));
    }

    let runtime = &settings.runtime.runtime_service;
    match toolkit.services.is_active(runtime) {
        Ok(true) => {}
        Ok(false) => return Err(fail(format!("container runtime {} is not running", runtime))),
        Err(e) => {
            return Err(fail(format!(
                "could not query container runtime {}: {:#}",
                runtime, e
            )));
        }
    }

    toolkit
        .progress
        .report(Step::Preconditions, StepOutcome::Completed);
    Ok(())
}

/// Copy the admin kubeconfig into the operator's home and hand it over to them
pub fn install_admin_credential(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    operator: &OperatorContext,
) -> Result<AdminCredential> {
    let exec = toolkit.exec;
    let kube_dir = operator.kube_dir();
    let target = operator.kubeconfig_path();

    exec.mkdir_p(&kube_dir)?;
    exec.copy_file(&settings.paths.admin_conf, &target)?;
    exec.chown(&kube_dir, operator.uid, operator.gid)?;
    exec.chown(&target, operator.uid, operator.gid)?;

    println!("✓ Admin kubeconfig installed at {}", target.display());
    Ok(AdminCredential {
        path: target,
        owner: operator.user.clone(),
    })
}

pub struct ClusterInitiator<'a> {
    toolkit: &'a Toolkit<'a>,
    settings: &'a Settings,
    operator: &'a OperatorContext,
    state: InitState,
    history: Vec<InitState>,
}

impl<'a> ClusterInitiator<'a> {
    pub fn new(
        toolkit: &'a Toolkit<'a>,
        settings: &'a Settings,
        operator: &'a OperatorContext,
    ) -> Self {
        Self {
            toolkit,
            settings,
            operator,
            state: InitState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    /// Every state entered after Idle, in order
    pub fn history(&self) -> &[InitState] {
        &self.history
    }

    fn transition(&mut self, next: InitState) {
        tracing::debug!(from = %self.state, to = %next, "control-plane init");
        self.state = next;
        self.history.push(next);
    }

    pub fn run(
        &mut self,
        identity: &NodeIdentity,
        decisions: &OperatorDecisions,
    ) -> Result<InitOutcome, BootstrapError> {
        if !decisions.become_control_plane {
            println!("Skipping control-plane initialization.");
            self.toolkit
                .progress
                .report(Step::InitControlPlane, StepOutcome::Skipped);
            return Ok(InitOutcome::Skipped);
        }

        match self.drive(identity) {
            Ok(control_plane) => Ok(InitOutcome::Initialized(Box::new(control_plane))),
            Err(e) => {
                self.transition(InitState::Failed);
                self.toolkit
                    .progress
                    .report(e.step(), StepOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn drive(&mut self, identity: &NodeIdentity) -> Result<ControlPlane, BootstrapError> {
        let toolkit = self.toolkit;
        let settings = self.settings;
        check_preconditions(toolkit, settings, true)?;

        self.transition(InitState::Resetting);
        let reset = cleanup::reset_node(toolkit, settings, self.operator)?;

        self.transition(InitState::Configuring);
        let config = BootstrapConfig::new(identity, settings);
        self.write_configs(&config).in_step(Step::RenderConfig)?;

        self.transition(InitState::Initializing);
        toolkit
            .progress
            .report(Step::InitControlPlane, StepOutcome::Started);
        println!("Initializing control plane on {}...", config.control_plane_endpoint());
        let output = toolkit
            .tool
            .init(&settings.paths.init_config, true, &[SKIP_KUBE_PROXY_PHASE])
            .in_step(Step::InitControlPlane)?;
        toolkit
            .progress
            .report(Step::InitControlPlane, StepOutcome::Completed);
        println!("✓ kubeadm init completed");

        self.transition(InitState::AwaitingReadiness);
        let api_ready = self.await_api_server(&config)?;

        self.transition(InitState::ExtractingCredentials);
        toolkit
            .progress
            .report(Step::ExtractCredentials, StepOutcome::Started);
        let credential = install_admin_credential(toolkit, settings, self.operator)
            .in_step(Step::ExtractCredentials)?;
        let join_token = self.extract_join_token(&output);
        toolkit
            .progress
            .report(Step::ExtractCredentials, StepOutcome::Completed);

        self.transition(InitState::Done);
        Ok(ControlPlane {
            config,
            reset,
            api_ready,
            credential,
            join_token,
        })
    }

    fn write_configs(&self, config: &BootstrapConfig) -> Result<()> {
        let progress = self.toolkit.progress;
        progress.report(Step::RenderConfig, StepOutcome::Started);
        let rendered = render::render(config)?;
        let paths = &self.settings.paths;
        self.toolkit
            .exec
            .write_file(&paths.init_config, rendered.init_document.as_bytes())
            .context("Failed to write kubeadm init configuration")?;
        self.toolkit
            .exec
            .write_file(&paths.kubelet_config, rendered.kubelet_document.as_bytes())
            .context("Failed to write kubelet configuration")?;
        progress.report(Step::RenderConfig, StepOutcome::Completed);
        println!("✓ Configuration written to {}", paths.init_config.display());
        Ok(())
    }

    /// Poll the API port. A timeout is only fatal under strict policy.
    fn await_api_server(&self, config: &BootstrapConfig) -> Result<bool, BootstrapError> {
        let readiness = &self.settings.readiness;
        let probe = self.toolkit.probe;
        let progress = self.toolkit.progress;
        let what = format!("API server on {}", config.control_plane_endpoint());
        progress.report(Step::AwaitApiServer, StepOutcome::Started);
        println!("Waiting for {}...", what);

        let address = config.advertise_address;
        let port = config.bind_port;
        let condition = ReadinessCondition::new(
            what.clone(),
            Duration::from_secs(readiness.api_poll_secs),
            Duration::from_secs(readiness.api_timeout_secs),
            || probe.is_listening(address, port),
        );

        match wait_until(self.toolkit.clock, condition) {
            WaitOutcome::Ready { .. } => {
                progress.report(Step::AwaitApiServer, StepOutcome::Completed);
                println!("✓ API server is listening");
                Ok(true)
            }
            WaitOutcome::TimedOut { elapsed, .. } if readiness.strict_api => {
                Err(BootstrapError::ReadinessTimeout {
                    step: Step::AwaitApiServer,
                    what,
                    waited: elapsed,
                })
            }
            WaitOutcome::TimedOut { elapsed, .. } => {
                let message = format!(
                    "{} not listening after {}s, continuing",
                    what,
                    elapsed.as_secs()
                );
                println!("⚠ {}", message);
                progress.report(Step::AwaitApiServer, StepOutcome::Warned(message));
                Ok(false)
            }
        }
    }

    fn extract_join_token(&self, init_output: &str) -> Option<BootstrapToken> {
        if let Some(token) = parse_join_command(init_output) {
            return Some(token);
        }
        tracing::debug!("no join command in init output, asking kubeadm for one");
        match self.toolkit.tool.print_join_command() {
            Ok(output) => parse_join_command(&output).or_else(|| {
                println!("⚠ Could not determine a join command; run 'kubeadm token create --print-join-command'");
                None
            }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create join command");
                println!("⚠ Could not create a join command: {}", e.diagnostics());
                None
            }
        }
    }
}
