//! Node bootstrap commands

use crate::config_manager::Settings;
use crate::services::kubeadm::progress::{Step, StepOutcome, TracingProgress, ProgressSink};
use crate::services::kubeadm::tools::{
    JoinTarget, Kubeadm, Kubectl, Systemctl, TcpProbe, Toolkit,
};
use crate::services::kubeadm::types::{
    BootstrapConfig, HardwareProfile, NodeIdentity, OperatorDecisions,
};
use crate::services::kubeadm::wait::SystemClock;
use crate::services::kubeadm::{
    self, BootstrapOutcome, BootstrapReport, Bootstrapper, OverlayOutcome,
};
use crate::utils::exec::{CommandExecutor, Executor};
use crate::utils::prompt;
use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Clone, Debug)]
pub enum ClusterCommands {
    /// Bootstrap this node as a control plane (reset, kubeadm init, overlay, taints)
    Init {
        /// Answer yes to every prompt
        #[arg(long, short = 'y')]
        yes: bool,
        /// Do not install the pod network overlay
        #[arg(long)]
        no_overlay: bool,
        /// Leave the control-plane NoSchedule taints in place
        #[arg(long)]
        keep_taints: bool,
        /// Fail if the API server never starts listening
        #[arg(long)]
        strict_readiness: bool,
        /// Fail if overlay pods never become ready
        #[arg(long)]
        strict_overlay: bool,
    },
    /// Reset this node to a clean pre-bootstrap state
    Reset {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Print the kubeadm and kubelet configuration for this node
    Render {
        /// Write the documents here instead of printing them
        #[arg(long, short = 'o')]
        output_dir: Option<PathBuf>,
    },
    /// Reset this node and join an existing cluster as a worker
    Join {
        /// Control plane endpoint (e.g., 192.168.1.50:6443)
        #[arg(long)]
        server: String,
        /// Bootstrap token
        #[arg(long)]
        token: String,
        /// CA certificate hash (sha256:...)
        #[arg(long)]
        ca_cert_hash: String,
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show detected node identity and hardware
    Identity,
}

pub fn handle_cluster(mut settings: Settings, command: ClusterCommands) -> Result<()> {
    match command {
        ClusterCommands::Init {
            yes,
            no_overlay,
            keep_taints,
            strict_readiness,
            strict_overlay,
        } => {
            settings.readiness.strict_api |= strict_readiness;
            settings.readiness.strict_overlay |= strict_overlay;
            handle_init(&settings, yes, no_overlay, keep_taints)
        }
        ClusterCommands::Reset { yes } => handle_reset(&settings, yes),
        ClusterCommands::Render { output_dir } => handle_render(&settings, output_dir.as_deref()),
        ClusterCommands::Join {
            server,
            token,
            ca_cert_hash,
            yes,
        } => {
            let target = JoinTarget {
                endpoint: server,
                token,
                ca_cert_hash,
            };
            handle_join(&settings, &target, yes)
        }
        ClusterCommands::Identity => handle_identity(&settings),
    }
}

/// Build the local collaborators and hand them to `f`
fn with_local_toolkit<T>(settings: &Settings, f: impl FnOnce(&Toolkit<'_>) -> T) -> T {
    let exec = Executor::local();
    let kubeadm = Kubeadm::new(&exec);
    let kubectl = Kubectl::new(&exec, &settings.paths.admin_conf);
    let systemctl = Systemctl::new(&exec);
    let probe = TcpProbe::default();
    let clock = SystemClock::new();
    let progress = TracingProgress;
    let toolkit = Toolkit {
        exec: &exec,
        tool: &kubeadm,
        cluster: &kubectl,
        services: &systemctl,
        probe: &probe,
        clock: &clock,
        progress: &progress,
    };
    f(&toolkit)
}

fn ensure_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("This command changes system state and must be run as root (try sudo)");
    }
    Ok(())
}

fn detect_node(exec: &dyn CommandExecutor, settings: &Settings) -> Result<(NodeIdentity, HardwareProfile)> {
    let progress = TracingProgress;
    progress.report(Step::DetectIdentity, StepOutcome::Started);
    let identity = kubeadm::detect_node_identity(exec).context("Failed to detect node identity")?;
    let hardware = kubeadm::detect_hardware_profile(exec, &settings.overlay);
    progress.report(Step::DetectIdentity, StepOutcome::Completed);
    Ok((identity, hardware))
}

fn print_node(identity: &NodeIdentity, hardware: &HardwareProfile) {
    println!("Node: {}", identity.hostname);
    println!(
        "  Primary interface: {} ({})",
        identity.primary_interface, identity.primary_ip
    );
    match &hardware.model {
        Some(model) => println!("  Board: {}", model),
        None => println!("  Board: unknown"),
    }
    if hardware.is_constrained_sbc {
        println!("  Constrained board: overlay will be pinned to {}", identity.primary_interface);
    }
}

/// Resolve the operator's yes/no decisions from flags, asking for the rest
pub fn decide<F>(yes: bool, no_overlay: bool, keep_taints: bool, mut ask: F) -> Result<OperatorDecisions>
where
    F: FnMut(&str, bool) -> Result<bool>,
{
    let become_control_plane =
        yes || ask("Initialize this node as a Kubernetes control plane?", false)?;
    if !become_control_plane {
        return Ok(OperatorDecisions {
            become_control_plane,
            install_overlay: false,
            remove_taints: false,
        });
    }

    let install_overlay = if no_overlay {
        false
    } else {
        yes || ask("Install the flannel pod network?", true)?
    };

    Ok(OperatorDecisions {
        become_control_plane,
        install_overlay,
        remove_taints: !keep_taints,
    })
}

fn handle_init(settings: &Settings, yes: bool, no_overlay: bool, keep_taints: bool) -> Result<()> {
    ensure_root()?;
    let exec = Executor::local();
    let (identity, hardware) = detect_node(&exec, settings)?;
    let operator = kubeadm::detect_operator()?;
    print_node(&identity, &hardware);
    println!("  Operator: {} ({})", operator.user, operator.home.display());
    println!();

    let decisions = decide(yes, no_overlay, keep_taints, prompt::confirm)?;
    if !decisions.become_control_plane {
        println!("Not initializing a control plane. To add this node to an existing cluster run:");
        println!("  kubeboot join --server <host:6443> --token <token> --ca-cert-hash sha256:<hash>");
        return Ok(());
    }

    let outcome = with_local_toolkit(settings, |toolkit| {
        Bootstrapper::new(toolkit, settings, &operator).bootstrap(&identity, &hardware, &decisions)
    })?;

    match outcome {
        BootstrapOutcome::Skipped => println!("Control-plane initialization skipped."),
        BootstrapOutcome::Completed(report) => print_summary(&report),
    }
    Ok(())
}

fn print_summary(report: &BootstrapReport) {
    let control_plane = &report.control_plane;
    println!();
    println!("✓ Control plane initialized at {}", control_plane.config.control_plane_endpoint());
    if !control_plane.api_ready {
        println!("⚠ The API server was not confirmed ready; check 'systemctl status kubelet'");
    }
    println!(
        "  Admin kubeconfig: {} (owner: {})",
        control_plane.credential.path.display(),
        control_plane.credential.owner
    );

    match &report.overlay {
        OverlayOutcome::Skipped => println!("  Pod network: not installed"),
        OverlayOutcome::Installed { ready: true, .. } => println!("  Pod network: ready"),
        OverlayOutcome::Installed { ready: false, .. } => {
            println!("  Pod network: applied, pods not ready yet")
        }
    }

    if let Some(token) = &control_plane.join_token {
        println!();
        println!("To join worker nodes, run on each node:");
        println!(
            "  kubeboot join --server {} --token {} --ca-cert-hash {}",
            token.control_plane_endpoint, token.token, token.ca_cert_hash
        );
        println!("or:");
        println!("  {}", token.join_command());
        println!();
        println!("The token expires in 24 hours; record it now.");
    }
}

fn handle_reset(settings: &Settings, yes: bool) -> Result<()> {
    ensure_root()?;
    if !yes
        && !prompt::confirm(
            "This will destroy all cluster state on this node. Continue?",
            false,
        )?
    {
        println!("Reset cancelled.");
        return Ok(());
    }

    let operator = kubeadm::detect_operator()?;
    let report = with_local_toolkit(settings, |toolkit| {
        kubeadm::reset_node(toolkit, settings, &operator)
    })?;
    if report.was_clean() {
        println!("✓ Node was already clean");
    } else {
        println!("✓ Node reset");
    }
    Ok(())
}

fn handle_render(settings: &Settings, output_dir: Option<&Path>) -> Result<()> {
    let exec = Executor::local();
    let (identity, _) = detect_node(&exec, settings)?;
    let config = BootstrapConfig::new(&identity, settings);
    let rendered = kubeadm::render(&config)?;

    match output_dir {
        Some(dir) => {
            let init_path = dir.join("kubeadm-init.yaml");
            let kubelet_path = dir.join("kubelet-config.yaml");
            exec.write_file(&init_path, rendered.init_document.as_bytes())?;
            exec.write_file(&kubelet_path, rendered.kubelet_document.as_bytes())?;
            println!("✓ Wrote {}", init_path.display());
            println!("✓ Wrote {}", kubelet_path.display());
        }
        None => print!("{}", rendered.init_document),
    }
    Ok(())
}

fn handle_join(settings: &Settings, target: &JoinTarget, yes: bool) -> Result<()> {
    ensure_root()?;
    if !yes
        && !prompt::confirm(
            &format!(
                "Reset this node and join the cluster at {}?",
                target.endpoint
            ),
            false,
        )?
    {
        println!("Join cancelled.");
        return Ok(());
    }

    let operator = kubeadm::detect_operator()?;
    with_local_toolkit(settings, |toolkit| {
        kubeadm::join_cluster(toolkit, settings, &operator, target)
    })?;
    println!("Run 'kubectl get nodes' on the control plane to confirm.");
    Ok(())
}

fn handle_identity(settings: &Settings) -> Result<()> {
    let exec = Executor::local();
    let (identity, hardware) = detect_node(&exec, settings)?;
    print_node(&identity, &hardware);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_asked(question: &str, _default: bool) -> Result<bool> {
        panic!("unexpected prompt: {}", question);
    }

    #[test]
    fn test_yes_answers_everything() {
        let decisions = decide(true, false, false, never_asked).unwrap();
        assert_eq!(
            decisions,
            OperatorDecisions {
                become_control_plane: true,
                install_overlay: true,
                remove_taints: true,
            }
        );
    }

    #[test]
    fn test_prompt_defaults() {
        let mut asked = Vec::new();
        let decisions = decide(false, false, false, |question, default| {
            asked.push((question.to_string(), default));
            Ok(default)
        })
        .unwrap();

        // Control plane defaults to no, so the overlay question is never reached
        assert!(!decisions.become_control_plane);
        assert_eq!(asked.len(), 1);
        assert!(!asked[0].1);
    }

    #[test]
    fn test_overlay_defaults_to_yes() {
        let mut answers = vec![true];
        let decisions = decide(false, false, true, |_, default| {
            Ok(answers.pop().unwrap_or(default))
        })
        .unwrap();
        assert!(decisions.become_control_plane);
        assert!(decisions.install_overlay);
        assert!(!decisions.remove_taints);
    }

    #[test]
    fn test_no_overlay_flag_skips_question() {
        let decisions = decide(false, true, false, |question, _| {
            assert!(question.contains("control plane"));
            Ok(true)
        })
        .unwrap();
        assert!(!decisions.install_overlay);
    }
}
