//! Wrappers around the external tools the bootstrap drives: kubeadm, kubectl, systemctl

use crate::error::ToolFailure;
use crate::services::kubeadm::progress::ProgressSink;
use crate::services::kubeadm::taints::TaintRemoval;
use crate::services::kubeadm::types::BootstrapToken;
use crate::services::kubeadm::wait::Clock;
use crate::utils::bytes_to_string;
use crate::utils::exec::CommandExecutor;
use crate::utils::networking;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

/// kube-proxy is replaced by the overlay
pub const SKIP_KUBE_PROXY_PHASE: &str = "addon/kube-proxy";

/// Where to join an existing cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
}

/// The control-plane bootstrap tool (kubeadm)
pub trait BootstrapTool {
    fn is_installed(&self) -> bool;

    /// Undo any previous init/join. `force` skips the confirmation prompt.
    fn reset(&self, force: bool) -> Result<(), ToolFailure>;

    /// Initialize a control plane from a config file, returning the tool's output
    fn init(
        &self,
        config_path: &Path,
        ignore_preflight_errors: bool,
        skip_phases: &[&str],
    ) -> Result<String, ToolFailure>;

    /// Mint a fresh join command for worker nodes
    fn print_join_command(&self) -> Result<String, ToolFailure>;

    fn join(
        &self,
        target: &JoinTarget,
        cri_socket: &str,
        ignore_preflight_errors: bool,
    ) -> Result<String, ToolFailure>;
}

/// Cluster API access (kubectl)
pub trait ClusterClient {
    fn is_installed(&self) -> bool;

    fn apply_manifest(&self, document: &str) -> Result<()>;

    /// True when at least one pod matches and every match reports Ready
    fn pods_ready(&self, namespace: &str, selector: &str) -> Result<bool>;

    /// Remove `key:effect` from every node
    fn remove_taint(&self, taint: &str) -> Result<TaintRemoval>;
}

/// Service supervisor (systemd)
pub trait ServiceManager {
    fn is_active(&self, unit: &str) -> Result<bool>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn restart(&self, unit: &str) -> Result<()>;
}

/// Checks whether the API server accepts connections
pub trait ApiProbe {
    fn is_listening(&self, address: IpAddr, port: u16) -> bool;
}

fn tool_failure(command: String, output: &Output) -> ToolFailure {
    ToolFailure::new(command, output.status.code()).with_output(
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

/// kubeadm driven through a command executor
pub struct Kubeadm<'a, E: CommandExecutor + ?Sized> {
    exec: &'a E,
}

impl<'a, E: CommandExecutor + ?Sized> Kubeadm<'a, E> {
    pub fn new(exec: &'a E) -> Self {
        Self { exec }
    }

    fn run(&self, args: &[&str]) -> Result<String, ToolFailure> {
        let command = format!("kubeadm {}", args.join(" "));
        tracing::debug!(%command, "running kubeadm");
        let output = self
            .exec
            .execute_simple("kubeadm", args)
            .map_err(|e| ToolFailure::new(command.clone(), None).with_output("", format!("{:#}", e)))?;
        if !output.status.success() {
            return Err(tool_failure(command, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn preflight_flag(ignore: bool) -> Option<&'static str> {
    ignore.then_some("--ignore-preflight-errors=all")
}

impl<E: CommandExecutor + ?Sized> BootstrapTool for Kubeadm<'_, E> {
    fn is_installed(&self) -> bool {
        self.exec.check_command_exists("kubeadm").unwrap_or(false)
    }

    fn reset(&self, force: bool) -> Result<(), ToolFailure> {
        let mut args = vec!["reset"];
        if force {
            args.push("--force");
        }
        self.run(&args).map(|_| ())
    }

    fn init(
        &self,
        config_path: &Path,
        ignore_preflight_errors: bool,
        skip_phases: &[&str],
    ) -> Result<String, ToolFailure> {
        let config_arg = format!("--config={}", config_path.display());
        let skip_arg = format!("--skip-phases={}", skip_phases.join(","));
        let mut args = vec!["init", config_arg.as_str()];
        args.extend(preflight_flag(ignore_preflight_errors));
        if !skip_phases.is_empty() {
            args.push(&skip_arg);
        }
        self.run(&args)
    }

    fn print_join_command(&self) -> Result<String, ToolFailure> {
        self.run(&["token", "create", "--print-join-command"])
    }

    fn join(
        &self,
        target: &JoinTarget,
        cri_socket: &str,
        ignore_preflight_errors: bool,
    ) -> Result<String, ToolFailure> {
        let mut args = vec![
            "join",
            target.endpoint.as_str(),
            "--token",
            target.token.as_str(),
            "--discovery-token-ca-cert-hash",
            target.ca_cert_hash.as_str(),
            "--cri-socket",
            cri_socket,
        ];
        args.extend(preflight_flag(ignore_preflight_errors));
        self.run(&args)
    }
}

/// Pull the worker join command out of kubeadm output.
///
/// kubeadm wraps the command over several lines with trailing backslashes and
/// prints a `--control-plane` variant before the worker one; the last command wins.
pub fn parse_join_command(output: &str) -> Option<BootstrapToken> {
    let joined = output.replace("\\\r\n", " ").replace("\\\n", " ");
    let line = joined
        .lines()
        .filter(|line| line.contains("kubeadm join"))
        .last()?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let join_at = tokens.iter().position(|t| *t == "join")?;
    let endpoint = tokens.get(join_at + 1)?;
    let value_of = |flag: &str| {
        tokens
            .windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].to_string())
    };

    Some(BootstrapToken {
        control_plane_endpoint: endpoint.to_string(),
        token: value_of("--token")?,
        ca_cert_hash: value_of("--discovery-token-ca-cert-hash")?,
    })
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Evaluate `kubectl get pods -o json` output
pub fn all_pods_ready(pod_list_json: &str) -> Result<bool> {
    let list: PodList =
        serde_json::from_str(pod_list_json).context("Failed to parse pod list from kubectl")?;
    if list.items.is_empty() {
        return Ok(false);
    }
    Ok(list.items.iter().all(|pod| {
        pod.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }))
}

/// kubectl against the cluster's admin kubeconfig
pub struct Kubectl<'a, E: CommandExecutor + ?Sized> {
    exec: &'a E,
    kubeconfig: PathBuf,
}

impl<'a, E: CommandExecutor + ?Sized> Kubectl<'a, E> {
    pub fn new(exec: &'a E, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            kubeconfig: kubeconfig.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let kubeconfig = format!("--kubeconfig={}", self.kubeconfig.display());
        let mut full_args = vec![kubeconfig.as_str()];
        full_args.extend_from_slice(args);
        self.exec.execute_simple("kubectl", &full_args)
    }
}

impl<E: CommandExecutor + ?Sized> ClusterClient for Kubectl<'_, E> {
    fn is_installed(&self) -> bool {
        self.exec.check_command_exists("kubectl").unwrap_or(false)
    }

    fn apply_manifest(&self, document: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("kubeboot-manifest-")
            .suffix(".yaml")
            .tempfile()
            .context("Failed to create temporary manifest file")?;
        file.write_all(document.as_bytes())?;
        file.flush()?;

        let path = file.path().display().to_string();
        let output = self.run(&["apply", "-f", &path])?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn pods_ready(&self, namespace: &str, selector: &str) -> Result<bool> {
        let output = self.run(&["get", "pods", "-n", namespace, "-l", selector, "-o", "json"])?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl get pods failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        all_pods_ready(&String::from_utf8_lossy(&output.stdout))
    }

    fn remove_taint(&self, taint: &str) -> Result<TaintRemoval> {
        let removal = format!("{}-", taint);
        let output = self.run(&["taint", "nodes", "--all", &removal])?;
        let stdout = bytes_to_string(&output.stdout);
        let stderr = bytes_to_string(&output.stderr);
        classify_taint_output(output.status.success(), &stdout, &stderr)
    }
}

/// Map `kubectl taint ... -` results onto Removed / NotFound
pub fn classify_taint_output(success: bool, stdout: &str, stderr: &str) -> Result<TaintRemoval> {
    if success {
        if stdout.contains("untainted") {
            return Ok(TaintRemoval::Removed);
        }
        return Ok(TaintRemoval::NotFound);
    }
    if stderr.contains("not found") {
        return Ok(TaintRemoval::NotFound);
    }
    anyhow::bail!("kubectl taint failed: {}", stderr)
}

/// systemd via systemctl
pub struct Systemctl<'a, E: CommandExecutor + ?Sized> {
    exec: &'a E,
}

impl<'a, E: CommandExecutor + ?Sized> Systemctl<'a, E> {
    pub fn new(exec: &'a E) -> Self {
        Self { exec }
    }

    fn run(&self, verb: &str, unit: &str) -> Result<()> {
        let output = self
            .exec
            .execute_simple("systemctl", &[verb, unit])
            .with_context(|| format!("Failed to {} {}", verb, unit))?;
        if !output.status.success() {
            anyhow::bail!(
                "systemctl {} {} failed: {}",
                verb,
                unit,
                bytes_to_string(&output.stderr)
            );
        }
        Ok(())
    }
}

impl<E: CommandExecutor + ?Sized> ServiceManager for Systemctl<'_, E> {
    fn is_active(&self, unit: &str) -> Result<bool> {
        // systemctl is-active returns "active" if running, non-zero exit if not
        let output = self.exec.execute_simple("systemctl", &["is-active", unit])?;
        Ok(output.status.success() && bytes_to_string(&output.stdout) == "active")
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.run("stop", unit)
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.run("restart", unit)
    }
}

/// TCP connect probe
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ApiProbe for TcpProbe {
    fn is_listening(&self, address: IpAddr, port: u16) -> bool {
        networking::is_port_open(address, port, self.connect_timeout)
    }
}

/// Every collaborator a bootstrap run talks to
pub struct Toolkit<'a> {
    pub exec: &'a dyn CommandExecutor,
    pub tool: &'a dyn BootstrapTool,
    pub cluster: &'a dyn ClusterClient,
    pub services: &'a dyn ServiceManager,
    pub probe: &'a dyn ApiProbe,
    pub clock: &'a dyn Clock,
    pub progress: &'a dyn ProgressSink,
}
