//! In-memory collaborators for orchestration tests

use crate::config_manager::{NodePaths, Settings};
use crate::error::ToolFailure;
use crate::services::kubeadm::progress::{ProgressEvent, ProgressSink, Step, StepOutcome};
use crate::services::kubeadm::taints::TaintRemoval;
use crate::services::kubeadm::tools::{
    ApiProbe, BootstrapTool, ClusterClient, JoinTarget, ServiceManager, Toolkit,
};
use crate::services::kubeadm::wait::Clock;
use crate::services::kubeadm::types::{NodeIdentity, OperatorContext};
use crate::utils::exec::Executor;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

pub const INIT_OUTPUT: &str = "\
Your Kubernetes control-plane has initialized successfully!

Then you can join any number of worker nodes by running the following on each as root:

kubeadm join 192.168.1.50:6443 --token abcdef.0123456789abcdef \\
\t--discovery-token-ca-cert-hash sha256:0a1b2c3d
";

/// Clock that only advances when slept on
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    slept: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Total time spent in `sleep`
    pub fn total_slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.advance(duration);
    }
}

/// Ordered record of every collaborator call, shared between fakes
#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.borrow_mut().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Index of the first call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.borrow().iter().position(|c| c.starts_with(prefix))
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }
}

/// kubeadm stand-in. A successful init writes the admin kubeconfig; reset removes it.
pub struct FakeTool {
    log: CallLog,
    admin_conf: PathBuf,
    installed: Cell<bool>,
    init_failure: RefCell<Option<ToolFailure>>,
    reset_failure: RefCell<Option<ToolFailure>>,
    join_failure: RefCell<Option<ToolFailure>>,
    init_output: RefCell<String>,
    join_command: RefCell<String>,
}

impl FakeTool {
    pub fn new(log: CallLog, admin_conf: impl Into<PathBuf>) -> Self {
        Self {
            log,
            admin_conf: admin_conf.into(),
            installed: Cell::new(true),
            init_failure: RefCell::new(None),
            reset_failure: RefCell::new(None),
            join_failure: RefCell::new(None),
            init_output: RefCell::new(INIT_OUTPUT.to_string()),
            join_command: RefCell::new(String::new()),
        }
    }

    pub fn fail_init(&self, failure: ToolFailure) {
        *self.init_failure.borrow_mut() = Some(failure);
    }

    pub fn fail_reset(&self, failure: ToolFailure) {
        *self.reset_failure.borrow_mut() = Some(failure);
    }

    pub fn fail_join(&self, failure: ToolFailure) {
        *self.join_failure.borrow_mut() = Some(failure);
    }

    pub fn set_init_output(&self, output: &str) {
        *self.init_output.borrow_mut() = output.to_string();
    }

    pub fn set_join_command(&self, output: &str) {
        *self.join_command.borrow_mut() = output.to_string();
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.set(installed);
    }
}

impl BootstrapTool for FakeTool {
    fn is_installed(&self) -> bool {
        self.installed.get()
    }

    fn reset(&self, force: bool) -> Result<(), ToolFailure> {
        self.log.record(format!("kubeadm reset force={}", force));
        if let Some(failure) = self.reset_failure.borrow().clone() {
            return Err(failure);
        }
        let _ = std::fs::remove_file(&self.admin_conf);
        Ok(())
    }

    fn init(
        &self,
        config_path: &Path,
        ignore_preflight_errors: bool,
        skip_phases: &[&str],
    ) -> Result<String, ToolFailure> {
        self.log.record(format!(
            "kubeadm init config={} ignore-preflight={} skip={}",
            config_path.display(),
            ignore_preflight_errors,
            skip_phases.join(",")
        ));
        if let Some(failure) = self.init_failure.borrow().clone() {
            return Err(failure);
        }
        if let Some(parent) = self.admin_conf.parent() {
            std::fs::create_dir_all(parent).expect("create admin conf dir");
        }
        std::fs::write(&self.admin_conf, "apiVersion: v1\nkind: Config\n")
            .expect("write admin conf");
        Ok(self.init_output.borrow().clone())
    }

    fn print_join_command(&self) -> Result<String, ToolFailure> {
        self.log.record("kubeadm token create");
        Ok(self.join_command.borrow().clone())
    }

    fn join(
        &self,
        target: &JoinTarget,
        cri_socket: &str,
        ignore_preflight_errors: bool,
    ) -> Result<String, ToolFailure> {
        self.log.record(format!(
            "kubeadm join {} token={} hash={} cri={} ignore-preflight={}",
            target.endpoint, target.token, target.ca_cert_hash, cri_socket, ignore_preflight_errors
        ));
        if let Some(failure) = self.join_failure.borrow().clone() {
            return Err(failure);
        }
        Ok(String::new())
    }
}

/// kubectl stand-in
#[derive(Default)]
pub struct FakeCluster {
    log: CallLog,
    applied: RefCell<Vec<String>>,
    taints: RefCell<HashMap<String, TaintRemoval>>,
    taint_error: RefCell<Option<String>>,
    /// pods_ready turns true on this call number; None never
    ready_on_call: Cell<Option<u32>>,
    ready_calls: Cell<u32>,
}

impl FakeCluster {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ready_on_call: Cell::new(Some(1)),
            ..Self::default()
        }
    }

    pub fn set_taint_result(&self, taint: &str, removal: TaintRemoval) {
        self.taints.borrow_mut().insert(taint.to_string(), removal);
    }

    pub fn fail_taints(&self, message: &str) {
        *self.taint_error.borrow_mut() = Some(message.to_string());
    }

    pub fn set_ready_on_call(&self, call: Option<u32>) {
        self.ready_on_call.set(call);
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.borrow().clone()
    }
}

impl ClusterClient for FakeCluster {
    fn is_installed(&self) -> bool {
        true
    }

    fn apply_manifest(&self, document: &str) -> anyhow::Result<()> {
        self.log.record("kubectl apply");
        self.applied.borrow_mut().push(document.to_string());
        Ok(())
    }

    fn pods_ready(&self, namespace: &str, selector: &str) -> anyhow::Result<bool> {
        let call = self.ready_calls.get() + 1;
        self.ready_calls.set(call);
        self.log.record(format!("kubectl pods-ready {} {}", namespace, selector));
        Ok(self.ready_on_call.get().is_some_and(|n| call >= n))
    }

    fn remove_taint(&self, taint: &str) -> anyhow::Result<TaintRemoval> {
        self.log.record(format!("kubectl taint {}", taint));
        if let Some(message) = self.taint_error.borrow().clone() {
            anyhow::bail!("kubectl taint failed: {}", message);
        }
        Ok(self
            .taints
            .borrow()
            .get(taint)
            .copied()
            .unwrap_or(TaintRemoval::NotFound))
    }
}

/// systemctl stand-in. Every unit is active unless marked otherwise.
#[derive(Default)]
pub struct FakeServices {
    log: CallLog,
    inactive: RefCell<HashSet<String>>,
    failing: RefCell<HashSet<String>>,
}

impl FakeServices {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn mark_inactive(&self, unit: &str) {
        self.inactive.borrow_mut().insert(unit.to_string());
    }

    pub fn fail_unit(&self, unit: &str) {
        self.failing.borrow_mut().insert(unit.to_string());
    }

    fn act(&self, verb: &str, unit: &str) -> anyhow::Result<()> {
        self.log.record(format!("systemctl {} {}", verb, unit));
        if self.failing.borrow().contains(unit) {
            anyhow::bail!("systemctl {} {} failed: Unit {}.service not loaded", verb, unit, unit);
        }
        Ok(())
    }
}

impl ServiceManager for FakeServices {
    fn is_active(&self, unit: &str) -> anyhow::Result<bool> {
        Ok(!self.inactive.borrow().contains(unit))
    }

    fn stop(&self, unit: &str) -> anyhow::Result<()> {
        self.act("stop", unit)
    }

    fn restart(&self, unit: &str) -> anyhow::Result<()> {
        self.act("restart", unit)
    }
}

/// API probe that starts listening on the n-th check, or never
pub struct FakeProbe {
    listening_on_call: Option<u32>,
    calls: Cell<u32>,
}

impl FakeProbe {
    pub fn listening_on(call: u32) -> Self {
        Self {
            listening_on_call: Some(call),
            calls: Cell::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            listening_on_call: None,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl ApiProbe for FakeProbe {
    fn is_listening(&self, _address: IpAddr, _port: u16) -> bool {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        self.listening_on_call.is_some_and(|n| call >= n)
    }
}

/// Progress sink that keeps every event
#[derive(Default)]
pub struct RecordingProgress {
    events: RefCell<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.borrow().clone()
    }

    pub fn outcomes_for(&self, step: Step) -> Vec<StepOutcome> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.step == step)
            .map(|e| e.outcome.clone())
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, event: ProgressEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// Scratch node: settings rooted in a temp dir plus an operator owned by the test user
pub struct ScratchNode {
    pub root: TempDir,
    pub settings: Settings,
    pub operator: OperatorContext,
}

impl ScratchNode {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::default();
        settings.paths = NodePaths::rooted_at(root.path());
        let home = root.path().join("home/operator");
        std::fs::create_dir_all(&home).expect("create home");
        let operator = OperatorContext {
            user: "operator".to_string(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home,
        };
        Self {
            root,
            settings,
            operator,
        }
    }

    /// Leave artifacts behind as a previous bootstrap would
    pub fn seed_previous_install(&self) {
        let paths = &self.settings.paths;
        for dir in [&paths.cni_dir, &paths.kubelet_dir, &paths.etcd_dir] {
            std::fs::create_dir_all(dir).expect("create dir");
        }
        std::fs::write(paths.cni_dir.join("10-flannel.conflist"), "{}").unwrap();
        std::fs::write(paths.kubelet_dir.join("config.yaml"), "kind: KubeletConfiguration").unwrap();
        std::fs::create_dir_all(paths.etcd_dir.join("member")).unwrap();
        std::fs::create_dir_all(paths.admin_conf.parent().unwrap()).unwrap();
        std::fs::write(&paths.admin_conf, "apiVersion: v1").unwrap();
        std::fs::create_dir_all(self.operator.kube_dir()).unwrap();
        std::fs::write(self.operator.kubeconfig_path(), "stale").unwrap();
    }
}

pub fn identity() -> NodeIdentity {
    NodeIdentity {
        hostname: "pi-01".to_string(),
        primary_interface: "eth0".to_string(),
        primary_ip: "192.168.1.50".parse().unwrap(),
    }
}

/// A scratch node wired to fakes sharing one call log
pub struct Harness {
    pub log: CallLog,
    pub node: ScratchNode,
    pub exec: Executor,
    pub tool: FakeTool,
    pub cluster: FakeCluster,
    pub services: FakeServices,
    pub probe: FakeProbe,
    pub clock: ManualClock,
    pub progress: RecordingProgress,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_probe(FakeProbe::listening_on(1))
    }

    pub fn with_probe(probe: FakeProbe) -> Self {
        let log = CallLog::default();
        let node = ScratchNode::new();
        let tool = FakeTool::new(log.clone(), &node.settings.paths.admin_conf);
        Self {
            cluster: FakeCluster::new(log.clone()),
            services: FakeServices::new(log.clone()),
            probe,
            clock: ManualClock::new(),
            progress: RecordingProgress::default(),
            exec: Executor::local(),
            tool,
            node,
            log,
        }
    }

    pub fn toolkit(&self) -> Toolkit<'_> {
        Toolkit {
            exec: &self.exec,
            tool: &self.tool,
            cluster: &self.cluster,
            services: &self.services,
            probe: &self.probe,
            clock: &self.clock,
            progress: &self.progress,
        }
    }
}
