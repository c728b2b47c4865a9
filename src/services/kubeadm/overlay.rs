//! Pod network overlay (flannel) installation
//!
//! On constrained boards flannel must be told which interface to use, otherwise
//! it can pick a wireless or USB link. The interface is set structurally on the
//! flannel container's args rather than by patching text. A placeholder in a
//! local template is filled in on every host.

use crate::config_manager::{OverlaySettings, Settings};
use crate::error::{BootstrapError, StepContext};
use crate::services::kubeadm::progress::{Step, StepOutcome};
use crate::services::kubeadm::tools::Toolkit;
use crate::services::kubeadm::types::{HardwareProfile, NodeIdentity};
use crate::services::kubeadm::wait::{wait_until, ReadinessCondition, WaitOutcome};
use crate::utils::exec::CommandExecutor;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Token in local manifest templates replaced by the node's primary interface
pub const IFACE_PLACEHOLDER: &str = "__FLANNEL_IFACE__";

const FLANNEL_CONTAINER: &str = "kube-flannel";
const IFACE_FLAG: &str = "--iface=";

/// Where the overlay manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Url(String),
    File(PathBuf),
    Inline(String),
}

impl ManifestSource {
    /// A local template wins over the upstream URL
    pub fn from_settings(overlay: &OverlaySettings) -> Self {
        match &overlay.manifest_path {
            Some(path) => ManifestSource::File(path.clone()),
            None => ManifestSource::Url(overlay.manifest_url.clone()),
        }
    }

    pub fn load(&self, exec: &dyn CommandExecutor) -> Result<String> {
        match self {
            ManifestSource::Url(url) => fetch_manifest(url),
            ManifestSource::File(path) => exec.read_file(path),
            ManifestSource::Inline(document) => Ok(document.clone()),
        }
    }
}

impl std::fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestSource::Url(url) => write!(f, "{}", url),
            ManifestSource::File(path) => write!(f, "{}", path.display()),
            ManifestSource::Inline(_) => write!(f, "inline manifest"),
        }
    }
}

fn fetch_manifest(url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    client
        .get(url)
        .send()
        .with_context(|| format!("Failed to download overlay manifest from {}", url))?
        .error_for_status()
        .with_context(|| format!("HTTP error fetching {}", url))?
        .text()
        .context("Failed to read overlay manifest body")
}

fn parse_documents(manifest: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(document).context("Invalid overlay manifest YAML")?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn render_documents(documents: &[Value]) -> Result<String> {
    let mut out = String::new();
    for document in documents {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(document).context("Failed to serialize manifest")?);
    }
    Ok(out)
}

fn is_flannel_container(container: &Value) -> bool {
    if container.get("name").and_then(Value::as_str) == Some(FLANNEL_CONTAINER) {
        return true;
    }
    container
        .get("args")
        .and_then(Value::as_sequence)
        .is_some_and(|args| args.iter().any(|a| a.as_str() == Some("--kube-subnet-mgr")))
}

/// Replace any existing `--iface=` argument with one for `iface`
fn set_iface_arg(container: &mut Value, iface: &str) -> bool {
    let Some(map) = container.as_mapping_mut() else {
        return false;
    };
    if !map.contains_key("args") {
        map.insert(Value::String("args".to_string()), Value::Sequence(Vec::new()));
    }
    let Some(args) = map.get_mut("args").and_then(Value::as_sequence_mut) else {
        return false;
    };
    args.retain(|arg| !arg.as_str().is_some_and(|s| s.starts_with(IFACE_FLAG)));
    args.push(Value::String(format!("{}{}", IFACE_FLAG, iface)));
    true
}

fn fill_placeholder(manifest: String, iface: &str) -> String {
    if manifest.contains(IFACE_PLACEHOLDER) {
        tracing::debug!(iface, "substituting interface placeholder in overlay manifest");
        manifest.replace(IFACE_PLACEHOLDER, iface)
    } else {
        manifest
    }
}

/// Point flannel at `iface`: substitute the template placeholder, then set
/// the flannel container's `--iface` argument in every DaemonSet
pub fn pin_interface(manifest: &str, iface: &str) -> Result<String> {
    let substituted = manifest.replace(IFACE_PLACEHOLDER, iface);
    let mut documents = parse_documents(&substituted)?;

    let mut pinned = 0;
    for document in documents.iter_mut() {
        if document.get("kind").and_then(Value::as_str) != Some("DaemonSet") {
            continue;
        }
        let containers = document
            .get_mut("spec")
            .and_then(|s| s.get_mut("template"))
            .and_then(|t| t.get_mut("spec"))
            .and_then(|s| s.get_mut("containers"))
            .and_then(Value::as_sequence_mut);
        let Some(containers) = containers else {
            continue;
        };
        for container in containers.iter_mut() {
            if is_flannel_container(container) && set_iface_arg(container, iface) {
                pinned += 1;
            }
        }
    }

    if pinned == 0 {
        anyhow::bail!(
            "No {} container found in the overlay manifest to pin to {}",
            FLANNEL_CONTAINER,
            iface
        );
    }
    render_documents(&documents)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayOutcome {
    /// Operator declined the overlay
    Skipped,
    Installed {
        /// False when the pod wait timed out under permissive policy
        ready: bool,
        pinned_interface: Option<String>,
    },
}

/// Fetch, parameterize and apply the overlay, then wait for its pods
pub fn install_overlay(
    toolkit: &Toolkit<'_>,
    settings: &Settings,
    identity: &NodeIdentity,
    hardware: &HardwareProfile,
    source: &ManifestSource,
) -> Result<OverlayOutcome, BootstrapError> {
    let progress = toolkit.progress;
    progress.report(Step::InstallOverlay, StepOutcome::Started);
    println!("Installing pod network overlay from {}...", source);

    let manifest = source.load(toolkit.exec).in_step(Step::InstallOverlay)?;
    let manifest = fill_placeholder(manifest, &identity.primary_interface);
    let (manifest, pinned_interface) = if hardware.is_constrained_sbc {
        let iface = &identity.primary_interface;
        println!(
            "  Constrained board detected ({}), pinning overlay to {}",
            hardware.model.as_deref().unwrap_or("unknown model"),
            iface
        );
        let pinned = pin_interface(&manifest, iface).in_step(Step::InstallOverlay)?;
        (pinned, Some(iface.clone()))
    } else {
        (manifest, None)
    };

    toolkit
        .cluster
        .apply_manifest(&manifest)
        .in_step(Step::InstallOverlay)?;
    progress.report(Step::InstallOverlay, StepOutcome::Completed);
    println!("✓ Overlay manifest applied");

    let ready = await_overlay(toolkit, settings)?;
    Ok(OverlayOutcome::Installed {
        ready,
        pinned_interface,
    })
}

fn await_overlay(toolkit: &Toolkit<'_>, settings: &Settings) -> Result<bool, BootstrapError> {
    let readiness = &settings.readiness;
    let overlay = &settings.overlay;
    let progress = toolkit.progress;
    let cluster = toolkit.cluster;
    let what = format!("overlay pods ({} in {})", overlay.selector, overlay.namespace);
    progress.report(Step::AwaitOverlay, StepOutcome::Started);
    println!("Waiting for {} to become ready...", what);

    let condition = ReadinessCondition::new(
        what.clone(),
        Duration::from_secs(readiness.overlay_poll_secs),
        Duration::from_secs(readiness.overlay_timeout_secs),
        || match cluster.pods_ready(&overlay.namespace, &overlay.selector) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::debug!(error = %e, "overlay readiness check failed");
                false
            }
        },
    );

    match wait_until(toolkit.clock, condition) {
        WaitOutcome::Ready { .. } => {
            progress.report(Step::AwaitOverlay, StepOutcome::Completed);
            println!("✓ Overlay pods are ready");
            Ok(true)
        }
        WaitOutcome::TimedOut { elapsed, .. } if readiness.strict_overlay => {
            Err(BootstrapError::ReadinessTimeout {
                step: Step::AwaitOverlay,
                what,
                waited: elapsed,
            })
        }
        WaitOutcome::TimedOut { elapsed, .. } => {
            let message = format!("{} not ready after {}s, continuing", what, elapsed.as_secs());
            println!("⚠ {}", message);
            progress.report(Step::AwaitOverlay, StepOutcome::Warned(message));
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, Harness};

    const FLANNEL_TEMPLATE: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: kube-flannel
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kube-flannel-ds
  namespace: kube-flannel
spec:
  template:
    spec:
      initContainers:
      - name: install-cni
        image: docker.io/flannel/flannel-cni-plugin:v1.5.1
      containers:
      - name: kube-flannel
        image: docker.io/flannel/flannel:v0.25.6
        command:
        - /opt/bin/flanneld
        args:
        - --ip-masq
        - --kube-subnet-mgr
        - --iface=__FLANNEL_IFACE__
"#;

    fn upstream_manifest() -> String {
        FLANNEL_TEMPLATE.replace("        - --iface=__FLANNEL_IFACE__\n", "")
    }

    fn flannel_args(manifest: &str) -> Vec<String> {
        let documents = parse_documents(manifest).unwrap();
        let ds = documents
            .iter()
            .find(|d| d["kind"].as_str() == Some("DaemonSet"))
            .unwrap();
        ds["spec"]["template"]["spec"]["containers"][0]["args"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap().to_string())
            .collect()
    }

    fn sbc() -> HardwareProfile {
        HardwareProfile {
            is_constrained_sbc: true,
            model: Some("Raspberry Pi 4 Model B Rev 1.4".to_string()),
        }
    }

    #[test]
    fn test_placeholder_rewritten_to_primary_interface() {
        let h = Harness::new();
        let source = ManifestSource::Inline(FLANNEL_TEMPLATE.to_string());
        let outcome =
            install_overlay(&h.toolkit(), &h.node.settings, &identity(), &sbc(), &source).unwrap();

        assert_eq!(
            outcome,
            OverlayOutcome::Installed {
                ready: true,
                pinned_interface: Some("eth0".to_string())
            }
        );
        let applied = h.cluster.applied();
        assert_eq!(applied.len(), 1);
        assert!(!applied[0].contains(IFACE_PLACEHOLDER));
        assert_eq!(
            flannel_args(&applied[0]),
            vec!["--ip-masq", "--kube-subnet-mgr", "--iface=eth0"]
        );
    }

    #[test]
    fn test_upstream_manifest_gets_iface_arg() {
        let pinned = pin_interface(&upstream_manifest(), "end0").unwrap();
        assert_eq!(
            flannel_args(&pinned),
            vec!["--ip-masq", "--kube-subnet-mgr", "--iface=end0"]
        );
        // Namespace document survives
        assert_eq!(parse_documents(&pinned).unwrap().len(), 2);
    }

    #[test]
    fn test_existing_iface_replaced() {
        let manifest = FLANNEL_TEMPLATE.replace(IFACE_PLACEHOLDER, "wlan0");
        let pinned = pin_interface(&manifest, "eth0").unwrap();
        let args = flannel_args(&pinned);
        assert_eq!(args.iter().filter(|a| a.starts_with("--iface=")).count(), 1);
        assert!(args.contains(&"--iface=eth0".to_string()));
    }

    #[test]
    fn test_pin_without_flannel_container_fails() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        assert!(pin_interface(manifest, "eth0").is_err());
    }

    #[test]
    fn test_generic_hardware_applies_manifest_unchanged() {
        let h = Harness::new();
        let manifest = upstream_manifest();
        let source = ManifestSource::Inline(manifest.clone());
        let outcome = install_overlay(
            &h.toolkit(),
            &h.node.settings,
            &identity(),
            &HardwareProfile::default(),
            &source,
        )
        .unwrap();

        assert_eq!(
            outcome,
            OverlayOutcome::Installed {
                ready: true,
                pinned_interface: None
            }
        );
        assert_eq!(h.cluster.applied(), vec![manifest]);
    }

    #[test]
    fn test_generic_hardware_fills_template_placeholder() {
        let h = Harness::new();
        let source = ManifestSource::Inline(FLANNEL_TEMPLATE.to_string());
        let outcome = install_overlay(
            &h.toolkit(),
            &h.node.settings,
            &identity(),
            &HardwareProfile::default(),
            &source,
        )
        .unwrap();

        assert_eq!(
            outcome,
            OverlayOutcome::Installed {
                ready: true,
                pinned_interface: None
            }
        );
        let applied = h.cluster.applied();
        assert_eq!(applied, vec![FLANNEL_TEMPLATE.replace(IFACE_PLACEHOLDER, "eth0")]);
        assert!(flannel_args(&applied[0]).contains(&"--iface=eth0".to_string()));
    }

    #[test]
    fn test_apply_precedes_readiness_wait() {
        let h = Harness::new();
        h.cluster.set_ready_on_call(Some(3));
        let source = ManifestSource::Inline(upstream_manifest());
        install_overlay(
            &h.toolkit(),
            &h.node.settings,
            &identity(),
            &HardwareProfile::default(),
            &source,
        )
        .unwrap();

        assert!(h.log.position("kubectl apply").unwrap() < h.log.position("kubectl pods-ready").unwrap());
        assert_eq!(h.clock.total_slept(), Duration::from_secs(20));
    }

    #[test]
    fn test_overlay_timeout_is_permissive_by_default() {
        let h = Harness::new();
        h.cluster.set_ready_on_call(None);
        let source = ManifestSource::Inline(upstream_manifest());
        let outcome = install_overlay(
            &h.toolkit(),
            &h.node.settings,
            &identity(),
            &HardwareProfile::default(),
            &source,
        )
        .unwrap();

        assert_eq!(
            outcome,
            OverlayOutcome::Installed {
                ready: false,
                pinned_interface: None
            }
        );
        assert_eq!(h.clock.total_slept(), Duration::from_secs(20 * 60));
        assert!(matches!(
            h.progress.outcomes_for(Step::AwaitOverlay).last(),
            Some(StepOutcome::Warned(_))
        ));
    }

    #[test]
    fn test_overlay_timeout_fails_under_strict_policy() {
        let mut h = Harness::new();
        h.node.settings.readiness.strict_overlay = true;
        h.cluster.set_ready_on_call(None);
        let source = ManifestSource::Inline(upstream_manifest());
        let err = install_overlay(
            &h.toolkit(),
            &h.node.settings,
            &identity(),
            &HardwareProfile::default(),
            &source,
        )
        .unwrap_err();
        assert!(matches!(err, BootstrapError::ReadinessTimeout { step: Step::AwaitOverlay, .. }));
    }

    #[test]
    fn test_local_template_preferred_over_url() {
        let mut overlay = OverlaySettings::default();
        assert!(matches!(ManifestSource::from_settings(&overlay), ManifestSource::Url(_)));
        overlay.manifest_path = Some(PathBuf::from("/etc/kubeboot/flannel.yaml"));
        assert_eq!(
            ManifestSource::from_settings(&overlay),
            ManifestSource::File(PathBuf::from("/etc/kubeboot/flannel.yaml"))
        );
    }
}
