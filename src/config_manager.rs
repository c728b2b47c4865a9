use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "kubeboot";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable that overrides the settings file location
pub const CONFIG_PATH_ENV: &str = "KUBEBOOT_CONFIG";

/// Upstream flannel release manifest
pub const DEFAULT_OVERLAY_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";

/// All tunables for a bootstrap run. Every section is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub runtime: RuntimeSettings,
    pub readiness: ReadinessSettings,
    pub overlay: OverlaySettings,
    pub paths: NodePaths,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub pod_cidr: String,
    pub service_cidr: String,
    pub bind_port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            bind_port: 6443,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    Systemd,
    Cgroupfs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub cri_socket: String,
    /// Container runtime unit stopped and restarted around cleanup
    pub runtime_service: String,
    /// Lower-level runtime daemon restarted last
    pub low_level_service: Option<String>,
    pub node_agent_service: String,
    pub cgroup_driver: CgroupDriver,
    pub settle_delay_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cri_socket: "unix:///var/run/cri-dockerd.sock".to_string(),
            runtime_service: "docker".to_string(),
            low_level_service: Some("containerd".to_string()),
            node_agent_service: "kubelet".to_string(),
            cgroup_driver: CgroupDriver::Systemd,
            settle_delay_secs: 5,
        }
    }
}

impl RuntimeSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub api_poll_secs: u64,
    pub api_timeout_secs: u64,
    pub overlay_poll_secs: u64,
    pub overlay_timeout_secs: u64,
    /// Fail the run when the API server never starts listening
    pub strict_api: bool,
    /// Fail the run when overlay pods never become ready
    pub strict_overlay: bool,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            api_poll_secs: 5,
            api_timeout_secs: 60,
            overlay_poll_secs: 10,
            overlay_timeout_secs: 20 * 60,
            strict_api: false,
            strict_overlay: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub manifest_url: String,
    /// Local manifest template, used instead of the URL when set
    pub manifest_path: Option<PathBuf>,
    pub namespace: String,
    pub selector: String,
    /// Force the constrained-board code path on or off
    pub constrained_sbc: Option<bool>,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            manifest_url: DEFAULT_OVERLAY_MANIFEST_URL.to_string(),
            manifest_path: None,
            namespace: "kube-flannel".to_string(),
            selector: "app=flannel".to_string(),
            constrained_sbc: None,
        }
    }
}

/// Well-known filesystem locations, matching kubeadm's own conventions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePaths {
    pub admin_conf: PathBuf,
    pub kubelet_dir: PathBuf,
    pub etcd_dir: PathBuf,
    pub cni_dir: PathBuf,
    pub init_config: PathBuf,
    pub kubelet_config: PathBuf,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            admin_conf: PathBuf::from("/etc/kubernetes/admin.conf"),
            kubelet_dir: PathBuf::from("/var/lib/kubelet"),
            etcd_dir: PathBuf::from("/var/lib/etcd"),
            cni_dir: PathBuf::from("/etc/cni/net.d"),
            init_config: PathBuf::from("/etc/kubeboot/kubeadm-init.yaml"),
            kubelet_config: PathBuf::from("/etc/kubeboot/kubelet-config.yaml"),
        }
    }
}

impl NodePaths {
    /// Every path rooted under `root`, for running against a scratch tree
    pub fn rooted_at(root: &Path) -> Self {
        let defaults = Self::default();
        let reroot = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            admin_conf: reroot(&defaults.admin_conf),
            kubelet_dir: reroot(&defaults.kubelet_dir),
            etcd_dir: reroot(&defaults.etcd_dir),
            cni_dir: reroot(&defaults.cni_dir),
            init_config: reroot(&defaults.init_config),
            kubelet_config: reroot(&defaults.kubelet_config),
        }
    }
}

pub fn get_home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .with_context(|| "Could not determine home directory")
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.trim().is_empty() {
            return Ok(PathBuf::from(xdg).join(CONFIG_DIR_NAME));
        }
    }
    Ok(get_home_dir()?.join(".config").join(CONFIG_DIR_NAME))
}

/// Resolve the settings path: explicit flag, then env var, then config dir
pub fn get_config_file_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

pub fn parse_settings(content: &str) -> Result<Settings> {
    toml::from_str(content).context("Failed to parse settings")
}

/// Load settings, falling back to defaults when no file exists.
/// An explicitly requested file must exist.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let config_path = get_config_file_path(explicit)?;

    if !config_path.exists() {
        if explicit.is_some() {
            anyhow::bail!("Settings file not found: {}", config_path.display());
        }
        tracing::debug!(path = %config_path.display(), "no settings file, using defaults");
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let settings = parse_settings(&content)
        .with_context(|| format!("Invalid config file: {}", config_path.display()))?;
    tracing::debug!(path = %config_path.display(), "loaded settings");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        assert_eq!(parse_settings("").unwrap(), Settings::default());
    }

    #[test]
    fn test_partial_override() {
        let settings = parse_settings(
            r#"
[readiness]
strict_api = true
api_timeout_secs = 120

[runtime]
runtime_service = "containerd"
cri_socket = "unix:///run/containerd/containerd.sock"
cgroup_driver = "cgroupfs"

[overlay]
constrained_sbc = true
"#,
        )
        .unwrap();

        assert!(settings.readiness.strict_api);
        assert_eq!(settings.readiness.api_timeout_secs, 120);
        assert_eq!(settings.readiness.api_poll_secs, 5);
        assert_eq!(settings.runtime.runtime_service, "containerd");
        assert_eq!(settings.runtime.cgroup_driver, CgroupDriver::Cgroupfs);
        assert_eq!(settings.runtime.node_agent_service, "kubelet");
        assert_eq!(settings.overlay.constrained_sbc, Some(true));
        assert_eq!(settings.network, NetworkSettings::default());
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(parse_settings("[runtime]\ncgroup_driver = \"openrc\"\n").is_err());
    }

    #[test]
    fn test_rooted_paths() {
        let paths = NodePaths::rooted_at(Path::new("/tmp/scratch"));
        assert_eq!(paths.cni_dir, PathBuf::from("/tmp/scratch/etc/cni/net.d"));
        assert_eq!(
            paths.admin_conf,
            PathBuf::from("/tmp/scratch/etc/kubernetes/admin.conf")
        );
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_settings(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[network]\npod_cidr = \"10.42.0.0/16\"\n").unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.network.pod_cidr, "10.42.0.0/16");
    }
}
