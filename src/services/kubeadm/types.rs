//! Data model shared by the bootstrap steps

use crate::config_manager::{CgroupDriver, Settings};
use crate::utils::format_address;
use rand::Rng;
use std::net::IpAddr;
use std::path::PathBuf;

/// Who this node is on the network. Detected once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub hostname: String,
    pub primary_interface: String,
    /// Source address of the default route
    pub primary_ip: IpAddr,
}

/// Board characteristics that change how the overlay is installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareProfile {
    pub is_constrained_sbc: bool,
    pub model: Option<String>,
}

/// The user who invoked the tool (through sudo, usually) and receives the admin kubeconfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl OperatorContext {
    pub fn kube_dir(&self) -> PathBuf {
        self.home.join(".kube")
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kube_dir().join("config")
    }
}

/// Answers to the yes/no decision points of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDecisions {
    pub become_control_plane: bool,
    pub install_overlay: bool,
    pub remove_taints: bool,
}

impl Default for OperatorDecisions {
    fn default() -> Self {
        Self {
            become_control_plane: false,
            install_overlay: true,
            remove_taints: true,
        }
    }
}

/// Inputs to kubeadm, fixed for the lifetime of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub node_name: String,
    pub advertise_address: IpAddr,
    pub bind_port: u16,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub cgroup_driver: CgroupDriver,
    pub fail_swap_on: bool,
    pub cri_socket: String,
    /// Bootstrap token registered during init, `[a-z0-9]{6}.[a-z0-9]{16}`
    pub token: String,
}

impl BootstrapConfig {
    pub fn new(identity: &NodeIdentity, settings: &Settings) -> Self {
        Self {
            node_name: identity.hostname.clone(),
            advertise_address: identity.primary_ip,
            bind_port: settings.network.bind_port,
            pod_cidr: settings.network.pod_cidr.clone(),
            service_cidr: settings.network.service_cidr.clone(),
            cgroup_driver: settings.runtime.cgroup_driver,
            fail_swap_on: false,
            cri_socket: settings.runtime.cri_socket.clone(),
            token: generate_bootstrap_token(),
        }
    }

    pub fn control_plane_endpoint(&self) -> String {
        format_address(self.advertise_address, self.bind_port)
    }
}

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a kubeadm bootstrap token (`abcdef.0123456789abcdef`)
pub fn generate_bootstrap_token() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = |len: usize| -> String {
        (0..len)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    };
    let id = pick(6);
    let secret = pick(16);
    format!("{}.{}", id, secret)
}

/// Check the `[a-z0-9]{6}.[a-z0-9]{16}` token format
pub fn is_valid_bootstrap_token(token: &str) -> bool {
    let valid = |s: &str, len: usize| {
        s.len() == len
            && s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    match token.split_once('.') {
        Some((id, secret)) => valid(id, 6) && valid(secret, 16),
        None => false,
    }
}

/// Everything another node needs to join this cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    pub token: String,
    pub ca_cert_hash: String,
    pub control_plane_endpoint: String,
}

impl BootstrapToken {
    pub fn join_command(&self) -> String {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.control_plane_endpoint, self.token, self.ca_cert_hash
        )
    }
}

/// The admin kubeconfig as installed for the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub path: PathBuf,
    pub owner: String,
}
