//! kubeadm and kubelet configuration documents
//!
//! Pure rendering: nothing here touches the node. The kubelet policy values
//! below are fixed and not exposed through settings.

use crate::config_manager::CgroupDriver;
use crate::services::kubeadm::types::BootstrapConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const KUBELET_API_VERSION: &str = "kubelet.config.k8s.io/v1beta1";

const MAX_PODS: u32 = 110;
const EVICTION_HARD: &[(&str, &str)] = &[
    ("memory.available", "100Mi"),
    ("nodefs.available", "10%"),
    ("nodefs.inodesFree", "5%"),
];
/// Applied to both system-reserved and kube-reserved
const RESERVED: &[(&str, &str)] = &[
    ("cpu", "500m"),
    ("memory", "512Mi"),
    ("ephemeral-storage", "1Gi"),
];
const ENFORCE_NODE_ALLOCATABLE: &[&str] = &["pods", "system-reserved", "kube-reserved"];

/// Output of a render: the multi-document init config kubeadm reads, and the
/// kubelet config on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfigs {
    pub init_document: String,
    pub kubelet_document: String,
}

pub fn render(config: &BootstrapConfig) -> Result<RenderedConfigs> {
    let init = to_yaml(&init_configuration(config), "InitConfiguration")?;
    let cluster = to_yaml(&cluster_configuration(config), "ClusterConfiguration")?;
    let kubelet = to_yaml(&kubelet_configuration(config), "KubeletConfiguration")?;

    Ok(RenderedConfigs {
        init_document: join_documents(&[&init, &cluster, &kubelet]),
        kubelet_document: kubelet,
    })
}

fn to_yaml<T: Serialize>(value: &T, kind: &str) -> Result<String> {
    serde_yaml::to_string(value).with_context(|| format!("Failed to serialize {}", kind))
}

fn join_documents(documents: &[&str]) -> String {
    documents
        .iter()
        .map(|doc| format!("---\n{}", doc))
        .collect::<Vec<_>>()
        .join("")
}

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn init_configuration(config: &BootstrapConfig) -> InitConfiguration {
    InitConfiguration {
        api_version: KUBEADM_API_VERSION.to_string(),
        kind: "InitConfiguration".to_string(),
        bootstrap_tokens: vec![BootstrapTokenSpec {
            token: config.token.clone(),
            groups: vec!["system:bootstrappers:kubeadm:default-node-token".to_string()],
            ttl: "24h0m0s".to_string(),
            usages: vec!["signing".to_string(), "authentication".to_string()],
        }],
        local_api_endpoint: ApiEndpoint {
            advertise_address: config.advertise_address.to_string(),
            bind_port: config.bind_port,
        },
        node_registration: NodeRegistration {
            name: config.node_name.clone(),
            cri_socket: config.cri_socket.clone(),
        },
    }
}

fn cluster_configuration(config: &BootstrapConfig) -> ClusterConfiguration {
    ClusterConfiguration {
        api_version: KUBEADM_API_VERSION.to_string(),
        kind: "ClusterConfiguration".to_string(),
        control_plane_endpoint: config.control_plane_endpoint(),
        networking: Networking {
            pod_subnet: config.pod_cidr.clone(),
            service_subnet: config.service_cidr.clone(),
        },
    }
}

fn kubelet_configuration(config: &BootstrapConfig) -> KubeletConfiguration {
    KubeletConfiguration {
        api_version: KUBELET_API_VERSION.to_string(),
        kind: "KubeletConfiguration".to_string(),
        cgroup_driver: config.cgroup_driver,
        fail_swap_on: config.fail_swap_on,
        authentication: KubeletAuthentication {
            anonymous: Enabled { enabled: false },
            webhook: Enabled { enabled: true },
        },
        eviction_hard: string_map(EVICTION_HARD),
        max_pods: MAX_PODS,
        system_reserved: string_map(RESERVED),
        kube_reserved: string_map(RESERVED),
        enforce_node_allocatable: ENFORCE_NODE_ALLOCATABLE
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

// =============================================================================
// kubeadm / kubelet config types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration {
    api_version: String,
    kind: String,
    bootstrap_tokens: Vec<BootstrapTokenSpec>,
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: ApiEndpoint,
    node_registration: NodeRegistration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapTokenSpec {
    token: String,
    groups: Vec<String>,
    ttl: String,
    usages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEndpoint {
    advertise_address: String,
    bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration {
    name: String,
    cri_socket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    api_version: String,
    kind: String,
    control_plane_endpoint: String,
    networking: Networking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Networking {
    pod_subnet: String,
    service_subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    api_version: String,
    kind: String,
    cgroup_driver: CgroupDriver,
    fail_swap_on: bool,
    authentication: KubeletAuthentication,
    eviction_hard: BTreeMap<String, String>,
    max_pods: u32,
    system_reserved: BTreeMap<String, String>,
    kube_reserved: BTreeMap<String, String>,
    enforce_node_allocatable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KubeletAuthentication {
    anonymous: Enabled,
    webhook: Enabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Enabled {
    enabled: bool,
}
