//! Scheduling repair for single-node clusters

use crate::services::kubeadm::tools::ClusterClient;
use anyhow::Result;

/// NoSchedule taints kubeadm puts on control-plane nodes, old and new role names
pub const CONTROL_PLANE_TAINTS: &[&str] = &[
    "node-role.kubernetes.io/control-plane:NoSchedule",
    "node-role.kubernetes.io/master:NoSchedule",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintRemoval {
    Removed,
    NotFound,
}

/// Remove the control-plane NoSchedule taints from all nodes.
/// Taints that are already absent count as success.
pub fn remove_control_plane_taints<C: ClusterClient + ?Sized>(
    cluster: &C,
) -> Result<Vec<(&'static str, TaintRemoval)>> {
    let mut results = Vec::with_capacity(CONTROL_PLANE_TAINTS.len());
    for taint in CONTROL_PLANE_TAINTS {
        let removal = cluster.remove_taint(taint)?;
        match removal {
            TaintRemoval::Removed => println!("  ✓ Removed taint {}", taint),
            TaintRemoval::NotFound => println!("  - Taint {} not present", taint),
        }
        results.push((*taint, removal));
    }
    Ok(results)
}
