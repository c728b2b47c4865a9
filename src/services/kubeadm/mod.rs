//! kubeadm node bootstrap
//!
//! Resets a node, initializes a control plane, installs the pod network
//! overlay and clears control-plane taints so a single node can run workloads.

// Module declarations
mod bootstrap;
mod cleanup;
mod identity;
mod init;
mod join;
mod overlay;
pub mod progress;
mod render;
pub mod taints;
pub mod tools;
pub mod types;
pub mod wait;

// Re-export the entry points
pub use bootstrap::{BootstrapOutcome, BootstrapReport, Bootstrapper};
pub use cleanup::{reset_node, ResetReport};
pub use identity::{detect_hardware_profile, detect_node_identity, detect_operator};
pub use init::{check_preconditions, ClusterInitiator, ControlPlane, InitOutcome, InitState};
pub use join::join_cluster;
pub use overlay::{pin_interface, ManifestSource, OverlayOutcome, IFACE_PLACEHOLDER};
pub use render::{render, RenderedConfigs};
