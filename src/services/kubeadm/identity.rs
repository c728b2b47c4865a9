//! Node, hardware and operator detection

use crate::config_manager::OverlaySettings;
use crate::services::kubeadm::types::{HardwareProfile, NodeIdentity, OperatorContext};
use crate::utils::exec::CommandExecutor;
use crate::utils::networking;
use anyhow::{Context, Result};
use nix::unistd::{Uid, User};
use std::path::Path;

const DEVICE_TREE_MODEL_PATHS: &[&str] = &[
    "/proc/device-tree/model",
    "/sys/firmware/devicetree/base/model",
];

/// Board families that need the overlay pinned to an explicit interface
const CONSTRAINED_BOARDS: &[&str] = &[
    "raspberry pi",
    "orange pi",
    "rock pi",
    "odroid",
    "jetson nano",
    "banana pi",
];

pub fn detect_node_identity<E: CommandExecutor + ?Sized>(exec: &E) -> Result<NodeIdentity> {
    let hostname = networking::get_current_hostname()?;
    let (primary_interface, primary_ip) = networking::detect_default_route(exec)?;
    Ok(NodeIdentity {
        hostname,
        primary_interface,
        primary_ip,
    })
}

/// Device-tree model strings are NUL-terminated
fn clean_model(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

pub fn is_constrained_model(model: &str) -> bool {
    let model = model.to_lowercase();
    CONSTRAINED_BOARDS.iter().any(|board| model.contains(board))
}

/// Detect the board model; a settings override wins over detection
pub fn detect_hardware_profile<E: CommandExecutor + ?Sized>(
    exec: &E,
    overlay: &OverlaySettings,
) -> HardwareProfile {
    let model = DEVICE_TREE_MODEL_PATHS
        .iter()
        .filter_map(|path| exec.read_file(Path::new(path)).ok())
        .map(|raw| clean_model(&raw))
        .find(|model| !model.is_empty());

    let detected = model.as_deref().map(is_constrained_model).unwrap_or(false);
    HardwareProfile {
        is_constrained_sbc: overlay.constrained_sbc.unwrap_or(detected),
        model,
    }
}

/// Resolve the invoking user: `SUDO_USER` when run through sudo, else the current user
pub fn detect_operator() -> Result<OperatorContext> {
    let sudo_user = std::env::var("SUDO_USER")
        .ok()
        .filter(|u| !u.trim().is_empty() && u != "root");

    let user = match sudo_user {
        Some(name) => User::from_name(&name)
            .with_context(|| format!("Failed to look up user {}", name))?
            .with_context(|| format!("User {} does not exist", name))?,
        None => User::from_uid(Uid::current())
            .context("Failed to look up current user")?
            .context("Current user has no passwd entry")?,
    };

    Ok(OperatorContext {
        user: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_model_strips_nul() {
        assert_eq!(
            clean_model("Raspberry Pi 4 Model B Rev 1.4\0"),
            "Raspberry Pi 4 Model B Rev 1.4"
        );
    }

    #[test]
    fn test_constrained_models() {
        assert!(is_constrained_model("Raspberry Pi 4 Model B Rev 1.4"));
        assert!(is_constrained_model("Hardkernel ODROID-C4"));
        assert!(!is_constrained_model("QEMU Virtual Machine"));
    }

    #[test]
    fn test_hardware_override_wins() {
        let exec = crate::utils::exec::Executor::local();
        let overlay = OverlaySettings {
            constrained_sbc: Some(true),
            ..OverlaySettings::default()
        };
        assert!(detect_hardware_profile(&exec, &overlay).is_constrained_sbc);

        let overlay = OverlaySettings {
            constrained_sbc: Some(false),
            ..OverlaySettings::default()
        };
        assert!(!detect_hardware_profile(&exec, &overlay).is_constrained_sbc);
    }
}
