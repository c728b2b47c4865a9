//! Single entry point for bootstrapping a control-plane node
//!
//! Strictly sequential: control plane, then overlay, then scheduling repair.
//! Taints are only removed once the overlay step has finished.

use crate::config_manager::Settings;
use crate::error::{BootstrapError, StepContext};
use crate::services::kubeadm::init::{ClusterInitiator, ControlPlane, InitOutcome};
use crate::services::kubeadm::overlay::{self, ManifestSource, OverlayOutcome};
use crate::services::kubeadm::progress::{Step, StepOutcome};
use crate::services::kubeadm::taints::{self, TaintRemoval};
use crate::services::kubeadm::tools::Toolkit;
use crate::services::kubeadm::types::{
    HardwareProfile, NodeIdentity, OperatorContext, OperatorDecisions,
};

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub control_plane: ControlPlane,
    pub overlay: OverlayOutcome,
    /// None when the operator kept the taints
    pub taints: Option<Vec<(&'static str, TaintRemoval)>>,
}

#[derive(Debug, Clone)]
pub enum BootstrapOutcome {
    /// Operator declined to make this node a control plane
    Skipped,
    Completed(Box<BootstrapReport>),
}

pub struct Bootstrapper<'a> {
    toolkit: &'a Toolkit<'a>,
    settings: &'a Settings,
    operator: &'a OperatorContext,
    overlay_source: ManifestSource,
}

impl<'a> Bootstrapper<'a> {
    pub fn new(
        toolkit: &'a Toolkit<'a>,
        settings: &'a Settings,
        operator: &'a OperatorContext,
    ) -> Self {
        Self {
            toolkit,
            settings,
            operator,
            overlay_source: ManifestSource::from_settings(&settings.overlay),
        }
    }

    pub fn with_overlay_source(mut self, source: ManifestSource) -> Self {
        self.overlay_source = source;
        self
    }

    pub fn bootstrap(
        &self,
        identity: &NodeIdentity,
        hardware: &HardwareProfile,
        decisions: &OperatorDecisions,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let mut initiator = ClusterInitiator::new(self.toolkit, self.settings, self.operator);
        let control_plane = match initiator.run(identity, decisions)? {
            InitOutcome::Skipped => return Ok(BootstrapOutcome::Skipped),
            InitOutcome::Initialized(control_plane) => *control_plane,
        };

        let overlay = if decisions.install_overlay {
            overlay::install_overlay(
                self.toolkit,
                self.settings,
                identity,
                hardware,
                &self.overlay_source,
            )
            .inspect_err(|e| self.report_failure(e))?
        } else {
            println!("Skipping overlay installation; pods will not get networking until one is installed.");
            self.toolkit
                .progress
                .report(Step::InstallOverlay, StepOutcome::Skipped);
            OverlayOutcome::Skipped
        };

        let taints = if decisions.remove_taints {
            Some(self.repair_scheduling().inspect_err(|e| self.report_failure(e))?)
        } else {
            self.toolkit
                .progress
                .report(Step::RemoveTaints, StepOutcome::Skipped);
            None
        };

        Ok(BootstrapOutcome::Completed(Box::new(BootstrapReport {
            control_plane,
            overlay,
            taints,
        })))
    }

    fn repair_scheduling(&self) -> Result<Vec<(&'static str, TaintRemoval)>, BootstrapError> {
        let progress = self.toolkit.progress;
        progress.report(Step::RemoveTaints, StepOutcome::Started);
        println!("Removing control-plane scheduling taints...");
        let results =
            taints::remove_control_plane_taints(self.toolkit.cluster).in_step(Step::RemoveTaints)?;

        let outcome = if results.iter().any(|(_, r)| *r == TaintRemoval::Removed) {
            StepOutcome::Completed
        } else {
            StepOutcome::NothingToDo
        };
        progress.report(Step::RemoveTaints, outcome);
        Ok(results)
    }

    fn report_failure(&self, error: &BootstrapError) {
        self.toolkit
            .progress
            .report(error.step(), StepOutcome::Failed(error.to_string()));
    }
}
