use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use storage_planner_core::guided::targets_for_disk;
use storage_planner_core::manipulator::{self, PartitionEdit, PartitionRequest, PartitionSpec};
use storage_planner_core::{
    add_boot_disk, apply_guided, guided_targets, is_boot_device, potential_boot_disks, render,
    EntityId, GadgetVolume, GuidedChoice, GuidedStorageTarget, PlatformInfo, StorageError,
    StorageModel, StoragePlan,
};
use tracing::info;

use crate::changes::{
    finish_core_boot_install, setup_tpm_encryption, use_encrypted_devices, AsyncChangeClient,
    ChangeTiming,
};
use crate::config::ServiceConfig;
use crate::controller::{ProbeController, ProbeOutcome, ProbeStatus};
use crate::events::DeviceEventSource;
use crate::prober::Prober;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuidedTargetsResponse {
    pub status: ProbeStatus,
    pub targets: Vec<GuidedStorageTarget>,
}

/// The storage API the installer front ends talk to.
pub struct StorageService {
    config: ServiceConfig,
    platform: PlatformInfo,
    controller: ProbeController,
}

impl StorageService {
    pub fn new(config: ServiceConfig, platform: PlatformInfo, prober: Arc<dyn Prober>) -> Self {
        let controller = ProbeController::new(config.clone(), prober);
        Self {
            config,
            platform,
            controller,
        }
    }

    pub fn controller(&self) -> &ProbeController {
        &self.controller
    }

    pub fn start(&self, events: Option<Box<dyn DeviceEventSource>>) -> Result<()> {
        self.controller.start(events)?;
        Ok(())
    }

    pub async fn wait_for_probe(&self) -> Result<()> {
        self.controller.wait_for_probe().await?;
        Ok(())
    }

    pub fn status(&self) -> Result<ProbeOutcome> {
        Ok(self.controller.status()?)
    }

    fn current_model(&self) -> Result<StorageModel> {
        self.controller
            .model()?
            .ok_or_else(|| anyhow!("storage has not been probed yet"))
    }

    /// Guided targets, for one disk or all of them. Only the manual target
    /// is offered when probing failed.
    pub fn guided_targets(&self, disk: Option<EntityId>) -> Result<GuidedTargetsResponse> {
        let status = self.controller.status()?.status;
        let model = self.controller.model()?;
        let targets = match (status, model) {
            (ProbeStatus::Failed, _) | (_, None) => vec![GuidedStorageTarget::manual()],
            (_, Some(model)) => match disk {
                Some(disk) => {
                    model.disk(disk)?;
                    let mut targets =
                        targets_for_disk(&model, disk, &self.platform, &self.config.planner);
                    targets.push(GuidedStorageTarget::manual());
                    targets
                }
                None => guided_targets(&model, &self.platform, &self.config.planner),
            },
        };
        Ok(GuidedTargetsResponse { status, targets })
    }

    pub fn guided_choice(&self, choice: &GuidedChoice) -> Result<()> {
        self.controller.edit(|model| {
            apply_guided(model, choice, &self.platform, &self.config.planner)
        })?;
        info!(capability = ?choice.capability, "applied guided choice");
        Ok(())
    }

    pub fn add_partition(&self, disk: EntityId, offset: Option<u64>, spec: PartitionSpec) -> Result<EntityId> {
        let request = PartitionRequest::Add { offset, spec };
        let resilient = self.config.planner.supports_resilient_boot;
        self.controller
            .edit(|model| manipulator::partition_disk(model, disk, &request, resilient))
    }

    pub fn edit_partition(&self, disk: EntityId, partition: EntityId, edit: PartitionEdit) -> Result<()> {
        let request = PartitionRequest::Edit { partition, edit };
        let resilient = self.config.planner.supports_resilient_boot;
        self.controller
            .edit(|model| manipulator::partition_disk(model, disk, &request, resilient))?;
        Ok(())
    }

    pub fn delete_partition(&self, partition: EntityId) -> Result<()> {
        self.controller
            .edit(|model| manipulator::delete_partition(model, partition, false))
    }

    pub fn reformat_disk(&self, disk: EntityId) -> Result<()> {
        self.controller.edit(|model| {
            let ptable = model.ptable_of(disk);
            manipulator::reformat(model, disk, ptable, None)
        })
    }

    pub fn add_boot_partition(&self, disk: EntityId) -> Result<()> {
        let resilient = self.config.planner.supports_resilient_boot;
        self.controller.edit(|model| {
            if is_boot_device(model, disk) {
                return Err(StorageError::invalid(format!(
                    "{} is already a boot device",
                    model.label(disk)
                )));
            }
            add_boot_disk(model, disk, resilient)
        })
    }

    pub fn potential_boot_disks(&self) -> Result<Vec<EntityId>> {
        Ok(potential_boot_disks(&self.current_model()?, false))
    }

    pub fn rendered_plan(&self) -> Result<StoragePlan> {
        Ok(render(&self.current_model()?)?)
    }

    pub fn reset(&self) -> Result<()> {
        self.controller.reset()
    }

    /// Freeze the configuration; later probes no longer touch the model.
    pub fn mark_configured(&self) -> Result<()> {
        if !self.current_model()?.can_install() {
            bail!("storage is not ready to install: a root mount and boot partition are required");
        }
        self.controller.mark_configured()?;
        Ok(())
    }

    fn gadget_volumes(&self) -> BTreeMap<String, GadgetVolume> {
        let volume = self
            .platform
            .core_boot
            .as_ref()
            .and_then(|support| support.volume.clone())
            .unwrap_or_else(GadgetVolume::pc);
        BTreeMap::from([("pc".to_string(), volume)])
    }

    fn change_timing(&self) -> ChangeTiming {
        ChangeTiming {
            poll: self.config.change_poll_interval(),
            timeout: self.config.change_timeout(),
        }
    }

    /// Have the system service create the TPM-sealed devices of a
    /// core-boot layout and point the model at them.
    pub async fn setup_core_boot_encryption(
        &self,
        client: &dyn AsyncChangeClient,
        system_label: &str,
    ) -> Result<()> {
        let devices =
            setup_tpm_encryption(client, system_label, self.gadget_volumes(), self.change_timing())
                .await?;
        self.controller
            .edit(|model| use_encrypted_devices(model, &devices))
    }

    pub async fn finish_core_boot_install(
        &self,
        client: &dyn AsyncChangeClient,
        system_label: &str,
    ) -> Result<()> {
        finish_core_boot_install(client, system_label, self.gadget_volumes(), self.change_timing())
            .await
    }

    pub fn stop(&self) -> Result<()> {
        self.controller.stop()?;
        Ok(())
    }
}
