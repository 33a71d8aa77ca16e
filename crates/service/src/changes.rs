//! Long-running requests to the system service: post an action, get a
//! change id back, poll the change until it settles.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storage_planner_core::model::Entity;
use storage_planner_core::{EntityId, GadgetVolume, StorageError, StorageModel};
use tracing::{debug, info};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeStatus {
    Do,
    Doing,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub status: ChangeStatus,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[async_trait]
pub trait AsyncChangeClient: Send + Sync {
    /// Post `body` to `path`; returns the id of the change it started.
    async fn post(&self, path: &str, body: Value) -> Result<String>;

    async fn get_change(&self, id: &str) -> Result<Change>;
}

/// Post an action and poll its change every `poll` until it is done,
/// failing with `ServiceError::TimedOut` after `timeout`.
pub async fn post_and_wait(
    client: &dyn AsyncChangeClient,
    path: &str,
    body: Value,
    poll: Duration,
    timeout: Duration,
) -> Result<Option<Value>> {
    let id = client
        .post(path, body)
        .await
        .with_context(|| format!("failed to post to {path}"))?;
    debug!(%id, path, "waiting for change");
    match tokio::time::timeout(timeout, poll_change(client, &id, poll)).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::TimedOut(timeout).into()),
    }
}

async fn poll_change(client: &dyn AsyncChangeClient, id: &str, poll: Duration) -> Result<Option<Value>> {
    loop {
        let change = client
            .get_change(id)
            .await
            .with_context(|| format!("failed to fetch change {id}"))?;
        match change.status {
            ChangeStatus::Done => return Ok(change.result),
            ChangeStatus::Error => {
                return Err(ServiceError::ChangeFailed {
                    id: id.to_string(),
                    message: change.err.unwrap_or_default(),
                }
                .into())
            }
            ChangeStatus::Do | ChangeStatus::Doing => tokio::time::sleep(poll).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemActionStep {
    SetupStorageEncryption,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemAction {
    pub action: String,
    pub step: SystemActionStep,
    #[serde(rename = "on-volumes")]
    pub on_volumes: BTreeMap<String, GadgetVolume>,
}

impl SystemAction {
    pub fn install(step: SystemActionStep, on_volumes: BTreeMap<String, GadgetVolume>) -> Self {
        Self {
            action: "install".to_string(),
            step,
            on_volumes,
        }
    }
}

fn system_path(label: &str) -> String {
    format!("v2/systems/{label}")
}

/// Polling knobs shared by the system install steps.
#[derive(Debug, Clone, Copy)]
pub struct ChangeTiming {
    pub poll: Duration,
    pub timeout: Duration,
}

/// Ask the system service to set up TPM-backed encryption for the
/// volumes. Returns the encrypted device path for each structure name.
pub async fn setup_tpm_encryption(
    client: &dyn AsyncChangeClient,
    system_label: &str,
    volumes: BTreeMap<String, GadgetVolume>,
    timing: ChangeTiming,
) -> Result<BTreeMap<String, String>> {
    let action = SystemAction::install(SystemActionStep::SetupStorageEncryption, volumes);
    let body = serde_json::to_value(&action).context("failed to encode system action")?;
    let result = post_and_wait(client, &system_path(system_label), body, timing.poll, timing.timeout)
        .await?
        .ok_or_else(|| anyhow!("encryption setup returned no result"))?;
    let devices = result
        .get("encrypted-devices")
        .cloned()
        .ok_or_else(|| anyhow!("encryption setup result lacks encrypted-devices"))?;
    let devices: BTreeMap<String, String> =
        serde_json::from_value(devices).context("failed to parse encrypted-devices")?;
    info!(count = devices.len(), "encrypted devices set up");
    Ok(devices)
}

pub async fn finish_core_boot_install(
    client: &dyn AsyncChangeClient,
    system_label: &str,
    volumes: BTreeMap<String, GadgetVolume>,
    timing: ChangeTiming,
) -> Result<()> {
    let action = SystemAction::install(SystemActionStep::Finish, volumes);
    let body = serde_json::to_value(&action).context("failed to encode system action")?;
    post_and_wait(client, &system_path(system_label), body, timing.poll, timing.timeout).await?;
    info!(system_label, "core boot install finished");
    Ok(())
}

/// Swap each TPM-sealed encrypted volume for the device the system
/// service created, keyed by the underlying partition's name.
pub fn use_encrypted_devices(
    model: &mut StorageModel,
    devices: &BTreeMap<String, String>,
) -> storage_planner_core::Result<()> {
    let sealed = model
        .entities()
        .filter_map(|entity| match entity {
            Entity::DmCrypt(dm) if dm.options.iter().any(|o| o == "tpm") => Some((dm.id, dm.volume)),
            _ => None,
        })
        .collect::<Vec<(EntityId, EntityId)>>();
    for (dm_crypt, volume) in sealed {
        let name = model
            .partition(volume)?
            .partition_name
            .clone()
            .unwrap_or_default();
        let path = devices.get(&name).ok_or_else(|| StorageError::NoMatch {
            what: "encrypted device".to_string(),
            detail: format!("structure '{name}'"),
        })?;
        let device = model.add_arbitrary_device(path);
        if let Some(fs) = model.filesystem_of(dm_crypt).map(|fs| fs.id) {
            model.retarget_filesystem(fs, device)?;
        }
        model.remove_dm_crypt(dm_crypt)?;
        debug!(structure = %name, %path, "using encrypted device");
    }
    model.check_invariants()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use storage_planner_core::guided::guided_core_boot;
    use storage_planner_core::model::{Disk, Entity};
    use storage_planner_core::units::GIB;
    use storage_planner_core::{Bootloader, GadgetVolume, StorageModel};

    use super::{
        post_and_wait, setup_tpm_encryption, use_encrypted_devices, AsyncChangeClient, Change,
        ChangeStatus, ChangeTiming,
    };
    use crate::error::ServiceError;

    /// Plays back a fixed sequence of change states.
    struct FakeClient {
        posted: Mutex<Vec<(String, Value)>>,
        states: Mutex<VecDeque<Change>>,
    }

    impl FakeClient {
        fn new(states: Vec<Change>) -> Self {
            Self {
                posted: Mutex::new(Vec::new()),
                states: Mutex::new(states.into()),
            }
        }
    }

    #[async_trait]
    impl AsyncChangeClient for FakeClient {
        async fn post(&self, path: &str, body: Value) -> Result<String> {
            self.posted
                .lock()
                .expect("posted lock")
                .push((path.to_string(), body));
            Ok("7".to_string())
        }

        async fn get_change(&self, id: &str) -> Result<Change> {
            let mut states = self.states.lock().expect("states lock");
            let change = match states.len() {
                0 => anyhow::bail!("no more states"),
                1 => states[0].clone(),
                _ => states.pop_front().expect("non-empty"),
            };
            assert_eq!(change.id, id);
            Ok(change)
        }
    }

    fn change(status: ChangeStatus, result: Option<Value>) -> Change {
        Change {
            id: "7".to_string(),
            status,
            err: (status == ChangeStatus::Error).then(|| "tpm locked out".to_string()),
            result,
        }
    }

    fn timing() -> ChangeTiming {
        ChangeTiming {
            poll: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_done() {
        let client = FakeClient::new(vec![
            change(ChangeStatus::Do, None),
            change(ChangeStatus::Doing, None),
            change(ChangeStatus::Done, Some(json!({"ok": true}))),
        ]);
        let result = post_and_wait(&client, "v2/x", json!({}), timing().poll, timing().timeout)
            .await
            .expect("done");
        assert_eq!(result, Some(json!({"ok": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_is_a_change_failure() {
        let client = FakeClient::new(vec![change(ChangeStatus::Error, None)]);
        let err = post_and_wait(&client, "v2/x", json!({}), timing().poll, timing().timeout)
            .await
            .expect_err("fails");
        assert_eq!(
            err.downcast_ref::<ServiceError>(),
            Some(&ServiceError::ChangeFailed {
                id: "7".to_string(),
                message: "tpm locked out".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_change_times_out() {
        let client = FakeClient::new(vec![change(ChangeStatus::Doing, None)]);
        let err = post_and_wait(&client, "v2/x", json!({}), timing().poll, timing().timeout)
            .await
            .expect_err("times out");
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::TimedOut(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_setup_replaces_sealed_volumes() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let disk = model.add_disk(Disk {
            path: Some("/dev/nvme0n1".to_string()),
            size: 64 * GIB,
            ..Disk::default()
        });
        let volume = GadgetVolume::pc();
        guided_core_boot(&mut model, disk, &volume, true).expect("layout");

        let client = FakeClient::new(vec![change(
            ChangeStatus::Done,
            Some(json!({"encrypted-devices": {
                "ubuntu-data": "/dev/mapper/ubuntu-data-3776",
                "ubuntu-save": "/dev/mapper/ubuntu-save-3776"
            }})),
        )]);
        let volumes = BTreeMap::from([("pc".to_string(), volume)]);
        let devices = setup_tpm_encryption(&client, "20240101", volumes, timing())
            .await
            .expect("setup");
        let posted = client.posted.lock().expect("posted").clone();
        assert_eq!(posted[0].0, "v2/systems/20240101");
        assert_eq!(posted[0].1["step"], "setup-storage-encryption");
        assert!(posted[0].1["on-volumes"]["pc"].is_object());

        use_encrypted_devices(&mut model, &devices).expect("swap devices");
        let kinds = model
            .entities()
            .filter(|e| matches!(e, Entity::DmCrypt(_)))
            .count();
        assert_eq!(kinds, 0);
        let root = model.mount_for_path("/").expect("root mount");
        let fs = model.filesystem(root.filesystem).expect("root fs");
        match model.get(fs.volume) {
            Some(Entity::Arbitrary(device)) => {
                assert_eq!(device.path, "/dev/mapper/ubuntu-data-3776")
            }
            other => panic!("root on {other:?}"),
        }
    }

    #[test]
    fn missing_device_is_reported() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let disk = model.add_disk(Disk {
            size: 64 * GIB,
            ..Disk::default()
        });
        guided_core_boot(&mut model, disk, &GadgetVolume::pc(), true).expect("layout");
        let err = use_encrypted_devices(&mut model, &BTreeMap::new()).expect_err("no mapping");
        assert!(err.to_string().contains("ubuntu-"));
    }
}
