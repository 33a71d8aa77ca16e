use std::path::Path;
use std::sync::Arc;

use storage_planner_core::manipulator::PartitionSpec;
use storage_planner_core::units::GIB;
use storage_planner_core::{
    Action, Bootloader, GuidedCapability, GuidedChoice, PlatformInfo, Target,
};
use storage_planner_service::{FileProber, ProbeStatus, ServiceConfig, StorageService};

const LAPTOP: &str = r#"{
    "blockdev": {
        "/dev/nvme0n1": {
            "DEVTYPE": "disk",
            "size": 128849018880,
            "ID_SERIAL": "Samsung_SSD_980",
            "rotational": false,
            "partitiontable": {"label": "gpt", "partitions": [
                {"node": "/dev/nvme0n1p1", "start": 2048, "size": 1048576,
                 "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"},
                {"node": "/dev/nvme0n1p2", "start": 1050624, "size": 104857600,
                 "type": "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"}
            ]}
        },
        "/dev/sda": {"DEVTYPE": "disk", "size": 64424509440}
    },
    "filesystem": {
        "/dev/nvme0n1p1": {"TYPE": "vfat"},
        "/dev/nvme0n1p2": {"TYPE": "ntfs", "ESTIMATED_MIN_SIZE": 21474836480}
    },
    "os": {
        "/dev/nvme0n1p2": {"long": "Windows Boot Manager", "label": "Windows", "type": "chain"}
    }
}"#;

fn service(probe_file: &Path) -> StorageService {
    let config = ServiceConfig {
        bootloader: Some(Bootloader::Uefi),
        ..ServiceConfig::default()
    };
    StorageService::new(
        config,
        PlatformInfo::classic(Bootloader::Uefi),
        Arc::new(FileProber::new(probe_file)),
    )
}

async fn probed(dir: &tempfile::TempDir) -> StorageService {
    let path = dir.path().join("probe.json");
    std::fs::write(&path, LAPTOP).expect("write probe data");
    let service = service(&path);
    service.start(None).expect("start");
    service.wait_for_probe().await.expect("probe");
    service
}

fn disk_by_path(service: &StorageService, path: &str) -> storage_planner_core::EntityId {
    service
        .controller()
        .model()
        .expect("state")
        .expect("probed")
        .all_disks()
        .iter()
        .find(|d| d.path.as_deref() == Some(path))
        .map(|d| d.id)
        .expect("disk present")
}

#[tokio::test]
async fn guided_resize_next_to_windows_configures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = probed(&dir).await;

    let offered = service.guided_targets(None).expect("targets");
    assert_eq!(offered.status, ProbeStatus::Done);
    let resize = offered
        .targets
        .iter()
        .find(|t| matches!(t.target, Target::Resize { .. }))
        .expect("resize offered")
        .target
        .clone();
    let Target::Resize { recommended, minimum, .. } = resize.clone() else {
        unreachable!()
    };
    assert!(minimum >= 20 * GIB);
    assert!(recommended >= minimum);

    service
        .guided_choice(&GuidedChoice::new(resize, GuidedCapability::Direct))
        .expect("guided choice");
    service.mark_configured().expect("configured");

    let plan = service.rendered_plan().expect("plan");
    let mounts = plan
        .config
        .iter()
        .filter_map(|action| match action {
            Action::Mount { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(mounts.contains(&"/"));
    assert!(mounts.contains(&"/boot/efi"));
    assert!(service.status().expect("status").configured);
}

#[tokio::test]
async fn manual_partitioning_then_reset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = probed(&dir).await;
    let sda = disk_by_path(&service, "/dev/sda");

    let root = service
        .add_partition(sda, None, PartitionSpec::new(0, Some("ext4"), Some("/")))
        .expect("add root");
    assert!(service.status().expect("status").locked);
    // the empty disk became the boot disk on the way
    assert!(service
        .add_boot_partition(sda)
        .expect_err("already boots")
        .to_string()
        .contains("already a boot device"));
    assert!(!service.potential_boot_disks().expect("disks").contains(&sda));
    service.rendered_plan().expect("renders");

    service.delete_partition(root).expect("delete");
    service.reset().expect("reset");
    let status = service.status().expect("status");
    assert!(!status.locked);
    let model = service.controller().model().expect("state").expect("model");
    assert!(model.partitions_of(sda).is_empty());
}

#[tokio::test]
async fn unconfigured_model_cannot_be_marked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = probed(&dir).await;
    let err = service.mark_configured().expect_err("nothing mounted");
    assert!(err.to_string().contains("not ready"));
}

#[tokio::test]
async fn failed_probe_offers_manual_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(&dir.path().join("missing.json"));
    service.start(None).expect("start");
    service.wait_for_probe().await.expect_err("probe fails");

    let offered = service.guided_targets(None).expect("targets");
    assert_eq!(offered.status, ProbeStatus::Failed);
    assert_eq!(offered.targets.len(), 1);
    assert_eq!(offered.targets[0].target, Target::Manual);
    assert_eq!(service.status().expect("status").errors.len(), 2);
}
