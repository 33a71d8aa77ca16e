use storage_planner_core::capability::{GuidedCapability, PlatformInfo};
use storage_planner_core::guided::{apply, targets, GuidedChoice, Target};
use storage_planner_core::model::{Bootloader, PartitionFlag};
use storage_planner_core::probe::{model_from_probe_data, ProbeData};
use storage_planner_core::render::{model_from_actions, render};
use storage_planner_core::units::MIB;
use storage_planner_core::PlannerConfig;

const DUAL_DISK: &str = r#"{
    "blockdev": {
        "/dev/sda": {"DEVTYPE": "disk", "size": 1073741824},
        "/dev/sdb": {
            "DEVTYPE": "disk",
            "size": 64424509440,
            "partitiontable": {"label": "gpt", "partitions": [
                {"node": "/dev/sdb1", "start": 2048, "size": 1048576,
                 "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"},
                {"node": "/dev/sdb2", "start": 1050624, "size": 41943040,
                 "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"}
            ]}
        }
    },
    "filesystem": {
        "/dev/sdb1": {"TYPE": "vfat"},
        "/dev/sdb2": {"TYPE": "ext4", "ESTIMATED_MIN_SIZE": 4294967296}
    },
    "os": {
        "/dev/sdb2": {"long": "Debian GNU/Linux 12", "label": "Debian", "type": "linux"}
    }
}"#;

fn load() -> storage_planner_core::StorageModel {
    let data: ProbeData = serde_json::from_str(DUAL_DISK).expect("probe data parses");
    model_from_probe_data(&data, Bootloader::Uefi).expect("model loads")
}

#[test]
fn every_offered_target_has_a_reason_for_each_refusal() {
    let model = load();
    let platform = PlatformInfo::classic(Bootloader::Uefi);
    let config = PlannerConfig::default();
    let offered = targets(&model, &platform, &config);
    assert_eq!(offered.last().map(|t| &t.target), Some(&Target::Manual));
    for target in &offered[..offered.len() - 1] {
        let considered = target.allowed.len() + target.disallowed.len();
        assert_eq!(considered, config.default_capabilities.len());
    }
    // the 1 GiB disk is too small for anything
    let small = model
        .all_disks()
        .iter()
        .find(|d| d.path.as_deref() == Some("/dev/sda"))
        .map(|d| d.id)
        .expect("small disk");
    let small_target = offered
        .iter()
        .find(|t| t.target == Target::Reformat { disk: small })
        .expect("reformat offered");
    assert!(small_target.allowed.is_empty());
}

#[test]
fn gap_install_renders_and_reparses() {
    let mut model = load();
    let platform = PlatformInfo::classic(Bootloader::Uefi);
    let config = PlannerConfig::default();
    let gap_target = targets(&model, &platform, &config)
        .into_iter()
        .find(|t| matches!(t.target, Target::UseGap { .. }))
        .expect("use-gap offered");
    assert!(gap_target.allowed.contains(&GuidedCapability::Lvm));

    apply(
        &mut model,
        &GuidedChoice::new(gap_target.target, GuidedCapability::Lvm),
        &platform,
        &config,
    )
    .expect("guided lvm applies");
    assert!(model.can_install());

    let plan = render(&model).expect("renders");
    let json = serde_json::to_value(&plan).expect("serializes");
    assert_eq!(json["version"], 2);
    let reparsed = model_from_actions(&plan.config, Bootloader::Uefi).expect("reparses");
    assert!(reparsed.can_install());

    let disk = reparsed
        .all_disks()
        .iter()
        .find(|d| d.path.as_deref() == Some("/dev/sdb"))
        .map(|d| d.id)
        .expect("target disk");
    let parts = reparsed.partitions_of(disk);
    // the existing ESP and Debian root stay untouched
    assert!(parts[0].preserve && parts[0].flag == Some(PartitionFlag::Boot));
    assert!(parts[1].preserve);
    assert!(parts.iter().all(|p| p.offset % MIB == 0));
}
