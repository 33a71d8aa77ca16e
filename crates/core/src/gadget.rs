//! Volume descriptions shipped by core-boot systems.

use serde::{Deserialize, Serialize};

use crate::units::{align_up, MIB};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureRole {
    Mbr,
    SystemSeed,
    SystemBoot,
    SystemSave,
    SystemData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetStructure {
    pub name: String,
    #[serde(default)]
    pub role: Option<StructureRole>,
    /// Fixed offset; `None` places the structure right after the previous one.
    #[serde(default)]
    pub offset: Option<u64>,
    pub size: u64,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Partition type code (GUID on GPT).
    #[serde(default, rename = "type")]
    pub partition_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSchema {
    #[default]
    Gpt,
    Mbr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetVolume {
    #[serde(default)]
    pub schema: VolumeSchema,
    #[serde(rename = "structure")]
    pub structures: Vec<GadgetStructure>,
}

const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const LINUX_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

impl GadgetVolume {
    /// The layout of the stock pc gadget.
    pub fn pc() -> Self {
        let structure = |name: &str, role, size, filesystem: &str, guid: &str| GadgetStructure {
            name: name.to_string(),
            role: Some(role),
            offset: None,
            size,
            filesystem: Some(filesystem.to_string()),
            label: Some(name.to_string()),
            partition_type: Some(guid.to_string()),
        };
        Self {
            schema: VolumeSchema::Gpt,
            structures: vec![
                structure("ubuntu-seed", StructureRole::SystemSeed, 1200 * MIB, "vfat", ESP_GUID),
                structure("ubuntu-boot", StructureRole::SystemBoot, 750 * MIB, "ext4", LINUX_GUID),
                structure("ubuntu-save", StructureRole::SystemSave, 16 * MIB, "ext4", LINUX_GUID),
                structure("ubuntu-data", StructureRole::SystemData, 1024 * MIB, "ext4", LINUX_GUID),
            ],
        }
    }

    /// Bytes the layout needs, counting the data partition at its minimum.
    pub fn minimum_size(&self) -> u64 {
        let end = self.structures.iter().fold(MIB, |cursor, s| {
            align_up(s.offset.unwrap_or(cursor), MIB) + s.size
        });
        align_up(end, MIB) + MIB
    }
}
