use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::error::{Result, StorageError};
use crate::gadget::GadgetVolume;
use crate::model::{Bootloader, Secret};
use crate::sizes::install_minimum;
use crate::units::human_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuidedCapability {
    Manual,
    Direct,
    Lvm,
    LvmLuks,
    Zfs,
    ZfsLuksKeystore,
    CoreBootEncrypted,
    CoreBootUnencrypted,
    Dd,
}

impl GuidedCapability {
    pub fn is_lvm(self) -> bool {
        matches!(self, Self::Lvm | Self::LvmLuks)
    }

    pub fn is_zfs(self) -> bool {
        matches!(self, Self::Zfs | Self::ZfsLuksKeystore)
    }

    pub fn is_core_boot(self) -> bool {
        matches!(self, Self::CoreBootEncrypted | Self::CoreBootUnencrypted)
    }

    pub fn supports_passphrase(self) -> bool {
        matches!(
            self,
            Self::LvmLuks | Self::ZfsLuksKeystore | Self::CoreBootEncrypted
        )
    }

    pub fn supports_pin(self) -> bool {
        self == Self::CoreBootEncrypted
    }

    pub fn supports_manual_customization(self) -> bool {
        matches!(self, Self::Manual | Self::Direct | Self::Lvm | Self::LvmLuks)
    }

    /// Keys sealed in the TPM rather than typed in at boot.
    pub fn is_tpm_backed(self) -> bool {
        self == Self::CoreBootEncrypted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisallowedReason {
    TooSmall,
    NotUefi,
    ThirdPartyDrivers,
    CoreBootEncryptionUnavailable,
    /// The partition table cannot number every partition the layout needs.
    TooManyPartitions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisallowedCapability {
    pub capability: GuidedCapability,
    pub reason: DisallowedReason,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionSupport {
    #[default]
    Available,
    Unavailable,
    /// The TPM exists but failed its checks.
    Defective,
}

/// What the install source and firmware allow for core-boot installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreBootSupport {
    #[serde(default)]
    pub encryption: EncryptionSupport,
    #[serde(default)]
    pub encryption_detail: Option<String>,
    /// False hides the unencrypted core-boot capability.
    #[serde(default = "default_true")]
    pub offer_unencrypted: bool,
    /// Gadget layout to install; the stock pc layout when absent.
    #[serde(default)]
    pub volume: Option<GadgetVolume>,
}

fn default_true() -> bool {
    true
}

impl Default for CoreBootSupport {
    fn default() -> Self {
        Self {
            encryption: EncryptionSupport::Available,
            encryption_detail: None,
            offer_unencrypted: true,
            volume: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub bootloader: Bootloader,
    #[serde(default)]
    pub has_third_party_drivers: bool,
    /// `None` when the install source is not a core-boot system.
    #[serde(default)]
    pub core_boot: Option<CoreBootSupport>,
}

impl PlatformInfo {
    pub fn classic(bootloader: Bootloader) -> Self {
        Self {
            bootloader,
            has_third_party_drivers: false,
            core_boot: None,
        }
    }
}

/// How the space behind a target is obtained; decides which capabilities
/// are even considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Reformat,
    UseGap,
    Resize,
    EraseInstall,
}

/// The capability matrix for a target offering `install_space` bytes.
pub fn evaluate_capabilities(
    install_space: u64,
    kind: TargetKind,
    platform: &PlatformInfo,
    config: &PlannerConfig,
) -> (Vec<GuidedCapability>, Vec<DisallowedCapability>) {
    let mut candidates = config
        .default_capabilities
        .iter()
        .copied()
        .filter(|cap| !cap.is_core_boot() && *cap != GuidedCapability::Manual)
        .collect::<Vec<_>>();
    if kind == TargetKind::Reformat {
        if let Some(core_boot) = &platform.core_boot {
            candidates.push(GuidedCapability::CoreBootEncrypted);
            if core_boot.offer_unencrypted {
                candidates.push(GuidedCapability::CoreBootUnencrypted);
            }
        }
        if config.dd_image_size.is_some() {
            candidates.push(GuidedCapability::Dd);
        }
    }
    candidates.dedup();

    let classic_min = install_minimum(platform.bootloader, config.minimum_root_size);
    let mut allowed = Vec::new();
    let mut disallowed = Vec::new();
    for capability in candidates {
        let needed = match capability {
            GuidedCapability::Dd => config.dd_image_size.unwrap_or(classic_min),
            cap if cap.is_core_boot() => {
                let layout = platform
                    .core_boot
                    .as_ref()
                    .and_then(|support| support.volume.as_ref())
                    .map(GadgetVolume::minimum_size)
                    .unwrap_or_else(|| GadgetVolume::pc().minimum_size());
                layout.max(classic_min)
            }
            _ => classic_min,
        };
        let refusal = if install_space < needed {
            Some((
                DisallowedReason::TooSmall,
                Some(format!(
                    "{} needed, {} available",
                    human_size(needed),
                    human_size(install_space)
                )),
            ))
        } else if capability.is_core_boot() {
            core_boot_refusal(capability, platform)
        } else {
            None
        };
        match refusal {
            Some((reason, message)) => disallowed.push(DisallowedCapability {
                capability,
                reason,
                message,
            }),
            None => allowed.push(capability),
        }
    }
    (allowed, disallowed)
}

fn core_boot_refusal(
    capability: GuidedCapability,
    platform: &PlatformInfo,
) -> Option<(DisallowedReason, Option<String>)> {
    if platform.bootloader != Bootloader::Uefi {
        return Some((DisallowedReason::NotUefi, None));
    }
    if capability != GuidedCapability::CoreBootEncrypted {
        return None;
    }
    let support = platform.core_boot.as_ref()?;
    if support.encryption != EncryptionSupport::Available {
        return Some((
            DisallowedReason::CoreBootEncryptionUnavailable,
            support.encryption_detail.clone(),
        ));
    }
    if platform.has_third_party_drivers {
        return Some((DisallowedReason::ThirdPartyDrivers, None));
    }
    None
}

const MIN_PIN_LENGTH: usize = 4;

/// Check the secrets supplied with a guided choice against what the
/// capability accepts.
pub fn validate_pin_pass(
    capability: GuidedCapability,
    passphrase: Option<&Secret>,
    pin: Option<&Secret>,
) -> Result<()> {
    if passphrase.is_some() && pin.is_some() {
        return Err(StorageError::EncryptionValidation(
            "supply either a passphrase or a pin, not both".to_string(),
        ));
    }
    if let Some(passphrase) = passphrase {
        if !capability.supports_passphrase() {
            return Err(StorageError::EncryptionValidation(format!(
                "{capability:?} does not take a passphrase"
            )));
        }
        if passphrase.is_empty() {
            return Err(StorageError::EncryptionValidation(
                "passphrase must not be empty".to_string(),
            ));
        }
    }
    if let Some(pin) = pin {
        if !capability.supports_pin() {
            return Err(StorageError::EncryptionValidation(format!(
                "{capability:?} does not take a pin"
            )));
        }
        let digits = pin.expose();
        if digits.len() < MIN_PIN_LENGTH || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(StorageError::EncryptionValidation(format!(
                "pin must be at least {MIN_PIN_LENGTH} digits"
            )));
        }
    }
    let needs_key = capability.supports_passphrase() && !capability.is_tpm_backed();
    if needs_key && passphrase.is_none() {
        return Err(StorageError::EncryptionValidation(format!(
            "{capability:?} needs a passphrase"
        )));
    }
    Ok(())
}
