use std::path::Path;

use serde::Serialize;

use crate::model::Bootloader;

/// What the machine we are running on looks like to the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformReport {
    pub arch: String,
    pub efi_firmware: bool,
    pub bootloader: Bootloader,
}

/// Bootloader for the running machine.
pub fn detect_bootloader() -> Bootloader {
    detect_at(Path::new("/"), std::env::consts::ARCH).bootloader
}

pub fn platform_report() -> PlatformReport {
    detect_at(Path::new("/"), std::env::consts::ARCH)
}

/// Detection against an arbitrary root, so tests can fake `/sys`.
pub fn detect_at(root: &Path, arch: &str) -> PlatformReport {
    let efi_firmware = root.join("sys/firmware/efi").exists();
    let bootloader = if arch == "s390x" {
        Bootloader::None
    } else if efi_firmware {
        Bootloader::Uefi
    } else if arch.starts_with("powerpc64") || arch.starts_with("ppc64") {
        Bootloader::Prep
    } else {
        Bootloader::Bios
    };
    PlatformReport {
        arch: arch.to_string(),
        efi_firmware,
        bootloader,
    }
}

#[cfg(test)]
mod tests {
    use super::detect_at;
    use crate::model::Bootloader;

    #[test]
    fn efi_directory_means_uefi() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("sys/firmware/efi")).expect("efi dir");
        let report = detect_at(root.path(), "x86_64");
        assert!(report.efi_firmware);
        assert_eq!(report.bootloader, Bootloader::Uefi);
    }

    #[test]
    fn legacy_firmware_by_architecture() {
        let root = tempfile::tempdir().expect("tempdir");
        assert_eq!(detect_at(root.path(), "x86_64").bootloader, Bootloader::Bios);
        assert_eq!(detect_at(root.path(), "powerpc64").bootloader, Bootloader::Prep);
        assert_eq!(detect_at(root.path(), "s390x").bootloader, Bootloader::None);
    }
}
