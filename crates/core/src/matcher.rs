//! Picking a disk by description, for unattended installs.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::model::Disk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePreference {
    Largest,
    Smallest,
}

/// Every field that is set must match. Globs use shell syntax and are
/// case sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskMatch {
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub ssd: Option<bool>,
    #[serde(default)]
    pub size: Option<SizePreference>,
}

impl DiskMatch {
    pub fn largest() -> Self {
        Self {
            size: Some(SizePreference::Largest),
            ..Self::default()
        }
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|err| StorageError::invalid(format!("invalid disk match glob '{pattern}': {err}")))
}

struct Field {
    matcher: GlobMatcher,
    value: fn(&Disk) -> Option<&str>,
}

impl Field {
    fn matches(&self, disk: &Disk) -> bool {
        self.matcher.is_match((self.value)(disk).unwrap_or(""))
    }
}

/// The disk `rule` picks among `disks`, if any.
pub fn disk_for_match<'a>(disks: &[&'a Disk], rule: &DiskMatch) -> Result<Option<&'a Disk>> {
    let mut fields = Vec::new();
    let globs: [(&Option<String>, fn(&Disk) -> Option<&str>); 4] = [
        (&rule.serial, |d| d.serial.as_deref()),
        (&rule.model, |d| d.model.as_deref()),
        (&rule.vendor, |d| d.vendor.as_deref()),
        (&rule.path, |d| d.path.as_deref()),
    ];
    for (pattern, value) in globs {
        if let Some(pattern) = pattern {
            fields.push(Field {
                matcher: compile(pattern)?,
                value,
            });
        }
    }

    let mut candidates = disks
        .iter()
        .copied()
        .filter(|disk| fields.iter().all(|field| field.matches(disk)))
        .filter(|disk| match rule.ssd {
            Some(ssd) => (disk.rotational == Some(false)) == ssd,
            None => true,
        })
        .collect::<Vec<_>>();
    match rule.size {
        Some(SizePreference::Largest) => candidates.sort_by(|a, b| b.size.cmp(&a.size)),
        Some(SizePreference::Smallest) => candidates.sort_by_key(|disk| disk.size),
        None => {}
    }
    Ok(candidates.first().copied())
}

#[cfg(test)]
mod tests {
    use super::{disk_for_match, DiskMatch, SizePreference};
    use crate::error::StorageError;
    use crate::model::Disk;
    use crate::units::GIB;

    fn disks() -> Vec<Disk> {
        vec![
            Disk {
                path: Some("/dev/sda".to_string()),
                serial: Some("WDC_WD10EZEX_1".to_string()),
                rotational: Some(true),
                size: 1000 * GIB,
                ..Disk::default()
            },
            Disk {
                path: Some("/dev/nvme0n1".to_string()),
                serial: Some("Samsung_SSD_970".to_string()),
                rotational: Some(false),
                size: 500 * GIB,
                ..Disk::default()
            },
            Disk {
                path: Some("/dev/nvme1n1".to_string()),
                serial: Some("Samsung_SSD_980".to_string()),
                rotational: Some(false),
                size: 250 * GIB,
                ..Disk::default()
            },
        ]
    }

    #[test]
    fn largest_by_default_rule() {
        let disks = disks();
        let refs = disks.iter().collect::<Vec<_>>();
        let picked = disk_for_match(&refs, &DiskMatch::largest()).expect("valid");
        assert_eq!(picked.and_then(|d| d.path.as_deref()), Some("/dev/sda"));
    }

    #[test]
    fn glob_and_ssd_narrow_candidates() {
        let disks = disks();
        let refs = disks.iter().collect::<Vec<_>>();
        let rule = DiskMatch {
            serial: Some("Samsung_*".to_string()),
            ssd: Some(true),
            size: Some(SizePreference::Smallest),
            ..DiskMatch::default()
        };
        let picked = disk_for_match(&refs, &rule).expect("valid");
        assert_eq!(picked.and_then(|d| d.path.as_deref()), Some("/dev/nvme1n1"));
    }

    #[test]
    fn no_candidate_is_none() {
        let disks = disks();
        let refs = disks.iter().collect::<Vec<_>>();
        let rule = DiskMatch {
            path: Some("/dev/vd*".to_string()),
            ..DiskMatch::default()
        };
        assert_eq!(disk_for_match(&refs, &rule).expect("valid"), None);
    }

    #[test]
    fn bad_glob_is_rejected() {
        let rule = DiskMatch {
            model: Some("[".to_string()),
            ..DiskMatch::default()
        };
        let err = disk_for_match(&[], &rule).expect_err("invalid");
        assert!(matches!(err, StorageError::InvalidTransition(_)));
    }
}
