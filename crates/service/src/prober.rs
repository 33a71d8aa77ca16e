use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use storage_planner_core::{ProbeData, ProbeKind};

/// Collects the storage state of the machine.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, kinds: &BTreeSet<ProbeKind>) -> Result<ProbeData>;
}

/// Serves probe data recorded in a JSON file, trimmed to the kinds asked
/// for.
#[derive(Debug, Clone)]
pub struct FileProber {
    path: PathBuf,
}

impl FileProber {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Prober for FileProber {
    async fn probe(&self, kinds: &BTreeSet<ProbeKind>) -> Result<ProbeData> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read probe data {}", self.path.display()))?;
        let mut data: ProbeData = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        if !kinds.contains(&ProbeKind::Defaults) {
            data.filesystem.clear();
            data.mount.clear();
        }
        if !kinds.contains(&ProbeKind::FilesystemSizing) {
            for fs in data.filesystem.values_mut() {
                fs.estimated_min_size = None;
            }
        }
        if !kinds.contains(&ProbeKind::Os) {
            data.os.clear();
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use storage_planner_core::probe::{full_kinds, restricted_kinds};

    use super::{FileProber, Prober};

    const DATA: &str = r#"{
        "blockdev": {"/dev/vda": {"DEVTYPE": "disk", "size": 10737418240}},
        "filesystem": {"/dev/vda": {"TYPE": "ext4", "ESTIMATED_MIN_SIZE": 1048576}},
        "os": {"/dev/vda": {"long": "Fedora Linux 40", "label": "Fedora", "type": "linux"}},
        "mount": [{"source": "/dev/vda", "target": "/"}]
    }"#;

    #[tokio::test]
    async fn restricted_probe_keeps_block_devices_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("probe.json");
        std::fs::write(&path, DATA).expect("write");
        let prober = FileProber::new(&path);

        let restricted = prober.probe(&restricted_kinds()).await.expect("probe");
        assert_eq!(restricted.blockdev.len(), 1);
        assert!(restricted.filesystem.is_empty() && restricted.os.is_empty());
        assert!(restricted.mount.is_empty());

        let full = prober.probe(&full_kinds(false)).await.expect("probe");
        assert_eq!(full.filesystem["/dev/vda"].estimated_min_size, Some(1048576));
        assert!(full.os.is_empty());
        assert_eq!(full.mount.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_file_is_an_error() {
        let prober = FileProber::new("/nonexistent/probe.json");
        let err = prober.probe(&restricted_kinds()).await.expect_err("missing");
        assert!(format!("{err:#}").contains("/nonexistent/probe.json"));
    }
}
