//! Crash reports raised when a probe kind fails.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReportKind {
    BlockProbeFail,
    DiskProbeFail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: Uuid,
    pub kind: ErrorReportKind,
    pub message: String,
    pub created_at: String,
}

/// What API clients see of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReportRef {
    pub id: Uuid,
    pub kind: ErrorReportKind,
}

impl ErrorReport {
    pub fn new(kind: ErrorReportKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn reference(&self) -> ErrorReportRef {
        ErrorReportRef {
            id: self.id,
            kind: self.kind,
        }
    }

    /// Write the report as `<id>.json` under `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.id));
        let body = serde_json::to_vec_pretty(self).context("failed to serialize crash report")?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
