//! Upload state, results and file handling
//!
//! The [`orchestrator`] drives one file through preflight, service setup, transfer
//! and confirmation. The types here are what callers observe.

pub mod orchestrator;

#[cfg(test)]
mod orchestrator_test;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use orchestrator::{UploadObserver, UploadOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UploadPhase {
    #[default]
    Idle,
    Preflighting,
    SettingUpService,
    Uploading,
    ConfirmingOnChain,
    Succeeded,
    Failed,
}

impl UploadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadPhase::Succeeded | UploadPhase::Failed)
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorInfo {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// A finished upload, ready to be published to the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub file_name: String,
    #[serde(rename = "fileSize")]
    pub file_size_bytes: u64,
    pub commp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Snapshot of one upload as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub phase: UploadPhase,
    /// 0..=100, never decreasing within one attempt
    pub progress: u8,
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<UploadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Video,
    Image,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "webm" | "mov" => Some(FileKind::Video),
            "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(FileKind::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Video => "video",
            FileKind::Image => "image",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(FileKind::Video),
            "image" => Ok(FileKind::Image),
            other => Err(Error::ValidationError(format!(
                "unknown file kind '{other}', expected video or image"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_video_bytes: u64,
    pub max_image_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_video_bytes: 1 << 30,
            max_image_bytes: 10 << 20,
        }
    }
}

impl UploadLimits {
    pub fn max_for(&self, kind: FileKind) -> u64 {
        match kind {
            FileKind::Video => self.max_video_bytes,
            FileKind::Image => self.max_image_bytes,
        }
    }

    pub fn check(&self, name: &str, kind: FileKind, size: u64) -> Result<()> {
        let limit = self.max_for(kind);
        if size > limit {
            return Err(Error::FileTooLargeError {
                name: name.to_string(),
                kind: kind.to_string(),
                size,
                limit,
            });
        }
        Ok(())
    }
}

/// File content selected for upload
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl UploadFile {
    pub fn new(name: impl Into<String>, kind: FileKind, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Read a file from disk, rejecting it by size before the content is loaded
    pub async fn from_path(path: &Path, kind: Option<FileKind>, limits: &UploadLimits) -> Result<Self> {
        let kind = kind.or_else(|| FileKind::from_path(path)).ok_or_else(|| {
            Error::ValidationError(format!(
                "cannot tell whether {} is a video or an image",
                path.display()
            ))
        })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        let size = tokio::fs::metadata(path).await?.len();
        limits.check(&name, kind, size)?;

        let bytes = tokio::fs::read(path).await?;
        Ok(Self { name, kind, bytes })
    }
}
