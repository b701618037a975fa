//! Upload storage
//!
//! Uploaded files land in a date-partitioned tree `<root>/YYYY/MM/<uuid>.<ext>`
//! and are served back under `/uploads`.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use std::path::PathBuf;
use tokio::fs;
use uuid::Uuid;

/// Maximum accepted upload size (50 MB).
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "svg", "ico", "bmp", "tiff",
    "mp4", "webm", "mov",
    "mp3", "ogg", "wav", "flac",
    "pdf", "txt", "md", "csv",
    "zip", "tar", "gz", "7z", "rar",
    "doc", "docx", "xls", "xlsx", "pptx",
    "json", "xml", "yaml", "yml",
    "go", "py", "js", "ts", "rs", "c", "cpp", "h", "java", "rb",
];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "ico"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "wav", "flac"];

/// A stored upload: the public URL and the on-disk path.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub url: String,
    pub path: PathBuf,
}

/// File store rooted at the configured upload directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create upload directory: {:?}", self.root))?;
        Ok(())
    }

    /// Write an upload under the current year/month partition.
    pub async fn store(&self, extension: &str, data: &[u8]) -> Result<StoredFile> {
        let now = Utc::now();
        let partition = format!("{}/{:02}", now.year(), now.month());
        let dir = self.root.join(&partition);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create upload partition: {dir:?}"))?;

        let filename = format!("{}.{extension}", Uuid::new_v4());
        let path = dir.join(&filename);
        fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write upload to {path:?}"))?;

        Ok(StoredFile {
            url: format!("/uploads/{partition}/{filename}"),
            path,
        })
    }
}

/// Whether the (lowercased, dot-free) extension is accepted.
pub fn extension_allowed(ext: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(&ext)
}

/// Coarse category used by clients to pick a preview widget.
pub fn categorize_extension(ext: &str) -> &'static str {
    if IMAGE_EXTENSIONS.contains(&ext) {
        "image"
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        "video"
    } else if AUDIO_EXTENSIONS.contains(&ext) {
        "audio"
    } else {
        "file"
    }
}
