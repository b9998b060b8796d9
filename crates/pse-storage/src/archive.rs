//! Raw payload archive.
//!
//! Every upstream response body can be kept on disk for replay and audit. Files
//! are named by the SHA-256 of their bytes and grouped by source and capture
//! date:
//!
//! ```text
//! <root>/<source_id>/<YYYY-MM-DD>/<sha256>.<ext>
//! ```
//!
//! The same payload captured twice on one day lands on the same path and is
//! written once.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPayload {
    pub digest: String,
    /// Path relative to the archive root.
    pub location: PathBuf,
    pub bytes: usize,
    /// True when an identical payload was already on disk.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn location(source_id: &str, captured_on: NaiveDate, digest: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        Path::new(source_id)
            .join(captured_on.format("%Y-%m-%d").to_string())
            .join(format!("{digest}.{extension}"))
    }

    /// Writes `body` under its digest unless the same bytes are already archived.
    ///
    /// The file is staged under a temporary name in the target directory and
    /// renamed into place, so readers never observe a partial payload.
    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let digest = Self::digest(body);
        let location = Self::location(source_id, captured_at.date_naive(), &digest, extension);
        let target = self.root.join(&location);
        let dir = target.parent().unwrap_or(&self.root).to_path_buf();

        let mut payload = ArchivedPayload {
            digest,
            location,
            bytes: body.len(),
            reused: true,
        };
        if fs::metadata(&target).await.is_ok() {
            return Ok(payload);
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create archive dir {}", dir.display()))?;
        let staging = dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
        fs::write(&staging, body)
            .await
            .with_context(|| format!("write {}", staging.display()))?;

        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            if fs::metadata(&target).await.is_ok() {
                return Ok(payload);
            }
            return Err(err).with_context(|| format!("publish {}", target.display()));
        }
        payload.reused = false;
        Ok(payload)
    }
}
