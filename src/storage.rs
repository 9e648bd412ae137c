/*
 * Meeting Recorder CLI - Storage Boundary
 * Copyright (c) 2024 Meeting Recorder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{MeetingRecord, UploadReceipt};

/// External persistence for finished meeting records. The relational
/// schema behind this lives outside the capture runtime; the contract is
/// only "accept a record or fail".
#[async_trait]
pub trait MeetingStore: Send + Sync {
    async fn save_meeting(&self, record: &MeetingRecord) -> Result<()>;
}

/// External blob storage for recorded audio.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadReceipt>;
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Default store: one pretty-printed JSON document per meeting under the
/// data directory. Stands in for the relational backend in local runs and
/// tests.
pub struct JsonMeetingStore {
    dir: PathBuf,
}

impl JsonMeetingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MeetingStore for JsonMeetingStore {
    async fn save_meeting(&self, record: &MeetingRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create meeting store directory")?;

        let filename = format!(
            "meeting_{}_{}.json",
            record.user_id,
            record.start_time.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(filename);

        let payload =
            serde_json::to_vec_pretty(record).context("Failed to serialize meeting record")?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("Failed to write meeting record {}", path.display()))?;

        tracing::info!("Meeting record saved: {}", path.display());
        Ok(())
    }
}

/// Default blob store: copies files into a local directory and presigns
/// them as file:// URLs. The S3/MinIO backends live behind the same trait.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadReceipt> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create blob directory")?;
        }
        tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| {
                format!(
                    "Failed to upload {} as {}",
                    local_path.display(),
                    target.display()
                )
            })?;

        tracing::info!("Blob stored: {} -> {}", local_path.display(), key);
        Ok(UploadReceipt {
            status: "success".to_string(),
            key: key.to_string(),
        })
    }

    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String> {
        let target = self.root.join(key);
        Ok(format!("file://{}", target.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeetingRecord;
    use chrono::Utc;
    use std::collections::HashMap;

    fn record() -> MeetingRecord {
        MeetingRecord {
            meeting_url: "https://meet.google.com/abc-defg-hij".to_string(),
            user_id: "user-1".to_string(),
            participants: vec!["Alice".to_string()],
            start_time: Utc::now(),
            transcript: Vec::new(),
            captions: Vec::new(),
            merged: Vec::new(),
            summary: None,
            speaker_stats: None,
            audio_blob_key: Some("user-1/abc/meeting_audio.wav".to_string()),
            errors: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn json_store_writes_a_readable_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMeetingStore::new(dir.path());
        store.save_meeting(&record()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let parsed: MeetingRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.user_id, "user-1");
        assert_eq!(parsed.participants, vec!["Alice"]);
    }

    #[tokio::test]
    async fn blob_store_round_trips_a_file() {
        let scratch = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();

        let source = scratch.path().join("meeting_audio.wav");
        std::fs::write(&source, b"RIFF....WAVE").unwrap();

        let store = FsBlobStore::new(blobs.path());
        let receipt = store
            .upload(&source, "user-1/abc/meeting_audio.wav")
            .await
            .unwrap();
        assert_eq!(receipt.status, "success");

        let stored = blobs.path().join("user-1/abc/meeting_audio.wav");
        assert!(stored.exists());

        let url = store
            .presign("user-1/abc/meeting_audio.wav", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("meeting_audio.wav"));
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails() {
        let blobs = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(blobs.path());
        assert!(store
            .upload(Path::new("/nonexistent/audio.wav"), "key.wav")
            .await
            .is_err());
    }
}
