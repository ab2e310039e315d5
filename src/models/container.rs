use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::{ContainerHash, FileId, FileKey, HostId};

/// Upstream transfer status, normalised to canonical names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    MagnetConversion,
    WaitingFiles,
    Queued,
    Downloading,
    Stalled,
    Compressing,
    Uploading,
    Downloaded,
    Error,
    MagnetError,
    Virus,
    Dead,
    Missing,
}

impl RemoteStatus {
    /// Fixed mapping from upstream status strings; anything unknown is
    /// `Missing`.
    pub fn from_upstream(status: &str) -> Self {
        match status {
            "magnet_conversion" => RemoteStatus::MagnetConversion,
            "waiting_files_selection" => RemoteStatus::WaitingFiles,
            "queued" => RemoteStatus::Queued,
            "downloading" => RemoteStatus::Downloading,
            "stalledDL" => RemoteStatus::Stalled,
            "compressing" => RemoteStatus::Compressing,
            "uploading" => RemoteStatus::Uploading,
            "downloaded" => RemoteStatus::Downloaded,
            "error" => RemoteStatus::Error,
            "magnet_error" => RemoteStatus::MagnetError,
            "virus" => RemoteStatus::Virus,
            "dead" => RemoteStatus::Dead,
            _ => RemoteStatus::Missing,
        }
    }

    /// Statuses the stall monitor watches.
    pub fn is_transferring(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Downloading | RemoteStatus::Queued | RemoteStatus::Stalled
        )
    }

    /// Statuses that can never complete on their own.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Error
                | RemoteStatus::MagnetError
                | RemoteStatus::Virus
                | RemoteStatus::Dead
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Active,
    /// Removed from the upstream provider but fully described locally;
    /// a read restores the container before proceeding.
    Dormant,
    Problematic,
}

/// Opaque probed media metadata, attached by the post-processing hook.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
}

/// A member of a [`Container`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: FileId,
    /// Host id of the unrestricted resource, refreshed on demand.
    pub host_id: HostId,
    pub size: u64,
    /// Provider-side link identifier, stable across URL refreshes.
    pub restricted_link: String,
    /// Short-lived fetchable URL; `None` until unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Canonical path under which the file appears in the namespace.
    pub local_path: String,
    #[serde(default)]
    pub deleted_locally: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_info: Option<MediaInfo>,
}

/// Last observed transfer sample, kept in memory for stall detection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferSample {
    pub bytes_done: u64,
    pub speed_bps: u64,
    pub seeders: u32,
    /// When the speed first dropped below the stall threshold, if it
    /// still is.
    pub slow_since: Option<DateTime<Utc>>,
    /// When the seeder count first hit zero, if it still is.
    pub seedless_since: Option<DateTime<Utc>>,
}

/// One unit added by the user: a torrent-like job grouping files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Container {
    pub host_id: HostId,
    pub name: String,
    pub hash: ContainerHash,
    pub added_at: DateTime<Utc>,
    pub remote_status: RemoteStatus,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_details: Option<String>,
    #[serde(default)]
    pub verification_attempts: u32,
    /// Transient stall-detection sample; never persisted.
    #[serde(skip)]
    pub transfer: Option<TransferSample>,
}

impl Container {
    pub fn new(host_id: HostId, hash: ContainerHash, name: impl Into<String>) -> Self {
        Self {
            host_id,
            hash,
            name: name.into(),
            added_at: Utc::now(),
            remote_status: RemoteStatus::Queued,
            lifecycle_state: LifecycleState::Active,
            files: Vec::new(),
            tags: None,
            category: None,
            last_verified: None,
            last_accessed: None,
            problem_reason: None,
            problem_details: None,
            verification_attempts: 0,
            transfer: None,
        }
    }

    /// Stable once the container reaches `downloaded`.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file(&self, file_id: FileId) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub fn file_mut(&mut self, file_id: FileId) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }

    pub fn file_key(&self, file_id: FileId) -> FileKey {
        FileKey {
            hash: self.hash.clone(),
            file_id,
        }
    }

    pub fn mark_problematic(&mut self, reason: impl Into<String>, details: Option<String>) {
        self.lifecycle_state = LifecycleState::Problematic;
        self.problem_reason = Some(reason.into());
        self.problem_details = details;
    }
}
