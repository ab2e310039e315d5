use anyhow::{Context, Result};

use crate::models::{Container, HostId};

/// Extension of persisted container descriptors.
pub const DESCRIPTOR_EXT: &str = "trd";

/// The three directories a descriptor can live in. A descriptor is in
/// exactly one at a time; saving moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCategory {
    Active,
    Deleted,
    Problematic,
}

impl StoreCategory {
    pub const ALL: [StoreCategory; 3] = [
        StoreCategory::Active,
        StoreCategory::Deleted,
        StoreCategory::Problematic,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            StoreCategory::Active => "Active",
            StoreCategory::Deleted => "Deleted",
            StoreCategory::Problematic => "Problematic",
        }
    }
}

pub fn descriptor_file_name(host_id: &HostId) -> String {
    format!("{}.{}", host_id, DESCRIPTOR_EXT)
}

pub fn to_json(container: &Container) -> Result<String> {
    serde_json::to_string_pretty(container).context("Failed to serialize container descriptor")
}

pub fn from_json(json: &str) -> Result<Container> {
    serde_json::from_str(json).context("Failed to parse container descriptor")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerHash, FileEntry, FileId, LifecycleState, RemoteStatus};

    fn sample() -> Container {
        let mut container = Container::new(
            HostId::new("HOST42"),
            ContainerHash::new("deadbeefcafe"),
            "Some.Show.S02.1080p",
        );
        container.remote_status = RemoteStatus::Downloaded;
        container.lifecycle_state = LifecycleState::Active;
        container.category = Some("tv".to_string());
        container.files.push(FileEntry {
            file_id: FileId(3),
            host_id: HostId::new("F3"),
            size: 123_456,
            restricted_link: "https://host/restricted/3".to_string(),
            download_url: Some("https://cdn/fetch/3".to_string()),
            local_path: "/Some.Show.S02.1080p/e01.mkv".to_string(),
            deleted_locally: false,
            media_info: None,
        });
        container
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let container = sample();
        let json = to_json(&container).unwrap();
        let parsed = from_json(&json).unwrap();

        assert_eq!(parsed.host_id, container.host_id);
        assert_eq!(parsed.hash, container.hash);
        assert_eq!(parsed.name, container.name);
        assert_eq!(parsed.remote_status, RemoteStatus::Downloaded);
        assert_eq!(parsed.lifecycle_state, LifecycleState::Active);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].file_id, FileId(3));
        assert_eq!(
            parsed.files[0].local_path,
            "/Some.Show.S02.1080p/e01.mkv"
        );
        assert_eq!(parsed.added_at, container.added_at);
    }

    #[test]
    fn test_wire_field_names() {
        let json = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["host_id"], "HOST42");
        assert_eq!(value["remote_status"], "downloaded");
        assert_eq!(value["lifecycle_state"], "active");
        assert_eq!(value["files"][0]["deleted_locally"], false);
        // added_at is ISO-8601.
        let added = value["added_at"].as_str().unwrap();
        assert!(added.contains('T'));
        chrono::DateTime::parse_from_rfc3339(added).unwrap();
    }

    #[test]
    fn test_descriptor_file_name() {
        assert_eq!(descriptor_file_name(&HostId::new("ABC")), "ABC.trd");
    }

    #[test]
    fn test_minimal_descriptor_parses_with_defaults() {
        let json = r#"{
            "host_id": "H1",
            "name": "n",
            "hash": "abcd",
            "added_at": "2025-04-01T10:00:00Z",
            "remote_status": "queued"
        }"#;
        let container = from_json(json).unwrap();
        assert_eq!(container.lifecycle_state, LifecycleState::Active);
        assert!(container.files.is_empty());
        assert_eq!(container.verification_attempts, 0);
    }
}
