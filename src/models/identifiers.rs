use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

macro_rules! impl_id_type {
    ($name:ident) => {
        #[derive(Clone, Debug, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_id_type!(HostId);
impl_id_type!(ContainerHash);

/// Stable identifier of a file within its container, issued upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FileId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifies one cacheable file: `(container_hash, file_id)`.
///
/// Doubles as the on-disk name of the file's chunk directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub hash: ContainerHash,
    pub file_id: FileId,
}

impl FileKey {
    pub fn new(hash: impl Into<ContainerHash>, file_id: impl Into<FileId>) -> Self {
        Self {
            hash: hash.into(),
            file_id: file_id.into(),
        }
    }

    /// Directory name under the cache root: `<container_hash>_<file_id>`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.hash, self.file_id)
    }

    /// Inverse of [`FileKey::dir_name`]; `None` for names that were not
    /// produced by it.
    pub fn parse_dir_name(name: &str) -> Option<Self> {
        let (hash, id) = name.rsplit_once('_')?;
        if hash.is_empty() {
            return None;
        }
        let file_id: u32 = id.parse().ok()?;
        Some(Self::new(hash, file_id))
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.hash, self.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation_and_conversion() {
        let id = HostId::new("ABCDEF123");
        assert_eq!(id.as_str(), "ABCDEF123");
        assert_eq!(id.to_string(), "ABCDEF123");

        let hash = ContainerHash::from("deadbeef");
        assert_eq!(hash.as_ref(), "deadbeef");
    }

    #[test]
    fn test_file_key_dir_name_round_trip() {
        let key = FileKey::new("deadbeefcafe", 7);
        assert_eq!(key.dir_name(), "deadbeefcafe_7");
        assert_eq!(FileKey::parse_dir_name("deadbeefcafe_7"), Some(key));
    }

    #[test]
    fn test_file_key_parse_rejects_garbage() {
        assert_eq!(FileKey::parse_dir_name("no-separator"), None);
        assert_eq!(FileKey::parse_dir_name("hash_notanumber"), None);
        assert_eq!(FileKey::parse_dir_name("_3"), None);
    }
}
