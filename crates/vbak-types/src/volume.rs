use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Name of a backed-up volume.
///
/// Volume names double as directory names in the archive, so they must be
/// non-empty, must not contain path separators or whitespace, and must not
/// start with a dot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 112
            && !name.starts_with('.')
            && !name.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control());
        if valid {
            Ok(Self(name))
        } else {
            Err(TypeError::InvalidVolumeName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VolumeName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeName> for String {
    fn from(name: VolumeName) -> Self {
        name.0
    }
}

impl fmt::Debug for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeName({})", self.0)
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of a volume's archive, assigned when it is first created.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(Uuid);

impl VolumeId {
    /// A fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for VolumeId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TypeError::InvalidHex(e.to_string()))
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical layout of a session's stored chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// One file per chunk, grouped in prefix directories.
    Folders,
    /// A single container file holding every chunk of the session.
    Tarfile,
}

impl StorageLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageLayout::Folders => "folders",
            StorageLayout::Tarfile => "tarfile",
        }
    }

    /// Whether sessions in this layout can take part in a merge.
    pub fn is_mergeable(&self) -> bool {
        matches!(self, StorageLayout::Folders)
    }
}

impl FromStr for StorageLayout {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folders" => Ok(StorageLayout::Folders),
            "tarfile" => Ok(StorageLayout::Tarfile),
            other => Err(TypeError::UnknownLayout(other.to_string())),
        }
    }
}

impl fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
