//! Immutable file and data artifacts carried by a [`State`](crate::State).

use crate::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Category of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    File,
    Image,
    Video,
    Audio,
    Document,
    Data,
    Model,
    Code,
    Log,
    Custom,
}

/// Where the bytes of an artifact live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    /// Bytes held in memory.
    Bytes(Arc<[u8]>),
    /// A reference to external storage, such as a file path.
    Location(String),
}

/// A named file or data object.
///
/// Artifacts are immutable once built: states share them through `Arc`
/// and a state clone never copies the payload.
///
/// # Examples
///
/// ```
/// use hataori_core::{Artifact, ArtifactType};
///
/// let report = Artifact::new("report.csv", ArtifactType::Data, b"a,b\n1,2\n".to_vec())
///     .with_mime_type("text/csv");
///
/// assert_eq!(report.size, 8);
/// assert_eq!(report.bytes(), Some(&b"a,b\n1,2\n"[..]));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub mime_type: Option<String>,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
    #[serde(skip)]
    content: ArtifactContent,
}

impl Artifact {
    /// Creates an artifact holding `data` in memory.
    pub fn new(name: impl Into<String>, artifact_type: ArtifactType, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::with_content(name, artifact_type, ArtifactContent::Bytes(data.into()), size)
    }

    /// Creates an artifact that only references external content.
    pub fn from_location(
        name: impl Into<String>,
        artifact_type: ArtifactType,
        location: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::with_content(
            name,
            artifact_type,
            ArtifactContent::Location(location.into()),
            size,
        )
    }

    fn with_content(
        name: impl Into<String>,
        artifact_type: ArtifactType,
        content: ArtifactContent,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            artifact_type,
            mime_type: None,
            size,
            created: Utc::now(),
            metadata: HashMap::new(),
            content,
        }
    }

    /// Sets the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the content descriptor.
    pub fn content(&self) -> &ArtifactContent {
        &self.content
    }

    /// Returns the in-memory bytes, or `None` for location artifacts.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            ArtifactContent::Bytes(bytes) => Some(bytes),
            ArtifactContent::Location(_) => None,
        }
    }

    /// Returns the external location, or `None` for in-memory artifacts.
    pub fn location(&self) -> Option<&str> {
        match &self.content {
            ArtifactContent::Location(location) => Some(location),
            ArtifactContent::Bytes(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_artifact_has_no_bytes() {
        let artifact =
            Artifact::from_location("model.bin", ArtifactType::Model, "/tmp/model.bin", 1024);
        assert_eq!(artifact.bytes(), None);
        assert_eq!(artifact.location(), Some("/tmp/model.bin"));
        assert_eq!(artifact.size, 1024);
    }

    #[test]
    fn test_artifact_ids_are_unique() {
        let a = Artifact::new("a", ArtifactType::Log, Vec::new());
        let b = Artifact::new("a", ArtifactType::Log, Vec::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_artifact_serializes_type_tag() {
        let artifact = Artifact::new("img", ArtifactType::Image, vec![1, 2, 3])
            .with_metadata("width", 640);
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["metadata"]["width"], 640);
        assert!(json.get("content").is_none());
    }
}
