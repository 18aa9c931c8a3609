//! The final unit persisted into the vector store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Persistence status of a chunk. Everything we dispatch is `NEW`;
/// the store owns later transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkStatus {
    New,
}

/// A chunk as sent over the wire to the vector store.
///
/// `source_id` is one fresh UUIDv4 per file, shared by every chunk of that
/// file. Chunks are never mutated in place after commit; replacement is
/// delete-by-source followed by insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Absolute path of the originating file.
    pub source_path: String,

    /// UUIDv4 shared by all chunks of the originating file.
    pub source_id: String,

    /// The text segment. Never empty.
    pub body: String,

    pub status: ChunkStatus,

    /// Position within the file's chunk sequence.
    pub ordinal: u32,

    /// Metadata forwarded verbatim from the originating block, plus
    /// anything the segmentation service attached. Not a contract.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl Chunk {
    /// Validate the invariants checked before any dispatch: a parseable
    /// UUIDv4 `source_id` and a non-empty body.
    pub fn validate(&self) -> Result<(), String> {
        match Uuid::parse_str(&self.source_id) {
            Ok(id) if id.get_version_num() == 4 => {}
            Ok(_) => return Err(format!("source_id is not a v4 UUID: {}", self.source_id)),
            Err(e) => return Err(format!("source_id is not a UUID: {e}")),
        }
        if self.body.is_empty() {
            return Err(format!(
                "empty body in chunk {} of {}",
                self.ordinal, self.source_path
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source_id: &str, body: &str) -> Chunk {
        Chunk {
            source_path: "/tmp/docs/a.md".into(),
            source_id: source_id.into(),
            body: body.into(),
            status: ChunkStatus::New,
            ordinal: 0,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_valid_chunk() {
        let c = chunk(&Uuid::new_v4().to_string(), "content");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_uuid() {
        let c = chunk("not-a-uuid", "content");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_wrong_uuid_version() {
        // A v1-style UUID parses but must still be rejected.
        let c = chunk("c232ab00-9414-11ec-b3c8-9f6bdeced846", "content");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_body() {
        let c = chunk(&Uuid::new_v4().to_string(), "");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_status_wire_format() {
        let c = chunk(&Uuid::new_v4().to_string(), "x");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["status"], "NEW");
    }
}
