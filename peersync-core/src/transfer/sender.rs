//! Outbound side of a file transfer.

use serde_json::{Map, Value};

use super::chunk::{chunk_count, split};
use super::{TransferConfig, TransferError, MAIN_FILE_ID};
use crate::models::DeviceCode;
use crate::protocol::{FileType, PeerMessage};
use crate::session::SessionManager;

const DATABASE_MIME: &str = "application/vnd.sqlite3";

/// A payload ready to be streamed to a peer.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_type: FileType,
    pub file_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub meta: Option<Map<String, Value>>,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    /// The metadata database snapshot.
    pub fn database(bytes: Vec<u8>) -> Self {
        Self {
            file_type: FileType::Database,
            file_id: MAIN_FILE_ID.to_string(),
            file_name: "metadata.db".to_string(),
            mime_type: Some(DATABASE_MIME.to_string()),
            meta: None,
            bytes,
        }
    }

    /// An image blob, identified by its content hash.
    pub fn image(hash: impl Into<String>, bytes: Vec<u8>, meta: Option<&Value>) -> Self {
        let hash = hash.into();
        Self {
            file_type: FileType::Image,
            file_name: hash.clone(),
            file_id: hash,
            mime_type: None,
            meta: meta.and_then(clean_meta),
            bytes,
        }
    }
}

/// Keeps only the primitive top-level fields of a JSON object.
///
/// Nested objects and arrays are dropped so arbitrary caller structures never
/// end up on the wire.
pub fn clean_meta(value: &Value) -> Option<Map<String, Value>> {
    let object = value.as_object()?;
    let cleaned: Map<String, Value> = object
        .iter()
        .filter(|(_, v)| matches!(v, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(cleaned)
}

/// Streams `file` to `peer`: `file_info`, each chunk in order, then `file_complete`.
///
/// An empty file still gets its `file_complete`.
pub async fn send_file(
    sessions: &SessionManager,
    peer: &DeviceCode,
    file: &OutgoingFile,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let total_chunks = chunk_count(file.bytes.len(), config.chunk_size);
    let send_error = |source| TransferError::Send {
        file_type: file.file_type,
        file_id: file.file_id.clone(),
        source,
    };

    tracing::debug!(
        "Sending {} {} to {}: {} bytes in {} chunks",
        file.file_type,
        file.file_id,
        peer,
        file.bytes.len(),
        total_chunks
    );

    sessions
        .send(
            peer,
            PeerMessage::FileInfo {
                file_type: file.file_type,
                file_id: file.file_id.clone(),
                file_name: file.file_name.clone(),
                file_size: file.bytes.len() as u64,
                total_chunks,
                mime_type: file.mime_type.clone(),
                meta: file.meta.clone(),
            },
        )
        .await
        .map_err(send_error)?;

    for (index, data) in split(&file.bytes, config.chunk_size).enumerate() {
        let index = index as u32;
        let delay = config.pacing.delay_before(index);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        sessions
            .send(
                peer,
                PeerMessage::FileChunk {
                    file_type: file.file_type,
                    file_id: file.file_id.clone(),
                    chunk_index: index,
                    total_chunks,
                    data: data.to_vec(),
                },
            )
            .await
            .map_err(send_error)?;
    }

    sessions
        .send(
            peer,
            PeerMessage::FileComplete {
                file_type: file.file_type,
                file_id: file.file_id.clone(),
            },
        )
        .await
        .map_err(send_error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_meta_keeps_primitives_only() {
        let meta = json!({
            "id": 4,
            "description": "dunes",
            "favourite": true,
            "missing": null,
            "tags": ["a", "b"],
            "owner": { "name": "x" }
        });

        let cleaned = clean_meta(&meta).unwrap();
        assert_eq!(cleaned.len(), 4);
        assert!(cleaned.contains_key("id"));
        assert!(cleaned.contains_key("missing"));
        assert!(!cleaned.contains_key("tags"));
        assert!(!cleaned.contains_key("owner"));
    }

    #[test]
    fn test_clean_meta_ignores_non_objects() {
        assert!(clean_meta(&json!([1, 2])).is_none());
        assert!(clean_meta(&json!("text")).is_none());
    }

    #[test]
    fn test_database_file_uses_main_id() {
        let file = OutgoingFile::database(vec![1, 2, 3]);
        assert_eq!(file.file_id, MAIN_FILE_ID);
        assert_eq!(file.file_type, FileType::Database);
    }
}
