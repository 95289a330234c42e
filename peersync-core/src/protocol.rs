//! Message types exchanged between peers.
//!
//! Every message is tagged by `type`; field names are camelCase. Messages
//! travel as CBOR on binary frames. The JSON rendering is accepted on text
//! frames, and there chunk payloads are base64 strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::DeviceCode;

/// Opaque identifier of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(String);

impl SyncId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SyncId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of file carried by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// The metadata database.
    Database,
    /// An image blob, identified by its content hash.
    Image,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Database => "database",
            FileType::Image => "image",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Link handshake - each side announces its device code
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello { device_code: DeviceCode },

    /// Ask the receiver to push its snapshot to the sender
    #[serde(rename = "sync_request", rename_all = "camelCase")]
    SyncRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<SyncId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<u8>,
        #[serde(default)]
        is_phase2: bool,
    },

    /// Start of a bidirectional sync
    #[serde(rename = "sync_request_phase1", rename_all = "camelCase")]
    SyncRequestPhase1 {
        sync_id: SyncId,
        initiator_device: DeviceCode,
    },

    /// Initiator has merged; responder should now pull the merged snapshot
    #[serde(rename = "sync_request_phase2", rename_all = "camelCase")]
    SyncRequestPhase2 {
        sync_id: SyncId,
        initiator_device: DeviceCode,
    },

    #[serde(rename = "phase1_complete", rename_all = "camelCase")]
    Phase1Complete { sync_id: SyncId },

    #[serde(rename = "phase2_complete", rename_all = "camelCase")]
    Phase2Complete { sync_id: SyncId },

    #[serde(rename = "bidirectional_sync_complete", rename_all = "camelCase")]
    BidirectionalSyncComplete { sync_id: SyncId },

    /// Announces a file transfer
    #[serde(rename = "file_info", rename_all = "camelCase")]
    FileInfo {
        file_type: FileType,
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    },

    #[serde(rename = "file_chunk", rename_all = "camelCase")]
    FileChunk {
        file_type: FileType,
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "chunk_data")]
        data: Vec<u8>,
    },

    #[serde(rename = "file_complete", rename_all = "camelCase")]
    FileComplete { file_type: FileType, file_id: String },

    /// A snapshot push has finished
    #[serde(rename = "sync_complete", rename_all = "camelCase")]
    SyncComplete {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<SyncId>,
    },

    #[serde(rename = "sync_error", rename_all = "camelCase")]
    SyncError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<SyncId>,
    },
}

/// Errors encoding or decoding a message.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PeerMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ciborium::from_reader(data).map_err(|e| CodecError::CborDecode(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::SyncRequestPhase1 { .. } => "sync_request_phase1",
            PeerMessage::SyncRequestPhase2 { .. } => "sync_request_phase2",
            PeerMessage::Phase1Complete { .. } => "phase1_complete",
            PeerMessage::Phase2Complete { .. } => "phase2_complete",
            PeerMessage::BidirectionalSyncComplete { .. } => "bidirectional_sync_complete",
            PeerMessage::FileInfo { .. } => "file_info",
            PeerMessage::FileChunk { .. } => "file_chunk",
            PeerMessage::FileComplete { .. } => "file_complete",
            PeerMessage::SyncComplete { .. } => "sync_complete",
            PeerMessage::SyncError { .. } => "sync_error",
        }
    }

    /// The sync attempt this message belongs to, if any.
    pub fn sync_id(&self) -> Option<&SyncId> {
        match self {
            PeerMessage::SyncRequestPhase1 { sync_id, .. }
            | PeerMessage::SyncRequestPhase2 { sync_id, .. }
            | PeerMessage::Phase1Complete { sync_id }
            | PeerMessage::Phase2Complete { sync_id }
            | PeerMessage::BidirectionalSyncComplete { sync_id } => Some(sync_id),
            PeerMessage::SyncRequest { sync_id, .. }
            | PeerMessage::SyncComplete { sync_id, .. }
            | PeerMessage::SyncError { sync_id, .. } => sync_id.as_ref(),
            _ => None,
        }
    }
}

/// Chunk payloads: base64 text for human-readable formats, raw bytes otherwise.
///
/// Decoding accepts either form.
mod chunk_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(data))
        } else {
            serde_bytes::serialize(data, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(ChunkVisitor)
    }

    struct ChunkVisitor;

    impl<'de> Visitor<'de> for ChunkVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("base64 string or byte string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            STANDARD.decode(v).map_err(E::custom)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_id_unique() {
        assert_ne!(SyncId::new(), SyncId::new());
    }

    #[test]
    fn test_json_tags_and_field_names() {
        let msg = PeerMessage::SyncRequestPhase1 {
            sync_id: SyncId::from("abc"),
            initiator_device: "123456".parse().unwrap(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "sync_request_phase1");
        assert_eq!(json["syncId"], "abc");
        assert_eq!(json["initiatorDevice"], "123456");

        let msg = PeerMessage::SyncRequest {
            sync_id: Some(SyncId::from("abc")),
            phase: Some(2),
            is_phase2: true,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "sync_request");
        assert_eq!(json["isPhase2"], true);
        assert_eq!(json["phase"], 2);
    }

    #[test]
    fn test_chunk_data_is_base64_in_json() {
        let msg = PeerMessage::FileChunk {
            file_type: FileType::Image,
            file_id: "f".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            data: vec![0xff, 0x00, 0x10],
        };
        let text = msg.to_json().unwrap();
        assert!(text.contains("\"data\":\"/wAQ\""));
        assert!(text.contains("\"fileType\":\"image\""));
        assert_eq!(PeerMessage::from_json(&text).unwrap(), msg);
    }

    #[test]
    fn test_chunk_cbor_encode_decode() {
        let msg = PeerMessage::FileChunk {
            file_type: FileType::Database,
            file_id: "main".to_string(),
            chunk_index: 3,
            total_chunks: 5,
            data: (0..=255).collect(),
        };
        let decoded = PeerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_minimal_sync_request_from_json() {
        let msg = PeerMessage::from_json(r#"{"type":"sync_request"}"#).unwrap();
        assert_eq!(
            msg,
            PeerMessage::SyncRequest {
                sync_id: None,
                phase: None,
                is_phase2: false
            }
        );
        assert!(msg.sync_id().is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(PeerMessage::from_json(r#"{"type":"launch_missiles"}"#).is_err());
    }
}
