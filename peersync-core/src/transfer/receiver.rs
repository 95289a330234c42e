//! Inbound side of file transfers: slot-based reassembly.

use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{TransferError, DEFAULT_MAX_TRANSFER_BYTES, MAIN_FILE_ID};
use crate::models::DeviceCode;
use crate::protocol::FileType;

/// Progress is reported on every Nth chunk and on the last one.
const PROGRESS_EVERY: u32 = 10;

/// What a `file_info` announced.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub file_type: FileType,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub mime_type: Option<String>,
    pub meta: Option<Map<String, Value>>,
}

/// Reassembly progress of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub peer: DeviceCode,
    pub file_type: FileType,
    pub file_id: String,
    pub received: u32,
    pub total: u32,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((u64::from(self.received) * 100) / u64::from(self.total)) as u8
    }
}

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub peer: DeviceCode,
    pub info: FileInfo,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransferKey {
    peer: DeviceCode,
    file_type: FileType,
    file_id: String,
}

impl TransferKey {
    fn new(peer: &DeviceCode, file_type: FileType, file_id: &str) -> Self {
        let file_id = if file_id.is_empty() {
            MAIN_FILE_ID
        } else {
            file_id
        };
        Self {
            peer: peer.clone(),
            file_type,
            file_id: file_id.to_string(),
        }
    }
}

#[derive(Debug)]
struct TransferState {
    info: FileInfo,
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
    /// Bytes held across all slots.
    buffered: u64,
}

/// Tracks every in-flight inbound transfer, across all peers.
#[derive(Debug)]
pub struct Reassembler {
    transfers: HashMap<TransferKey, TransferState>,
    max_file_bytes: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_TRANSFER_BYTES)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reassembler that refuses files larger than `max_file_bytes`.
    pub fn with_limit(max_file_bytes: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            max_file_bytes,
        }
    }

    /// Number of transfers currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Starts a transfer. A previous transfer with the same key is discarded.
    ///
    /// Announcements over the size limit, or whose chunk count cannot cover
    /// the announced size, are refused and leave existing state untouched.
    pub fn begin(&mut self, peer: &DeviceCode, info: FileInfo) -> Result<(), TransferError> {
        let key = TransferKey::new(peer, info.file_type, &info.file_id);

        let problem = if info.file_size > self.max_file_bytes {
            Some(format!(
                "{} bytes exceeds the {} byte limit",
                info.file_size, self.max_file_bytes
            ))
        } else if info.total_chunks == 0 && info.file_size != 0 {
            Some(format!("{} bytes in zero chunks", info.file_size))
        } else if u64::from(info.total_chunks) > info.file_size && info.file_size != 0 {
            Some(format!(
                "{} chunks for {} bytes",
                info.total_chunks, info.file_size
            ))
        } else if info.file_size == 0 && info.total_chunks > 1 {
            Some(format!("{} chunks for an empty file", info.total_chunks))
        } else {
            None
        };
        if let Some(reason) = problem {
            return Err(TransferError::InvalidAnnouncement {
                file_type: info.file_type,
                file_id: key.file_id,
                reason,
            });
        }

        let slots = vec![None; info.total_chunks as usize];

        tracing::debug!(
            "Receiving {} {} from {}: {} bytes in {} chunks",
            info.file_type,
            key.file_id,
            peer,
            info.file_size,
            info.total_chunks
        );

        if self
            .transfers
            .insert(
                key.clone(),
                TransferState {
                    info,
                    slots,
                    received: 0,
                    buffered: 0,
                },
            )
            .is_some()
        {
            tracing::warn!(
                "Restarted transfer {} {} from {}, earlier chunks dropped",
                key.file_type,
                key.file_id,
                peer
            );
        }
        Ok(())
    }

    /// Stores one chunk.
    ///
    /// Chunks for unknown transfers, with an index outside the announced
    /// range, with a mismatching total, or that would overrun the announced
    /// size are dropped. Returns progress on
    /// every tenth chunk and when the last missing chunk arrives.
    pub fn accept_chunk(
        &mut self,
        peer: &DeviceCode,
        file_type: FileType,
        file_id: &str,
        index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Option<Progress> {
        let key = TransferKey::new(peer, file_type, file_id);
        let state = match self.transfers.get_mut(&key) {
            Some(state) => state,
            None => {
                tracing::warn!(
                    "Dropping chunk {} for unknown transfer {} {} from {}",
                    index,
                    file_type,
                    key.file_id,
                    peer
                );
                return None;
            }
        };

        if total_chunks != state.info.total_chunks || index >= state.info.total_chunks {
            tracing::warn!(
                "Dropping malformed chunk {}/{} for {} {} (announced {} chunks)",
                index,
                total_chunks,
                file_type,
                key.file_id,
                state.info.total_chunks
            );
            return None;
        }

        let slot = &mut state.slots[index as usize];
        let replaced = slot.as_ref().map_or(0, |old| old.len() as u64);
        let buffered = state.buffered - replaced + data.len() as u64;
        if buffered > state.info.file_size {
            tracing::warn!(
                "Dropping chunk {} of {} {}: {} bytes exceed the announced {}",
                index,
                file_type,
                key.file_id,
                buffered,
                state.info.file_size
            );
            return None;
        }
        state.buffered = buffered;

        let first_delivery = slot.is_none();
        *slot = Some(data);
        if !first_delivery {
            tracing::debug!("Chunk {} of {} re-delivered", index, key.file_id);
            return None;
        }

        state.received += 1;
        let received = state.received;
        let total = state.info.total_chunks;

        if received % PROGRESS_EVERY == 0 || received == total {
            Some(Progress {
                peer: peer.clone(),
                file_type,
                file_id: key.file_id,
                received,
                total,
            })
        } else {
            None
        }
    }

    /// Concatenates a transfer's chunks and forgets it.
    ///
    /// Fails if any chunk is missing or the size disagrees with `file_info`.
    pub fn finish(
        &mut self,
        peer: &DeviceCode,
        file_type: FileType,
        file_id: &str,
    ) -> Result<CompletedFile, TransferError> {
        let key = TransferKey::new(peer, file_type, file_id);
        let state = self
            .transfers
            .remove(&key)
            .ok_or_else(|| TransferError::UnknownTransfer {
                file_type,
                file_id: key.file_id.clone(),
            })?;

        let mut bytes = Vec::with_capacity(state.buffered as usize);
        for (index, slot) in state.slots.into_iter().enumerate() {
            match slot {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => {
                    return Err(TransferError::MissingChunk {
                        file_type,
                        file_id: key.file_id,
                        index: index as u32,
                        total: state.info.total_chunks,
                    })
                }
            }
        }

        if bytes.len() as u64 != state.info.file_size {
            return Err(TransferError::SizeMismatch {
                file_type,
                file_id: key.file_id,
                expected: state.info.file_size,
                actual: bytes.len() as u64,
            });
        }

        Ok(CompletedFile {
            peer: peer.clone(),
            info: state.info,
            bytes,
        })
    }

    /// Drops every in-flight transfer from `peer`. Returns how many were dropped.
    pub fn abandon_peer(&mut self, peer: &DeviceCode) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|key, _| &key.peer != peer);
        let dropped = before - self.transfers.len();
        if dropped > 0 {
            tracing::info!("Abandoned {} partial transfer(s) from {}", dropped, peer);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunk::{chunk_count, split, DEFAULT_CHUNK_SIZE};

    fn peer() -> DeviceCode {
        "111111".parse().unwrap()
    }

    fn info(file_id: &str, bytes: &[u8], chunk_size: usize) -> FileInfo {
        FileInfo {
            file_type: FileType::Image,
            file_id: file_id.to_string(),
            file_name: file_id.to_string(),
            file_size: bytes.len() as u64,
            total_chunks: chunk_count(bytes.len(), chunk_size),
            mime_type: None,
            meta: None,
        }
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let chunks: Vec<Vec<u8>> = split(&payload, DEFAULT_CHUNK_SIZE)
            .map(|c| c.to_vec())
            .collect();
        assert_eq!(chunks.len(), 3);

        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f1", &payload, DEFAULT_CHUNK_SIZE)).unwrap();

        let p = reassembler.accept_chunk(&peer(), FileType::Image, "f1", 2, 3, chunks[2].clone());
        assert!(p.is_none());
        let p = reassembler.accept_chunk(&peer(), FileType::Image, "f1", 0, 3, chunks[0].clone());
        assert!(p.is_none());
        let p = reassembler
            .accept_chunk(&peer(), FileType::Image, "f1", 1, 3, chunks[1].clone())
            .unwrap();
        assert_eq!(p.percent(), 100);

        let done = reassembler.finish(&peer(), FileType::Image, "f1").unwrap();
        assert_eq!(done.bytes, payload);
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test]
    fn test_zero_length_file_completes() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("empty", &[], DEFAULT_CHUNK_SIZE)).unwrap();

        let done = reassembler.finish(&peer(), FileType::Image, "empty").unwrap();
        assert!(done.bytes.is_empty());
    }

    #[test]
    fn test_missing_chunk_fails_explicitly() {
        let payload = vec![1u8; 20];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f", &payload, 8)).unwrap();
        reassembler.accept_chunk(&peer(), FileType::Image, "f", 0, 3, vec![1; 8]);
        reassembler.accept_chunk(&peer(), FileType::Image, "f", 2, 3, vec![1; 4]);

        let err = reassembler.finish(&peer(), FileType::Image, "f").unwrap_err();
        assert!(matches!(err, TransferError::MissingChunk { index: 1, total: 3, .. }));
    }

    #[test]
    fn test_out_of_range_and_unknown_chunks_dropped() {
        let payload = vec![9u8; 10];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f", &payload, 5)).unwrap();

        assert!(reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 7, 2, vec![0; 5])
            .is_none());
        assert!(reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 0, 9, vec![0; 5])
            .is_none());
        assert!(reassembler
            .accept_chunk(&peer(), FileType::Image, "other", 0, 2, vec![0; 5])
            .is_none());

        // Still waiting on both real chunks.
        assert!(reassembler.finish(&peer(), FileType::Image, "f").is_err());
    }

    #[test]
    fn test_progress_reported_every_tenth_and_last() {
        let payload = vec![0u8; 25];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f", &payload, 1)).unwrap();

        let reports: Vec<u32> = (0..25)
            .filter_map(|i| reassembler.accept_chunk(&peer(), FileType::Image, "f", i, 25, vec![0]))
            .map(|p| p.received)
            .collect();
        assert_eq!(reports, vec![10, 20, 25]);
    }

    #[test]
    fn test_redelivered_chunk_not_double_counted() {
        let payload = vec![3u8; 4];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f", &payload, 2)).unwrap();

        reassembler.accept_chunk(&peer(), FileType::Image, "f", 0, 2, vec![3, 3]);
        assert!(reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 0, 2, vec![3, 3])
            .is_none());
        let last = reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 1, 2, vec![3, 3])
            .unwrap();
        assert_eq!(last.received, 2);
    }

    #[test]
    fn test_empty_file_id_keys_as_main() {
        let payload = vec![5u8; 3];
        let mut reassembler = Reassembler::new();
        let mut announced = info("", &payload, 4096);
        announced.file_type = FileType::Database;
        reassembler.begin(&peer(), announced).unwrap();
        reassembler.accept_chunk(&peer(), FileType::Database, "main", 0, 1, payload.clone());

        let done = reassembler.finish(&peer(), FileType::Database, "").unwrap();
        assert_eq!(done.bytes, payload);
    }

    #[test]
    fn test_inconsistent_announcements_rejected() {
        let mut reassembler = Reassembler::with_limit(1024);
        let mut announced = info("f", &[], 4096);

        announced.file_size = u64::MAX;
        announced.total_chunks = 0;
        assert!(matches!(
            reassembler.begin(&peer(), announced.clone()),
            Err(TransferError::InvalidAnnouncement { .. })
        ));

        announced.file_size = 10;
        announced.total_chunks = u32::MAX;
        assert!(reassembler.begin(&peer(), announced.clone()).is_err());

        announced.file_size = 0;
        announced.total_chunks = 2;
        assert!(reassembler.begin(&peer(), announced.clone()).is_err());

        announced.file_size = 2048;
        announced.total_chunks = 1;
        let err = reassembler.begin(&peer(), announced).unwrap_err();
        assert!(err.to_string().contains("exceeds the 1024 byte limit"));

        assert_eq!(reassembler.in_flight(), 0);
        assert!(matches!(
            reassembler.finish(&peer(), FileType::Image, "f"),
            Err(TransferError::UnknownTransfer { .. })
        ));
    }

    #[test]
    fn test_chunk_overrunning_announced_size_dropped() {
        let payload = vec![4u8; 6];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("f", &payload, 3)).unwrap();

        assert!(reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 0, 2, vec![4; 5000])
            .is_none());
        reassembler.accept_chunk(&peer(), FileType::Image, "f", 0, 2, vec![4; 3]);
        let last = reassembler
            .accept_chunk(&peer(), FileType::Image, "f", 1, 2, vec![4; 3])
            .unwrap();
        assert_eq!(last.received, 2);

        let done = reassembler.finish(&peer(), FileType::Image, "f").unwrap();
        assert_eq!(done.bytes, payload);
    }

    #[test]
    fn test_abandon_peer_drops_partial_state() {
        let other: DeviceCode = "222222".parse().unwrap();
        let payload = vec![0u8; 50];
        let mut reassembler = Reassembler::new();
        reassembler.begin(&peer(), info("a", &payload, 10)).unwrap();
        reassembler.begin(&other, info("b", &payload, 10)).unwrap();
        reassembler.accept_chunk(&peer(), FileType::Image, "a", 0, 5, vec![0; 10]);
        reassembler.accept_chunk(&peer(), FileType::Image, "a", 1, 5, vec![0; 10]);

        assert_eq!(reassembler.abandon_peer(&peer()), 1);
        assert_eq!(reassembler.in_flight(), 1);
        assert!(matches!(
            reassembler.finish(&peer(), FileType::Image, "a"),
            Err(TransferError::UnknownTransfer { .. })
        ));
    }
}
