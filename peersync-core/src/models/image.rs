use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A row of the `images` table.
///
/// The blob itself lives in the blob store under `blob_key`, which is the
/// sha256 hex digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Image {
    pub id: i64,
    pub device_id: String,
    pub created_at: i64,
    pub hash: String,
    pub blob_key: String,
    pub description: String,
}

impl Image {
    pub fn new(
        device_id: impl Into<String>,
        created_at: i64,
        hash: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let hash = hash.into();
        Self {
            id: 0,
            device_id: device_id.into(),
            created_at,
            blob_key: hash.clone(),
            hash,
            description: description.into(),
        }
    }

    /// Identity used to detect the same image across stores.
    pub fn dedup_key(&self) -> (&str, i64) {
        (self.hash.as_str(), self.created_at)
    }
}

/// Content hash used as a blob key.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
