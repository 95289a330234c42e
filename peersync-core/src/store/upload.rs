//! Ordered upload queue in front of the library.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Library, StoreError};
use crate::models::Image;

const QUEUE_DEPTH: usize = 32;

struct UploadRequest {
    bytes: Vec<u8>,
    description: String,
    reply: oneshot::Sender<Result<Image, StoreError>>,
}

/// Serialises image uploads through one worker task, in submission order.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<UploadRequest>,
}

impl UploadQueue {
    /// Starts the worker. It stops once every queue handle is dropped.
    pub fn spawn(library: Arc<Library>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UploadRequest>(QUEUE_DEPTH);

        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = library
                    .import_image(&request.bytes, &request.description)
                    .await;
                if let Err(e) = &result {
                    tracing::warn!("Upload failed: {}", e);
                }
                let _ = request.reply.send(result);
            }
            tracing::debug!("Upload queue closed");
        });

        (Self { tx }, handle)
    }

    /// Queues an upload and waits for it to be stored.
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        description: impl Into<String>,
    ) -> Result<Image, StoreError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(UploadRequest {
                bytes,
                description: description.into(),
                reply,
            })
            .await
            .map_err(|_| StoreError::QueueClosed)?;

        response.await.map_err(|_| StoreError::QueueClosed)?
    }
}
