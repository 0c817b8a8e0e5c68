// db-stream-backup/src/backup/upload.rs
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::limiter::TransferLimiter;
use super::pipeline::{BufferGauge, Chunk, ChunkResult, Reservation};
use super::retry::with_retry;
use crate::errors::{BackupError, TransferError};
use crate::storage::{ObjectStore, UploadedPart};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: u64,
    pub multipart: bool,
    pub parts: usize,
}

/// Upload stage of the pipeline: streams chunks into one remote object.
///
/// Streams up to `upload_cutoff` bytes go up in a single request; anything
/// larger becomes a staged multipart upload in `chunk_size` parts, with at
/// most `max_concurrent` parts in flight. The object only becomes visible
/// once the whole stream arrived without error.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    limiter: Arc<TransferLimiter>,
    key: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, limiter: Arc<TransferLimiter>, key: String) -> Self {
        Self { store, limiter, key }
    }

    pub async fn upload_stream(
        &self,
        mut rx: mpsc::Receiver<ChunkResult>,
        gauge: &BufferGauge,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, BackupError> {
        let cutoff = self.limiter.policy().upload_cutoff;
        let mut buffer = BytesMut::new();
        let mut reserved = gauge.reserve(0);

        loop {
            match next_chunk(&mut rx, cancel).await? {
                Some(chunk) => {
                    let (data, reservation) = chunk.into_parts();
                    buffer.extend_from_slice(&data);
                    reserved.merge(reservation);
                    if buffer.len() > cutoff {
                        break;
                    }
                }
                None => {
                    let body = buffer.freeze();
                    let bytes = body.len() as u64;
                    self.limiter.charge(bytes)?;
                    tracing::debug!(key = %self.key, bytes, "uploading in a single request");
                    with_retry(&self.limiter, cancel, "put object", || {
                        self.store.put_object(&self.key, body.clone())
                    })
                    .await?;
                    return Ok(UploadReport {
                        bytes,
                        multipart: false,
                        parts: 1,
                    });
                }
            }
        }

        let upload_id = with_retry(&self.limiter, cancel, "begin multipart upload", || {
            self.store.begin_upload(&self.key)
        })
        .await?;
        tracing::debug!(key = %self.key, upload_id = %upload_id, "multipart upload started");

        match self.upload_parts(&upload_id, buffer, reserved, rx, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                // Best effort: the object was never completed, so nothing is visible either way.
                if let Err(abort_err) = self.store.abort_upload(&self.key, &upload_id).await {
                    tracing::warn!(
                        key = %self.key,
                        upload_id = %upload_id,
                        error = %abort_err,
                        "failed to abort multipart upload, staged parts remain until the bucket lifecycle removes them"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        upload_id: &str,
        mut buffer: BytesMut,
        mut reserved: Reservation,
        mut rx: mpsc::Receiver<ChunkResult>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, BackupError> {
        let chunk_size = self.limiter.policy().chunk_size;
        let mut tasks: JoinSet<Result<UploadedPart, BackupError>> = JoinSet::new();
        let mut parts = Vec::new();
        let mut part_number: i32 = 0;
        let mut total: u64 = 0;
        let mut eof = false;

        loop {
            while let Some(done) = tasks.try_join_next() {
                parts.push(joined(done)?);
            }

            while buffer.len() >= chunk_size || (eof && !buffer.is_empty()) {
                let len = chunk_size.min(buffer.len());
                let body = buffer.split_to(len).freeze();
                let held = reserved.split(len);
                self.limiter.charge(len as u64)?;
                total += len as u64;
                part_number += 1;

                let permit = loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(BackupError::Cancelled("upload interrupted".to_string()));
                        }
                        Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                            parts.push(joined(done)?);
                        }
                        permit = self.limiter.transfer_slot() => break permit?,
                    }
                };

                let store = self.store.clone();
                let limiter = self.limiter.clone();
                let key = self.key.clone();
                let upload_id = upload_id.to_string();
                let cancel = cancel.clone();
                let number = part_number;
                tasks.spawn(async move {
                    let _permit = permit;
                    let _held = held;
                    let what = format!("upload part {}", number);
                    with_retry(&limiter, &cancel, &what, || {
                        store.upload_part(&key, &upload_id, number, body.clone())
                    })
                    .await
                });
            }

            if eof {
                break;
            }
            match next_chunk(&mut rx, cancel).await? {
                Some(chunk) => {
                    let (data, reservation) = chunk.into_parts();
                    buffer.extend_from_slice(&data);
                    reserved.merge(reservation);
                }
                None => eof = true,
            }
        }

        while let Some(done) = tasks.join_next().await {
            parts.push(joined(done)?);
        }
        parts.sort_by_key(|p| p.part_number);

        let count = parts.len();
        with_retry(&self.limiter, cancel, "complete multipart upload", || {
            self.store.complete_upload(&self.key, upload_id, parts.clone())
        })
        .await?;
        tracing::debug!(key = %self.key, parts = count, bytes = total, "multipart upload completed");

        Ok(UploadReport {
            bytes: total,
            multipart: true,
            parts: count,
        })
    }
}

async fn next_chunk(
    rx: &mut mpsc::Receiver<ChunkResult>,
    cancel: &CancellationToken,
) -> Result<Option<Chunk>, BackupError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled("upload interrupted".to_string())),
        item = rx.recv() => item.transpose(),
    }
}

fn joined(
    done: Result<Result<UploadedPart, BackupError>, JoinError>,
) -> Result<UploadedPart, BackupError> {
    done.map_err(|e| BackupError::Transfer(TransferError::Permanent(format!("part upload task failed: {}", e))))?
}
