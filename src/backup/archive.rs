// db-stream-backup/src/backup/archive.rs
use bytes::BytesMut;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};
use tokio::sync::mpsc;

use super::pipeline::{BufferGauge, Chunk, ChunkResult};
use crate::errors::BackupError;

/// `io::Write` adapter that cuts its input into [`Chunk`]s of at most
/// `buffer_size` bytes and pushes them into the next stage.
///
/// Blocks when the next stage is full, so it must only be used from a
/// blocking thread.
pub struct ChunkWriter {
    tx: Option<mpsc::Sender<ChunkResult>>,
    gauge: BufferGauge,
    pending: BytesMut,
    buffer_size: usize,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<ChunkResult>, gauge: BufferGauge, buffer_size: usize) -> Self {
        Self {
            tx: Some(tx),
            gauge,
            pending: BytesMut::with_capacity(buffer_size),
            buffer_size,
        }
    }

    /// Drops buffered output and refuses further writes.
    pub fn close(&mut self) {
        self.tx = None;
        self.pending.clear();
    }

    fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "chunk writer closed"))?;
        let chunk = Chunk::new(self.pending.split().freeze(), &self.gauge);
        tx.blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "next pipeline stage closed"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "chunk writer closed"));
        }
        let room = self.buffer_size - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() >= self.buffer_size {
            self.send_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending()
    }
}

/// Compression stage: gzips every chunk from `rx` into `tx`.
///
/// Upstream errors are forwarded as-is and end the stage without finishing
/// the gzip trailer.
pub fn gzip_stage(
    mut rx: mpsc::Receiver<ChunkResult>,
    tx: mpsc::Sender<ChunkResult>,
    gauge: BufferGauge,
    buffer_size: usize,
) {
    let errors = tx.clone();
    let mut encoder = GzEncoder::new(ChunkWriter::new(tx, gauge, buffer_size), Compression::default());

    while let Some(item) = rx.blocking_recv() {
        let written = match item {
            Ok(chunk) => encoder.write_all(chunk.data()),
            Err(e) => {
                encoder.get_mut().close();
                let _ = errors.blocking_send(Err(e));
                return;
            }
        };
        if let Err(e) = written {
            encoder.get_mut().close();
            if e.kind() != io::ErrorKind::BrokenPipe {
                let _ = errors.blocking_send(Err(BackupError::EngineInvocation(format!(
                    "compression failed: {}",
                    e
                ))));
            }
            return;
        }
    }

    let finished = encoder.finish().and_then(|mut writer| writer.flush());
    if let Err(e) = finished {
        if e.kind() != io::ErrorKind::BrokenPipe {
            let _ = errors.blocking_send(Err(BackupError::EngineInvocation(format!(
                "compression failed: {}",
                e
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn test_gzip_stage_compresses_in_bounded_chunks() -> anyhow::Result<()> {
        let gauge = BufferGauge::default();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let stage_gauge = gauge.clone();
        let stage = tokio::task::spawn_blocking(move || gzip_stage(in_rx, out_tx, stage_gauge, 256));

        let input: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let feeder_gauge = gauge.clone();
        let feed = input.clone();
        let feeder = tokio::spawn(async move {
            for piece in feed.chunks(1000) {
                let chunk = Chunk::new(Bytes::copy_from_slice(piece), &feeder_gauge);
                if in_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });

        let mut compressed = Vec::new();
        while let Some(item) = out_rx.recv().await {
            let chunk = item?;
            assert!(chunk.len() <= 256);
            compressed.extend_from_slice(chunk.data());
        }
        feeder.await?;
        stage.await?;

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded)?;
        assert_eq!(decoded, input);
        assert_eq!(gauge.current(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_gzip_stage_forwards_upstream_errors() -> anyhow::Result<()> {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let stage = tokio::task::spawn_blocking(move || gzip_stage(in_rx, out_tx, BufferGauge::default(), 256));

        in_tx
            .send(Err(BackupError::EngineInvocation("mysqldump exited with 2".into())))
            .await?;
        drop(in_tx);

        let mut saw_error = false;
        while let Some(item) = out_rx.recv().await {
            if let Err(BackupError::EngineInvocation(msg)) = item {
                assert!(msg.contains("mysqldump"));
                saw_error = true;
            }
        }
        stage.await?;
        assert!(saw_error);
        Ok(())
    }
}
