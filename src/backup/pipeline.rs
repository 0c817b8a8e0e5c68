//! Streaming dump → compress → upload pipeline.
//!
//! Stages run concurrently and talk over bounded channels of [`Chunk`]s, so a
//! slow upload suspends the dump instead of piling data up in memory. Every
//! chunk carries a [`Reservation`] on a shared [`BufferGauge`], which makes
//! the amount of buffered data observable.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::archive;
use super::upload::{UploadReport, Uploader};
use crate::config::{PipelineConfig, TransferPolicy};
use crate::errors::BackupError;

pub type ChunkResult = Result<Chunk, BackupError>;

/// Output of a dump strategy: the byte stream plus a future that resolves
/// once the producer has exited, reporting whether it succeeded.
pub struct DumpStream {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub finished: BoxFuture<'static, Result<(), BackupError>>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts bytes currently held by the pipeline and the high-water mark.
#[derive(Debug, Clone, Default)]
pub struct BufferGauge {
    inner: Arc<GaugeInner>,
}

impl BufferGauge {
    pub fn reserve(&self, bytes: usize) -> Reservation {
        let mut reservation = Reservation {
            gauge: self.clone(),
            bytes: 0,
        };
        reservation.grow(bytes);
        reservation
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

/// Bytes booked on a [`BufferGauge`]; released on drop.
#[derive(Debug)]
pub struct Reservation {
    gauge: BufferGauge,
    bytes: usize,
}

impl Reservation {
    pub fn grow(&mut self, bytes: usize) {
        self.bytes += bytes;
        let now = self.gauge.inner.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.gauge.inner.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Moves `other`'s bytes into this reservation without touching the gauge.
    pub fn merge(&mut self, mut other: Reservation) {
        self.bytes += other.bytes;
        other.bytes = 0;
    }

    /// Splits `bytes` off into a separate reservation.
    pub fn split(&mut self, bytes: usize) -> Reservation {
        let bytes = bytes.min(self.bytes);
        self.bytes -= bytes;
        Reservation {
            gauge: self.gauge.clone(),
            bytes,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.gauge.inner.current.fetch_sub(self.bytes, Ordering::SeqCst);
        }
    }
}

/// A piece of the stream in flight between two stages.
#[derive(Debug)]
pub struct Chunk {
    data: Bytes,
    reservation: Reservation,
}

impl Chunk {
    pub fn new(data: Bytes, gauge: &BufferGauge) -> Self {
        let reservation = gauge.reserve(data.len());
        Self { data, reservation }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn into_parts(self) -> (Bytes, Reservation) {
        (self.data, self.reservation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Bytes produced by the dump.
    pub dump_bytes: u64,
    /// Bytes written to the remote store (after compression).
    pub uploaded_bytes: u64,
    pub upload: UploadReport,
    pub peak_buffered: usize,
}

/// Wires a dump through optional gzip compression into an [`Uploader`].
#[derive(Debug, Clone)]
pub struct StreamPipeline {
    config: PipelineConfig,
    transfer: Arc<TransferPolicy>,
    compress: bool,
    gauge: BufferGauge,
}

impl StreamPipeline {
    pub fn new(config: PipelineConfig, transfer: Arc<TransferPolicy>, compress: bool) -> Self {
        Self {
            config,
            transfer,
            compress,
            gauge: BufferGauge::default(),
        }
    }

    pub fn gauge(&self) -> &BufferGauge {
        &self.gauge
    }

    /// Largest number of bytes the pipeline can hold at once, whatever the dump size.
    pub fn memory_bound(&self) -> usize {
        let buffer = self.config.buffer_size;
        let channels = if self.compress { 2 } else { 1 };
        // A channel holds `depth` chunks plus one blocked in the sender and one being consumed.
        let channel_bytes = channels * (self.config.depth + 2) * buffer;
        let encoder_bytes = if self.compress { buffer } else { 0 };
        let chunk = self.transfer.chunk_size;
        let upload_bytes = self.transfer.upload_cutoff.max(chunk) + buffer + (self.transfer.max_concurrent + 1) * chunk;
        channel_bytes + encoder_bytes + upload_bytes
    }

    pub async fn run(
        &self,
        dump: DumpStream,
        uploader: &Uploader,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, BackupError> {
        let started = Instant::now();
        let stage_cancel = cancel.child_token();
        let dump_bytes = Arc::new(AtomicU64::new(0));

        let (source_tx, source_rx) = mpsc::channel(self.config.depth);
        let source = tokio::spawn(read_dump(
            dump,
            source_tx,
            self.gauge.clone(),
            self.config.buffer_size,
            stage_cancel.clone(),
            dump_bytes.clone(),
        ));

        let (upload_rx, compressor) = if self.compress {
            let (tx, rx) = mpsc::channel(self.config.depth);
            let gauge = self.gauge.clone();
            let buffer_size = self.config.buffer_size;
            let handle = tokio::task::spawn_blocking(move || archive::gzip_stage(source_rx, tx, gauge, buffer_size));
            (rx, Some(handle))
        } else {
            (source_rx, None)
        };

        let uploaded = uploader.upload_stream(upload_rx, &self.gauge, cancel).await;
        if uploaded.is_err() {
            // Stops the dump process if it is still producing.
            stage_cancel.cancel();
        }

        if let Err(e) = source.await {
            tracing::error!(error = %e, "dump reader task failed");
        }
        if let Some(handle) = compressor {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "compression task failed");
            }
        }

        let upload = uploaded?;
        let report = PipelineReport {
            dump_bytes: dump_bytes.load(Ordering::SeqCst),
            uploaded_bytes: upload.bytes,
            upload,
            peak_buffered: self.gauge.peak(),
        };
        tracing::debug!(
            dump_bytes = report.dump_bytes,
            uploaded_bytes = report.uploaded_bytes,
            peak_buffered = report.peak_buffered,
            memory_bound = self.memory_bound(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(report)
    }
}

/// Source stage: reads the dump in `buffer_size` pieces and checks how the producer exited.
async fn read_dump(
    dump: DumpStream,
    tx: mpsc::Sender<ChunkResult>,
    gauge: BufferGauge,
    buffer_size: usize,
    cancel: CancellationToken,
    counter: Arc<AtomicU64>,
) {
    let DumpStream { mut reader, finished } = dump;
    let mut total: u64 = 0;
    loop {
        let mut buf = BytesMut::with_capacity(buffer_size);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tx.send(Err(BackupError::Cancelled("dump interrupted".to_string()))).await;
                return;
            }
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                counter.fetch_add(n as u64, Ordering::SeqCst);
                if tx.send(Ok(Chunk::new(buf.freeze(), &gauge))).await.is_err() {
                    // Downstream gave up; dropping `finished` kills the producer.
                    return;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(Err(BackupError::EngineInvocation(format!("failed to read dump output: {}", e))))
                    .await;
                return;
            }
        }
    }
    drop(reader);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled("dump interrupted".to_string())),
        outcome = finished => outcome,
    };
    let verdict = match outcome {
        Ok(()) if total == 0 => Err(BackupError::EngineInvocation("dump produced no output".to_string())),
        other => other,
    };
    if let Err(e) = verdict {
        let _ = tx.send(Err(e)).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::limiter::TransferLimiter;
    use crate::errors::TransferError;
    use crate::storage::{ListPage, MemoryStore, ObjectStore, StoreError, StoreResult, UploadedPart};
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use futures::FutureExt;
    use std::io::Read;
    use std::sync::atomic::AtomicU32;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;

    /// Endless-ish deterministic source that yields `remaining` bytes.
    /// Deterministic xorshift bytes; barely compressible, so gzip output
    /// stays close to the input size.
    pub(crate) struct SyntheticSource {
        remaining: u64,
        state: u32,
    }

    impl SyntheticSource {
        pub(crate) fn new(len: u64) -> Self {
            Self {
                remaining: len,
                state: 0x9E37_79B9,
            }
        }

        fn next_byte(&mut self) -> u8 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.state = x;
            (x >> 24) as u8
        }
    }

    impl AsyncRead for SyntheticSource {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let n = (buf.remaining() as u64).min(this.remaining) as usize;
            for _ in 0..n {
                let byte = this.next_byte();
                buf.put_slice(&[byte]);
            }
            this.remaining -= n as u64;
            Poll::Ready(Ok(()))
        }
    }

    pub(crate) fn synthetic_dump(len: u64) -> DumpStream {
        DumpStream {
            reader: Box::pin(SyntheticSource::new(len)),
            finished: async { Ok(()) }.boxed(),
        }
    }

    /// Store that accepts everything but keeps only byte counts, so huge
    /// streams do not accumulate in the test process.
    #[derive(Default)]
    pub(crate) struct CountingStore {
        pub(crate) bytes: AtomicU64,
        pub(crate) parts: AtomicU32,
        pub(crate) completed: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn put_object(&self, _key: &str, body: Bytes) -> StoreResult<()> {
            self.bytes.fetch_add(body.len() as u64, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn begin_upload(&self, _key: &str) -> StoreResult<String> {
            Ok("upload".to_string())
        }
        async fn upload_part(&self, _key: &str, _id: &str, part_number: i32, body: Bytes) -> StoreResult<UploadedPart> {
            // Slow consumer: forces the producer to wait on backpressure.
            tokio::time::sleep(Duration::from_micros(200)).await;
            self.bytes.fetch_add(body.len() as u64, Ordering::SeqCst);
            self.parts.fetch_add(1, Ordering::SeqCst);
            Ok(UploadedPart { part_number, etag: None })
        }
        async fn complete_upload(&self, _key: &str, _id: &str, _parts: Vec<UploadedPart>) -> StoreResult<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn abort_upload(&self, _key: &str, _id: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn list_page(&self, _prefix: &str, _token: Option<String>) -> StoreResult<ListPage> {
            Ok(ListPage::default())
        }
        async fn delete_object(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    fn small_policy() -> TransferPolicy {
        TransferPolicy {
            chunk_size: 4096,
            upload_cutoff: 4096,
            max_concurrent: 2,
            retry_sleep: Duration::from_millis(1),
            ..TransferPolicy::default()
        }
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            buffer_size: 1024,
            depth: 2,
        }
    }

    fn uploader(store: Arc<dyn ObjectStore>, policy: &TransferPolicy, key: &str) -> Uploader {
        Uploader::new(store, Arc::new(TransferLimiter::new(Arc::new(policy.clone()))), key.to_string())
    }

    #[tokio::test]
    async fn test_memory_stays_bounded_for_large_streams() -> anyhow::Result<()> {
        let policy = small_policy();
        for compress in [false, true] {
            let bound = StreamPipeline::new(small_config(), Arc::new(policy.clone()), compress).memory_bound();
            for multiple in [10u64, 100] {
                let len = bound as u64 * multiple;
                let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), compress);
                let store = Arc::new(CountingStore::default());
                let report = pipeline
                    .run(synthetic_dump(len), &uploader(store.clone(), &policy, "big"), &CancellationToken::new())
                    .await?;

                assert_eq!(report.dump_bytes, len);
                assert!(
                    report.peak_buffered <= bound,
                    "peak {} exceeds bound {} for {} bytes (compress={})",
                    report.peak_buffered,
                    bound,
                    len,
                    compress
                );
                assert_eq!(pipeline.gauge().current(), 0, "all buffers released");
                assert_eq!(store.bytes.load(Ordering::SeqCst), report.uploaded_bytes);
                if !compress {
                    assert_eq!(report.uploaded_bytes, len);
                }
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_chunked_upload_preserves_byte_order() -> anyhow::Result<()> {
        let policy = small_policy();
        let store = MemoryStore::new();
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), true);
        let len = 200_000u64;
        let report = pipeline
            .run(synthetic_dump(len), &uploader(Arc::new(store.clone()), &policy, "ordered.gz"), &CancellationToken::new())
            .await?;
        assert!(report.uploaded_bytes > policy.upload_cutoff as u64);
        assert!(report.upload.multipart);
        assert!(report.upload.parts > 1);

        let stored = store.get("ordered.gz").expect("object stored");
        let mut decoded = Vec::new();
        GzDecoder::new(&stored[..]).read_to_end(&mut decoded)?;

        let mut expected = Vec::new();
        let mut source = SyntheticSource::new(len);
        source.read_to_end(&mut expected).await?;
        assert_eq!(decoded, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_small_dump_uses_single_put() -> anyhow::Result<()> {
        let policy = small_policy();
        let store = MemoryStore::new();
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), false);
        let report = pipeline
            .run(synthetic_dump(1000), &uploader(Arc::new(store.clone()), &policy, "small"), &CancellationToken::new())
            .await?;
        assert!(!report.upload.multipart);
        assert_eq!(store.get("small").map(|b| b.len()), Some(1000));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_never_finalizes() -> anyhow::Result<()> {
        let policy = small_policy();
        let store = MemoryStore::new();
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), false);
        let dump = DumpStream {
            reader: Box::pin(SyntheticSource::new(50_000)),
            finished: async { Err(BackupError::EngineInvocation("exit status 1".into())) }.boxed(),
        };
        let err = pipeline
            .run(dump, &uploader(Arc::new(store.clone()), &policy, "broken"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::EngineInvocation(_)));
        assert!(store.get("broken").is_none());
        assert_eq!(store.staged_uploads(), 0, "staged upload aborted");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_dump_is_an_engine_error() {
        let policy = small_policy();
        let store = MemoryStore::new();
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), true);
        let err = pipeline
            .run(synthetic_dump(0), &uploader(Arc::new(store.clone()), &policy, "empty"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::EngineInvocation(_)));
        assert!(store.keys().is_empty());
    }

    /// Rejects every request with a transient error and counts the attempts.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub(crate) attempts: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn put_object(&self, _key: &str, _body: Bytes) -> StoreResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        async fn begin_upload(&self, _key: &str) -> StoreResult<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        async fn upload_part(&self, _key: &str, _id: &str, _n: i32, _body: Bytes) -> StoreResult<UploadedPart> {
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        async fn complete_upload(&self, _key: &str, _id: &str, _parts: Vec<UploadedPart>) -> StoreResult<()> {
            Err(StoreError::Transient("connection reset by peer".into()))
        }
        async fn abort_upload(&self, _key: &str, _id: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn list_page(&self, _prefix: &str, _token: Option<String>) -> StoreResult<ListPage> {
            Ok(ListPage::default())
        }
        async fn delete_object(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_retries_exactly_retry_count_times() {
        let policy = TransferPolicy {
            retries: 3,
            ..small_policy()
        };
        let store = Arc::new(FlakyStore::default());
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), false);
        let err = pipeline
            .run(synthetic_dump(100), &uploader(store.clone(), &policy, "flaky"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 4, "initial attempt + 3 retries");
        match err {
            BackupError::Transfer(TransferError::Transient { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_pipeline() {
        let policy = small_policy();
        let store = MemoryStore::new();
        let pipeline = StreamPipeline::new(small_config(), Arc::new(policy.clone()), true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        // Effectively unbounded; only cancellation can end it.
        let err = pipeline
            .run(synthetic_dump(u64::MAX), &uploader(Arc::new(store.clone()), &policy, "cancelled"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
        assert!(store.get("cancelled").is_none());
        assert_eq!(store.staged_uploads(), 0);
    }
}
