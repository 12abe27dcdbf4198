//! Dedicated writer task for request sending.
//!
//! Encoded requests reach the socket through an mpsc channel drained by a
//! single task, which batches whatever is queued into one vectored write.
//!
//! # Architecture
//!
//! ```text
//! Façade 1 ─┐
//! Façade 2 ─┼─► send lock ─► mpsc::Sender<OutboundRequest> ─► Writer Task ─► Socket
//! Façade N ─┘
//! ```
//!
//! The connection enqueues under its send lock, so channel order is
//! sequence order and the writer never reorders.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, XwireError};

/// Default maximum pending requests before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum requests to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A fully encoded request ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Full sequence number, for logging.
    pub sequence: u64,
    pub bytes: Bytes,
}

impl OutboundRequest {
    #[inline]
    pub fn new(sequence: u64, bytes: Bytes) -> Self {
        Self { sequence, bytes }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued requests before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the request queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing requests to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundRequest>,
    /// Requests queued but not yet written.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundRequest>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a request.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, request: OutboundRequest) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Count before sending so the writer never decrements below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(request).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            XwireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                tracing::warn!(
                    pending = self.pending.load(Ordering::Acquire),
                    "writer backpressure timed out"
                );
                return Err(XwireError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing requests.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, pending).await;
        if let Err(ref e) = result {
            tracing::error!(error = %e, "writer task failed");
        }
        result
    });

    (handle, task)
}

/// Receives requests and writes them, batching whatever is already queued.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundRequest>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(request) => request,
            None => {
                tracing::debug!("writer channel closed");
                writer.shutdown().await.ok();
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        tracing::trace!(
            count = batch.len(),
            first = batch[0].sequence,
            "writing requests"
        );

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of requests with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundRequest]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch
        .iter()
        .filter(|request| !request.bytes.is_empty())
        .map(|request| IoSlice::new(&request.bytes))
        .collect();
    let total_size: usize = batch.iter().map(OutboundRequest::size).sum();

    // Fast path: the kernel took everything in one call.
    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(XwireError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(XwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for what is left of `batch` after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundRequest], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for request in batch {
        let end = start + request.bytes.len();
        if skip_bytes < end {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&request.bytes[offset..]));
        }
        start = end;
    }

    slices
}
