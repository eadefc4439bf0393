//! Dedicated writer task for outgoing telegrams.
//!
//! Callers never touch the socket write half. They hand complete TPKT
//! telegrams to a [`WriterHandle`]; one task per session drains the queue
//! and batches whatever is ready into a single vectored write.
//!
//! ```text
//! Request 1 ─┐
//! Request 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► TCP write half
//! Request N ─┘
//! ```
//!
//! The number of queued telegrams is already bounded by the admission gate,
//! so the queue only needs to absorb bursts.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, S7Error};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum telegrams to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the telegram queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for queueing telegrams on the writer task.
///
/// Cheap to clone; the task stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue a telegram.
    ///
    /// Fails with `SendFailure` once the writer task has stopped.
    pub async fn send(&self, telegram: Bytes) -> Result<()> {
        self.tx
            .send(telegram)
            .await
            .map_err(|_| S7Error::SendFailure)
    }

    /// Check whether the writer task is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing telegrams.
///
/// The task ends with `Ok(())` when all handles are dropped and with the
/// I/O error when a write fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle::new(tx), task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(telegram) => batch.push(telegram),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!(error = %e, "Writer task failed");
            return Err(e);
        }
    }
}

/// Write a batch of telegrams using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(S7Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` bytes.
fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for telegram in batch {
        let end = offset + telegram.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&telegram[start..]));
        }
        offset = end;
    }

    slices
}
