//! Dedicated writer task for outbound packets.
//!
//! All senders — calls, notifications, and replies from concurrently
//! running handlers — funnel encoded packets through an mpsc channel into
//! one task that owns the write half. This keeps writes serialized
//! without a shared mutex and lets the task batch multiple packets into a
//! single vectored write.
//!
//! ```text
//! call()    ─┐
//! send()    ─┼─► mpsc::Sender<Bytes> ─► writer task ─► stream
//! replies   ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Default writer channel capacity.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum packets to batch into a single write.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for queueing encoded packets to the writer task.
///
/// Cheaply cloneable; shared by every sender on the connection.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue one encoded packet.
    ///
    /// Fails with `ConnectionClosed` once the writer task has exited.
    pub(crate) async fn send(&self, packet: Bytes) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Spawn the writer task and return a handle for queueing packets.
pub(crate) fn spawn_writer_task<W>(writer: W, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Main writer loop: receive packets, batch, write, flush.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        // Wait for the first packet; channel closure is a clean shutdown.
        let first = match rx.recv().await {
            Some(packet) => packet,
            None => return Ok(()),
        };

        // Collect whatever else is already queued, without blocking.
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of packets with a single vectored write where possible.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|b| IoSlice::new(b)).collect();
    let total_size: usize = batch.iter().map(|b| b.len()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: continue with the remaining tail.
    let mut total_written = written;
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the slice list for the bytes still unwritten after `skip_bytes`.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for packet in batch {
        let end = offset + packet.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&packet[start..]));
        }
        offset = end;
    }

    slices
}
