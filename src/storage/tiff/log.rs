//! Single-writer append-only log.
//!
//! All byte-level writes to one container file funnel through one
//! background thread, so directory entries are never interleaved with
//! pixel data by concurrent writers. Producers compute offsets
//! synchronously (`append` reserves the range) while the actual I/O is
//! deferred to the thread; `patch` rewrites a previously reserved range.
//! The queue is bounded, so a slow disk pushes back on the producer
//! instead of buffering unboundedly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, warn};

use crate::error::TiffError;

/// In-flight write operations allowed before producers block.
const WRITE_QUEUE_CAP: usize = 32;

enum WriteOp {
    /// Write bytes at an absolute offset
    WriteAt { offset: u64, data: Bytes },

    /// Set the file length (finalize truncation)
    Truncate { len: u64 },

    /// Run a callback after all preceding writes have been issued
    Run(Box<dyn FnOnce() + Send>),

    /// Flush and acknowledge once everything before this op is durable
    Sync { ack: Sender<()> },
}

/// Append-only write log over one file, served by one writer thread.
pub struct WriteLog {
    tx: Option<Sender<WriteOp>>,
    handle: Option<JoinHandle<()>>,

    /// Next append offset; owned by the producing side
    position: u64,
}

impl WriteLog {
    /// Create the file (truncating any previous content) and start the
    /// writer thread.
    pub fn create(path: &Path) -> Result<Self, TiffError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let (tx, rx) = bounded(WRITE_QUEUE_CAP);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string());
        let handle = thread::Builder::new()
            .name(format!("writer: {name}"))
            .spawn(move || writer_loop(file, rx))
            .map_err(TiffError::Io)?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            position: 0,
        })
    }

    /// Current end-of-log offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reserve space at the end of the log and enqueue the write.
    /// Returns the offset the data will land at.
    pub fn append(&mut self, data: Bytes) -> Result<u64, TiffError> {
        let offset = self.position;
        self.position += data.len() as u64;
        self.send(WriteOp::WriteAt { offset, data })?;
        Ok(offset)
    }

    /// Append a single zero byte so the next append starts on a word
    /// boundary, as the directory layout requires.
    pub fn pad_to_word(&mut self) -> Result<(), TiffError> {
        if self.position % 2 == 1 {
            self.append(Bytes::from_static(&[0u8]))?;
        }
        Ok(())
    }

    /// Rewrite bytes inside an already reserved range.
    pub fn patch(&self, offset: u64, data: Bytes) -> Result<(), TiffError> {
        self.send(WriteOp::WriteAt { offset, data })
    }

    /// Run a callback on the writer thread after all preceding writes.
    pub fn after_pending(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), TiffError> {
        self.send(WriteOp::Run(Box::new(callback)))
    }

    /// Shrink the file to the given length.
    pub fn truncate(&self, len: u64) -> Result<(), TiffError> {
        self.send(WriteOp::Truncate { len })
    }

    /// Block until every previously enqueued operation has hit the file.
    pub fn drain(&self) -> Result<(), TiffError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.send(WriteOp::Sync { ack: ack_tx })?;
        ack_rx.recv().map_err(|_| TiffError::WriterGone)
    }

    fn send(&self, op: WriteOp) -> Result<(), TiffError> {
        match &self.tx {
            Some(tx) => tx.send(op).map_err(|_| TiffError::WriterGone),
            None => Err(TiffError::WriterGone),
        }
    }

    /// Stop the writer thread, flushing everything first.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("container writer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WriteLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(mut file: File, rx: Receiver<WriteOp>) {
    // A failed write is logged and the loop continues; a disk fault must
    // not take down the acquisition (already-durable data stays valid)
    for op in rx {
        match op {
            WriteOp::WriteAt { offset, data } => {
                if let Err(e) = write_at(&mut file, offset, &data) {
                    error!("container write of {} bytes at {offset} failed: {e}", data.len());
                }
            }
            WriteOp::Truncate { len } => {
                if let Err(e) = file.set_len(len) {
                    error!("container truncate to {len} failed: {e}");
                }
            }
            WriteOp::Run(callback) => callback(),
            WriteOp::Sync { ack } => {
                if let Err(e) = file.sync_all() {
                    error!("container sync failed: {e}");
                }
                let _ = ack.send(());
            }
        }
    }
    if let Err(e) = file.sync_all() {
        error!("container sync on shutdown failed: {e}");
    }
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// Read an exact range from a file handle.
///
/// Shared by the reader half; kept here so all byte-level file access for
/// a container lives in one module.
pub fn read_exact_at(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// =============================================================================
// Tests
// =============================================================================
