//! Append-only journal streams.
//!
//! Both the order stream and the algo stream use the same binary framing:
//!
//! ```text
//! [seq:u32][body_len:u32][user_id:u16][order_id:u32][payload...]\0\n
//! ```
//!
//! All integers little-endian. On startup the file is memory-mapped and
//! scanned forward to restore the sequence and order-id high-water marks; a
//! non-whole trailing record is fatal (truncation must be a manual
//! operation). Appends go through a dedicated writer thread per stream.

use crossbeam::channel::{bounded, unbounded, Sender};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::error;

/// Fixed header size: seq + body_len + user_id + order_id.
const HEADER_SIZE: usize = 4 + 4 + 2 + 4;
/// Trailing `\0\n` after the payload.
const TRAILER_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error at {path}: {message}")]
    Io { path: PathBuf, message: String },
    /// The file ends in a partial record. Manual remediation required.
    #[error("corrupted journal file {path}, please fix it first")]
    Corrupt { path: PathBuf },
}

/// One journaled record.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub seq: u32,
    pub user_id: u16,
    pub order_id: u32,
    pub payload: Vec<u8>,
}

/// High-water marks recovered by the startup scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalScan {
    pub last_seq: u32,
    pub max_order_id: u32,
    pub records: usize,
}

enum WriterMsg {
    Record(Vec<u8>),
    Flush(Sender<()>),
}

/// An append-only journal stream with a dedicated writer thread.
pub struct Journal {
    path: PathBuf,
    seq: AtomicU32,
    tx: Option<Sender<WriterMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl Journal {
    /// Open (creating if absent) and scan the stream. The scan is strict:
    /// trailing garbage is a [`JournalError::Corrupt`].
    pub fn open(path: &Path) -> Result<(Self, JournalScan), JournalError> {
        let io_err = |e: std::io::Error| JournalError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(io_err)?;

        let mut scan = JournalScan::default();
        let len = file.metadata().map_err(io_err)?.len() as usize;
        if len > 0 {
            // SAFETY: the file is owned by this process; the writer thread is
            // not running yet and nothing truncates journals at runtime.
            let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };
            let consumed = scan_records(&mmap, |rec| {
                // Concurrent producers may hand records to the writer
                // slightly out of seq order; track the high-water mark.
                if rec.seq > scan.last_seq {
                    scan.last_seq = rec.seq;
                }
                if rec.order_id > scan.max_order_id {
                    scan.max_order_id = rec.order_id;
                }
                scan.records += 1;
                true
            });
            if consumed != len {
                return Err(JournalError::Corrupt {
                    path: path.to_path_buf(),
                });
            }
        }

        let (tx, rx) = unbounded::<WriterMsg>();
        let thread_path = path.to_path_buf();
        let mut writer: File = file;
        let handle = std::thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        WriterMsg::Record(bytes) => {
                            if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                                error!(
                                    "journal write failed on {}: {e}",
                                    thread_path.display()
                                );
                                std::process::exit(2);
                            }
                        }
                        WriterMsg::Flush(done) => {
                            let _ = writer.flush();
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(io_err)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                seq: AtomicU32::new(scan.last_seq),
                tx: Some(tx),
                handle: Some(handle),
            },
            scan,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last assigned sequence number.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Bump the sequence high-water (algo streams skip a region on startup).
    pub fn advance_seq(&self, by: u32) {
        self.seq.fetch_add(by, Ordering::Relaxed);
    }

    /// Assign the next sequence number and queue the record. Returns the
    /// assigned seq.
    pub fn append(&self, user_id: u16, order_id: u32, payload: &[u8]) -> u32 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&user_id.to_le_bytes());
        buf.extend_from_slice(&order_id.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(b"\0\n");
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriterMsg::Record(buf));
        }
        seq
    }

    /// Block until every queued record reached the file.
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = bounded(1);
            if tx.send(WriterMsg::Flush(done_tx)).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }

    /// Replay records with `seq >= seq0` whose user matches (admins see all).
    /// Replay never mutates live state; a partial trailing record (a write
    /// racing the read) is ignored here, unlike the strict startup scan.
    pub fn replay(
        &self,
        seq0: u32,
        user_id: u16,
        is_admin: bool,
        mut f: impl FnMut(&JournalRecord),
    ) -> Result<(), JournalError> {
        self.flush();
        let io_err = |e: std::io::Error| JournalError::Io {
            path: self.path.clone(),
            message: e.to_string(),
        };
        let file = File::open(&self.path).map_err(io_err)?;
        if file.metadata().map_err(io_err)?.len() == 0 {
            return Ok(());
        }
        // SAFETY: read-only map; the writer only ever appends.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };
        scan_records(&mmap, |rec| {
            if rec.seq >= seq0 && (is_admin || rec.user_id == user_id) {
                f(&rec);
            }
            true
        });
        Ok(())
    }

    /// Stop the writer after draining the queue.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Walk whole records, invoking `f` for each; returns the number of bytes
/// consumed (callers decide whether a short tail is corruption).
fn scan_records(data: &[u8], mut f: impl FnMut(JournalRecord) -> bool) -> usize {
    let mut pos = 0usize;
    while pos + HEADER_SIZE <= data.len() {
        let seq = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let body_len = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]) as usize;
        let user_id = u16::from_le_bytes([data[pos + 8], data[pos + 9]]);
        let order_id = u32::from_le_bytes([
            data[pos + 10],
            data[pos + 11],
            data[pos + 12],
            data[pos + 13],
        ]);
        let end = pos + HEADER_SIZE + body_len + TRAILER_SIZE;
        if end > data.len() {
            break;
        }
        let payload = data[pos + HEADER_SIZE..pos + HEADER_SIZE + body_len].to_vec();
        if !f(JournalRecord {
            seq,
            user_id,
            order_id,
            payload,
        }) {
            return end;
        }
        pos = end;
    }
    pos
}
