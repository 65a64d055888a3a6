//! Journal stage: persist records before they reach the service handler.
//!
//! The stage reads the replica ring when replication is enabled, otherwise
//! the ingress ring, hands every record to the [`JournalWriter`] and only
//! then forwards it downstream — so a journaled record is always durable
//! (to the strategy's guarantees) before the handler can observe it. The
//! writer sits on a [`Journalling`] strategy: rotating pre-sized files
//! written either via seek-then-write or positioned writes. Deeper on-disk
//! layout and fsync policy live outside this crate.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::config::{JournalConfig, JournalStrategyKind};
use crate::idle::IdleStrategy;
use crate::ring::{RingConsumer, RingProducer};
use crate::worker::PollStep;

const JOURNAL_READ_BATCH: usize = 10;

/// Bytes of framing the writer puts in front of every journaled payload.
pub const JOURNAL_FRAME_LENGTH: usize = 8;

/// Pluggable journal file strategy.
pub trait Journalling: Send {
    /// Prepare resources. Called once before the first write.
    fn open(&mut self) -> io::Result<()>;

    /// Append one block. Returns the bytes written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Push buffered bytes towards the device.
    fn flush(&mut self) -> io::Result<()>;
}

/// Shared rotation bookkeeping for the file-backed strategies.
struct JournalFiles {
    dir: PathBuf,
    journal_size: u64,
    journal_count: usize,
    index: usize,
    position: u64,
    current: Option<File>,
}

impl JournalFiles {
    fn new(dir: PathBuf, journal_size: u64, page_size: usize, journal_count: usize) -> Self {
        // Journals are sized in whole pages.
        let page = page_size as u64;
        let journal_size = journal_size.div_ceil(page) * page;
        Self {
            dir,
            journal_size,
            journal_count,
            index: 0,
            position: 0,
            current: None,
        }
    }

    fn open(&mut self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.index = 0;
        self.roll(0)
    }

    fn roll(&mut self, index: usize) -> io::Result<()> {
        let path = self.dir.join(format!("journal-{index}.log"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(self.journal_size)?;
        self.current = Some(file);
        self.index = index;
        self.position = 0;
        Ok(())
    }

    /// Make sure the current journal can take `length` more bytes, rolling
    /// to the next file in the cycle when it cannot.
    fn ensure(&mut self, length: u64) -> io::Result<()> {
        if length > self.journal_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block of {length} bytes exceeds journal size {}",
                    self.journal_size
                ),
            ));
        }
        if self.current.is_none() {
            self.open()?;
        } else if self.position + length > self.journal_size {
            self.roll((self.index + 1) % self.journal_count)?;
        }
        Ok(())
    }

    fn file(&mut self) -> &mut File {
        self.current.as_mut().expect("ensure() opens the journal")
    }
}

/// Seek-then-write on a single handle.
pub struct SeekJournalling {
    files: JournalFiles,
}

impl SeekJournalling {
    pub fn new(dir: PathBuf, journal_size: u64, page_size: usize, journal_count: usize) -> Self {
        Self {
            files: JournalFiles::new(dir, journal_size, page_size, journal_count),
        }
    }
}

impl Journalling for SeekJournalling {
    fn open(&mut self) -> io::Result<()> {
        self.files.open()
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files.ensure(buf.len() as u64)?;
        let position = self.files.position;
        let file = self.files.file();
        file.seek(SeekFrom::Start(position))?;
        file.write_all(buf)?;
        self.files.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.files.file().flush()
    }
}

/// Positioned writes at an explicit offset; the handle's own cursor is
/// never moved.
pub struct PositionalJournalling {
    files: JournalFiles,
}

impl PositionalJournalling {
    pub fn new(dir: PathBuf, journal_size: u64, page_size: usize, journal_count: usize) -> Self {
        Self {
            files: JournalFiles::new(dir, journal_size, page_size, journal_count),
        }
    }
}

impl Journalling for PositionalJournalling {
    fn open(&mut self) -> io::Result<()> {
        self.files.open()
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files.ensure(buf.len() as u64)?;
        let position = self.files.position;
        let file = self.files.file();
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.write_all_at(buf, position)?;
        }
        #[cfg(not(unix))]
        {
            file.seek(SeekFrom::Start(position))?;
            file.write_all(buf)?;
        }
        self.files.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.files.file().flush()
    }
}

/// Build the configured strategy.
pub fn create_journalling(config: &JournalConfig) -> Box<dyn Journalling> {
    match config.strategy {
        JournalStrategyKind::Seek => Box::new(SeekJournalling::new(
            config.dir.clone(),
            config.journal_size,
            config.page_size,
            config.journal_count,
        )),
        JournalStrategyKind::Positional => Box::new(PositionalJournalling::new(
            config.dir.clone(),
            config.journal_size,
            config.page_size,
            config.journal_count,
        )),
    }
}

/// Frames records and drives a [`Journalling`] strategy, with optional
/// per-batch flushing.
pub struct JournalWriter {
    journalling: Box<dyn Journalling>,
    flushing_enabled: bool,
    scratch: Vec<u8>,
}

impl JournalWriter {
    /// Opens the strategy eagerly so construction-time I/O failures surface
    /// at assembly, not mid-stream.
    pub fn new(mut journalling: Box<dyn Journalling>, flushing_enabled: bool) -> io::Result<Self> {
        journalling.open()?;
        Ok(Self {
            journalling,
            flushing_enabled,
            scratch: Vec::with_capacity(1024),
        })
    }

    /// Journal one record: an 8-byte frame (payload length u32, type id
    /// i32, little-endian) followed by the payload.
    pub fn write_record(&mut self, msg_type_id: i32, payload: &[u8]) -> io::Result<()> {
        self.scratch.clear();
        self.scratch
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.scratch.extend_from_slice(&msg_type_id.to_le_bytes());
        self.scratch.extend_from_slice(payload);
        self.journalling.write(&self.scratch)?;
        Ok(())
    }

    /// Flush once per read batch when flushing is enabled.
    pub fn flush_batch(&mut self) -> io::Result<()> {
        if self.flushing_enabled {
            self.journalling.flush()?;
        }
        Ok(())
    }
}

/// The journal stage worker step.
///
/// An I/O fault is a close request on this stage alone: the error is
/// logged, the running flag clears, and the rest of the pipeline keeps its
/// workers.
pub struct JournalStage {
    consumer: RingConsumer,
    writer: JournalWriter,
    forward: RingProducer,
    idle: IdleStrategy,
    running: Arc<AtomicBool>,
}

impl JournalStage {
    pub fn new(
        consumer: RingConsumer,
        writer: JournalWriter,
        forward: RingProducer,
        idle: IdleStrategy,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            writer,
            forward,
            idle,
            running,
        }
    }
}

impl PollStep for JournalStage {
    fn poll(&mut self) -> usize {
        let writer = &mut self.writer;
        let forward = &mut self.forward;
        let idle = &mut self.idle;
        let running = &self.running;
        let mut faulted = false;

        let bytes = self.consumer.read(
            &mut |msg_type_id, payload| {
                if faulted {
                    return;
                }
                if let Err(e) = writer.write_record(msg_type_id, payload) {
                    error!(error = %e, "journal write failed; journal stage shutting down");
                    faulted = true;
                    return;
                }
                while !forward.write(msg_type_id, payload) {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    idle.idle(0);
                }
            },
            JOURNAL_READ_BATCH,
        );

        if faulted {
            running.store(false, Ordering::SeqCst);
        } else if bytes > 0 {
            if let Err(e) = self.writer.flush_batch() {
                error!(error = %e, "journal flush failed; journal stage shutting down");
                running.store(false, Ordering::SeqCst);
            }
        }

        bytes
    }

    fn on_close(&mut self) {
        if let Err(e) = self.writer.flush_batch() {
            error!(error = %e, "journal flush on close failed");
        }
    }
}
