use std::{
    fs::{self, OpenOptions},
    io, mem,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use memmap::MmapMut;
use thiserror::Error;

use crate::entry::LogEntry;

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("failed to map log buffer storage: {0}")]
    Io(#[from] io::Error),
}

pub type SpaceResult<T> = Result<T, SpaceError>;

fn cblog_file_name(seq: u64) -> String {
    format!("{}.cblog", seq)
}

/// Backing storage for one circular buffer. Holding it keeps the mapping
/// alive for as long as the owning buffer-list node exists.
#[derive(Debug)]
pub struct BufferBacking {
    mmap: MmapMut,
    slots: u32,
}

impl BufferBacking {
    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn slot_ptr(&self) -> *mut LogEntry {
        self.mmap.as_ptr() as *mut LogEntry
    }

    pub fn start_addr(&self) -> u64 {
        self.mmap.as_ptr() as u64
    }

    pub fn end_addr(&self) -> u64 {
        self.start_addr() + self.byte_len() as u64
    }

    pub fn byte_len(&self) -> usize {
        self.slots as usize * mem::size_of::<LogEntry>()
    }
}

/// Allocates buffer backing storage: `{seq}.cblog` files inside a data dir,
/// or anonymous mappings for tests and volatile runs. The sequence counter is
/// atomic so concurrent allocations never take a lock.
#[derive(Debug)]
pub struct LogSpace {
    base_dir: Option<PathBuf>,
    next_seq: AtomicU64,
}

impl LogSpace {
    pub fn anonymous() -> Self {
        Self {
            base_dir: None,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn in_dir(base_dir: PathBuf) -> SpaceResult<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: Some(base_dir),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn alloc(&self, slots: u32) -> SpaceResult<BufferBacking> {
        let byte_len = slots as usize * mem::size_of::<LogEntry>();
        let mmap = match &self.base_dir {
            None => MmapMut::map_anon(byte_len)?,
            Some(dir) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(cblog_file_name(seq));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?;
                file.set_len(byte_len as u64)?;
                log::debug!("mapped log buffer file {:?}", path);
                // SAFETY: the file was just created and sized by us and is
                // only ever accessed through this mapping
                unsafe { MmapMut::map_mut(&file)? }
            }
        };
        Ok(BufferBacking { mmap, slots })
    }
}
