use crc32fast::Hasher;

/// Kind of effect a log entry records. Discriminants start at one so zeroed
/// backing storage never parses as a valid entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    Store = 1,
    Memcpy = 2,
    Memmove = 3,
    Memset = 4,
    Strcpy = 5,
    Strcat = 6,
    Acquire = 7,
    Release = 8,
}

impl EntryKind {
    pub fn try_from_u32(v: u32) -> Option<Self> {
        match v {
            x if x == EntryKind::Store as u32 => Some(EntryKind::Store),
            x if x == EntryKind::Memcpy as u32 => Some(EntryKind::Memcpy),
            x if x == EntryKind::Memmove as u32 => Some(EntryKind::Memmove),
            x if x == EntryKind::Memset as u32 => Some(EntryKind::Memset),
            x if x == EntryKind::Strcpy as u32 => Some(EntryKind::Strcpy),
            x if x == EntryKind::Strcat as u32 => Some(EntryKind::Strcat),
            x if x == EntryKind::Acquire as u32 => Some(EntryKind::Acquire),
            x if x == EntryKind::Release as u32 => Some(EntryKind::Release),
            _ => None,
        }
    }
}

/// Fixed-size log record: one logged effect.
///
/// `size` is in bits for scalar stores and in bytes for bulk memory and
/// string operations. Entries are append-only, there is no in-place mutation.
/// The checksum lets recovery reject torn or stale slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct LogEntry {
    pub addr: u64,
    pub size: u64,
    pub kind: u32,
    pub crc: u32,
}

impl LogEntry {
    pub fn new(kind: EntryKind, addr: u64, size: u64) -> Self {
        let mut entry = Self {
            addr,
            size,
            kind: kind as u32,
            crc: 0,
        };
        entry.crc = entry.compute_crc();
        entry
    }

    fn compute_crc(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.addr.to_le_bytes());
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.kind.to_le_bytes());
        hasher.finalize()
    }

    pub fn checksum_ok(&self) -> bool {
        self.crc == self.compute_crc()
    }

    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::try_from_u32(self.kind)
    }
}
