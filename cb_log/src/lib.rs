pub mod buffer;
pub mod entry;
pub mod list;
pub mod space;

pub use buffer::CbLog;
pub use entry::{EntryKind, LogEntry};
pub use list::{BufferList, CbListNode};
pub use space::{LogSpace, SpaceError, SpaceResult};

pub const DEFAULT_SLOTS_PER_BUFFER: u32 = 4096;
