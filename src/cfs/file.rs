//! Process-wide open file table.

use super::error::{FsError, Result};
use std::{collections::HashMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Mode {
    pub fn readable(self) -> bool {
        matches!(self, Mode::ReadOnly | Mode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Mode::WriteOnly | Mode::ReadWrite)
    }
}

/// Accepts the shell's numeric codes (1, 2, 3) and the usual letters.
impl FromStr for Mode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "r" => Ok(Mode::ReadOnly),
            "2" | "w" => Ok(Mode::WriteOnly),
            "3" | "rw" => Ok(Mode::ReadWrite),
            _ => Err(FsError::InvalidArgument("mode must be 1 (r), 2 (w) or 3 (rw)")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::ReadOnly => f.write_str("r"),
            Mode::WriteOnly => f.write_str("w"),
            Mode::ReadWrite => f.write_str("rw"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    /// The entry this descriptor was opened through, while it still leads
    /// to `inode`.
    pub name: Option<String>,
    pub inode: u32,
    pub directory: u32,
    pub offset: u64,
    pub mode: Mode,
    /// Set by the first write of this open; governs truncation.
    pub touched: bool,
}

/// The directory entry whose removal waits for the last close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredUnlink {
    pub name: String,
    pub directory: u32,
}

#[derive(Debug)]
pub struct FileTable {
    slots: Vec<Option<OpenFile>>,
    pending: HashMap<u32, DeferredUnlink>,
}

impl FileTable {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: vec![None; capacity as usize],
            pending: HashMap::new(),
        }
    }

    /// Handle of the descriptor opened as `name` from `directory`.
    pub fn find(&self, name: &str, directory: u32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map_or(false, |f| f.name.as_deref() == Some(name) && f.directory == directory)
        })
    }

    /// Detaches `handle` from its name; later opens of that name get a new
    /// descriptor.
    pub fn unbind(&mut self, handle: usize) -> Result<()> {
        self.get_mut(handle)?.name = None;
        Ok(())
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn insert(&mut self, handle: usize, file: OpenFile) {
        self.slots[handle] = Some(file);
    }

    pub fn get(&self, handle: usize) -> Result<&OpenFile> {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .ok_or(FsError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: usize) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(handle)
            .and_then(Option::as_mut)
            .ok_or(FsError::InvalidHandle)
    }

    pub fn take(&mut self, handle: usize) -> Result<OpenFile> {
        self.slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or(FsError::InvalidHandle)
    }

    pub fn is_open(&self, inode: u32) -> bool {
        self.slots.iter().flatten().any(|f| f.inode == inode)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &OpenFile)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| slot.as_ref().map(|f| (handle, f)))
    }

    pub fn defer_unlink(&mut self, inode: u32, entry: DeferredUnlink) {
        self.pending.insert(inode, entry);
    }

    pub fn is_pending(&self, inode: u32) -> bool {
        self.pending.contains_key(&inode)
    }

    pub fn take_pending(&mut self, inode: u32) -> Option<DeferredUnlink> {
        self.pending.remove(&inode)
    }
}
