//! Directory contents.
//!
//! A directory is an inode whose bytes are a packed array of
//! `DIRECTORY_ITEM_SIZE` records. The first two are always `.` and `..`.
//! Entries are appended at the end and removal shifts the tail down, so the
//! array never has holes and its blocks are released as it shrinks.

use super::{
    device::{Block, BlockDevice},
    error::{FsError, Result},
    fs::Filesystem,
    types::{DirectoryItem, FileKind, Inode},
    BLOCK_SIZE, DIRECTORY_ITEM_SIZE,
};
use log::debug;

impl<D: BlockDevice> Filesystem<D> {
    pub fn directory_items(&self, dir: u32) -> Result<Vec<DirectoryItem>> {
        let inode = self.find_inode(dir)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let bytes = self.read_range(&inode, 0, inode.size as usize)?;
        if bytes.len() != inode.size as usize || bytes.len() % DIRECTORY_ITEM_SIZE != 0 {
            return Err(FsError::Corrupted("directory size does not match its blocks"));
        }

        bytes
            .chunks_exact(DIRECTORY_ITEM_SIZE)
            .map(|raw| bincode::deserialize(raw).map_err(FsError::from))
            .collect()
    }

    pub fn lookup_in(&self, dir: u32, name: &str) -> Result<DirectoryItem> {
        self.directory_items(dir)?
            .into_iter()
            .find(|item| item.is(name))
            .ok_or(FsError::NotFound)
    }

    /// Looks `name` up in the working directory.
    pub fn lookup(&self, name: &str) -> Result<DirectoryItem> {
        self.lookup_in(self.cwd(), name)
    }

    pub fn item_exists(&self, name: &str) -> Result<bool> {
        match self.lookup(name) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Creates an empty regular file named `name` in the working directory.
    pub fn create_new_file(&mut self, name: &str) -> Result<DirectoryItem> {
        let cwd = self.cwd();
        DirectoryItem::new(name, 0)?;
        if self.item_exists(name)? {
            return Err(FsError::AlreadyExists);
        }

        let mut inode = Inode::new(FileKind::File);
        let number = self.alloc_inode(&inode)?;
        let item = DirectoryItem::new(name, number)?;
        if let Err(err) = self.append_item(cwd, item) {
            self.free_inode(number, &mut inode)?;
            self.sync_bitmaps();
            return Err(err);
        }
        self.sync_bitmaps();
        debug!("created {:?} as inode {}", name, number);

        Ok(item)
    }

    pub(crate) fn append_item(&mut self, dir: u32, item: DirectoryItem) -> Result<()> {
        let mut inode = self.find_inode(dir)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let bytes = bincode::serialize(&item)?;
        let (end, keep) = (inode.size as u64, inode.block_count());
        let written = self.write_range(&mut inode, end, &bytes)?;
        if written < bytes.len() {
            // hand back whatever the partial record claimed
            self.release_from(&mut inode, keep)?;
            self.save_inode(dir, &inode)?;
            return Err(FsError::NoSpace);
        }

        inode.size += DIRECTORY_ITEM_SIZE as u32;
        self.save_inode(dir, &inode)
    }

    /// Removes the entry `name` from `dir` and returns it.
    pub(crate) fn remove_item(&mut self, dir: u32, name: &str) -> Result<DirectoryItem> {
        let mut inode = self.find_inode(dir)?;
        let mut items = self.directory_items(dir)?;
        let position = items
            .iter()
            .position(|item| item.is(name))
            .ok_or(FsError::NotFound)?;
        let removed = items.remove(position);

        let mut tail = Vec::with_capacity((items.len() - position) * DIRECTORY_ITEM_SIZE);
        for item in &items[position..] {
            tail.extend(bincode::serialize(item)?);
        }
        self.write_range(&mut inode, (position * DIRECTORY_ITEM_SIZE) as u64, &tail)?;

        inode.size -= DIRECTORY_ITEM_SIZE as u32;
        let keep = inode.block_count();
        self.release_from(&mut inode, keep)?;
        self.save_inode(dir, &inode)?;
        debug!("removed {:?} from directory {}", name, dir);

        Ok(removed)
    }

    /// Writes the `.` and `..` records of a fresh directory into `block`.
    pub(crate) fn write_directory_block(&mut self, block: u32, itself: u32, parent: u32) -> Result<()> {
        let mut buf: Block = [0u8; BLOCK_SIZE];
        let entries = [DirectoryItem::new(".", itself)?, DirectoryItem::new("..", parent)?];
        for (raw, item) in buf.chunks_exact_mut(DIRECTORY_ITEM_SIZE).zip(entries.iter()) {
            raw.copy_from_slice(&bincode::serialize(item)?);
        }
        self.device.write_block(block, &buf);

        Ok(())
    }
}
