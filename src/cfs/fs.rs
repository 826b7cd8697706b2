//! The mounted file system.
//!
//! [`Filesystem`] owns the device, the cached superblock, both bitmaps and the
//! open file table. Every operation borrows it mutably, so calls are strictly
//! one after another. Bitmaps are written back at the end of each mutating
//! operation; inode and data blocks are written as they change.

use super::{
    bitmap::Bitmap,
    device::BlockDevice,
    error::{FsError, Result},
    file::{DeferredUnlink, FileTable, Mode, OpenFile},
    inode::InodeTable,
    types::{BlockPtr, DirectoryItem, FileKind, Geometry, Inode, Superblock},
    util, BLOCK_SIZE, DIRECTORY_ITEM_SIZE, MAX_FILE_SIZE, ROOT_INODE, SUPERBLOCK_BLOCK,
};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: u32,
    pub kind: FileKind,
    pub link_count: u32,
    pub size: u32,
    pub blocks: u32,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub inode: u32,
    pub kind: FileKind,
    pub link_count: u32,
}

/// Allocation state of an inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
    Live,
    /// Unlinked while open; storage goes away on the last close.
    PendingDeletion,
    Freed,
}

pub struct Filesystem<D: BlockDevice> {
    pub(super) device: D,
    pub(super) sb: Superblock,
    pub(super) inodes: InodeTable,
    pub(super) inode_map: Bitmap,
    pub(super) data_map: Bitmap,
    pub(super) files: FileTable,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Mounts the volume on `device`, formatting it first if block 0 holds
    /// no superblock.
    pub fn init(mut device: D) -> Result<Self> {
        device.init();

        let mut block = [0u8; BLOCK_SIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut block);
        match Superblock::from_block(&block)? {
            Some(sb) => Self::mount(device, sb),
            None => {
                info!("no file system found, formatting {} blocks", device.block_count());
                let geometry = Geometry::for_device(device.block_count());
                Self::mkfs(device, &geometry)
            }
        }
    }

    /// Formats `device` with `geometry` and mounts the result.
    pub fn mkfs(device: D, geometry: &Geometry) -> Result<Self> {
        if geometry.total_blocks > device.block_count() {
            return Err(FsError::InvalidArgument("volume larger than its device"));
        }

        let sb = Superblock::new(geometry)?;
        let mut fs = Self {
            inodes: InodeTable::new(sb.inode_start, sb.inode_count),
            inode_map: Bitmap::empty(sb.inode_map_start, sb.inode_map_blocks(), sb.inode_count),
            data_map: Bitmap::empty(sb.data_map_start, sb.data_map_blocks(), sb.data_block_count),
            files: FileTable::new(sb.fd_table_size),
            device,
            sb,
        };
        fs.write_layout()?;

        Ok(fs)
    }

    /// Wipes the mounted volume and lays it out again with the same geometry.
    /// Open descriptors and pending unlinks are dropped.
    pub fn format(&mut self) -> Result<()> {
        let sb = Superblock::new(&self.sb.geometry())?;
        self.inodes = InodeTable::new(sb.inode_start, sb.inode_count);
        self.inode_map = Bitmap::empty(sb.inode_map_start, sb.inode_map_blocks(), sb.inode_count);
        self.data_map = Bitmap::empty(sb.data_map_start, sb.data_map_blocks(), sb.data_block_count);
        self.files = FileTable::new(sb.fd_table_size);
        self.sb = sb;

        self.write_layout()
    }

    fn mount(device: D, sb: Superblock) -> Result<Self> {
        if sb.disk_size > device.block_count() {
            return Err(FsError::Corrupted("volume larger than its device"));
        }

        let mut fs = Self {
            inodes: InodeTable::new(sb.inode_start, sb.inode_count),
            inode_map: Bitmap::load(&device, sb.inode_map_start, sb.inode_map_blocks(), sb.inode_count),
            data_map: Bitmap::load(&device, sb.data_map_start, sb.data_map_blocks(), sb.data_block_count),
            files: FileTable::new(sb.fd_table_size),
            device,
            sb,
        };
        if !fs.inode_map.is_set(ROOT_INODE) {
            return Err(FsError::Corrupted("root directory is not allocated"));
        }

        let cwd = fs.sb.working_directory;
        if !fs.is_live_directory(cwd) {
            warn!("working directory {} is gone, falling back to root", cwd);
            fs.sb.working_directory = ROOT_INODE;
        }
        info!(
            "mounted {} blocks: {}/{} inodes, {}/{} data blocks in use",
            fs.sb.disk_size,
            fs.inode_map.count_set(),
            fs.sb.inode_count,
            fs.data_map.count_set(),
            fs.sb.data_block_count
        );

        Ok(fs)
    }

    fn write_layout(&mut self) -> Result<()> {
        self.inodes.clear(&mut self.device, self.sb.inode_table_blocks());

        let root = self.inode_map.find_free_bit().ok_or(FsError::NoSpace)?;
        let block = self.alloc_data_block()?;
        self.write_directory_block(block, root, root)?;

        let mut inode = Inode::new(FileKind::Directory);
        inode.size = 2 * DIRECTORY_ITEM_SIZE as u32;
        inode.direct[0] = BlockPtr::new(block);
        self.save_inode(root, &inode)?;

        self.sync_bitmaps();
        self.save_superblock()?;
        info!(
            "formatted {} blocks: {} inodes, {} data blocks starting at block {}",
            self.sb.disk_size, self.sb.inode_count, self.sb.data_block_count, self.sb.data_start
        );

        Ok(())
    }

    fn is_live_directory(&self, inode: u32) -> bool {
        self.inode_map.is_set(inode)
            && self
                .find_inode(inode)
                .map(|inode| inode.is_dir())
                .unwrap_or(false)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Inode number of the working directory.
    pub fn cwd(&self) -> u32 {
        self.sb.working_directory
    }

    pub fn open_files(&self) -> impl Iterator<Item = (usize, &OpenFile)> {
        self.files.iter()
    }

    pub fn free_inodes(&self) -> u32 {
        self.inode_map.len() - self.inode_map.count_set()
    }

    pub fn free_blocks(&self) -> u32 {
        self.data_map.len() - self.data_map.count_set()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sync_bitmaps();
        self.save_superblock()?;
        self.device
            .flush()
            .map_err(|_| FsError::Corrupted("device flush failed"))
    }

    pub(crate) fn save_superblock(&mut self) -> Result<()> {
        let block = self.sb.to_block()?;
        self.device.write_block(SUPERBLOCK_BLOCK, &block);
        Ok(())
    }

    pub(crate) fn sync_bitmaps(&mut self) {
        if self.inode_map.is_dirty() {
            self.inode_map.save(&mut self.device);
        }
        if self.data_map.is_dirty() {
            self.data_map.save(&mut self.device);
        }
    }

    pub fn find_inode(&self, inode: u32) -> Result<Inode> {
        self.inodes.find(&self.device, inode)
    }

    pub(crate) fn save_inode(&mut self, number: u32, inode: &Inode) -> Result<()> {
        self.inodes.save(&mut self.device, number, inode)
    }

    /// Claims an inode number and stores `inode` under it.
    pub(crate) fn alloc_inode(&mut self, inode: &Inode) -> Result<u32> {
        let number = self.inode_map.find_free_bit().ok_or(FsError::NoSpace)?;
        self.save_inode(number, inode)?;
        debug!("allocated inode {} ({})", number, inode.kind);

        Ok(number)
    }

    /// Releases the data blocks of `inode` and its number.
    pub(crate) fn free_inode(&mut self, number: u32, inode: &mut Inode) -> Result<()> {
        self.release_from(inode, 0)?;
        inode.size = 0;
        inode.link_count = 0;
        self.save_inode(number, inode)?;
        self.inode_map.clear_bit(number)?;
        debug!("freed inode {}", number);

        Ok(())
    }

    pub fn inode_state(&self, inode: u32) -> InodeState {
        if !self.inode_map.is_set(inode) {
            InodeState::Freed
        } else if self.files.is_pending(inode) {
            InodeState::PendingDeletion
        } else {
            InodeState::Live
        }
    }

    /// Handle of the descriptor opened as `name` in the working directory,
    /// as long as that entry still leads to the descriptor's file.
    pub fn handle_of(&self, name: &str) -> Option<usize> {
        let handle = self.files.find(name, self.cwd())?;
        let inode = self.files.get(handle).ok()?.inode;
        match self.lookup(name) {
            Ok(item) if item.inode == inode => Some(handle),
            _ => None,
        }
    }

    /// Opens `name` in the working directory and returns its handle.
    ///
    /// A descriptor already open on the same name from the same directory is
    /// handed back with the new mode and its offset rewound. A missing file is
    /// created when `mode` allows writing.
    pub fn open(&mut self, name: &str, mode: Mode) -> Result<usize> {
        util::validate_name(name)?;
        let cwd = self.cwd();

        if let Some(handle) = self.handle_of(name) {
            let file = self.files.get_mut(handle)?;
            file.mode = mode;
            file.offset = 0;
            file.touched = false;
            debug!("reopened {:?} as handle {}", name, handle);
            return Ok(handle);
        }
        if let Some(stale) = self.files.find(name, cwd) {
            // the name was unlinked or replaced since that open
            self.files.unbind(stale)?;
            debug!("handle {} no longer reaches {:?}", stale, name);
        }

        let handle = self.files.first_free().ok_or(FsError::TableFull)?;
        let item = match self.lookup_in(cwd, name) {
            Ok(item) => {
                if self.find_inode(item.inode)?.is_dir() {
                    return Err(FsError::IsADirectory);
                }
                item
            }
            Err(FsError::NotFound) if mode.writable() => self.create_new_file(name)?,
            Err(err) => return Err(err),
        };

        self.files.insert(
            handle,
            OpenFile {
                name: Some(name.to_owned()),
                inode: item.inode,
                directory: cwd,
                offset: 0,
                mode,
                touched: false,
            },
        );
        debug!("opened {:?} (inode {}) as handle {} [{}]", name, item.inode, handle, mode);

        Ok(handle)
    }

    /// Frees `handle`. The last close of an unlinked file removes it.
    pub fn close(&mut self, handle: usize) -> Result<()> {
        let file = self.files.take(handle)?;
        debug!("closed handle {} ({:?})", handle, file.name);

        if self.files.is_open(file.inode) || !self.files.is_pending(file.inode) {
            return Ok(());
        }
        if self.find_inode(file.inode)?.link_count >= 1 {
            self.files.take_pending(file.inode);
            return Ok(());
        }

        match self.files.take_pending(file.inode) {
            Some(entry) => {
                debug!("completing deferred unlink of {:?}", entry.name);
                self.unlink_in(entry.directory, &entry.name)
            }
            None => Ok(()),
        }
    }

    /// Reads up to `count` bytes at the handle's offset and advances it.
    pub fn read(&mut self, handle: usize, count: usize) -> Result<Vec<u8>> {
        let file = self.files.get(handle)?;
        let (number, offset) = (file.inode, file.offset);
        if !file.mode.readable() {
            return Err(FsError::InvalidArgument("handle is not open for reading"));
        }

        let inode = self.find_inode(number)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let size = inode.size as u64;
        if offset >= size {
            return Err(FsError::EndOfFile);
        }

        let count = count.min((size - offset) as usize);
        let data = self.read_range(&inode, offset, count)?;
        self.files.get_mut(handle)?.offset += data.len() as u64;

        Ok(data)
    }

    /// Writes `data` at the handle's offset and returns the bytes written.
    ///
    /// The first write after an open cuts the file at the end of the written
    /// range. Writing past the end first fills the gap with zeros.
    pub fn write(&mut self, handle: usize, data: &[u8]) -> Result<usize> {
        let file = self.files.get(handle)?;
        let (number, offset, touched) = (file.inode, file.offset, file.touched);
        if !file.mode.writable() {
            return Err(FsError::InvalidArgument("handle is not open for writing"));
        }

        let mut inode = self.find_inode(number)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if offset >= MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }

        if offset > inode.size as u64 {
            self.zero_fill(&mut inode, offset)?;
            if offset > inode.size as u64 {
                self.save_inode(number, &inode)?;
                self.sync_bitmaps();
                warn!("no room to extend inode {} to offset {}", number, offset);
                return Err(FsError::NoSpace);
            }
        }

        let written = self.write_range(&mut inode, offset, data)?;
        if written == 0 {
            self.save_inode(number, &inode)?;
            self.sync_bitmaps();
            return Err(FsError::NoSpace);
        }

        let end = offset + written as u64;
        if !touched {
            let keep = util::ceil_div(end, BLOCK_SIZE as u64) as u32;
            self.release_from(&mut inode, keep)?;
            inode.size = end as u32;
        } else if end > inode.size as u64 {
            inode.size = end as u32;
        }
        self.save_inode(number, &inode)?;
        self.sync_bitmaps();

        let file = self.files.get_mut(handle)?;
        file.offset = end;
        file.touched = true;
        if written < data.len() {
            warn!("short write on handle {}: {} of {} bytes", handle, written, data.len());
        }

        Ok(written)
    }

    fn zero_fill(&mut self, inode: &mut Inode, to: u64) -> Result<()> {
        let from = inode.size as u64;
        let to = to.min(MAX_FILE_SIZE);
        if to <= from {
            return Ok(());
        }

        let zeros = vec![0u8; (to - from) as usize];
        let filled = self.write_range(inode, from, &zeros)?;
        inode.size = (from + filled as u64) as u32;

        Ok(())
    }

    /// Moves the handle's offset to `offset` bytes from the start.
    pub fn lseek(&mut self, handle: usize, offset: u64) -> Result<u64> {
        let number = self.files.get(handle)?.inode;
        if self.find_inode(number)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.files.get_mut(handle)?.offset = offset;

        Ok(offset)
    }

    pub fn mkdir(&mut self, name: &str) -> Result<()> {
        let cwd = self.cwd();
        util::validate_name(name)?;
        if self.item_exists(name)? {
            return Err(FsError::AlreadyExists);
        }

        let number = self.inode_map.find_free_bit().ok_or(FsError::NoSpace)?;
        let block = match self.alloc_data_block() {
            Ok(block) => block,
            Err(err) => {
                self.inode_map.clear_bit(number)?;
                return Err(err);
            }
        };
        self.write_directory_block(block, number, cwd)?;

        let mut inode = Inode::new(FileKind::Directory);
        inode.size = 2 * DIRECTORY_ITEM_SIZE as u32;
        inode.direct[0] = BlockPtr::new(block);
        self.save_inode(number, &inode)?;

        if let Err(err) = self.append_item(cwd, DirectoryItem::new(name, number)?) {
            self.free_inode(number, &mut inode)?;
            self.sync_bitmaps();
            return Err(err);
        }
        self.sync_bitmaps();
        debug!("created directory {:?} as inode {}", name, number);

        Ok(())
    }

    /// Removes the empty directory `name` from the working directory.
    pub fn rmdir(&mut self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument("cannot remove '.' or '..'"));
        }

        let cwd = self.cwd();
        let item = self.lookup_in(cwd, name)?;
        let mut inode = self.find_inode(item.inode)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if self.directory_items(item.inode)?.len() > 2 {
            return Err(FsError::NotEmpty);
        }

        self.free_inode(item.inode, &mut inode)?;
        self.remove_item(cwd, name)?;
        self.sync_bitmaps();
        debug!("removed directory {:?}", name);

        Ok(())
    }

    /// Changes the working directory. The choice survives a remount.
    pub fn chdir(&mut self, name: &str) -> Result<()> {
        let item = self.lookup(name)?;
        if !self.find_inode(item.inode)?.is_dir() {
            return Err(FsError::NotADirectory);
        }

        self.sb.working_directory = item.inode;
        self.save_superblock()
    }

    /// Adds `new` as another name for the regular file `old`.
    pub fn link(&mut self, old: &str, new: &str) -> Result<()> {
        let cwd = self.cwd();
        util::validate_name(new)?;
        if self.item_exists(new)? {
            return Err(FsError::AlreadyExists);
        }

        let item = self.lookup_in(cwd, old)?;
        let mut inode = self.find_inode(item.inode)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if self.files.is_pending(item.inode) || inode.link_count == 0 {
            return Err(FsError::NotFound);
        }

        self.append_item(cwd, DirectoryItem::new(new, item.inode)?)?;
        inode.link_count += 1;
        self.save_inode(item.inode, &inode)?;
        self.sync_bitmaps();

        Ok(())
    }

    pub fn unlink(&mut self, name: &str) -> Result<()> {
        self.unlink_in(self.cwd(), name)
    }

    /// Drops the name `name` from directory `dir`. The last name of a file
    /// that is still open stays until the file is closed.
    pub fn unlink_in(&mut self, dir: u32, name: &str) -> Result<()> {
        let item = self.lookup_in(dir, name)?;
        let mut inode = self.find_inode(item.inode)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        if inode.link_count <= 1 && self.files.is_open(item.inode) {
            inode.link_count = 0;
            self.save_inode(item.inode, &inode)?;
            self.files.defer_unlink(
                item.inode,
                DeferredUnlink {
                    name: name.to_owned(),
                    directory: dir,
                },
            );
            debug!("unlink of {:?} deferred until inode {} is closed", name, item.inode);
            return Ok(());
        }

        if inode.link_count <= 1 {
            self.free_inode(item.inode, &mut inode)?;
        } else {
            inode.link_count -= 1;
            self.save_inode(item.inode, &inode)?;
        }
        self.remove_item(dir, name)?;
        self.sync_bitmaps();

        Ok(())
    }

    pub fn stat(&self, name: &str) -> Result<Stat> {
        let item = self.lookup(name)?;
        let inode = self.find_inode(item.inode)?;

        Ok(Stat {
            inode: item.inode,
            kind: inode.kind,
            link_count: inode.link_count,
            size: inode.size,
            blocks: inode.block_count(),
        })
    }

    /// Whole content of the regular file `name`, without opening it.
    pub fn contents(&self, name: &str) -> Result<Vec<u8>> {
        let item = self.lookup(name)?;
        let inode = self.find_inode(item.inode)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }

        self.read_range(&inode, 0, inode.size as usize)
    }

    /// Entries of the working directory in on-disk order.
    pub fn list(&self) -> Result<Vec<Listing>> {
        self.directory_items(self.cwd())?
            .into_iter()
            .map(|item| {
                let inode = self.find_inode(item.inode)?;
                Ok(Listing {
                    name: item.name().into_owned(),
                    inode: item.inode,
                    kind: inode.kind,
                    link_count: inode.link_count,
                })
            })
            .collect()
    }
}
