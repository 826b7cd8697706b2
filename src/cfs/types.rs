//! On-disk records.
//!
//! Every record is encoded with bincode's fixed-width little-endian layout,
//! so the field order below is the byte order on disk:
//!
//! | record        | size | layout                                                  |
//! |---------------|------|---------------------------------------------------------|
//! | superblock    | 45   | magic[5], nine u32 geometry fields, crc32               |
//! | inode         | 56   | kind u32, size u32, links u32, direct[10] i32, indirect i32 |
//! | directory item| 36   | name[32] NUL padded, inode u32                          |

use super::{
    device::Block,
    error::{FsError, Result},
    util, BLOCK_SIZE, CFS_MAGIC, DEFAULT_FD_TABLE_SIZE, DEFAULT_FS_SIZE, DEFAULT_INODE_COUNT,
    DIRECT_POINTERS, INODE_SIZE, MAX_FILE_NAME, ROOT_INODE,
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// Volume shape requested at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub total_blocks: u32,
    pub inode_count: u32,
    pub fd_table_size: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            total_blocks: DEFAULT_FS_SIZE,
            inode_count: DEFAULT_INODE_COUNT,
            fd_table_size: DEFAULT_FD_TABLE_SIZE,
        }
    }
}

impl Geometry {
    pub fn for_device(total_blocks: u32) -> Self {
        Self {
            total_blocks,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: [u8; 5],
    pub disk_size: u32,
    pub working_directory: u32,
    pub inode_count: u32,
    pub data_block_count: u32,
    pub inode_map_start: u32,
    pub data_map_start: u32,
    pub inode_start: u32,
    pub data_start: u32,
    pub fd_table_size: u32,
    pub checksum: u32,
}

impl Superblock {
    /// Lays out a volume: superblock, inode bitmap, data bitmap, inode table, data.
    pub fn new(geometry: &Geometry) -> Result<Self> {
        if geometry.inode_count == 0 {
            return Err(FsError::InvalidArgument("inode count must be positive"));
        }
        if geometry.fd_table_size == 0 {
            return Err(FsError::InvalidArgument("descriptor table must be positive"));
        }

        let bits_per_block = BLOCK_SIZE as u64 * 8;
        let inodes = geometry.inode_count as u64;
        let inode_map_blocks = util::ceil_div(util::ceil_div(inodes, 8), BLOCK_SIZE as u64);
        let inode_blocks = util::ceil_div(inodes * INODE_SIZE as u64, BLOCK_SIZE as u64);
        let meta_blocks = 1 + inode_map_blocks + inode_blocks;

        let total = geometry.total_blocks as u64;
        if total <= meta_blocks {
            return Err(FsError::InvalidArgument("volume too small for its inode table"));
        }

        // Smallest bitmap that still covers every block left after it.
        let data_total = total - meta_blocks;
        let data_map_blocks = (data_total + bits_per_block) / (bits_per_block + 1);
        let data_blocks = data_total - data_map_blocks;
        if data_blocks == 0 {
            return Err(FsError::InvalidArgument("volume too small for any data block"));
        }

        let inode_map_start = 1;
        let data_map_start = inode_map_start + inode_map_blocks;
        let inode_start = data_map_start + data_map_blocks;
        let data_start = inode_start + inode_blocks;

        Ok(Self {
            magic: CFS_MAGIC,
            disk_size: geometry.total_blocks,
            working_directory: ROOT_INODE,
            inode_count: geometry.inode_count,
            data_block_count: data_blocks as u32,
            inode_map_start: inode_map_start as u32,
            data_map_start: data_map_start as u32,
            inode_start: inode_start as u32,
            data_start: data_start as u32,
            fd_table_size: geometry.fd_table_size,
            checksum: 0,
        })
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            total_blocks: self.disk_size,
            inode_count: self.inode_count,
            fd_table_size: self.fd_table_size,
        }
    }

    pub fn inode_map_blocks(&self) -> u32 {
        self.data_map_start - self.inode_map_start
    }

    pub fn data_map_blocks(&self) -> u32 {
        self.inode_start - self.data_map_start
    }

    pub fn inode_table_blocks(&self) -> u32 {
        self.data_start - self.inode_start
    }

    pub fn to_block(&mut self) -> Result<Block> {
        self.checksum()?;
        let bytes = bincode::serialize(self)?;
        let mut block = [0u8; BLOCK_SIZE];
        block[..bytes.len()].copy_from_slice(&bytes);

        Ok(block)
    }

    /// Decodes block 0. `None` means the volume was never formatted.
    pub fn from_block(block: &Block) -> Result<Option<Self>> {
        if block[..CFS_MAGIC.len()] != CFS_MAGIC {
            return Ok(None);
        }

        let mut sb: Self = bincode::deserialize(&block[..])?;
        if !sb.verify_checksum()? {
            return Err(FsError::Corrupted("superblock checksum mismatch"));
        }
        if !sb.is_consistent() {
            return Err(FsError::Corrupted("superblock geometry out of range"));
        }

        Ok(Some(sb))
    }

    fn is_consistent(&self) -> bool {
        self.inode_map_start == 1
            && self.inode_map_start < self.data_map_start
            && self.data_map_start < self.inode_start
            && self.inode_start < self.data_start
            && self.data_start as u64 + self.data_block_count as u64 <= self.disk_size as u64
            && self.inode_count as u64 * INODE_SIZE as u64
                <= self.inode_table_blocks() as u64 * BLOCK_SIZE as u64
            && self.fd_table_size > 0
    }

    fn checksum(&mut self) -> Result<()> {
        self.checksum = 0;
        self.checksum = util::calculate_checksum(&self)?;
        Ok(())
    }

    fn verify_checksum(&mut self) -> Result<bool> {
        let checksum = self.checksum;
        self.checksum = 0;
        let ok = checksum == util::calculate_checksum(&self)?;
        self.checksum = checksum;

        Ok(ok)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    #[default]
    File,
    Directory,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::File => f.write_str("FILE"),
            FileKind::Directory => f.write_str("DIRECTORY"),
        }
    }
}

/// A block number, stored as `-1` when unset.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(from = "i32", into = "i32")]
pub struct BlockPtr(Option<u32>);

impl BlockPtr {
    pub const NONE: Self = Self(None);

    pub fn new(block: u32) -> Self {
        Self(Some(block))
    }

    pub fn get(self) -> Option<u32> {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0.is_some()
    }
}

impl From<i32> for BlockPtr {
    fn from(raw: i32) -> Self {
        Self(u32::try_from(raw).ok())
    }
}

impl From<BlockPtr> for i32 {
    fn from(ptr: BlockPtr) -> Self {
        ptr.0.map_or(-1, |block| block as i32)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub kind: FileKind,
    pub size: u32,
    pub link_count: u32,
    pub direct: [BlockPtr; DIRECT_POINTERS],
    pub indirect: BlockPtr,
}

impl Inode {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            size: 0,
            link_count: 1,
            direct: [BlockPtr::NONE; DIRECT_POINTERS],
            indirect: BlockPtr::NONE,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Blocks needed to hold `size` bytes.
    pub fn block_count(&self) -> u32 {
        util::ceil_div(self.size as u64, BLOCK_SIZE as u64) as u32
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryItem {
    name: [u8; MAX_FILE_NAME],
    pub inode: u32,
}

impl DirectoryItem {
    pub fn new(name: &str, inode: u32) -> Result<Self> {
        util::validate_name(name)?;
        let mut raw = [0u8; MAX_FILE_NAME];
        raw[..name.len()].copy_from_slice(name.as_bytes());

        Ok(Self { name: raw, inode })
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(util::trim_nul(&self.name))
    }

    pub fn is(&self, name: &str) -> bool {
        util::trim_nul(&self.name) == name.as_bytes()
    }
}

impl fmt::Debug for DirectoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryItem")
            .field("name", &self.name())
            .field("inode", &self.inode)
            .finish()
    }
}
