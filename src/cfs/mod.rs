pub mod bitmap;
pub mod device;
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod inode;
pub mod resolver;
pub mod types;
pub mod util;

pub use device::{BlockDevice, ImageDevice, MemoryDevice};
pub use error::{FsError, Result};
pub use file::Mode;
pub use fs::{Filesystem, InodeState, Listing, Stat};
pub use types::{FileKind, Geometry};

pub const CFS_MAGIC: [u8; 5] = *b"!CFS\0";
pub const BLOCK_SIZE: usize = 512;
pub const SUPERBLOCK_BLOCK: u32 = 0;
pub const ROOT_INODE: u32 = 0;

pub const DIRECT_POINTERS: usize = 10;
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;
/// Largest logical block index a file can address, exclusive.
pub const MAX_FILE_BLOCKS: u32 = (DIRECT_POINTERS + POINTERS_PER_BLOCK) as u32;
pub const MAX_FILE_SIZE: u64 = MAX_FILE_BLOCKS as u64 * BLOCK_SIZE as u64;

pub const INODE_SIZE: usize = 56;
pub const MAX_FILE_NAME: usize = 32;
pub const DIRECTORY_ITEM_SIZE: usize = MAX_FILE_NAME + 4;

pub const DEFAULT_FS_SIZE: u32 = 4096;
pub const DEFAULT_INODE_COUNT: u32 = 512;
pub const DEFAULT_FD_TABLE_SIZE: u32 = 5;
