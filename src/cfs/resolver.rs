//! Logical block index to physical block number.
//!
//! A file's logical blocks form two ranges: `0..DIRECT_POINTERS` live in the
//! inode itself, the next `POINTERS_PER_BLOCK` live in one address block
//! referenced by the inode's indirect pointer. Byte-range helpers on top of
//! the mapping serve both file I/O and directory storage.

use super::{
    device::{Block, BlockDevice},
    error::{FsError, Result},
    fs::Filesystem,
    types::{BlockPtr, Inode},
    BLOCK_SIZE, DIRECT_POINTERS, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK,
};
use log::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Direct(usize),
    Indirect(usize),
}

impl Slot {
    pub fn of(index: u32) -> Result<Self> {
        let index = index as usize;
        if index < DIRECT_POINTERS {
            Ok(Slot::Direct(index))
        } else if index < DIRECT_POINTERS + POINTERS_PER_BLOCK {
            Ok(Slot::Indirect(index - DIRECT_POINTERS))
        } else {
            Err(FsError::FileTooLarge)
        }
    }
}

/// The pointer table held by an indirect block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBlock([BlockPtr; POINTERS_PER_BLOCK]);

impl AddressBlock {
    pub fn empty() -> Self {
        Self([BlockPtr::NONE; POINTERS_PER_BLOCK])
    }

    pub fn from_block(block: &Block) -> Self {
        let mut ptrs = [BlockPtr::NONE; POINTERS_PER_BLOCK];
        for (ptr, raw) in ptrs.iter_mut().zip(block.chunks_exact(4)) {
            *ptr = BlockPtr::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        }

        Self(ptrs)
    }

    pub fn to_block(&self) -> Block {
        let mut block = [0u8; BLOCK_SIZE];
        for (raw, ptr) in block.chunks_exact_mut(4).zip(self.0.iter()) {
            raw.copy_from_slice(&i32::from(*ptr).to_le_bytes());
        }

        block
    }

    pub fn get(&self, slot: usize) -> BlockPtr {
        self.0[slot]
    }

    pub fn set(&mut self, slot: usize, ptr: BlockPtr) {
        self.0[slot] = ptr;
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|ptr| !ptr.is_set())
    }
}

impl<D: BlockDevice> Filesystem<D> {
    pub(crate) fn read_address_block(&self, block: u32) -> AddressBlock {
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf);
        AddressBlock::from_block(&buf)
    }

    pub(crate) fn write_address_block(&mut self, block: u32, table: &AddressBlock) {
        self.device.write_block(block, &table.to_block());
    }

    /// Claims a data block and zeroes it. Returns its absolute block number.
    pub(crate) fn alloc_data_block(&mut self) -> Result<u32> {
        let index = self.data_map.find_free_bit().ok_or(FsError::NoSpace)?;
        let block = self.sb.data_start + index;
        self.device.write_block(block, &[0u8; BLOCK_SIZE]);
        debug!("allocated data block {}", block);

        Ok(block)
    }

    pub(crate) fn free_data_block(&mut self, block: u32) -> Result<()> {
        let block = self.data_block(block)?;
        self.data_map.clear_bit(block - self.sb.data_start)?;
        debug!("freed data block {}", block);

        Ok(())
    }

    /// Checks a pointer read from disk against the data region.
    fn data_block(&self, block: u32) -> Result<u32> {
        match block.checked_sub(self.sb.data_start) {
            Some(index) if index < self.sb.data_block_count => Ok(block),
            _ => Err(FsError::Corrupted("block pointer outside the data region")),
        }
    }

    /// Physical block behind logical block `index`, without allocating.
    pub fn lookup_block(&self, inode: &Inode, index: u32) -> Result<u32> {
        let block = match Slot::of(index)? {
            Slot::Direct(slot) => inode.direct[slot].get(),
            Slot::Indirect(slot) => match inode.indirect.get() {
                Some(table) => self.read_address_block(self.data_block(table)?).get(slot).get(),
                None => None,
            },
        };

        self.data_block(block.ok_or(FsError::NotFound)?)
    }

    /// Physical block behind logical block `index`. With `allocate`, unset
    /// pointers (and the address block itself) are filled in on the way.
    pub fn resolve(&mut self, inode: &mut Inode, index: u32, allocate: bool) -> Result<u32> {
        match self.lookup_block(inode, index) {
            Err(FsError::NotFound) if allocate => self.allocate_block(inode, index),
            other => other,
        }
    }

    fn allocate_block(&mut self, inode: &mut Inode, index: u32) -> Result<u32> {
        match Slot::of(index)? {
            Slot::Direct(slot) => {
                let block = self.alloc_data_block()?;
                inode.direct[slot] = BlockPtr::new(block);
                trace!("logical block {} -> {} (direct)", index, block);

                Ok(block)
            }
            Slot::Indirect(slot) => {
                let (table_block, mut table, fresh) = match inode.indirect.get() {
                    Some(table_block) => (table_block, self.read_address_block(table_block), false),
                    None => (self.alloc_data_block()?, AddressBlock::empty(), true),
                };

                let block = match self.alloc_data_block() {
                    Ok(block) => block,
                    Err(err) => {
                        if fresh {
                            self.free_data_block(table_block)?;
                        }
                        return Err(err);
                    }
                };

                table.set(slot, BlockPtr::new(block));
                self.write_address_block(table_block, &table);
                inode.indirect = BlockPtr::new(table_block);
                trace!("logical block {} -> {} (indirect via {})", index, block, table_block);

                Ok(block)
            }
        }
    }

    /// Frees every allocated logical block at or after `first`, and the
    /// address block once none of its slots remain in use.
    pub(crate) fn release_from(&mut self, inode: &mut Inode, first: u32) -> Result<()> {
        for slot in (first as usize).min(DIRECT_POINTERS)..DIRECT_POINTERS {
            if let Some(block) = inode.direct[slot].get() {
                self.free_data_block(block)?;
                inode.direct[slot] = BlockPtr::NONE;
            }
        }

        if let Some(table_block) = inode.indirect.get() {
            let table_block = self.data_block(table_block)?;
            let mut table = self.read_address_block(table_block);
            let from = (first as usize).saturating_sub(DIRECT_POINTERS);
            for slot in from.min(POINTERS_PER_BLOCK)..POINTERS_PER_BLOCK {
                if let Some(block) = table.get(slot).get() {
                    self.free_data_block(block)?;
                    table.set(slot, BlockPtr::NONE);
                }
            }

            if table.is_empty() {
                self.free_data_block(table_block)?;
                inode.indirect = BlockPtr::NONE;
            } else {
                self.write_address_block(table_block, &table);
            }
        }

        Ok(())
    }

    /// Reads up to `len` bytes from `offset`, stopping early at the first
    /// unmapped block.
    pub(crate) fn read_range(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        if len == 0 {
            return Ok(out);
        }

        let end = offset + len as u64;
        let first = offset / BLOCK_SIZE as u64;
        let last = (end - 1) / BLOCK_SIZE as u64;
        let mut buf = [0u8; BLOCK_SIZE];

        for index in first..=last {
            let block = match u32::try_from(index)
                .map_err(|_| FsError::FileTooLarge)
                .and_then(|index| self.lookup_block(inode, index))
            {
                Ok(block) => block,
                Err(FsError::NotFound) | Err(FsError::FileTooLarge) => break,
                Err(err) => return Err(err),
            };
            self.device.read_block(block, &mut buf);

            let block_start = index * BLOCK_SIZE as u64;
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_start + BLOCK_SIZE as u64) - block_start;
            out.extend_from_slice(&buf[from as usize..to as usize]);
        }

        Ok(out)
    }

    /// Writes `data` at `offset`, allocating blocks as needed. Stops at the
    /// first block that cannot be allocated and returns the bytes written.
    pub(crate) fn write_range(&mut self, inode: &mut Inode, offset: u64, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        let mut buf = [0u8; BLOCK_SIZE];

        while written < data.len() {
            let pos = offset + written as u64;
            let index = pos / BLOCK_SIZE as u64;
            let inner = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - inner).min(data.len() - written);

            if index >= MAX_FILE_BLOCKS as u64 {
                warn!("write stopped at the maximum file size after {} bytes", written);
                break;
            }

            let block = match self.resolve(inode, index as u32, true) {
                Ok(block) => block,
                Err(FsError::NoSpace) => {
                    warn!("volume full, write stopped after {} bytes", written);
                    break;
                }
                Err(err) => return Err(err),
            };

            if chunk < BLOCK_SIZE {
                self.device.read_block(block, &mut buf);
            }
            buf[inner..inner + chunk].copy_from_slice(&data[written..written + chunk]);
            self.device.write_block(block, &buf);
            written += chunk;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::{
        device::MemoryDevice,
        types::{FileKind, Geometry},
    };

    fn small_fs(total_blocks: u32) -> anyhow::Result<Filesystem<MemoryDevice>> {
        let geometry = Geometry {
            total_blocks,
            inode_count: 16,
            fd_table_size: 4,
        };
        Ok(Filesystem::mkfs(MemoryDevice::new(total_blocks), &geometry)?)
    }

    #[test]
    fn slots() {
        assert_eq!(Slot::of(0), Ok(Slot::Direct(0)));
        assert_eq!(Slot::of(9), Ok(Slot::Direct(9)));
        assert_eq!(Slot::of(10), Ok(Slot::Indirect(0)));
        assert_eq!(Slot::of(137), Ok(Slot::Indirect(127)));
        assert_eq!(Slot::of(138), Err(FsError::FileTooLarge));
    }

    #[test]
    fn address_block_codec() {
        let mut table = AddressBlock::empty();
        assert!(table.is_empty());
        table.set(0, BlockPtr::new(100));
        table.set(127, BlockPtr::new(7));

        let block = table.to_block();
        assert_eq!(block[0..4], 100i32.to_le_bytes());
        assert_eq!(block[4..8], (-1i32).to_le_bytes());
        assert_eq!(block[508..512], 7i32.to_le_bytes());
        assert_eq!(AddressBlock::from_block(&block), table);
    }

    #[test]
    fn resolve_across_the_indirect_edge() -> anyhow::Result<()> {
        let mut fs = small_fs(256)?;
        let mut inode = Inode::new(FileKind::File);
        let before = fs.data_map.count_set();

        assert_eq!(fs.resolve(&mut inode, 3, false), Err(FsError::NotFound));
        let direct = fs.resolve(&mut inode, 9, true)?;
        assert_eq!(inode.direct[9].get(), Some(direct));
        assert!(!inode.indirect.is_set());

        let indirect = fs.resolve(&mut inode, 10, true)?;
        let table_block = inode.indirect.get().expect("address block");
        assert_ne!(table_block, indirect);
        assert_eq!(fs.read_address_block(table_block).get(0).get(), Some(indirect));
        // data block for index 9, address block, data block for index 10
        assert_eq!(fs.data_map.count_set(), before + 3);

        assert_eq!(fs.resolve(&mut inode, 10, false)?, indirect);
        assert_eq!(fs.lookup_block(&inode, 11), Err(FsError::NotFound));
        assert_eq!(fs.resolve(&mut inode, 138, true), Err(FsError::FileTooLarge));
        Ok(())
    }

    #[test]
    fn release_frees_the_address_block() -> anyhow::Result<()> {
        let mut fs = small_fs(256)?;
        let before = fs.data_map.count_set();
        let mut inode = Inode::new(FileKind::File);
        for index in 0..14 {
            fs.resolve(&mut inode, index, true)?;
        }
        assert_eq!(fs.data_map.count_set(), before + 15);

        fs.release_from(&mut inode, 12)?;
        assert!(inode.indirect.is_set());
        assert_eq!(fs.data_map.count_set(), before + 13);

        fs.release_from(&mut inode, 10)?;
        assert!(!inode.indirect.is_set());
        assert_eq!(fs.data_map.count_set(), before + 10);

        fs.release_from(&mut inode, 0)?;
        assert_eq!(inode, Inode::new(FileKind::File));
        assert_eq!(fs.data_map.count_set(), before);
        Ok(())
    }

    #[test]
    fn exhaustion_while_allocating_the_address_block() -> anyhow::Result<()> {
        let mut fs = small_fs(256)?;
        let mut inode = Inode::new(FileKind::File);
        for index in 0..10 {
            fs.resolve(&mut inode, index, true)?;
        }
        // leave exactly one free block: enough for the table, not the data
        while fs.data_map.count_set() < fs.data_map.len() - 1 {
            fs.alloc_data_block()?;
        }

        assert_eq!(fs.resolve(&mut inode, 10, true), Err(FsError::NoSpace));
        assert!(!inode.indirect.is_set());
        assert_eq!(fs.data_map.count_set(), fs.data_map.len() - 1);
        Ok(())
    }

    #[test]
    fn byte_ranges_span_blocks() -> anyhow::Result<()> {
        let mut fs = small_fs(256)?;
        let mut inode = Inode::new(FileKind::File);
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();

        assert_eq!(fs.write_range(&mut inode, 100, &data)?, data.len());
        // bytes 100..1600 touch blocks 0..=3
        assert!(inode.direct[..4].iter().all(|p| p.is_set()));
        assert!(!inode.direct[4].is_set());

        assert_eq!(fs.read_range(&inode, 100, data.len())?, data);
        assert_eq!(fs.read_range(&inode, 0, 100)?, vec![0u8; 100]);
        assert_eq!(fs.read_range(&inode, 1590, 10)?, data[1490..].to_vec());
        // block 4 is unmapped, so the read stops at the end of block 3
        assert_eq!(fs.read_range(&inode, 2000, 100)?.len(), 48);
        Ok(())
    }

    #[test]
    fn write_range_stops_at_the_file_limit() -> anyhow::Result<()> {
        let mut fs = small_fs(512)?;
        let mut inode = Inode::new(FileKind::File);
        let data = vec![1u8; BLOCK_SIZE * 2];
        let offset = (MAX_FILE_BLOCKS as u64 - 1) * BLOCK_SIZE as u64;

        assert_eq!(fs.write_range(&mut inode, offset, &data)?, BLOCK_SIZE);
        Ok(())
    }

    #[test]
    fn pointers_outside_the_data_region_are_corrupt() -> anyhow::Result<()> {
        let mut fs = small_fs(256)?;
        let corrupt = FsError::Corrupted("block pointer outside the data region");

        let mut inode = Inode::new(FileKind::File);
        inode.size = BLOCK_SIZE as u32;
        inode.direct[0] = BlockPtr::new(1_000_000);
        assert_eq!(fs.lookup_block(&inode, 0), Err(corrupt));
        assert_eq!(fs.read_range(&inode, 0, 10), Err(corrupt));

        // an indirect pointer into the inode table
        let mut inode = Inode::new(FileKind::File);
        inode.indirect = BlockPtr::new(fs.sb.inode_start);
        assert_eq!(fs.lookup_block(&inode, 10), Err(corrupt));
        assert_eq!(fs.release_from(&mut inode, 0), Err(corrupt));

        // a valid address block holding a bad entry
        let table_block = fs.alloc_data_block()?;
        let mut table = AddressBlock::empty();
        table.set(3, BlockPtr::new(fs.sb.data_start - 1));
        fs.write_address_block(table_block, &table);
        let mut inode = Inode::new(FileKind::File);
        inode.indirect = BlockPtr::new(table_block);
        assert_eq!(fs.lookup_block(&inode, 13), Err(corrupt));
        assert_eq!(fs.lookup_block(&inode, 12), Err(FsError::NotFound));
        Ok(())
    }
}
