//! Inode table access.
//!
//! Records are `INODE_SIZE` bytes packed back to back from the first table
//! block, so one record may straddle two blocks. Both directions go through
//! the whole span.

use super::{
    device::BlockDevice,
    error::{FsError, Result},
    types::Inode,
    BLOCK_SIZE, INODE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeTable {
    start: u32,
    count: u32,
}

impl InodeTable {
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    // (first block, number of blocks, offset inside the first block)
    fn span(&self, inode_number: u32) -> Result<(u32, u32, usize)> {
        if inode_number >= self.count {
            return Err(FsError::NotFound);
        }

        let offset = inode_number as usize * INODE_SIZE;
        let first = offset / BLOCK_SIZE;
        let last = (offset + INODE_SIZE - 1) / BLOCK_SIZE;

        Ok((
            self.start + first as u32,
            (last - first + 1) as u32,
            offset % BLOCK_SIZE,
        ))
    }

    fn read_span<D>(device: &D, first: u32, blocks: u32) -> Vec<u8>
    where
        D: BlockDevice + ?Sized,
    {
        let mut buf = vec![0u8; blocks as usize * BLOCK_SIZE];
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            device.read_block(first + i as u32, &mut block);
            chunk.copy_from_slice(&block);
        }

        buf
    }

    pub fn find<D>(&self, device: &D, inode_number: u32) -> Result<Inode>
    where
        D: BlockDevice + ?Sized,
    {
        let (first, blocks, offset) = self.span(inode_number)?;
        let buf = Self::read_span(device, first, blocks);

        Ok(bincode::deserialize(&buf[offset..offset + INODE_SIZE])?)
    }

    pub fn save<D>(&self, device: &mut D, inode_number: u32, inode: &Inode) -> Result<()>
    where
        D: BlockDevice + ?Sized,
    {
        let (first, blocks, offset) = self.span(inode_number)?;
        let mut buf = Self::read_span(&*device, first, blocks);
        let bytes = bincode::serialize(inode)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(&bytes);

        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            device.write_block(first + i as u32, &block);
        }

        Ok(())
    }

    /// Zero-fills the `blocks` table blocks.
    pub fn clear<D>(&self, device: &mut D, blocks: u32)
    where
        D: BlockDevice + ?Sized,
    {
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..blocks {
            device.write_block(self.start + i, &zero);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::{
        device::MemoryDevice,
        types::{BlockPtr, FileKind},
    };

    #[test]
    fn span_straddles_blocks() -> anyhow::Result<()> {
        let table = InodeTable::new(3, 512);
        assert_eq!(table.span(0)?, (3, 1, 0));
        // 9 * 56 = 504, record ends at 559
        assert_eq!(table.span(9)?, (3, 2, 504));
        assert_eq!(table.span(10)?, (4, 1, 48));
        assert_eq!(table.span(511)?, (3 + 55, 1, 456));
        assert_eq!(table.span(512), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn save_and_find() -> anyhow::Result<()> {
        let mut dev = MemoryDevice::new(64);
        let table = InodeTable::new(3, 512);
        table.clear(&mut dev, 56);

        let mut straddling = Inode::new(FileKind::File);
        straddling.size = 1234;
        straddling.direct[9] = BlockPtr::new(77);
        straddling.indirect = BlockPtr::new(78);
        table.save(&mut dev, 9, &straddling)?;

        let mut neighbour = Inode::new(FileKind::Directory);
        neighbour.link_count = 3;
        table.save(&mut dev, 10, &neighbour)?;
        table.save(&mut dev, 8, &Inode::new(FileKind::File))?;

        assert_eq!(table.find(&dev, 9)?, straddling);
        assert_eq!(table.find(&dev, 10)?, neighbour);
        assert_eq!(table.find(&dev, 8)?.link_count, 1);
        assert_eq!(table.find(&dev, 600), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn new_inode_defaults() {
        let inode = Inode::new(FileKind::File);
        assert_eq!(inode.link_count, 1);
        assert_eq!(inode.size, 0);
        assert!(inode.direct.iter().all(|p| !p.is_set()));
        assert!(!inode.indirect.is_set());
    }
}
