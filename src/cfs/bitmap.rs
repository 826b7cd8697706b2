//! Free lists for inodes and data blocks.
//!
//! A bitmap lives in its own run of blocks on disk and is kept in memory
//! between operations. Bit `i` set means item `i` is in use; bits are packed
//! most significant first within each byte.

use super::{
    device::BlockDevice,
    error::{FsError, Result},
    util, BLOCK_SIZE,
};
use bitvec::prelude::*;

#[derive(Debug, Clone)]
pub struct Bitmap {
    start: u32,
    blocks: u32,
    bits: BitVec<u8, Msb0>,
    dirty: bool,
}

impl Bitmap {
    /// An all-free bitmap for `count` items stored at `start`.
    pub fn empty(start: u32, blocks: u32, count: u32) -> Self {
        Self {
            start,
            blocks,
            bits: bitvec![u8, Msb0; 0; count as usize],
            dirty: true,
        }
    }

    pub fn load<D>(device: &D, start: u32, blocks: u32, count: u32) -> Self
    where
        D: BlockDevice + ?Sized,
    {
        let byte_len = util::ceil_div(count as u64, 8) as usize;
        let mut bytes = Vec::with_capacity(blocks as usize * BLOCK_SIZE);
        let mut buf = [0u8; BLOCK_SIZE];
        for i in 0..blocks {
            device.read_block(start + i, &mut buf);
            bytes.extend_from_slice(&buf);
        }
        bytes.truncate(byte_len);

        let mut bits = BitVec::<u8, Msb0>::from_vec(bytes);
        bits.truncate(count as usize);

        Self {
            start,
            blocks,
            bits,
            dirty: false,
        }
    }

    pub fn save<D>(&mut self, device: &mut D)
    where
        D: BlockDevice + ?Sized,
    {
        let raw = self.bits.as_raw_slice();
        for i in 0..self.blocks as usize {
            let mut buf = [0u8; BLOCK_SIZE];
            let from = i * BLOCK_SIZE;
            if from < raw.len() {
                let to = raw.len().min(from + BLOCK_SIZE);
                buf[..to - from].copy_from_slice(&raw[from..to]);
            }
            device.write_block(self.start + i as u32, &buf);
        }
        self.dirty = false;
    }

    /// Claims the first free item and returns its index.
    pub fn find_free_bit(&mut self) -> Option<u32> {
        let index = self.bits.first_zero()?;
        self.bits.set(index, true);
        self.dirty = true;

        Some(index as u32)
    }

    pub fn set_bit(&mut self, index: u32) -> Result<()> {
        self.flip(index, true)
    }

    pub fn clear_bit(&mut self, index: u32) -> Result<()> {
        self.flip(index, false)
    }

    fn flip(&mut self, index: u32, value: bool) -> Result<()> {
        let index = index as usize;
        if index >= self.bits.len() {
            return Err(FsError::Corrupted("bitmap index out of range"));
        }
        self.bits.set(index, value);
        self.dirty = true;

        Ok(())
    }

    pub fn is_set(&self, index: u32) -> bool {
        self.bits
            .get(index as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn count_set(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Indices of every item in use.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::device::MemoryDevice;

    #[test]
    fn first_fit_is_msb_first() {
        let mut map = Bitmap::empty(1, 1, 16);
        assert_eq!(map.find_free_bit(), Some(0));
        assert_eq!(map.find_free_bit(), Some(1));
        assert_eq!(map.find_free_bit(), Some(2));
        assert_eq!(map.bits.as_raw_slice()[0], 0b1110_0000);

        map.clear_bit(1).unwrap();
        assert_eq!(map.find_free_bit(), Some(1));
        assert_eq!(map.find_free_bit(), Some(3));
    }

    #[test]
    fn exhaustion() {
        let mut map = Bitmap::empty(1, 1, 3);
        for expected in 0..3 {
            assert_eq!(map.find_free_bit(), Some(expected));
        }
        assert_eq!(map.find_free_bit(), None);
        assert_eq!(map.count_set(), 3);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let mut map = Bitmap::empty(1, 1, 10);
        assert!(map.set_bit(9).is_ok());
        assert_eq!(
            map.set_bit(10),
            Err(FsError::Corrupted("bitmap index out of range"))
        );
        assert!(!map.is_set(10));
    }

    #[test]
    fn save_and_load() {
        let mut dev = MemoryDevice::new(8);
        let mut map = Bitmap::empty(2, 2, 5000);
        map.set_bit(0).unwrap();
        map.set_bit(9).unwrap();
        map.set_bit(4999).unwrap();
        assert!(map.is_dirty());
        map.save(&mut dev);
        assert!(!map.is_dirty());

        let mut raw = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut raw);
        assert_eq!(raw[0], 0b1000_0000);
        assert_eq!(raw[1], 0b0100_0000);
        // bit 4999 is byte 624, which is byte 112 of the second block
        dev.read_block(3, &mut raw);
        assert_eq!(raw[112], 0b0000_0001);

        let loaded = Bitmap::load(&dev, 2, 2, 5000);
        assert_eq!(loaded.len(), 5000);
        assert_eq!(loaded.iter_set().collect::<Vec<_>>(), vec![0, 9, 4999]);
    }
}
