//! Block storage under the file system.
//!
//! The file system sees a volume as a flat array of `BLOCK_SIZE` blocks.
//! Reads and writes never fail and never complete partially; a device that
//! cannot honour that (real disks, fault injection) has to be wrapped before
//! it is handed to [`Filesystem`](super::Filesystem).

use super::BLOCK_SIZE;
use anyhow::anyhow;
use memmap::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

pub type Block = [u8; BLOCK_SIZE];

pub trait BlockDevice {
    /// Number of addressable blocks.
    fn block_count(&self) -> u32;

    fn init(&mut self) {}

    fn read_block(&self, block: u32, buf: &mut Block);

    fn write_block(&mut self, block: u32, buf: &Block);

    /// Pushes written blocks to the backing store.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(blocks: u32) -> Self {
        Self {
            data: vec![0; blocks as usize * BLOCK_SIZE],
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn block_count(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    fn read_block(&self, block: u32, buf: &mut Block) {
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
    }

    fn write_block(&mut self, block: u32, buf: &Block) {
        let start = block as usize * BLOCK_SIZE;
        self.data[start..start + BLOCK_SIZE].copy_from_slice(buf);
    }
}

/// A volume kept in a regular file, mapped into memory.
#[derive(Debug)]
pub struct ImageDevice {
    mmap: MmapMut,
    blocks: u32,
}

impl ImageDevice {
    /// Creates a zero-filled image of `blocks` blocks. Fails if `path` exists.
    pub fn create<P>(path: P, blocks: u32) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(blocks as u64 * BLOCK_SIZE as u64)?;

        Self::map(file)
    }

    pub fn open<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        Self::map(file)
    }

    fn map(file: File) -> anyhow::Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 || len % BLOCK_SIZE as u64 != 0 {
            return Err(anyhow!(
                "image size {} is not a whole number of {}-byte blocks",
                len,
                BLOCK_SIZE
            ));
        }

        let blocks = u32::try_from(len / BLOCK_SIZE as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self { mmap, blocks })
    }
}

impl BlockDevice for ImageDevice {
    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_block(&self, block: u32, buf: &mut Block) {
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.mmap[start..start + BLOCK_SIZE]);
    }

    fn write_block(&mut self, block: u32, buf: &Block) {
        let start = block as usize * BLOCK_SIZE;
        self.mmap[start..start + BLOCK_SIZE].copy_from_slice(buf);
    }

    fn flush(&mut self) -> io::Result<()> {
        self.mmap.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn memory_device_round_trip() {
        let mut dev = MemoryDevice::new(4);
        assert_eq!(dev.block_count(), 4);

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        dev.write_block(3, &block);

        let mut out = [0u8; BLOCK_SIZE];
        dev.read_block(3, &mut out);
        assert_eq!(out[..], block[..]);

        dev.read_block(2, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn image_device_persists() -> anyhow::Result<()> {
        let path = tmp_image("image_device_persists")?;

        {
            let mut dev = ImageDevice::create(&path, 8)?;
            assert_eq!(dev.block_count(), 8);
            let block = [7u8; BLOCK_SIZE];
            dev.write_block(5, &block);
            dev.flush()?;
        }

        let dev = ImageDevice::open(&path)?;
        let mut out = [0u8; BLOCK_SIZE];
        dev.read_block(5, &mut out);
        assert!(out.iter().all(|&b| b == 7));
        assert_eq!(std::fs::metadata(&path)?.len(), 8 * BLOCK_SIZE as u64);

        Ok(std::fs::remove_file(&path)?)
    }

    #[test]
    fn image_device_refuses_existing_file() -> anyhow::Result<()> {
        let path = tmp_image("image_device_refuses_existing_file")?;
        std::fs::write(&path, vec![0u8; BLOCK_SIZE])?;

        assert!(ImageDevice::create(&path, 4).is_err());

        Ok(std::fs::remove_file(&path)?)
    }

    #[test]
    fn image_device_rejects_partial_block() -> anyhow::Result<()> {
        let path = tmp_image("image_device_rejects_partial_block")?;
        std::fs::write(&path, vec![0u8; BLOCK_SIZE + 1])?;

        assert!(ImageDevice::open(&path).is_err());

        Ok(std::fs::remove_file(&path)?)
    }

    fn tmp_image(name: &str) -> anyhow::Result<PathBuf> {
        let mut tmp_file = std::env::temp_dir();
        tmp_file.push(name);
        tmp_file.set_extension("img");
        if tmp_file.exists() {
            std::fs::remove_file(&tmp_file)?;
        }

        Ok(tmp_file)
    }
}
