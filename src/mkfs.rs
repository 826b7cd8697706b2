use crate::cfs::{
    types::{Geometry, Superblock},
    util, Filesystem, ImageDevice, BLOCK_SIZE, DEFAULT_FS_SIZE, INODE_SIZE,
};
use anyhow::anyhow;
use byte_unit::Byte;
use log::info;
use std::path::Path;

/// Creates the image at `path` and formats it. Fails if `path` exists.
pub fn make<P>(path: P, size: u64, inodes: u32, descriptors: u32) -> anyhow::Result<Superblock>
where
    P: AsRef<Path>,
{
    let blocks = u32::try_from(util::ceil_div(size, BLOCK_SIZE as u64))
        .map_err(|_| anyhow!("{} is too large for a volume", Byte::from_bytes(size).get_appropriate_unit(true)))?;
    let geometry = Geometry {
        total_blocks: blocks,
        inode_count: inodes,
        fd_table_size: descriptors,
    };

    if let Err(err) = Superblock::new(&geometry) {
        return Err(anyhow!(
            "Volume size must be at least {} for {} inodes ({})",
            Byte::from_bytes(minimum_size(inodes)).get_appropriate_unit(true),
            inodes,
            err
        ));
    }

    let device = ImageDevice::create(path.as_ref(), blocks)?;
    let mut fs = Filesystem::mkfs(device, &geometry)?;
    fs.flush()?;
    info!("created {}", path.as_ref().display());

    Ok(fs.superblock().clone())
}

/// Mounts the image at `path`, creating and formatting a default one first
/// when the file does not exist.
pub fn mount(path: &Path) -> anyhow::Result<Filesystem<ImageDevice>> {
    let device = if path.exists() {
        ImageDevice::open(path)?
    } else {
        info!("{} not found, creating it", path.display());
        ImageDevice::create(path, DEFAULT_FS_SIZE)?
    };

    Ok(Filesystem::init(device)?)
}

// superblock, both bitmaps, the inode table and one data block
fn minimum_size(inodes: u32) -> u64 {
    let inodes = inodes as u64;
    let block = BLOCK_SIZE as u64;
    let inode_map = util::ceil_div(util::ceil_div(inodes, 8), block);
    let table = util::ceil_div(inodes * INODE_SIZE as u64, block);

    (1 + inode_map + 1 + table + 1) * block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::{Mode, DEFAULT_INODE_COUNT};
    use std::path::PathBuf;

    #[test]
    fn make_and_mount() -> anyhow::Result<()> {
        let path = tmp_image("cfs_make_and_mount")?;

        let sb = make(&path, 2 * 1024 * 1024, DEFAULT_INODE_COUNT, 5)?;
        assert_eq!(sb.disk_size, 4096);
        assert_eq!(std::fs::metadata(&path)?.len(), 2 * 1024 * 1024);
        assert!(make(&path, 2 * 1024 * 1024, DEFAULT_INODE_COUNT, 5).is_err());

        let mut fs = mount(&path)?;
        assert_eq!(fs.superblock(), &sb);
        let h = fs.open("f", Mode::WriteOnly)?;
        fs.write(h, b"on disk")?;
        fs.close(h)?;
        fs.flush()?;
        drop(fs);

        let fs = mount(&path)?;
        assert_eq!(fs.contents("f")?, b"on disk");

        Ok(std::fs::remove_file(&path)?)
    }

    #[test]
    fn size_rounds_up_to_whole_blocks() -> anyhow::Result<()> {
        let path = tmp_image("cfs_size_rounds_up")?;

        let sb = make(&path, 100 * 1024 + 1, 32, 3)?;
        assert_eq!(sb.disk_size, 201);
        assert_eq!(sb.fd_table_size, 3);

        Ok(std::fs::remove_file(&path)?)
    }

    #[test]
    fn too_small() -> anyhow::Result<()> {
        let path = tmp_image("cfs_too_small")?;

        let err = make(&path, 16 * 1024, DEFAULT_INODE_COUNT, 5).unwrap_err();
        assert!(err.to_string().starts_with("Volume size must be at least"));
        assert!(!path.exists());
        assert_eq!(minimum_size(DEFAULT_INODE_COUNT), 60 * BLOCK_SIZE as u64);

        Ok(())
    }

    #[test]
    fn mount_creates_a_missing_image() -> anyhow::Result<()> {
        let path = tmp_image("cfs_mount_creates")?;

        let fs = mount(&path)?;
        assert_eq!(fs.superblock().disk_size, DEFAULT_FS_SIZE);
        assert_eq!(fs.list()?.len(), 2);

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
