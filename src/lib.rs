//! An inode file system over a flat array of 512-byte blocks, plus the image
//! tooling and command shell the `cfs` binary drives.

#[macro_use]
extern crate anyhow;

pub mod cfs;
pub mod mkfs;
pub mod shell;
