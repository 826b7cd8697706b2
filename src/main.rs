#[macro_use]
extern crate anyhow;

use cfs::{mkfs, shell};
use clap::{arg, value_parser, Arg, ArgMatches, Command};
use std::{io, path::Path};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .subcommand(
            Command::new("mkfs")
                .about("Create a new file system image")
                .arg(arg!(<image> "Location of the new file system image"))
                .arg(
                    Arg::new("size")
                        .short('s')
                        .long("size")
                        .value_name("SIZE")
                        .help("Total size of the volume, rounded up to whole 512-byte blocks")
                        .default_value("2MiB"),
                )
                .arg(
                    Arg::new("inodes")
                        .short('i')
                        .long("inodes")
                        .value_name("COUNT")
                        .help("Number of inodes")
                        .value_parser(value_parser!(u32))
                        .default_value("512"),
                )
                .arg(
                    Arg::new("descriptors")
                        .short('d')
                        .long("descriptors")
                        .value_name("COUNT")
                        .help("Number of files that can be open at once")
                        .value_parser(value_parser!(u32))
                        .default_value("5"),
                ),
        )
        .subcommand(
            Command::new("shell")
                .about("Run file system commands read from stdin against an image")
                .arg(arg!(<image> "Location of the file system image; created when missing")),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("mkfs", matches)) => {
            let image = required::<String>(matches, "image")?;
            let size = required::<String>(matches, "size")?;
            let size = match byte_unit::Byte::from_str(size) {
                Ok(size) => size.get_bytes(),
                Err(err) => return Err(anyhow!(err)),
            };

            let sb = mkfs::make(
                image,
                size,
                *required::<u32>(matches, "inodes")?,
                *required::<u32>(matches, "descriptors")?,
            )?;
            println!(
                "{}: {} blocks, {} inodes, {} data blocks",
                image, sb.disk_size, sb.inode_count, sb.data_block_count
            );
        }
        Some(("shell", matches)) => {
            let image = required::<String>(matches, "image")?;
            let fs = mkfs::mount(Path::new(image))?;

            let mut shell = shell::Shell::new(fs);
            shell.run(io::stdin().lock(), &mut io::stdout().lock())?;
            shell.into_inner().flush()?;
        }
        _ => unreachable!("a subcommand is required"),
    }

    Ok(())
}

fn required<'a, T>(matches: &'a ArgMatches, id: &str) -> anyhow::Result<&'a T>
where
    T: Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(id)
        .ok_or_else(|| anyhow!("missing argument <{}>", id))
}
