//! Line-oriented command interpreter over a mounted volume.
//!
//! One command per line. File system errors are reported and the loop goes
//! on; only I/O errors on the streams themselves end it.

use crate::cfs::{BlockDevice, Filesystem, FsError, Mode, MAX_FILE_SIZE};
use std::{
    io::{BufRead, Write},
    str::FromStr,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mkfs,
    Open { name: String, mode: Mode },
    Close(usize),
    Read { handle: usize, count: usize },
    Write { handle: usize, text: String },
    Lseek { handle: usize, offset: u64 },
    Mkdir(String),
    Rmdir(String),
    Cd(String),
    Link { old: String, new: String },
    Unlink(String),
    Stat(String),
    Ls,
    /// A file of `size` bytes cycling through `A..Z`.
    Create { name: String, size: usize },
    Cat(String),
    Exit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Self> {
        let mut args = line.split_whitespace();
        let name = args.next().ok_or_else(|| anyhow!("empty command"))?;
        let mut arg = |what: &str| -> anyhow::Result<String> {
            args.next()
                .map(String::from)
                .ok_or_else(|| anyhow!("{}: missing {}", name, what))
        };

        let command = match name {
            "mkfs" => Command::Mkfs,
            "open" => Command::Open {
                name: arg("name")?,
                mode: arg("mode")?.parse()?,
            },
            "close" => Command::Close(arg("fd")?.parse()?),
            "read" => Command::Read {
                handle: arg("fd")?.parse()?,
                count: arg("count")?.parse()?,
            },
            "write" => {
                let handle = arg("fd")?.parse()?;
                let text = args.by_ref().collect::<Vec<_>>().join(" ");
                return Ok(Command::Write { handle, text });
            }
            "lseek" => Command::Lseek {
                handle: arg("fd")?.parse()?,
                offset: arg("offset")?.parse()?,
            },
            "mkdir" => Command::Mkdir(arg("name")?),
            "rmdir" => Command::Rmdir(arg("name")?),
            "cd" => Command::Cd(arg("name")?),
            "link" => Command::Link {
                old: arg("source")?,
                new: arg("target")?,
            },
            "unlink" => Command::Unlink(arg("name")?),
            "stat" => Command::Stat(arg("name")?),
            "ls" => Command::Ls,
            "create" => Command::Create {
                name: arg("name")?,
                size: arg("size")?.parse()?,
            },
            "cat" => Command::Cat(arg("name")?),
            "exit" | "quit" => Command::Exit,
            _ => return Err(anyhow!("unknown command: {}", name)),
        };

        if args.next().is_some() {
            return Err(anyhow!("{}: too many arguments", name));
        }

        Ok(command)
    }
}

pub struct Shell<D: BlockDevice> {
    fs: Filesystem<D>,
}

impl<D: BlockDevice> Shell<D> {
    pub fn new(fs: Filesystem<D>) -> Self {
        Self { fs }
    }

    pub fn into_inner(self) -> Filesystem<D> {
        self.fs
    }

    /// Runs commands from `input` until `exit` or end of input.
    pub fn run<R, W>(&mut self, input: R, out: &mut W) -> anyhow::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(err) => {
                    writeln!(out, "Invalid command: {}", err)?;
                    continue;
                }
            };
            if command == Command::Exit {
                break;
            }
            self.execute(command, out)?;
        }

        out.flush()?;
        Ok(())
    }

    pub fn execute<W: Write>(&mut self, command: Command, out: &mut W) -> anyhow::Result<()> {
        match self.apply(command, out) {
            Ok(()) => Ok(()),
            Err(err) => match err.downcast::<FsError>() {
                Ok(err) => {
                    writeln!(out, "Error: {} ({:?})", err, err.errno())?;
                    Ok(())
                }
                Err(err) => Err(err),
            },
        }
    }

    fn apply<W: Write>(&mut self, command: Command, out: &mut W) -> anyhow::Result<()> {
        let fs = &mut self.fs;

        match command {
            Command::Mkfs => {
                fs.format()?;
                writeln!(out, "OK")?;
            }
            Command::Open { name, mode } => {
                let handle = fs.open(&name, mode)?;
                writeln!(out, "File handle is : {}", handle)?;
            }
            Command::Close(handle) => {
                fs.close(handle)?;
                writeln!(out, "OK")?;
            }
            Command::Read { handle, count } => {
                let data = fs.read(handle, count)?;
                out.write_all(&data)?;
                writeln!(out)?;
            }
            Command::Write { handle, text } => {
                let written = fs.write(handle, text.as_bytes())?;
                writeln!(out, "{} bytes written", written)?;
            }
            Command::Lseek { handle, offset } => {
                let offset = fs.lseek(handle, offset)?;
                writeln!(out, "Offset is : {}", offset)?;
            }
            Command::Mkdir(name) => {
                fs.mkdir(&name)?;
                writeln!(out, "OK")?;
            }
            Command::Rmdir(name) => {
                fs.rmdir(&name)?;
                writeln!(out, "OK")?;
            }
            Command::Cd(name) => {
                fs.chdir(&name)?;
                writeln!(out, "OK")?;
            }
            Command::Link { old, new } => {
                fs.link(&old, &new)?;
                writeln!(out, "OK")?;
            }
            Command::Unlink(name) => {
                fs.unlink(&name)?;
                writeln!(out, "OK")?;
            }
            Command::Stat(name) => {
                let st = fs.stat(&name)?;
                writeln!(out, "Inode: {}", st.inode)?;
                writeln!(out, "Type: {}", st.kind)?;
                writeln!(out, "Links: {}", st.link_count)?;
                writeln!(out, "Size: {}", st.size)?;
                writeln!(out, "Blocks: {}", st.blocks)?;
            }
            Command::Ls => {
                for entry in fs.list()? {
                    writeln!(
                        out,
                        "{:<32}{:>6}  {:<10}{:>3}",
                        entry.name, entry.inode, entry.kind, entry.link_count
                    )?;
                }
            }
            Command::Create { name, size } => {
                if let Some(handle) = fs.handle_of(&name) {
                    writeln!(out, "Error: {} is open as handle {}", name, handle)?;
                    return Ok(());
                }
                let data: Vec<u8> = (0..size.min(MAX_FILE_SIZE as usize))
                    .map(|i| b'A' + (i % 26) as u8)
                    .collect();
                let handle = fs.open(&name, Mode::WriteOnly)?;
                let written = fs.write(handle, &data);
                fs.close(handle)?;
                writeln!(out, "{} bytes written", written?)?;
            }
            Command::Cat(name) => {
                let data = fs.contents(&name)?;
                out.write_all(&data)?;
                writeln!(out)?;
            }
            Command::Exit => {}
        }

        Ok(())
    }
}
