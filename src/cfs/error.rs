use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("no space left on volume")]
    NoSpace,
    #[error("bad file descriptor")]
    InvalidHandle,
    #[error("file descriptor table is full")]
    TableFull,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("end of file")]
    EndOfFile,
    #[error("file too large")]
    FileTooLarge,
    #[error("corrupted volume: {0}")]
    Corrupted(&'static str),
}

impl FsError {
    pub fn errno(&self) -> Errno {
        match self {
            FsError::NotFound => Errno::ENOENT,
            FsError::AlreadyExists => Errno::EEXIST,
            FsError::NotADirectory => Errno::ENOTDIR,
            FsError::IsADirectory => Errno::EISDIR,
            FsError::NoSpace => Errno::ENOSPC,
            FsError::InvalidHandle => Errno::EBADF,
            FsError::TableFull => Errno::EMFILE,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::InvalidArgument(_) => Errno::EINVAL,
            FsError::EndOfFile => Errno::ENODATA,
            FsError::FileTooLarge => Errno::EFBIG,
            FsError::Corrupted(_) => Errno::EIO,
        }
    }
}

impl From<bincode::Error> for FsError {
    fn from(_: bincode::Error) -> Self {
        FsError::Corrupted("undecodable record")
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), Errno::ENOENT);
        assert_eq!(FsError::NoSpace.errno(), Errno::ENOSPC);
        assert_eq!(FsError::TableFull.errno(), Errno::EMFILE);
        assert_eq!(FsError::InvalidArgument("x").errno(), Errno::EINVAL);
    }

    #[test]
    fn display() {
        assert_eq!(FsError::NotEmpty.to_string(), "directory not empty");
        assert_eq!(
            FsError::InvalidArgument("name too long").to_string(),
            "invalid argument: name too long"
        );
    }
}
