use super::{
    error::{FsError, Result},
    MAX_FILE_NAME,
};

pub fn calculate_checksum<S>(s: &S) -> Result<u32>
where
    S: serde::Serialize,
{
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bincode::serialize(&s)?);
    Ok(hasher.finalize())
}

pub fn ceil_div(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

pub fn trim_nul(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

/// Names are stored NUL-terminated in a fixed field.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty name"));
    }
    if name.len() >= MAX_FILE_NAME {
        return Err(FsError::InvalidArgument("name too long"));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(FsError::InvalidArgument("name contains '/' or NUL"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 512), 0);
        assert_eq!(ceil_div(1, 512), 1);
        assert_eq!(ceil_div(512, 512), 1);
        assert_eq!(ceil_div(513, 512), 2);
    }

    #[test]
    fn trims_at_first_nul() {
        assert_eq!(trim_nul(b"ab\0\0"), b"ab");
        assert_eq!(trim_nul(b"abc"), b"abc");
        assert_eq!(trim_nul(b"\0bc"), b"");
    }

    #[test]
    fn names() {
        assert!(validate_name("file.txt").is_ok());
        assert!(validate_name("..").is_ok());
        assert_eq!(validate_name(""), Err(FsError::InvalidArgument("empty name")));
        assert_eq!(
            validate_name(&"n".repeat(32)),
            Err(FsError::InvalidArgument("name too long"))
        );
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn checksum_changes_with_content() -> anyhow::Result<()> {
        let a = calculate_checksum(&(1u32, 2u32))?;
        let b = calculate_checksum(&(1u32, 3u32))?;
        assert_ne!(a, b);
        assert_eq!(a, calculate_checksum(&(1u32, 2u32))?);
        Ok(())
    }
}
