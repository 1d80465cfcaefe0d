//! Filesystem helpers used by stats, merge, and backup.

use std::fs;
use std::path::Path;

use crate::error::Result;

/// Total size in bytes of all files under `dir`, recursively.
pub(crate) fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Free bytes on the filesystem holding `dir`.
pub(crate) fn available_disk_size(dir: &Path) -> Result<u64> {
    Ok(fs2::available_space(dir)?)
}

/// Copies the tree under `src` into `dst`, skipping entries whose file name
/// appears in `exclude`.
pub(crate) fn copy_dir(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|skip| name == *skip) {
            continue;
        }
        let target = dst.join(&name);
        if entry.metadata()?.is_dir() {
            copy_dir(&entry.path(), &target, exclude)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;

    use super::*;

    /// Fixed-width numbered key used across the engine tests.
    pub(crate) fn test_key(n: usize) -> Bytes {
        Bytes::from(format!("siltstone-key-{n:09}"))
    }

    /// Deterministic filler value of exactly `len` bytes.
    pub(crate) fn test_value(n: usize, len: usize) -> Bytes {
        let pattern = format!("siltstone-value-{n:09}-");
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let take = (len - out.len()).min(pattern.len());
            out.extend_from_slice(&pattern.as_bytes()[..take]);
        }
        Bytes::from(out)
    }

    #[test]
    fn dir_size_sums_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a"), b"12345").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), b"123").unwrap();

        assert_eq!(dir_size(dir.path()).unwrap(), 8);
    }

    #[test]
    fn copy_dir_skips_excluded_names() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        fs::write(src.path().join("keep"), b"data").unwrap();
        fs::write(src.path().join("filelock"), b"").unwrap();

        let target = dst.path().join("backup");
        copy_dir(src.path(), &target, &["filelock"]).unwrap();

        assert!(target.join("keep").is_file());
        assert!(!target.join("filelock").exists());
    }

    #[test]
    fn test_value_has_requested_length() {
        assert_eq!(test_value(7, 128).len(), 128);
        assert_eq!(test_value(7, 3).len(), 3);
    }
}
