//! Atomic small-file helpers
//!
//! Every helper here follows the write-fsync-rename-fsync pattern:
//! 1. Write to a sibling temporary file
//! 2. fsync the temporary file
//! 3. Atomic rename onto the final path
//! 4. fsync the parent directory
//!
//! A reader therefore sees either the old content or the new content, never
//! a torn write.

use depot_core::CommitError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// fsync a directory so a completed rename survives power loss
pub fn sync_dir(dir: &Path) -> Result<(), CommitError> {
    let handle = File::open(dir).map_err(|e| CommitError::io(dir, e))?;
    handle.sync_all().map_err(|e| CommitError::io(dir, e))
}

/// Replace `path` with `data` atomically
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CommitError> {
    let parent = path
        .parent()
        .ok_or_else(|| CommitError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent).map_err(|e| CommitError::io(parent, e))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(tmp_path)
        .map_err(|e| CommitError::io(tmp_path, e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| CommitError::io(tmp_path, e))?;
    drop(file);

    fs::rename(tmp_path, path).map_err(|e| CommitError::io(path, e))?;
    sync_dir(parent)
}

/// Remove `path`, treating absence as success
pub fn remove_if_exists(path: &Path) -> Result<bool, CommitError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CommitError::io(path, e)),
    }
}

/// Read a file, returning `None` if it does not exist
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, CommitError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CommitError::io(path, e)),
    }
}

/// Store an integer as decimal text, atomically
pub fn write_int_to_file(path: &Path, value: u64) -> Result<(), CommitError> {
    write_atomic(path, value.to_string().as_bytes())
}

/// Read an integer written by [`write_int_to_file`], or `default` if absent
pub fn read_int_from_file(path: &Path, default: u64) -> Result<u64, CommitError> {
    match read_if_exists(path)? {
        None => Ok(default),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                CommitError::io(
                    path,
                    io::Error::new(io::ErrorKind::InvalidData, "not an integer"),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("file");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("sub"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_int_file_roundtrip_and_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".event_serial");
        assert_eq!(read_int_from_file(&path, 7).unwrap(), 7);
        write_int_to_file(&path, 42).unwrap();
        assert_eq!(read_int_from_file(&path, 0).unwrap(), 42);
    }

    #[test]
    fn test_int_file_garbage_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n");
        fs::write(&path, b"abc").unwrap();
        assert!(read_int_from_file(&path, 0).is_err());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
