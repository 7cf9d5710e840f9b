//! Real file system access

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};

use super::FileSystem;

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))
    }

    fn append(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {:?} for append", path))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to append to {:?}", path))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create {:?}", path))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove {:?}", path))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("Failed to list {:?}", path))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn write_mode(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        // mode() only applies on creation; existing files are chmodded first.
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to chmod {:o} {:?}", mode, path))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_append_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pacman.conf");
        let fs = OsFileSystem;
        fs.write(&path, "[options]\n").unwrap();
        fs.append(&path, "Color\n").unwrap();
        assert_eq!(fs.read_to_string(&path).unwrap(), "[options]\nColor\n");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let fs = OsFileSystem;
        fs.remove_file(&dir.path().join("nope")).unwrap();
        fs.remove_dir_all(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn test_list_dir_sorted_and_write_mode() {
        let dir = TempDir::new().unwrap();
        let fs = OsFileSystem;
        fs.write(&dir.path().join("b"), "").unwrap();
        fs.write(&dir.path().join("a"), "").unwrap();
        assert_eq!(fs.list_dir(dir.path()).unwrap(), vec!["a", "b"]);

        fs.write_mode(&dir.path().join("a"), "secret", 0o600).unwrap();
        let mode = std::fs::metadata(dir.path().join("a")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs.read_to_string(&dir.path().join("a")).unwrap(), "secret");
    }
}
