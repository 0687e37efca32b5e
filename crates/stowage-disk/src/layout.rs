//! On-disk layout of a store directory
//!
//! ```text
//! <path>/
//!   index            embedded index (+ index-wal, index-shm)
//!   data/<filename>  one file per file-backed value
//!   trash/<uuid>/    content staged for deletion, purged in the background
//! ```

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Index file name
pub const INDEX_FILE: &str = "index";

/// Content directory name
pub const DATA_DIR: &str = "data";

/// Trash directory name
pub const TRASH_DIR: &str = "trash";

/// Write-ahead log and shared-memory sidecars of the index
const INDEX_SIDECARS: [&str; 2] = ["-wal", "-shm"];

/// Paths of one store directory
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    index: PathBuf,
    data: PathBuf,
    trash: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index: root.join(INDEX_FILE),
            data: root.join(DATA_DIR),
            trash: root.join(TRASH_DIR),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> &Path {
        &self.index
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash
    }

    /// Create the root, content and trash directories
    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.data)?;
        fs::create_dir_all(&self.trash)
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.data.join(filename)
    }

    pub fn write_file(&self, filename: &str, bytes: &[u8]) -> io::Result<()> {
        fs::write(self.file_path(filename), bytes)
    }

    pub fn read_file(&self, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.file_path(filename))
    }

    /// Delete a content file; a missing file is not an error
    pub fn delete_file(&self, filename: &str) -> io::Result<()> {
        ignore_not_found(fs::remove_file(self.file_path(filename)))
    }

    /// Delete the index and its sidecars
    pub fn remove_index_files(&self) -> io::Result<()> {
        ignore_not_found(fs::remove_file(&self.index))?;
        for suffix in INDEX_SIDECARS {
            let mut name = OsString::from(self.index.as_os_str());
            name.push(suffix);
            ignore_not_found(fs::remove_file(PathBuf::from(name)))?;
        }
        Ok(())
    }

    /// Rename the content directory into `trash/<uuid>` and recreate it empty
    ///
    /// Returns the staged directory, or `None` if there was no content
    /// directory to move.
    pub fn move_data_to_trash(&self) -> io::Result<Option<PathBuf>> {
        fs::create_dir_all(&self.trash)?;
        let staged = if self.data.exists() {
            let dest = self.trash.join(Uuid::new_v4().to_string());
            fs::rename(&self.data, &dest)?;
            Some(dest)
        } else {
            None
        };
        fs::create_dir_all(&self.data)?;
        Ok(staged)
    }
}

/// Delete everything inside `dir`, keeping `dir` itself
///
/// Returns the number of top-level entries removed.
pub fn empty_dir(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            ignore_not_found(fs::remove_dir_all(&path))?;
        } else {
            ignore_not_found(fs::remove_file(&path))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Filenames are plain names inside the content directory
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_file_ops() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("store"));
        layout.create_dirs().unwrap();
        assert!(layout.data_dir().is_dir());
        assert!(layout.trash_dir().is_dir());
        assert_eq!(layout.index_path(), dir.path().join("store").join("index"));

        // Put
        layout.write_file("blob", b"hello").unwrap();
        assert_eq!(layout.read_file("blob").unwrap(), b"hello");

        // Delete twice
        layout.delete_file("blob").unwrap();
        layout.delete_file("blob").unwrap();
        assert!(layout.read_file("blob").is_err());
    }

    #[test]
    fn test_move_data_to_trash() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.create_dirs().unwrap();
        layout.write_file("a", b"1").unwrap();
        layout.write_file("b", b"2").unwrap();

        let staged = layout.move_data_to_trash().unwrap().unwrap();
        assert!(staged.starts_with(layout.trash_dir()));
        assert!(staged.join("a").exists());
        assert!(layout.data_dir().is_dir());
        assert_eq!(fs::read_dir(layout.data_dir()).unwrap().count(), 0);

        assert_eq!(empty_dir(layout.trash_dir()).unwrap(), 1);
        assert_eq!(fs::read_dir(layout.trash_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_index_files() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.create_dirs().unwrap();
        for name in ["index", "index-wal", "index-shm"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        layout.remove_index_files().unwrap();
        for name in ["index", "index-wal", "index-shm"] {
            assert!(!dir.path().join(name).exists());
        }
        // Nothing left to remove is fine
        layout.remove_index_files().unwrap();
    }

    #[test]
    fn test_valid_filenames() {
        assert!(is_valid_filename("0123abcd"));
        assert!(is_valid_filename("thumb.png"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename(".."));
        assert!(!is_valid_filename("../escape"));
        assert!(!is_valid_filename("nested/name"));
    }
}
