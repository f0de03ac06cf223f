use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Disk operations the store needs, behind a seam so tests and embedders can
/// substitute their own storage. All methods operate on whole paths; the
/// store never walks directories itself except through `delete_contents`.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    /// Create a directory and any missing parents. Existing is fine.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    /// Open a file for reading from the start.
    fn source(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    /// Open a file for writing, truncating any previous contents.
    fn sink(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    /// Open a file for appending, creating it if absent.
    fn appending_sink(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    /// Delete a file. Deleting a file that does not exist is not an error.
    fn delete(&self, path: &Path) -> io::Result<()>;
    /// Atomically rename `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn size(&self, path: &Path) -> io::Result<u64>;
    /// Recursively delete everything inside `dir`, keeping `dir` itself.
    fn delete_contents(&self, dir: &Path) -> io::Result<()>;
}

/// The production implementation over `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn source(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn sink(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(path)?))
    }

    fn appending_sink(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(
            OpenOptions::new().append(true).create(true).open(path)?,
        ))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn delete_contents(&self, dir: &Path) -> io::Result<()> {
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_delete_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let fs = StdFileSystem;
        assert!(fs.delete(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_appending_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let fs = StdFileSystem;
        fs.appending_sink(&path).unwrap().write_all(b"one\n").unwrap();
        fs.appending_sink(&path).unwrap().write_all(b"two\n").unwrap();
        let mut contents = String::new();
        fs.source(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!("one\ntwo\n", contents);
        assert_eq!(8, fs.size(&path).unwrap());
    }

    #[test]
    fn test_delete_contents_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let fs = StdFileSystem;
        fs.sink(&dir.path().join("a")).unwrap().write_all(b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        fs.sink(&dir.path().join("sub").join("b"))
            .unwrap()
            .write_all(b"y")
            .unwrap();
        fs.delete_contents(dir.path()).unwrap();
        assert!(dir.path().exists());
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }
}
