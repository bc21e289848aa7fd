//! Storage directory abstraction
//!
//! A directory is a flat, named-file byte store. The replication core only
//! needs to list, stream, copy, durably flush and delete files; everything
//! else about the storage engine stays behind this trait.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

/// Named-file byte store
pub trait Directory: Send + Sync + fmt::Debug {
    /// List every file name, sorted
    fn list_all(&self) -> Result<Vec<String>>;

    /// Check whether a file exists
    fn file_exists(&self, name: &str) -> Result<bool>;

    /// Length of a file in bytes
    fn file_length(&self, name: &str) -> Result<u64>;

    /// Open a file for reading
    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Create a file for writing, replacing any existing file of that name
    fn create_output(&self, name: &str) -> Result<Box<dyn Write + Send>>;

    /// Durably flush the named files
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Delete a file
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;

    /// Copy `src_name` from this directory into `dest` as `dest_name`.
    ///
    /// Returns the number of bytes copied. The copy is not synced.
    fn copy_to(&self, dest: &dyn Directory, src_name: &str, dest_name: &str) -> Result<u64> {
        let mut input = self.open_input(src_name)?;
        let mut output = dest.create_output(dest_name)?;
        let copied = io::copy(&mut input, &mut output)?;
        output.flush()?;
        Ok(copied)
    }
}

/// Whether two handles point at the very same directory instance.
pub fn same_directory(a: &Arc<dyn Directory>, b: &Arc<dyn Directory>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Directory backed by a single filesystem directory
#[derive(Debug, Clone)]
pub struct FsDirectory {
    path: PathBuf,
}

impl FsDirectory {
    /// Open a directory, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Filesystem path of this directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn sync_dir(&self) -> Result<()> {
        // Directory handles cannot be fsynced on every platform
        #[cfg(unix)]
        {
            let dir = OpenOptions::new().read(true).open(&self.path)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.file_path(name).is_file())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.file_path(name))?.len())
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.file_path(name))?;
        Ok(Box::new(file))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = OpenOptions::new().read(true).open(self.file_path(name))?;
            file.sync_all()?;
        }
        // make new directory entries durable as well
        self.sync_dir()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.file_path(name))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

type RamFiles = Arc<Mutex<HashMap<String, Bytes>>>;

/// In-memory directory
///
/// Useful as a staging area and in tests. `sync` is a no-op.
#[derive(Debug, Clone, Default)]
pub struct RamDirectory {
    files: RamFiles,
}

impl RamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file in one step
    pub fn put(&self, name: &str, data: impl Into<Bytes>) {
        self.lock().insert(name.to_string(), data.into());
    }

    /// Contents of a file, if present
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(name: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", name))
    }
}

impl Directory for RamDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().contains_key(name))
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.lock()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Self::not_found(name).into())
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.get(name).ok_or_else(|| Self::not_found(name))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        self.lock().insert(name.to_string(), Bytes::new());
        Ok(Box::new(RamOutput {
            name: name.to_string(),
            buf: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.file_exists(name)? {
                return Err(Self::not_found(name).into());
            }
        }
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name).into())
    }

    fn describe(&self) -> String {
        format!("ram@{:p}", Arc::as_ptr(&self.files))
    }
}

/// Writer that publishes its buffer into the owning `RamDirectory`
struct RamOutput {
    name: String,
    buf: Vec<u8>,
    files: RamFiles,
}

impl RamOutput {
    fn publish(&self) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.name.clone(), Bytes::copy_from_slice(&self.buf));
    }
}

impl Write for RamOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for RamOutput {
    fn drop(&mut self) {
        self.publish();
    }
}
