// SPDX-License-Identifier: MIT OR Apache-2.0

//! The random-access storage seam.
//!
//! The engine persists through four logical files, routed by name through a
//! [`Storage`] factory: `oplog` (header), `tree` (node records), `bitfield`
//! and `data` (block records). Implementations only need dumb positioned
//! reads and writes; all structure lives above this seam.
//!
//! Both traits are async so implementations can do real I/O without ever
//! stalling the runtime the replicator runs on. [`DirStorage`] shunts its
//! blocking filesystem calls onto the blocking pool; [`MemoryStorage`]
//! resolves immediately.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

/// A single random-access file.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError>;
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;
    async fn truncate(&mut self, length: u64) -> Result<(), StorageError>;
    async fn len(&self) -> Result<u64, StorageError>;
    async fn sync(&mut self) -> Result<(), StorageError>;

    /// Read the whole file.
    async fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let length = self.len().await?;
        self.read_at(0, length as usize).await
    }
}

/// Factory routing logical file names to backends.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn open(&self, name: &str) -> Result<Box<dyn StorageBackend>, StorageError>;

    /// Whether a previously created store exists under this factory.
    async fn exists(&self) -> Result<bool, StorageError>;

    /// Remove all files of the store, for `overwrite` opens.
    async fn destroy(&self) -> Result<(), StorageError>;

    /// Release any lock held on the store. Called once on close.
    async fn unlock(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Errors which can occur on the storage seam.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("read of {length} bytes at {offset} is out of bounds")]
    OutOfBounds { offset: u64, length: usize },

    #[error("store is already locked by another process")]
    AlreadyLocked,
}

// Run one blocking filesystem operation on the blocking pool.
async fn blocking<T>(
    op: impl FnOnce() -> Result<T, StorageError> + Send + 'static,
) -> Result<T, StorageError>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .expect("blocking storage task")
}

/// In-memory storage, for tests and ephemeral logs.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryFile {
    name: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl StorageBackend for MemoryFile {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let files = self.files.lock().expect("memory storage lock");
        let data = files.get(&self.name).map(Vec::as_slice).unwrap_or(&[]);
        let start = offset as usize;
        let end = start + length;
        if end > data.len() {
            return Err(StorageError::OutOfBounds { offset, length });
        }
        Ok(data[start..end].to_vec())
    }

    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut files = self.files.lock().expect("memory storage lock");
        let data = files.entry(self.name.clone()).or_default();
        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn truncate(&mut self, length: u64) -> Result<(), StorageError> {
        let mut files = self.files.lock().expect("memory storage lock");
        let data = files.entry(self.name.clone()).or_default();
        data.resize(length as usize, 0);
        Ok(())
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let files = self.files.lock().expect("memory storage lock");
        Ok(files.get(&self.name).map(Vec::len).unwrap_or(0) as u64)
    }

    async fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Box<dyn StorageBackend>, StorageError> {
        Ok(Box::new(MemoryFile {
            name: name.to_owned(),
            files: self.files.clone(),
        }))
    }

    async fn exists(&self) -> Result<bool, StorageError> {
        let files = self.files.lock().expect("memory storage lock");
        Ok(files.contains_key("oplog"))
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let mut files = self.files.lock().expect("memory storage lock");
        files.clear();
        Ok(())
    }
}

/// Directory-backed storage: one file per logical name under `path`.
///
/// Opening the `oplog` file takes an advisory lock (a `.lock` file created
/// with `create_new`), so two processes cannot extend the same store at once.
/// The lock is released by [`Storage::unlock`], or swept by a later open if
/// the owning process died.
pub struct DirStorage {
    path: PathBuf,
    locked: Arc<Mutex<bool>>,
}

impl DirStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            locked: Arc::new(Mutex::new(false)),
        }
    }
}

fn acquire_lock(path: &Path, locked: &Mutex<bool>) -> Result<(), StorageError> {
    let mut locked = locked.lock().expect("dir storage lock state");
    if *locked {
        return Ok(());
    }
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path.join("oplog.lock"))
    {
        Ok(mut file) => {
            let _ = write!(file, "{}", std::process::id());
            *locked = true;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(StorageError::AlreadyLocked)
        }
        Err(err) => Err(err.into()),
    }
}

struct DirFile {
    file: Arc<File>,
}

#[async_trait]
impl StorageBackend for DirFile {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let file = self.file.clone();
        blocking(move || {
            let file_length = file.metadata()?.len();
            if offset + length as u64 > file_length {
                return Err(StorageError::OutOfBounds { offset, length });
            }
            let mut handle = &*file;
            handle.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; length];
            handle.read_exact(&mut buffer)?;
            Ok(buffer)
        })
        .await
    }

    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let file = self.file.clone();
        let bytes = bytes.to_vec();
        blocking(move || {
            let mut handle = &*file;
            handle.seek(SeekFrom::Start(offset))?;
            handle.write_all(&bytes)?;
            Ok(())
        })
        .await
    }

    async fn truncate(&mut self, length: u64) -> Result<(), StorageError> {
        let file = self.file.clone();
        blocking(move || {
            file.set_len(length)?;
            Ok(())
        })
        .await
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let file = self.file.clone();
        blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn sync(&mut self) -> Result<(), StorageError> {
        let file = self.file.clone();
        blocking(move || {
            file.sync_data()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Storage for DirStorage {
    async fn open(&self, name: &str) -> Result<Box<dyn StorageBackend>, StorageError> {
        let path = self.path.clone();
        let locked = self.locked.clone();
        let name = name.to_owned();
        let file = blocking(move || {
            fs::create_dir_all(&path)?;
            if name == "oplog" {
                acquire_lock(&path, &locked)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path.join(&name))?;
            Ok(file)
        })
        .await?;
        Ok(Box::new(DirFile {
            file: Arc::new(file),
        }))
    }

    async fn exists(&self) -> Result<bool, StorageError> {
        let path = self.path.join("oplog");
        blocking(move || Ok(path.is_file())).await
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let path = self.path.clone();
        blocking(move || {
            for name in ["oplog", "tree", "bitfield", "data"] {
                let file = path.join(name);
                if file.is_file() {
                    fs::remove_file(file)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn unlock(&self) -> Result<(), StorageError> {
        let path = self.path.clone();
        let locked = self.locked.clone();
        blocking(move || {
            let mut locked = locked.lock().expect("dir storage lock state");
            if *locked {
                let lock_file = path.join("oplog.lock");
                if lock_file.is_file() {
                    fs::remove_file(lock_file)?;
                }
                *locked = false;
            }
            Ok(())
        })
        .await
    }
}
