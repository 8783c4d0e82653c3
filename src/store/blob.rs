//! Blob storage for serialized payloads.
//!
//! Blobs are addressed by an area (a top-level namespace, like a bucket)
//! and a relative path inside it. The API is synchronous `std::io`; async
//! callers go through `spawn_blocking`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::model::FileStoreInfo;
use crate::stream::{DigestReader, SeekableStream};

pub const DEFAULT_AREA: &str = "results";

pub trait BlobStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Write everything from `data` to `area`/`path`, replacing any existing
    /// blob. Returns the location string recorded in [`FileStoreInfo::path`].
    fn put(&self, area: &str, path: &str, data: &mut dyn Read) -> Result<String>;

    /// Open a stored blob for reading.
    fn get_file(&self, area: &str, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Stored size in bytes.
    fn file_size(&self, area: &str, path: &str) -> Result<u64>;

    /// Store `data`, measuring and hashing it on the way through.
    fn store_file(&self, area: &str, path: &str, data: &mut dyn Read) -> Result<FileStoreInfo> {
        let mut reader = DigestReader::new(data);
        let location = self.put(area, path, &mut reader)?;
        let (size, md5) = reader.finish();
        Ok(FileStoreInfo {
            size,
            offset: 0,
            path: location,
            md5,
        })
    }
}

/// Open a stored blob as a [`SeekableStream`] of its stored size.
pub fn open_seekable(
    store: &dyn BlobStore,
    area: &str,
    path: &str,
) -> Result<SeekableStream<Box<dyn Read + Send>>> {
    let len = store.file_size(area, path)?;
    let source = store.get_file(area, path)?;
    SeekableStream::new(source, len)
}

fn not_found(area: &str, path: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no blob at {area}:{path}"),
    ))
}

/// Blobs stored as files under `root/<area>/<path>`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `area` and `path` under the root, refusing anything that could
    /// escape it.
    fn resolve(&self, area: &str, path: &str) -> Result<PathBuf> {
        let mut full = self.root.clone();
        for part in [area, path] {
            let relative = Path::new(part);
            if part.is_empty()
                || !relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(Error::Other(format!("invalid blob location {area}:{path}")));
            }
            full.push(relative);
        }
        Ok(full)
    }
}

impl BlobStore for LocalBlobStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn put(&self, area: &str, path: &str, data: &mut dyn Read) -> Result<String> {
        let target = self.resolve(area, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        io::copy(data, &mut file)?;
        file.sync_all()?;
        Ok(target.display().to_string())
    }

    fn get_file(&self, area: &str, path: &str) -> Result<Box<dyn Read + Send>> {
        let target = self.resolve(area, path)?;
        match File::open(&target) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(area, path)),
            Err(e) => Err(e.into()),
        }
    }

    fn file_size(&self, area: &str, path: &str) -> Result<u64> {
        let target = self.resolve(area, path)?;
        match fs::metadata(&target) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(area, path)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blobs held in process memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<(String, String), Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, area: &str, path: &str) -> Result<Arc<Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(area.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| not_found(area, path))
    }
}

impl BlobStore for MemoryBlobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn put(&self, area: &str, path: &str, data: &mut dyn Read) -> Result<String> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((area.to_string(), path.to_string()), Arc::new(bytes));
        Ok(format!("{area}:/{path}"))
    }

    fn get_file(&self, area: &str, path: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self.get(area, path)?;
        Ok(Box::new(Cursor::new(bytes.as_ref().clone())))
    }

    fn file_size(&self, area: &str, path: &str) -> Result<u64> {
        Ok(self.get(area, path)?.len() as u64)
    }
}
