use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use riq_common::{Result, RiqError};

/// Byte-level object storage under a warehouse root.
///
/// Paths are relative, `/`-separated, and never start with `/`. A missing
/// object is reported as `RiqError::Io` with [`io::ErrorKind::NotFound`].
pub trait StorageBackend: Send + Sync + Debug {
    /// Writes `data` at `path`, replacing any existing object atomically.
    fn put(&self, path: &str, data: Bytes) -> Result<()>;

    fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads `range` (end exclusive) of the object at `path`.
    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes>;

    /// Object size in bytes.
    fn size(&self, path: &str) -> Result<u64>;

    /// All object paths under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn delete(&self, path: &str) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool> {
        match self.size(path) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// True for the backend "object does not exist" error.
pub fn is_not_found(e: &RiqError) -> bool {
    matches!(e, RiqError::Io(io) if io.kind() == io::ErrorKind::NotFound)
}

pub(crate) fn not_found(path: &str) -> RiqError {
    RiqError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("object not found: {path}"),
    ))
}

fn check_range(path: &str, range: &Range<u64>, size: u64) -> Result<()> {
    if range.start > range.end || range.end > size {
        return Err(RiqError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "range {}..{} out of bounds for '{path}' ({size} bytes)",
                range.start, range.end
            ),
        )));
    }
    Ok(())
}

/// Warehouse root on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

impl StorageBackend for LocalFsBackend {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{file_name}.tmp-{nanos}"));
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.resolve(path))?))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let mut file = fs::File::open(self.resolve(path))?;
        let size = file.metadata()?.len();
        check_range(path, &range, size)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0_u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(self.resolve(path))?;
        if !meta.is_file() {
            return Err(not_found(path));
        }
        Ok(meta.len())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if self.root.exists() {
            walk(&self.root, "", &mut out)?;
        }
        out.retain(|p| p.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }
}

fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // in-flight temp files from `put`
        if name.starts_with('.') {
            continue;
        }
        let child = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

/// Process-local backend for tests and ephemeral warehouses.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Bytes>>> {
        self.objects
            .read()
            .map_err(|_| RiqError::Execution("memory backend lock poisoned".to_string()))
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| RiqError::Execution("memory backend lock poisoned".to_string()))?
            .insert(path.to_string(), data);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        self.read()?.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(path)?;
        check_range(path, &range, data.len() as u64)?;
        Ok(data.slice(range.start as usize..range.end as usize))
    }

    fn size(&self, path: &str) -> Result<u64> {
        Ok(self.get(path)?.len() as u64)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| RiqError::Execution("memory backend lock poisoned".to_string()))?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }
}
