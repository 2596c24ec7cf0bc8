//! Content-addressed, file-backed blob cache.
//!
//! Blobs live under a two-level sharded hierarchy keyed by digest prefix:
//! `ab/cd/abcdef…`.  Sidecars (`<digest>.sig`, `<digest>.meta`,
//! `<digest>.basis`) share their payload's shard.  Writers commit atomically:
//! bytes land in a temp file inside the target shard and are renamed into
//! place on commit, so concurrent writers producing the same digest converge.
//!
//! The cache takes no locks.  Any I/O failure surfaces with the digest
//! attached.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Shard fan-out: number of leading digest characters per directory level.
const SHARD_WIDTH: usize = 2;
const SHARD_LEVELS: usize = 2;

/// Anything that can hand out blob payload streams by digest.  Implemented by
/// [`CacheDir`] and by the remote catalog proxy.
pub trait BlobSource {
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read>>;
    fn blob_exists(&self, digest: &str) -> bool;
}

pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `name` (a digest or a digest-with-suffix).  The shard
    /// is derived from the stem so sidecars land next to their payload.
    pub fn path_of(&self, name: &str) -> PathBuf {
        let stem = name.split('.').next().unwrap_or(name);
        let mut p = self.root.clone();
        let mut pos = 0;
        for _ in 0..SHARD_LEVELS {
            if stem.len() < pos + SHARD_WIDTH {
                break;
            }
            p.push(&stem[pos..pos + SHARD_WIDTH]);
            pos += SHARD_WIDTH;
        }
        p.push(name);
        p
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    pub fn open_read(&self, name: &str) -> Result<File> {
        File::open(self.path_of(name)).map_err(|e| Error::io(name, e))
    }

    pub fn size_of(&self, name: &str) -> Result<u64> {
        fs::metadata(self.path_of(name))
            .map(|m| m.len())
            .map_err(|e| Error::io(name, e))
    }

    /// Start an atomic write.  Nothing is visible under `name` until
    /// [`CacheWriter::commit`] succeeds.
    pub fn writer(&self, name: &str) -> Result<CacheWriter> {
        let target = self.path_of(name);
        let dir = target.parent().expect("sharded paths always have a parent");
        fs::create_dir_all(dir).map_err(|e| Error::io(name, e))?;
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(name, e))?;
        Ok(CacheWriter { name: name.to_owned(), tmp: Some(tmp), target })
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path_of(name)).map_err(|e| Error::io(name, e))
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let to = self.path_of(new);
        let dir = to.parent().expect("sharded paths always have a parent");
        fs::create_dir_all(dir).map_err(|e| Error::io(new, e))?;
        fs::rename(self.path_of(old), to).map_err(|e| Error::io(old, e))
    }

    pub fn link(&self, src: &str, dst: &str, soft: bool) -> Result<()> {
        let to = self.path_of(dst);
        let dir = to.parent().expect("sharded paths always have a parent");
        fs::create_dir_all(dir).map_err(|e| Error::io(dst, e))?;
        if soft {
            #[cfg(unix)]
            return std::os::unix::fs::symlink(self.path_of(src), to)
                .map_err(|e| Error::io(src, e));
            #[cfg(not(unix))]
            return Err(Error::io(src, io::Error::new(io::ErrorKind::Unsupported, "symlink")));
        }
        fs::hard_link(self.path_of(src), to).map_err(|e| Error::io(src, e))
    }

    /// Bulk-delete auxiliary files bound to a digest.  A suffix of `""` names
    /// the payload itself.  Missing files are not an error; returns how many
    /// were removed.
    pub fn remove_suffixes(&self, digest: &str, suffixes: &[&str]) -> Result<usize> {
        let mut removed = 0;
        for suffix in suffixes {
            let name = format!("{digest}{suffix}");
            match fs::remove_file(self.path_of(&name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(name, e)),
            }
        }
        Ok(removed)
    }
}

impl BlobSource for CacheDir {
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read>> {
        Ok(Box::new(self.open_read(digest)?))
    }

    fn blob_exists(&self, digest: &str) -> bool {
        self.exists(digest)
    }
}

// ── Atomic writer ────────────────────────────────────────────────────────────

/// Write handle returned by [`CacheDir::writer`].  Dropping without
/// committing discards the temp file.
pub struct CacheWriter {
    name:   String,
    tmp:    Option<tempfile::NamedTempFile>,
    target: PathBuf,
}

impl CacheWriter {
    /// Flush and rename into place.
    pub fn commit(mut self) -> Result<()> {
        let tmp = self.tmp.take().expect("commit called once");
        tmp.persist(&self.target)
            .map_err(|e| Error::io(self.name.clone(), e.error))?;
        Ok(())
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tmp.as_mut().expect("writer not committed").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.as_mut().expect("writer not committed").flush()
    }
}
