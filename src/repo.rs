//! High-level [`Repository`] API — the primary embedding surface.
//!
//! ```no_run
//! use snapvault::repo::Repository;
//! use snapvault::catalog::types::{FileSpec, ROOT_PARENT};
//!
//! let mut repo = Repository::create("/srv/backups/host-a")?;
//! let bset = repo.catalog_mut().begin_snapshot("daily-1", "sess", 0, None)?;
//! let digest = repo.store_blob(b"hello", None, false)?;
//! let spec = FileSpec { name: "a.txt".into(), inode: 2, device: 1,
//!                       checksum: Some(digest), ..FileSpec::default() };
//! repo.catalog_mut().insert_file(&spec, ROOT_PARENT, bset)?;
//! repo.catalog_mut().complete_snapshot(bset)?;
//! # Ok::<(), snapvault::Error>(())
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cache::CacheDir;
use crate::catalog::{Catalog, CatalogRead};
use crate::crypto::{encrypt_blob, CryptoParams, Digest, KeySet};
use crate::delta::{diff, Signature, DEFAULT_BLOCK_SIZE};
use crate::error::Result;
use crate::recover::{RecoverOptions, Recoverer};
use crate::regen::Regenerator;

/// Catalog filename inside a repository directory.
pub const CATALOG_NAME: &str = "catalog.db";
/// Blob cache directory inside a repository directory.
pub const BLOBS_DIR: &str = "blobs";

/// A local repository: catalog + blob cache + optional keys.
pub struct Repository {
    root:    PathBuf,
    catalog: Catalog,
    cache:   CacheDir,
    keys:    Option<KeySet>,
}

impl Repository {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_owned();
        std::fs::create_dir_all(&root)
            .map_err(|e| crate::Error::io(root.display().to_string(), e))?;
        let catalog = Catalog::create(root.join(CATALOG_NAME))?;
        let cache = CacheDir::new(root.join(BLOBS_DIR))?;
        Ok(Self { root, catalog, cache, keys: None })
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with_keys(root, None)
    }

    /// Open an encrypted repository, deriving keys from the passphrase and
    /// client identifier.
    pub fn open_encrypted<P: AsRef<Path>>(
        root: P,
        passphrase: &str,
        client_id: &str,
        params: &CryptoParams,
    ) -> Result<Self> {
        let keys = KeySet::derive(passphrase, client_id, params);
        Self::open_with_keys(root, Some(keys))
    }

    pub fn open_with_keys<P: AsRef<Path>>(root: P, keys: Option<KeySet>) -> Result<Self> {
        let root = root.as_ref().to_owned();
        let catalog = Catalog::open(root.join(CATALOG_NAME))?;
        let cache = CacheDir::new(root.join(BLOBS_DIR))?;
        Ok(Self { root, catalog, cache, keys })
    }

    /// Attach keys after opening (used when creating an encrypted repository
    /// from scratch or after a re-keying migration).
    pub fn set_keys(&mut self, keys: Option<KeySet>) {
        self.keys = keys;
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn keys(&self) -> Option<&KeySet> {
        self.keys.as_ref()
    }

    /// Mutable catalog plus cache, borrowed together (the re-keying pipeline
    /// needs both at once).
    pub fn parts_mut(&mut self) -> (&mut Catalog, &CacheDir) {
        (&mut self.catalog, &self.cache)
    }

    pub fn regenerator(&self) -> Regenerator<'_> {
        Regenerator::new(&self.catalog, &self.cache, self.keys.as_ref())
    }

    pub fn recoverer(&self, opts: RecoverOptions) -> Recoverer<'_> {
        Recoverer::new(&self.catalog, &self.cache, self.keys.as_ref(), opts)
    }

    // ── Write side ───────────────────────────────────────────────────────────

    /// Open a snapshot with a fresh session token.
    pub fn begin_snapshot(&mut self, name: &str, priority: i64) -> Result<i64> {
        let session = uuid::Uuid::new_v4().to_string();
        self.catalog.begin_snapshot(name, &session, priority, None)
    }

    /// The content digest of `bytes` under this repository's mode.
    pub fn digest_of(&self, bytes: &[u8]) -> String {
        let mut hasher = Digest::for_keys(self.keys.as_ref());
        hasher.update(bytes);
        hasher.hex()
    }

    /// Store content as a blob and register its checksum entry.
    ///
    /// With `basis`, the stored bytes are a binary delta against that digest
    /// (which must already exist); the blob's identity is still the digest of
    /// the full content.  Identical content deduplicates to the existing
    /// entry.
    pub fn store_blob(
        &mut self,
        content: &[u8],
        basis: Option<&str>,
        compress: bool,
    ) -> Result<String> {
        let digest = self.digest_of(content);
        if self.catalog.checksum_info(&digest)?.is_some() {
            return Ok(digest);
        }

        let payload: Vec<u8> = match basis {
            None => content.to_vec(),
            Some(base_digest) => {
                let base = {
                    let regen = self.regenerator();
                    regen.recover_checksum(base_digest)?
                };
                let sig = Signature::generate(base, DEFAULT_BLOCK_SIZE)?;
                let mut patch = Vec::new();
                diff(&sig, content, &mut patch)?;
                patch
            }
        };
        let payload = if compress {
            zstd::encode_all(&payload[..], 3).map_err(|e| crate::Error::io(&digest, e))?
        } else {
            payload
        };

        let mut w = self.cache.writer(&digest)?;
        let disk_size = match &self.keys {
            Some(keys) => encrypt_blob(&payload[..], &mut w, keys)
                .map_err(|e| crate::Error::io(&digest, e))?,
            None => {
                w.write_all(&payload).map_err(|e| crate::Error::io(&digest, e))?;
                payload.len() as u64
            }
        };
        w.commit()?;

        self.catalog.insert_checksum(
            &digest,
            content.len() as i64,
            disk_size as i64,
            basis,
            true,
            compress,
            self.keys.is_some(),
        )?;
        Ok(digest)
    }

    /// Stored name for a plaintext component under this repository's mode.
    pub fn stored_name(&self, name: &str) -> String {
        match &self.keys {
            Some(k) => k.encrypt_name(name),
            None => name.to_owned(),
        }
    }
}
