//! Resolves a digest to a byte stream by walking its delta chain.
//!
//! The chain for a digest is `[target, …, root]`; the root (`basis = null`)
//! decodes standalone, every other link is a binary patch against the link
//! after it.  Decoding a stored blob is decrypt (strip IV, verify trailing
//! HMAC) then decompress; chain links then apply lazily through
//! [`PatchReader`].  Patch application needs a seekable base, so each
//! intermediate stage spools to a temp file; the final stage streams.

use log::debug;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::cache::BlobSource;
use crate::catalog::types::{ChecksumInfo, FileRecord};
use crate::catalog::CatalogRead;
use crate::crypto::{CryptoError, DecryptReader, Digest, KeySet};
use crate::delta::PatchReader;
use crate::error::{Error, Result};

/// Read granularity for regeneration and authentication.
pub const BUF_SIZE: usize = 64 * 1024;

pub struct Regenerator<'a> {
    catalog: &'a dyn CatalogRead,
    blobs:   &'a dyn BlobSource,
    keys:    Option<&'a KeySet>,
}

impl<'a> Regenerator<'a> {
    pub fn new(
        catalog: &'a dyn CatalogRead,
        blobs: &'a dyn BlobSource,
        keys: Option<&'a KeySet>,
    ) -> Self {
        Self { catalog, blobs, keys }
    }

    pub fn keys(&self) -> Option<&'a KeySet> {
        self.keys
    }

    /// The digest function matching this repository's mode.
    pub fn hasher(&self) -> Digest {
        Digest::for_keys(self.keys)
    }

    /// Decrypt and decompress one stored blob, yielding its raw payload
    /// (full content for a chain root, patch bytes otherwise).
    pub fn open_decoded(&self, info: &ChecksumInfo) -> Result<Box<dyn Read>> {
        let raw = self.blobs.open_blob(&info.checksum)?;
        let stream: Box<dyn Read> = if info.encrypted {
            let keys = self.keys.ok_or(CryptoError::MissingKey)?;
            Box::new(DecryptReader::new(raw, keys).map_err(|e| Error::io(&info.checksum, e))?)
        } else {
            raw
        };
        Ok(if info.compressed {
            Box::new(
                zstd::stream::read::Decoder::new(stream)
                    .map_err(|e| Error::io(&info.checksum, e))?,
            )
        } else {
            stream
        })
    }

    /// Produce the content stream for `digest` by walking its chain.
    ///
    /// The returned reader is lazy; authentication (comparing a running
    /// digest against `digest`) is the caller's concern so it can interleave
    /// with writing.
    pub fn recover_checksum(&self, digest: &str) -> Result<Box<dyn Read>> {
        let chain = self.catalog.chain(digest)?;
        debug!("regenerating {digest} (chain length {})", chain.len());

        let root = chain.last().expect("chain() never returns an empty chain");
        let mut stream = self.open_decoded(root)?;
        for link in chain.iter().rev().skip(1) {
            let base = spool(stream, &link.checksum)?;
            let patch = self.open_decoded(link)?;
            stream = Box::new(PatchReader::new(base, patch)?);
        }
        Ok(stream)
    }

    /// Regenerate and fully read a digest, verifying the content digest on
    /// the way.  Used for small auxiliary blobs (xattrs, ACLs, link targets).
    pub fn recover_verified(&self, digest: &str) -> Result<Vec<u8>> {
        let mut stream = self.recover_checksum(digest)?;
        let mut hasher = self.hasher();
        let mut out = Vec::new();
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).map_err(|e| Error::from_read(digest, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.extend_from_slice(&buf[..n]);
        }
        let actual = hasher.hex();
        if actual != digest {
            return Err(Error::AuthFailure { expected: digest.to_owned(), actual });
        }
        Ok(out)
    }
}

/// Spool a stream to an anonymous temp file and rewind it, producing the
/// seekable base a patch needs.
fn spool(mut stream: Box<dyn Read>, digest: &str) -> Result<File> {
    let mut tmp = tempfile::tempfile().map_err(|e| Error::io(digest, e))?;
    io::copy(&mut stream, &mut tmp).map_err(|e| Error::io(digest, e))?;
    tmp.seek(SeekFrom::Start(0)).map_err(|e| Error::io(digest, e))?;
    Ok(tmp)
}

// ── Directory digests ────────────────────────────────────────────────────────

/// Digest a directory from its children: stored names and metadata, in
/// `name_id` ascending order (the canonical order).  Returns the digest and
/// the number of entries hashed.
pub fn hash_directory(keys: Option<&KeySet>, children: &[FileRecord]) -> (String, u64) {
    let mut ordered: Vec<&FileRecord> = children.iter().collect();
    ordered.sort_by_key(|c| c.name_id);

    let mut hasher = Digest::for_keys(keys);
    for child in &ordered {
        hasher.update(child.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&child.inode.to_le_bytes());
        hasher.update(&child.device.to_le_bytes());
        hasher.update(&child.size.to_le_bytes());
        hasher.update(&child.mtime.to_le_bytes());
        hasher.update(&child.mode.to_le_bytes());
        hasher.update(&child.uid.to_le_bytes());
        hasher.update(&child.gid.to_le_bytes());
    }
    (hasher.hex(), ordered.len() as u64)
}
