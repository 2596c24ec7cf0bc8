//! One-shot migration converting a plaintext repository into an encrypted
//! one, in five phases:
//!
//! 1. **Names** — re-encrypt every name row in place; single transaction.
//! 2. **Directory hashes** — recompute directory digests from the
//!    now-encrypted child names, chain length ascending.
//! 3. **Signatures** — emit a `.sig` sidecar for every file checksum that
//!    lacks one.
//! 4. **Files** — per chain length from highest to lowest: re-digest the
//!    plaintext under the content key, encrypt the stored blob, move the
//!    checksum row to its new identity, repoint basis references, move the
//!    `.sig`, drop obsolete sidecars.  Highest level first, so when a basis
//!    is rewritten no remaining un-rewritten blob still references its old
//!    digest.
//! 5. **Metadata** — emit a `.meta` sidecar for every file checksum.
//!
//! Phases commit per item; a failure rolls back that item only and the phase
//! continues.  Re-running skips names already `Encrypted=1` (phase 4) and
//! sidecars already present (phases 3 and 5).

use log::{error, info, warn};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};

use crate::cache::CacheDir;
use crate::catalog::types::ChecksumInfo;
use crate::catalog::{Catalog, CatalogRead};
use crate::crypto::{encrypt_blob, KeySet};
use crate::delta::{Signature, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::regen::{hash_directory, Regenerator};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReencryptOptions {
    pub names: bool,
    pub dirs:  bool,
    pub sigs:  bool,
    pub files: bool,
    pub meta:  bool,
}

impl ReencryptOptions {
    pub fn all() -> Self {
        Self { names: true, dirs: true, sigs: true, files: true, meta: true }
    }

    pub fn any(&self) -> bool {
        self.names || self.dirs || self.sigs || self.files || self.meta
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReencryptStats {
    pub names_encrypted: usize,
    pub dirs_rehashed:   usize,
    pub sigs_generated:  usize,
    pub files_encrypted: usize,
    pub metas_written:   usize,
}

/// Run the selected phases in order.
pub fn run(
    catalog: &mut Catalog,
    cache: &CacheDir,
    keys: &KeySet,
    opts: &ReencryptOptions,
) -> Result<ReencryptStats> {
    let mut stats = ReencryptStats::default();
    if opts.names {
        stats.names_encrypted = encrypt_names(catalog, keys)?;
    }
    if opts.dirs {
        stats.dirs_rehashed = rehash_directories(catalog, keys)?;
    }
    if opts.sigs {
        stats.sigs_generated = generate_signatures(catalog, cache, keys)?;
    }
    if opts.files {
        stats.files_encrypted = encrypt_files(catalog, cache, keys)?;
    }
    if opts.meta {
        stats.metas_written = write_metadata(catalog, cache)?;
    }
    Ok(stats)
}

// ── Phase 1: names ───────────────────────────────────────────────────────────

pub fn encrypt_names(catalog: &mut Catalog, keys: &KeySet) -> Result<usize> {
    let names = catalog.list_names()?;
    info!("encrypting {} filename(s)", names.len());
    let renames: Vec<(i64, String)> = names
        .iter()
        .map(|(id, name)| (*id, keys.encrypt_name(name)))
        .collect();
    catalog.update_names(&renames)?;
    Ok(renames.len())
}

// ── Phase 2: directory hashes ────────────────────────────────────────────────

pub fn rehash_directories(catalog: &mut Catalog, keys: &KeySet) -> Result<usize> {
    let rows = catalog.directory_digests()?;
    info!("rehashing {} directory record(s)", rows.len());
    let mut done: HashSet<i64> = HashSet::new();
    let mut rehashed = 0;
    for (checksum_id, old_digest, node, bset) in rows {
        if !done.insert(checksum_id) {
            continue; // one digest serves many identical directory rows
        }
        let children = catalog.read_directory(node, bset)?;
        let (new_digest, entries) = hash_directory(Some(keys), &children);
        if new_digest != old_digest {
            if let Err(e) = catalog.update_checksum_digest(checksum_id, &new_digest) {
                error!("unable to rehash directory digest {old_digest}: {e}");
                continue;
            }
        }
        rehashed += 1;
        log::debug!("rehashed {old_digest} => {new_digest} ({entries} entries)");
    }
    Ok(rehashed)
}

// ── Phase 3: signatures ──────────────────────────────────────────────────────

pub fn generate_signatures(catalog: &mut Catalog, cache: &CacheDir, keys: &KeySet) -> Result<usize> {
    let checksums = catalog.file_checksums()?;
    info!("generating signatures for {} checksum(s)", checksums.len());
    let mut generated = 0;
    for info in checksums {
        let sig_name = format!("{}.sig", info.checksum);
        if cache.exists(&sig_name) {
            continue;
        }
        if let Err(e) = make_signature(catalog, cache, keys, &info, &sig_name) {
            error!("unable to generate signature for {}: {e}", info.checksum);
            continue;
        }
        generated += 1;
    }
    Ok(generated)
}

fn make_signature(
    catalog: &Catalog,
    cache: &CacheDir,
    keys: &KeySet,
    info: &ChecksumInfo,
    sig_name: &str,
) -> Result<()> {
    let stream = {
        let regen = Regenerator::new(catalog, cache, Some(keys));
        regen.recover_checksum(&info.checksum)?
    };
    let sig = Signature::generate(stream, DEFAULT_BLOCK_SIZE)?;
    let mut w = cache.writer(sig_name)?;
    sig.write(&mut w)?;
    w.commit()
}

// ── Phase 4: files ───────────────────────────────────────────────────────────

pub fn encrypt_files(catalog: &mut Catalog, cache: &CacheDir, keys: &KeySet) -> Result<usize> {
    let max_level = catalog.max_chain_length()?;
    let mut encrypted = 0;
    for level in (0..=max_level).rev() {
        let pending = catalog.plaintext_checksums_at_level(level)?;
        if pending.is_empty() {
            continue;
        }
        info!("encrypting {} file(s) at chain length {level}", pending.len());
        for info in pending {
            match encrypt_one(catalog, cache, keys, &info) {
                Ok(()) => encrypted += 1,
                Err(e) => error!("unable to convert checksum {}: {e}", info.checksum),
            }
        }
    }
    Ok(encrypted)
}

fn encrypt_one(
    catalog: &mut Catalog,
    cache: &CacheDir,
    keys: &KeySet,
    info: &ChecksumInfo,
) -> Result<()> {
    let old = &info.checksum;

    // New identity: HMAC of the full plaintext, regenerated through the old
    // representation.  Generate the signature in the same pass if missing.
    let need_sig = !cache.exists(&format!("{old}.sig"));
    let mut hasher = crate::crypto::Digest::for_keys(Some(keys));
    let mut sig_buf: Vec<u8> = Vec::new();
    {
        let regen = Regenerator::new(&*catalog, cache, Some(keys));
        let mut stream = regen.recover_checksum(old)?;
        if need_sig {
            let mut content = Vec::new();
            stream.read_to_end(&mut content).map_err(|e| Error::io(old, e))?;
            hasher.update(&content);
            let sig = Signature::generate(&content[..], DEFAULT_BLOCK_SIZE)?;
            sig.write(&mut sig_buf)?;
        } else {
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = stream.read(&mut buf).map_err(|e| Error::io(old, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    let new = hasher.hex();

    if need_sig {
        let mut w = cache.writer(&format!("{old}.sig"))?;
        w.write_all(&sig_buf).map_err(|e| Error::io(old, e))?;
        w.commit()?;
    }

    // Encrypt the stored bytes (full content or patch) under the new name.
    let raw = cache.open_read(old)?;
    let mut w = cache.writer(&new)?;
    let disk_size = encrypt_blob(raw, &mut w, keys).map_err(|e| Error::io(old, e))?;
    w.commit()?;

    cache.rename(&format!("{old}.sig"), &format!("{new}.sig"))?;
    catalog.reencrypt_checksum(old, &new, disk_size as i64)?;
    cache.remove_suffixes(old, &[".meta", ".sig", ".basis", ""])?;
    log::debug!("encrypted {old} => {new} ({disk_size} bytes on disk)");
    Ok(())
}

// ── Phase 5: metadata sidecars ───────────────────────────────────────────────

pub fn write_metadata(catalog: &mut Catalog, cache: &CacheDir) -> Result<usize> {
    let checksums = catalog.file_checksums()?;
    info!("writing metadata sidecars for {} checksum(s)", checksums.len());
    let mut written = 0;
    for info in checksums {
        let meta_name = format!("{}.meta", info.checksum);
        if cache.exists(&meta_name) {
            continue;
        }
        let mut w = cache.writer(&meta_name)?;
        write_meta_sidecar(&mut w, &info).map_err(|e| Error::io(&meta_name, e))?;
        w.commit()?;
        written += 1;
    }
    Ok(written)
}

/// Serialize the line-oriented `.meta` sidecar.
pub fn write_meta_sidecar<W: Write>(w: &mut W, info: &ChecksumInfo) -> std::io::Result<()> {
    writeln!(w, "size: {}", info.size)?;
    writeln!(w, "compressed: {}", info.compressed)?;
    writeln!(w, "encrypted: {}", info.encrypted)?;
    writeln!(w, "disk_size: {}", info.disk_size)?;
    writeln!(w, "basis: {}", info.basis.as_deref().unwrap_or(""))?;
    Ok(())
}

/// Recovery-side parse of a `.meta` sidecar.  Key order is irrelevant and
/// trailing newlines are tolerated; unknown keys are skipped.
pub fn parse_meta_sidecar<R: Read>(r: R) -> Result<MetaSidecar> {
    let mut meta = MetaSidecar::default();
    for line in BufReader::new(r).lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "size" => meta.size = value.parse().unwrap_or(0),
            "compressed" => meta.compressed = value == "true" || value == "1",
            "encrypted" => meta.encrypted = value == "true" || value == "1",
            "disk_size" => meta.disk_size = value.parse().unwrap_or(0),
            "basis" => meta.basis = (!value.is_empty()).then(|| value.to_owned()),
            other => warn!("unknown metadata key {other}"),
        }
    }
    Ok(meta)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetaSidecar {
    pub size:       i64,
    pub disk_size:  i64,
    pub compressed: bool,
    pub encrypted:  bool,
    pub basis:      Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_sidecar_round_trips() {
        let info = ChecksumInfo {
            checksum: "abc".into(),
            checksum_id: 1,
            size: 1234,
            disk_size: 1312,
            is_file: true,
            compressed: true,
            encrypted: true,
            chain_length: 2,
            basis: Some("def".into()),
        };
        let mut buf = Vec::new();
        write_meta_sidecar(&mut buf, &info).unwrap();
        let parsed = parse_meta_sidecar(&buf[..]).unwrap();
        assert_eq!(parsed.size, 1234);
        assert_eq!(parsed.disk_size, 1312);
        assert!(parsed.compressed);
        assert!(parsed.encrypted);
        assert_eq!(parsed.basis.as_deref(), Some("def"));
    }

    #[test]
    fn meta_sidecar_tolerates_reorder_and_blanks() {
        let text = "basis: \ndisk_size: 9\n\nsize: 7\nencrypted: false\ncompressed: false\n\n\n";
        let parsed = parse_meta_sidecar(text.as_bytes()).unwrap();
        assert_eq!(parsed.size, 7);
        assert_eq!(parsed.disk_size, 9);
        assert!(parsed.basis.is_none());
        assert!(!parsed.encrypted);
    }
}
