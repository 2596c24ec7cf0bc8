//! Recovery engine — reconstructs file trees from a snapshot.
//!
//! `recover(targets, selector)` resolves each target (a path, or a digest
//! with [`RecoverOptions::as_digests`]) against a snapshot, streams content
//! through the [`Regenerator`], and restores metadata.  Per-target errors are
//! caught, logged, and counted; the returned count is the process exit code.
//! Only [`Error::Cancelled`] unwinds the whole run.
//!
//! Hardlink reconstruction keeps an `(inode, device) → output path` map for
//! the duration of one invocation.  Cancellation is cooperative: the
//! interrupt flag is checked between targets and between directory children.

pub mod meta;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::cache::BlobSource;
use crate::catalog::types::{FileRecord, NodeId};
use crate::catalog::{splitpath, CatalogRead};
use crate::crypto::KeySet;
use crate::error::{Error, Result};
use crate::regen::{Regenerator, BUF_SIZE};

/// Symlink targets are read from the first 16 KiB of the content stream.
const LINK_MAX: u64 = 16 * 1024;
/// Regular file content is streamed in 16 KiB chunks.
const FILE_CHUNK: usize = 16 * 1024;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overwrite {
    #[default]
    Never,
    Always,
    /// Overwrite only if the existing mtime is older than the stored mtime.
    Newer,
    /// Overwrite only if the existing mtime is newer than the stored mtime.
    Older,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthFailAction {
    Keep,
    #[default]
    Rename,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReducePath {
    #[default]
    None,
    /// Trim this many leading path components.
    Components(usize),
    /// Find the longest suffix that matches an entry in the snapshot.
    Smart,
}

/// Which snapshot to recover from.
#[derive(Debug, Clone)]
pub enum SnapshotSelector {
    /// The most recent completed snapshot.
    Latest,
    Named(String),
    /// The completed snapshot with the largest start time ≤ this timestamp.
    AtTime(i64),
    /// Newest snapshot that contains the target path.
    LastContaining,
}

#[derive(Debug, Clone)]
pub struct RecoverOptions {
    pub output:          Option<PathBuf>,
    /// Treat targets as digests instead of paths.
    pub as_digests:      bool,
    pub recurse:         bool,
    /// When recovering by digest, name the output after a known filename.
    pub recover_name:    bool,
    pub authenticate:    bool,
    pub authfail_action: AuthFailAction,
    pub reduce_path:     ReducePath,
    pub set_times:       bool,
    pub set_perms:       bool,
    pub set_attrs:       bool,
    pub set_acl:         bool,
    pub overwrite:       Overwrite,
    pub hardlinks:       bool,
}

impl Default for RecoverOptions {
    fn default() -> Self {
        Self {
            output:          None,
            as_digests:      false,
            recurse:         true,
            recover_name:    false,
            authenticate:    true,
            authfail_action: AuthFailAction::Rename,
            reduce_path:     ReducePath::None,
            set_times:       true,
            set_perms:       true,
            set_attrs:       true,
            set_acl:         true,
            overwrite:       Overwrite::Never,
            hardlinks:       true,
        }
    }
}

// ── Permission pre-checks ────────────────────────────────────────────────────

/// Pure owner/group/other check parameterized by the caller's uid and group
/// set, captured at startup.  `None` for the super-user (no checking).
pub struct PermissionCheck {
    uid:    u32,
    groups: Vec<u32>,
}

impl PermissionCheck {
    #[cfg(unix)]
    pub fn for_current_user() -> Option<Self> {
        let uid = nix::unistd::getuid();
        if uid.is_root() {
            return None;
        }
        let groups = nix::unistd::getgroups()
            .map(|gs| gs.into_iter().map(|g| g.as_raw()).collect())
            .unwrap_or_default();
        Some(Self { uid: uid.as_raw(), groups })
    }

    #[cfg(not(unix))]
    pub fn for_current_user() -> Option<Self> {
        None
    }

    pub fn with_identity(uid: u32, groups: Vec<u32>) -> Self {
        Self { uid, groups }
    }

    /// Would the caller have read (and, for directories, execute) access?
    pub fn allows(&self, file_uid: u32, file_gid: u32, mode: u32, is_dir: bool) -> bool {
        let (usr, grp, oth) = if is_dir {
            (0o500, 0o050, 0o005)
        } else {
            (0o400, 0o040, 0o004)
        };
        if self.uid == file_uid && mode & usr == usr {
            return true;
        }
        if self.groups.contains(&file_gid) && mode & grp == grp {
            return true;
        }
        mode & oth == oth
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

enum ContentOutcome {
    Written(PathBuf),
    /// Authentication failed; path of whatever the authfail action left.
    AuthFail(Option<PathBuf>),
}

pub struct Recoverer<'a> {
    catalog:    &'a dyn CatalogRead,
    regen:      Regenerator<'a>,
    keys:       Option<&'a KeySet>,
    opts:       RecoverOptions,
    interrupt:  Arc<AtomicBool>,
    perm_check: Option<PermissionCheck>,
}

impl<'a> Recoverer<'a> {
    pub fn new(
        catalog: &'a dyn CatalogRead,
        blobs: &'a dyn BlobSource,
        keys: Option<&'a KeySet>,
        opts: RecoverOptions,
    ) -> Self {
        Self {
            catalog,
            regen: Regenerator::new(catalog, blobs, keys),
            keys,
            opts,
            interrupt: Arc::new(AtomicBool::new(false)),
            perm_check: PermissionCheck::for_current_user(),
        }
    }

    /// Flag checked between targets and between directory children; setting
    /// it unwinds the run with [`Error::Cancelled`].
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Recover every target; returns the failed-target count.
    pub fn recover(&self, targets: &[String], selector: &SnapshotSelector) -> Result<u32> {
        let mut failures = 0u32;
        let mut link_map: HashMap<NodeId, PathBuf> = HashMap::new();

        let output = self
            .opts
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let (outputdir, outname) = if targets.len() > 1 || output.is_dir() {
            fs::create_dir_all(&output)
                .map_err(|e| Error::io(output.display().to_string(), e))?;
            (Some(output), None)
        } else {
            (None, Some(output))
        };
        debug!("outputdir: {outputdir:?}  outname: {outname:?}");

        for target in targets {
            if self.interrupted() {
                return Err(Error::Cancelled);
            }
            let result = if self.opts.as_digests {
                self.recover_one_digest(target, outputdir.as_deref(), outname.as_deref())
            } else {
                self.recover_one_path(
                    target,
                    selector,
                    outputdir.as_deref(),
                    outname.as_deref(),
                    &mut link_map,
                )
            };
            match result {
                Ok(n) => failures += n,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("could not recover {target}: {e}");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!("{failures} target(s) could not be recovered");
        }
        Ok(failures)
    }

    // ── Path targets ─────────────────────────────────────────────────────────

    fn recover_one_path(
        &self,
        target: &str,
        selector: &SnapshotSelector,
        outputdir: Option<&Path>,
        outname: Option<&Path>,
        link_map: &mut HashMap<NodeId, PathBuf>,
    ) -> Result<u32> {
        let path = Path::new(target);
        let (bset, logical) = match selector {
            SnapshotSelector::Latest => {
                let snap = self
                    .catalog
                    .last_snapshot(true)?
                    .ok_or_else(|| Error::not_found("no completed snapshot"))?;
                (snap.bset_id, self.reduce(path, snap.bset_id)?)
            }
            SnapshotSelector::Named(name) => {
                let snap = self
                    .catalog
                    .snapshot_by_name(name)?
                    .ok_or_else(|| Error::not_found(format!("snapshot {name}")))?;
                (snap.bset_id, self.reduce(path, snap.bset_id)?)
            }
            SnapshotSelector::AtTime(t) => {
                let snap = self
                    .catalog
                    .snapshot_for_time(*t)?
                    .ok_or_else(|| Error::not_found(format!("no snapshot at time {t}")))?;
                (snap.bset_id, self.reduce(path, snap.bset_id)?)
            }
            SnapshotSelector::LastContaining => self
                .find_last_path(path)?
                .ok_or_else(|| Error::not_found(format!("no snapshot contains {target}")))?,
        };

        let stored = self.stored_path(&logical);
        let info = self
            .catalog
            .file_by_path(&stored, bset)?
            .ok_or_else(|| Error::not_found(format!("{} in snapshot {bset}", logical.display())))?;
        info!("processing {} from snapshot {bset}", logical.display());
        self.recover_object(&info, bset, outputdir, &logical, link_map, outname)
    }

    /// Recover one object and, for directories, its children.  Returns the
    /// failure count; `Err` only on cancellation.
    fn recover_object(
        &self,
        info: &FileRecord,
        bset: i64,
        outputdir: Option<&Path>,
        path: &Path,
        link_map: &mut HashMap<NodeId, PathBuf>,
        name: Option<&Path>,
    ) -> Result<u32> {
        let mut failures = 0u32;
        let realname = self.plain_name(&info.name);
        let outname: PathBuf = match name {
            Some(n) => n.to_owned(),
            None => match outputdir {
                Some(d) => d.join(&realname),
                None => {
                    error!("no output location for {}", path.display());
                    return Ok(1);
                }
            },
        };

        let mut skip = false;
        if !info.is_dir && !check_overwrite(&outname, info, self.opts.overwrite) {
            info!("skipping existing file {}", outname.display());
            skip = true;
        }

        // Hardlink reconstruction: second sighting of an inode links to the
        // first output path instead of rewriting content.
        if self.opts.hardlinks && info.nlinks > 1 && !info.is_dir {
            if let Some(existing) = link_map.get(&info.node()) {
                if !skip {
                    info!("linking {} to {}", outname.display(), existing.display());
                    if let Err(e) = fs::hard_link(existing, &outname) {
                        error!("unable to link {}: {e}", outname.display());
                        return Ok(failures + 1);
                    }
                    self.restore_metadata(&outname, info, bset);
                }
                return Ok(failures);
            }
            link_map.insert(info.node(), outname.clone());
        }

        let written: Option<PathBuf> = if info.is_dir {
            if let Some(check) = &self.perm_check {
                if !check.allows(info.uid, info.gid, info.mode, true) {
                    warn!(
                        "original permissions would deny reading directory {}",
                        path.display()
                    );
                }
            }
            info!("processing directory {}", path.display());
            if !outname.is_dir() {
                if let Err(e) = fs::create_dir_all(&outname) {
                    error!("unable to create directory {}: {e}", outname.display());
                    return Ok(failures + 1);
                }
            }
            let contents = match self.catalog.read_directory(info.node(), bset) {
                Ok(c) => c,
                Err(e) => {
                    error!("unable to read directory {}: {e}", path.display());
                    return Ok(failures + 1);
                }
            };
            for child in &contents {
                if self.interrupted() {
                    return Err(Error::Cancelled);
                }
                if !self.opts.recurse && child.is_dir {
                    continue;
                }
                let childname = self.plain_name(&child.name);
                match self.recover_object(
                    child,
                    bset,
                    Some(&outname),
                    &path.join(&childname),
                    link_map,
                    None,
                ) {
                    Ok(n) => failures += n,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        error!("could not recover {childname} in {}: {e}", path.display());
                        failures += 1;
                    }
                }
            }
            Some(outname.clone())
        } else if !skip {
            match self.write_content(info, &outname) {
                Ok(ContentOutcome::Written(p)) => Some(p),
                Ok(ContentOutcome::AuthFail(p)) => {
                    failures += 1;
                    p
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("recovery of {} failed: {e}", outname.display());
                    return Ok(failures + 1);
                }
            }
        } else {
            None
        };

        if let Some(p) = written {
            self.restore_metadata(&p, info, bset);
        }
        Ok(failures)
    }

    /// Stream the regenerated content to disk, authenticating on the fly.
    fn write_content(&self, info: &FileRecord, outname: &Path) -> Result<ContentOutcome> {
        let digest = info.checksum.as_deref().ok_or_else(|| {
            Error::not_found(format!("no content digest for {}", outname.display()))
        })?;
        let mut stream = self.regen.recover_checksum(digest)?;
        let mut hasher = self.opts.authenticate.then(|| self.regen.hasher());

        if info.is_link {
            let mut target = Vec::new();
            stream
                .by_ref()
                .take(LINK_MAX)
                .read_to_end(&mut target)
                .map_err(|e| classify_io(digest, e))?;
            if let Some(h) = hasher.as_mut() {
                h.update(&target);
            }
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                let _ = fs::remove_file(outname);
                std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(&target), outname)
                    .map_err(|e| Error::io(outname.display().to_string(), e))?;
            }
            #[cfg(not(unix))]
            return Err(Error::PermissionDenied("symlinks unsupported here".into()));
        } else {
            debug!("writing output to {}", outname.display());
            let mut output = File::create(outname)
                .map_err(|e| Error::io(outname.display().to_string(), e))?;
            let mut buf = [0u8; FILE_CHUNK];
            loop {
                let n = stream.read(&mut buf).map_err(|e| classify_io(digest, e))?;
                if n == 0 {
                    break;
                }
                if let Some(h) = hasher.as_mut() {
                    h.update(&buf[..n]);
                }
                output
                    .write_all(&buf[..n])
                    .map_err(|e| Error::io(outname.display().to_string(), e))?;
            }
        }

        if let Some(h) = hasher {
            let actual = h.hex();
            if actual != digest {
                return Ok(ContentOutcome::AuthFail(
                    self.apply_authfail(outname, digest, &actual),
                ));
            }
        }
        Ok(ContentOutcome::Written(outname.to_owned()))
    }

    fn apply_authfail(&self, outname: &Path, expected: &str, actual: &str) -> Option<PathBuf> {
        error!(
            "file {} did not authenticate. expected: {expected}, got: {actual}",
            outname.display()
        );
        match self.opts.authfail_action {
            AuthFailAction::Keep => Some(outname.to_owned()),
            AuthFailAction::Rename => {
                let mut name = outname.file_name().unwrap_or_default().to_os_string();
                name.push(format!("-CORRUPT-{actual}"));
                let target = outname.with_file_name(name);
                match fs::rename(outname, &target) {
                    Ok(()) => {
                        warn!("renamed to {}", target.display());
                        Some(target)
                    }
                    Err(e) => {
                        warn!("unable to rename to {}: {e}", target.display());
                        Some(outname.to_owned())
                    }
                }
            }
            AuthFailAction::Delete => {
                warn!("deleting {}", outname.display());
                let _ = fs::remove_file(outname);
                None
            }
        }
    }

    fn restore_metadata(&self, path: &Path, info: &FileRecord, _bset: i64) {
        if self.opts.set_times {
            meta::restore_times(path, info);
        }
        if self.opts.set_perms {
            meta::restore_perms(path, info);
        }
        if self.opts.set_attrs {
            if let Some(digest) = &info.xattr_checksum {
                match self.regen.recover_verified(digest) {
                    Ok(blob) => meta::restore_xattrs(path, &blob),
                    Err(e) => warn!(
                        "unable to regenerate extended attributes for {}: {e}",
                        path.display()
                    ),
                }
            }
        }
        if self.opts.set_acl {
            if let Some(digest) = &info.acl_checksum {
                match self.regen.recover_verified(digest) {
                    Ok(blob) => {
                        meta::restore_acl(path, &String::from_utf8_lossy(&blob));
                    }
                    Err(e) => warn!("unable to regenerate ACL for {}: {e}", path.display()),
                }
            }
        }
    }

    // ── Digest targets ───────────────────────────────────────────────────────

    fn recover_one_digest(
        &self,
        digest: &str,
        outputdir: Option<&Path>,
        outname: Option<&Path>,
    ) -> Result<u32> {
        let ckname = if self.opts.recover_name {
            self.recover_name(digest)?
        } else {
            digest.to_owned()
        };
        let out = match outname {
            Some(n) => n.to_owned(),
            None => outputdir.unwrap_or_else(|| Path::new(".")).join(&ckname),
        };

        let mut stream = self.regen.recover_checksum(digest)?;
        let mut hasher = self.opts.authenticate.then(|| self.regen.hasher());
        let mut output =
            File::create(&out).map_err(|e| Error::io(out.display().to_string(), e))?;
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).map_err(|e| classify_io(digest, e))?;
            if n == 0 {
                break;
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            output
                .write_all(&buf[..n])
                .map_err(|e| Error::io(out.display().to_string(), e))?;
        }
        if let Some(h) = hasher {
            let actual = h.hex();
            if actual != digest {
                self.apply_authfail(&out, digest, &actual);
                return Ok(1);
            }
        }
        Ok(0)
    }

    /// Find a filename for a digest from the catalog's name associations.
    fn recover_name(&self, digest: &str) -> Result<String> {
        let names = self.catalog.names_for_checksum(digest)?;
        match names.first() {
            None => {
                warn!("no name discovered for checksum {digest}");
                Ok(digest.to_owned())
            }
            Some(first) => {
                if names.len() > 1 {
                    warn!("multiple ({}) names for checksum {digest}", names.len());
                }
                Ok(self.plain_name(first))
            }
        }
    }

    // ── Snapshot and path resolution ─────────────────────────────────────────

    /// Scan snapshots newest-first for the first one containing `path`.
    fn find_last_path(&self, path: &Path) -> Result<Option<(i64, PathBuf)>> {
        let sets = self.catalog.list_snapshots()?;
        for snap in sets.iter().rev() {
            let reduced = self.reduce(path, snap.bset_id)?;
            let stored = self.stored_path(&reduced);
            if self.catalog.file_by_path(&stored, snap.bset_id)?.is_some() {
                debug!("found {} in snapshot {} ({})", path.display(), snap.name, snap.bset_id);
                return Ok(Some((snap.bset_id, reduced)));
            }
        }
        Ok(None)
    }

    fn reduce(&self, path: &Path, bset: i64) -> Result<PathBuf> {
        match self.opts.reduce_path {
            ReducePath::None => Ok(path.to_owned()),
            ReducePath::Components(n) => {
                Ok(splitpath(path).into_iter().skip(n).collect())
            }
            ReducePath::Smart => {
                let comps = splitpath(path);
                for k in 0..comps.len() {
                    let candidate: PathBuf = comps[k..].iter().collect();
                    let stored = self.stored_path(&candidate);
                    if self.catalog.file_by_path(&stored, bset)?.is_some() {
                        return Ok(candidate);
                    }
                }
                Ok(path.to_owned())
            }
        }
    }

    fn stored_path(&self, path: &Path) -> PathBuf {
        match self.keys {
            Some(k) => k.encrypt_path(path),
            None => path.to_owned(),
        }
    }

    fn plain_name(&self, stored: &str) -> String {
        match self.keys {
            Some(k) => match k.decrypt_name(stored) {
                Ok(name) => name,
                Err(e) => {
                    warn!("unable to decrypt name: {e}");
                    stored.to_owned()
                }
            },
            None => stored.to_owned(),
        }
    }
}

fn classify_io(digest: &str, e: std::io::Error) -> Error {
    Error::from_read(digest, e)
}

/// Decide whether `outname` may be (over)written under the policy.
fn check_overwrite(outname: &Path, info: &FileRecord, mode: Overwrite) -> bool {
    let meta = match fs::symlink_metadata(outname) {
        Ok(m) => m,
        Err(_) => return true,
    };
    match mode {
        Overwrite::Never => false,
        Overwrite::Always => true,
        Overwrite::Newer | Overwrite::Older => {
            let existing = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if existing < info.mtime {
                mode == Overwrite::Newer
            } else {
                mode == Overwrite::Older
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mtime: i64) -> FileRecord {
        FileRecord {
            name: "f".into(),
            name_id: 1,
            bset_id: 1,
            inode: 1,
            device: 1,
            parent: 0,
            parent_dev: 0,
            is_dir: false,
            is_link: false,
            size: 0,
            mtime,
            ctime: mtime,
            atime: mtime,
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlinks: 1,
            checksum: None,
            xattr_checksum: None,
            acl_checksum: None,
        }
    }

    #[test]
    fn overwrite_policies() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("present");
        std::fs::write(&existing, b"x").unwrap();
        let missing = dir.path().join("absent");

        let now = chrono::Utc::now().timestamp();
        let older = record(now - 3600);
        let newer = record(now + 3600);

        // Missing files are always writable.
        assert!(check_overwrite(&missing, &older, Overwrite::Never));

        assert!(!check_overwrite(&existing, &newer, Overwrite::Never));
        assert!(check_overwrite(&existing, &newer, Overwrite::Always));
        // Stored copy newer than the file on disk.
        assert!(check_overwrite(&existing, &newer, Overwrite::Newer));
        assert!(!check_overwrite(&existing, &newer, Overwrite::Older));
        // Stored copy older than the file on disk.
        assert!(!check_overwrite(&existing, &older, Overwrite::Newer));
        assert!(check_overwrite(&existing, &older, Overwrite::Older));
    }

    #[test]
    fn permission_check_owner_group_other() {
        let check = PermissionCheck::with_identity(1000, vec![100, 200]);

        // Owner with read access.
        assert!(check.allows(1000, 0, 0o400, false));
        // Owner bits missing, but other grants.
        assert!(check.allows(1000, 0, 0o044, false));
        // Group path.
        assert!(check.allows(0, 200, 0o040, false));
        // Directory needs execute too.
        assert!(!check.allows(1000, 0, 0o400, true));
        assert!(check.allows(1000, 0, 0o500, true));
        // Nothing grants.
        assert!(!check.allows(0, 0, 0o700, false));
    }
}
