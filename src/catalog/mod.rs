//! Snapshot/inode/name/checksum relational store.
//!
//! One [`Catalog`] owns one SQLite connection and one transaction scope;
//! handles are single-threaded and never shared.  Multiple reader handles may
//! open the same catalog concurrently; write-side operations (snapshot
//! completion, batch file insertion, purge) each form one transaction, so
//! readers observe either the pre- or post-state.
//!
//! Names are interned: every file insertion resolves its name to a stable
//! `NameId`, inserting on first sight.  Under encryption the stored name is
//! ciphertext; the catalog never sees plaintext.
//!
//! The [`CatalogRead`] trait is the seam shared with the remote HTTP proxy
//! ([`remote::RemoteCatalog`]); path resolution and chain assembly have
//! default implementations in terms of the primitive lookups.

pub mod remote;
pub mod types;

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use types::{ChecksumInfo, FileRecord, FileSpec, NodeId, SnapshotInfo, ROOT_PARENT};

/// Current catalog schema version, kept in `Config(Key='SchemaVersion')`.
/// Upgrades advance it monotonically; a mismatch on open is a hard error.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Config (
    Key   TEXT PRIMARY KEY,
    Value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Backups (
    BackupSet  INTEGER PRIMARY KEY AUTOINCREMENT,
    Name       TEXT UNIQUE NOT NULL,
    Session    TEXT UNIQUE,
    StartTime  INTEGER NOT NULL,
    EndTime    INTEGER,
    ClientTime INTEGER,
    Completed  INTEGER NOT NULL DEFAULT 0,
    Priority   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS Names (
    NameId INTEGER PRIMARY KEY AUTOINCREMENT,
    Name   TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS CheckSums (
    ChecksumId  INTEGER PRIMARY KEY AUTOINCREMENT,
    Checksum    TEXT UNIQUE NOT NULL,
    Size        INTEGER NOT NULL DEFAULT 0,
    DiskSize    INTEGER NOT NULL DEFAULT 0,
    IsFile      INTEGER NOT NULL DEFAULT 1,
    Compressed  INTEGER NOT NULL DEFAULT 0,
    Encrypted   INTEGER NOT NULL DEFAULT 0,
    ChainLength INTEGER NOT NULL DEFAULT 0,
    Basis       TEXT,
    FOREIGN KEY (Basis) REFERENCES CheckSums(Checksum) DEFERRABLE INITIALLY DEFERRED
);

CREATE INDEX IF NOT EXISTS CheckSumIndex ON CheckSums(Checksum);

CREATE TABLE IF NOT EXISTS Files (
    NameId     INTEGER NOT NULL,
    BackupSet  INTEGER NOT NULL,
    Inode      INTEGER NOT NULL,
    Device     INTEGER NOT NULL,
    Parent     INTEGER NOT NULL,
    ParentDev  INTEGER NOT NULL,
    ChecksumId INTEGER,
    XattrId    INTEGER,
    AclId      INTEGER,
    Dir        INTEGER NOT NULL DEFAULT 0,
    Link       INTEGER NOT NULL DEFAULT 0,
    Size       INTEGER NOT NULL DEFAULT 0,
    MTime      INTEGER NOT NULL DEFAULT 0,
    CTime      INTEGER NOT NULL DEFAULT 0,
    ATime      INTEGER NOT NULL DEFAULT 0,
    Mode       INTEGER NOT NULL DEFAULT 0,
    UID        INTEGER NOT NULL DEFAULT 0,
    GID        INTEGER NOT NULL DEFAULT 0,
    NLinks     INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (NameId)     REFERENCES Names(NameId),
    FOREIGN KEY (BackupSet)  REFERENCES Backups(BackupSet),
    FOREIGN KEY (ChecksumId) REFERENCES CheckSums(ChecksumId)
);

CREATE INDEX IF NOT EXISTS FilesIdx  ON Files(Parent ASC, ParentDev ASC, NameId ASC, BackupSet ASC);
CREATE INDEX IF NOT EXISTS InodeIdx  ON Files(Inode ASC, Device ASC, BackupSet ASC);
";

const FILE_COLUMNS: &str = "
    Names.Name, Files.NameId, Files.BackupSet, Files.Inode, Files.Device,
    Files.Parent, Files.ParentDev, Files.Dir, Files.Link, Files.Size,
    Files.MTime, Files.CTime, Files.ATime, Files.Mode, Files.UID, Files.GID,
    Files.NLinks, C1.Checksum, C2.Checksum, C3.Checksum
    FROM Files
    JOIN Names ON Files.NameId = Names.NameId
    LEFT OUTER JOIN CheckSums C1 ON Files.ChecksumId = C1.ChecksumId
    LEFT OUTER JOIN CheckSums C2 ON Files.XattrId    = C2.ChecksumId
    LEFT OUTER JOIN CheckSums C3 ON Files.AclId      = C3.ChecksumId
";

// ── Read seam ────────────────────────────────────────────────────────────────

/// Read-side operations shared by the local catalog and the remote proxy.
pub trait CatalogRead {
    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;
    fn last_snapshot(&self, completed_only: bool) -> Result<Option<SnapshotInfo>>;
    fn snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotInfo>>;
    /// The completed snapshot with the largest start time ≤ `t`.
    fn snapshot_for_time(&self, t: i64) -> Result<Option<SnapshotInfo>>;

    fn file_by_name(&self, name: &str, parent: NodeId, bset: i64) -> Result<Option<FileRecord>>;
    fn file_by_inode(&self, node: NodeId, bset: i64) -> Result<Option<FileRecord>>;
    fn read_directory(&self, node: NodeId, bset: i64) -> Result<Vec<FileRecord>>;

    fn checksum_info(&self, digest: &str) -> Result<Option<ChecksumInfo>>;
    fn names_for_checksum(&self, digest: &str) -> Result<Vec<String>>;

    /// Walk stored-form path components from the root sentinel.  A missing
    /// component resolves to `None`, not an error.
    fn file_by_path(&self, path: &Path, bset: i64) -> Result<Option<FileRecord>> {
        let mut parent = ROOT_PARENT;
        let mut found = None;
        for name in splitpath(path) {
            match self.file_by_name(&name, parent, bset)? {
                Some(info) => {
                    parent = info.node();
                    found = Some(info);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    /// `[digest, basis(digest), …]`, terminated at a chain root.
    fn chain(&self, digest: &str) -> Result<Vec<ChecksumInfo>> {
        let mut links = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = digest.to_owned();
        loop {
            let info = self
                .checksum_info(&cursor)?
                .ok_or_else(|| Error::not_found(format!("checksum {cursor}")))?;
            if !seen.insert(info.checksum.clone()) {
                return Err(Error::not_found(format!("basis cycle at {cursor}")));
            }
            let basis = info.basis.clone();
            links.push(info);
            match basis {
                Some(b) => cursor = b,
                None => break,
            }
        }
        Ok(links)
    }
}

/// Split a path into stored-form components, root first.  Prefix and root
/// components are dropped; `"a/b/c"` and `"/a/b/c"` resolve identically.
pub fn splitpath(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(c) => Some(c.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

// ── Local catalog ────────────────────────────────────────────────────────────

pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Create a fresh catalog (schema + version row) or open an existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO Config (Key, Value) VALUES ('SchemaVersion', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Self::from_conn(conn, path)
    }

    /// Open an existing catalog; fails with [`Error::Schema`] on a version
    /// mismatch and with `NotFound` if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if !path.is_file() {
            return Err(Error::not_found(format!("catalog {}", path.display())));
        }
        let conn = Connection::open(&path)?;
        Self::from_conn(conn, path)
    }

    fn from_conn(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let found: Option<String> = conn
            .query_row(
                "SELECT Value FROM Config WHERE Key = 'SchemaVersion'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let found = found
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(Error::Schema { found: 0, want: SCHEMA_VERSION })?;
        if found != SCHEMA_VERSION {
            return Err(Error::Schema { found, want: SCHEMA_VERSION });
        }
        debug!("opened catalog {} (schema v{found})", path.display());
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Snapshot lifecycle ───────────────────────────────────────────────────

    /// Create a new backup set and return its id.
    pub fn begin_snapshot(
        &mut self,
        name: &str,
        session: &str,
        priority: i64,
        client_time: Option<i64>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO Backups (Name, Session, StartTime, ClientTime, Completed, Priority)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![name, session, Utc::now().timestamp(), client_time, priority],
        )?;
        let bset = self.conn.last_insert_rowid();
        info!("created backup set {bset}: {name} ({session})");
        Ok(bset)
    }

    /// Seal a backup set: mark complete, stamp the end time.
    pub fn complete_snapshot(&mut self, bset: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "UPDATE Backups SET Completed = 1, EndTime = ?1 WHERE BackupSet = ?2",
            params![Utc::now().timestamp(), bset],
        )?;
        if n == 0 {
            return Err(Error::not_found(format!("backup set {bset}")));
        }
        tx.commit()?;
        Ok(())
    }

    // ── Write side ───────────────────────────────────────────────────────────

    /// Insert one file record under `parent`.  The name is interned first.
    pub fn insert_file(&mut self, spec: &FileSpec, parent: NodeId, bset: i64) -> Result<()> {
        self.insert_files(std::slice::from_ref(spec), parent, bset)
    }

    /// Insert a batch of file records in a single transaction.  All distinct
    /// names are interned before any file row is written.
    pub fn insert_files(&mut self, specs: &[FileSpec], parent: NodeId, bset: i64) -> Result<()> {
        debug!("inserting {} file(s) under {:?} in set {bset}", specs.len(), parent);
        let tx = self.conn.transaction()?;
        {
            let mut name_ids = Vec::with_capacity(specs.len());
            for spec in specs {
                name_ids.push(intern_name(&tx, &spec.name)?);
            }
            let mut stmt = tx.prepare(
                "INSERT INTO Files
                 (NameId, BackupSet, Inode, Device, Parent, ParentDev,
                  ChecksumId, XattrId, AclId,
                  Dir, Link, Size, MTime, CTime, ATime, Mode, UID, GID, NLinks)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                         (SELECT ChecksumId FROM CheckSums WHERE Checksum = ?7),
                         (SELECT ChecksumId FROM CheckSums WHERE Checksum = ?8),
                         (SELECT ChecksumId FROM CheckSums WHERE Checksum = ?9),
                         ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            )?;
            for (spec, name_id) in specs.iter().zip(name_ids) {
                stmt.execute(params![
                    name_id,
                    bset,
                    spec.inode as i64,
                    spec.device as i64,
                    parent.0 as i64,
                    parent.1 as i64,
                    spec.checksum,
                    spec.xattr_checksum,
                    spec.acl_checksum,
                    spec.is_dir,
                    spec.is_link,
                    spec.size,
                    spec.mtime,
                    spec.ctime,
                    spec.atime,
                    spec.mode,
                    spec.uid,
                    spec.gid,
                    spec.nlinks,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Copy every file record under `parent` from one snapshot into another.
    /// Used when a directory is unchanged between snapshots.  Returns the row
    /// count copied.
    pub fn clone_directory(&mut self, parent: NodeId, from_bset: i64, to_bset: i64) -> Result<usize> {
        debug!("cloning directory {:?} from set {from_bset} to {to_bset}", parent);
        let n = self.conn.execute(
            "INSERT INTO Files
             (NameId, BackupSet, Inode, Device, Parent, ParentDev,
              ChecksumId, XattrId, AclId,
              Dir, Link, Size, MTime, CTime, ATime, Mode, UID, GID, NLinks)
             SELECT NameId, ?1, Inode, Device, Parent, ParentDev,
                    ChecksumId, XattrId, AclId,
                    Dir, Link, Size, MTime, CTime, ATime, Mode, UID, GID, NLinks
             FROM Files WHERE BackupSet = ?2 AND Parent = ?3 AND ParentDev = ?4",
            params![to_bset, from_bset, parent.0 as i64, parent.1 as i64],
        )?;
        Ok(n)
    }

    /// Associate a content digest with a file after the fact.  The checksum
    /// entry must already exist.
    pub fn set_checksum(&mut self, node: NodeId, bset: i64, digest: &str) -> Result<usize> {
        if self.checksum_info(digest)?.is_none() {
            return Err(Error::not_found(format!("checksum {digest}")));
        }
        Ok(self.conn.execute(
            "UPDATE Files
             SET ChecksumId = (SELECT ChecksumId FROM CheckSums WHERE Checksum = ?1)
             WHERE Inode = ?2 AND Device = ?3 AND BackupSet = ?4",
            params![digest, node.0 as i64, node.1 as i64, bset],
        )?)
    }

    /// Insert a checksum entry.  A basis pointer whose target does not yet
    /// exist is rejected; the chain length is derived from the basis.
    pub fn insert_checksum(
        &mut self,
        digest: &str,
        size: i64,
        disk_size: i64,
        basis: Option<&str>,
        is_file: bool,
        compressed: bool,
        encrypted: bool,
    ) -> Result<i64> {
        let chain_length = match basis {
            None => 0,
            Some(b) => {
                let info = self
                    .checksum_info(b)?
                    .ok_or_else(|| Error::not_found(format!("basis checksum {b}")))?;
                info.chain_length + 1
            }
        };
        self.conn.execute(
            "INSERT INTO CheckSums
             (Checksum, Size, DiskSize, IsFile, Compressed, Encrypted, ChainLength, Basis)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![digest, size, disk_size, is_file, compressed, encrypted, chain_length, basis],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ── Similarity / move detection ──────────────────────────────────────────

    /// Find a finalized record with the same inode, mtime, and size in this
    /// snapshot or later.  Identifies files that moved between runs.
    pub fn file_by_similar(&self, spec: &FileSpec, bset: i64) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS}
             WHERE Files.Inode = ?1 AND Files.Device = ?2 AND Files.MTime = ?3
               AND Files.Size = ?4 AND Files.BackupSet >= ?5
               AND Files.ChecksumId IS NOT NULL"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![spec.inode as i64, spec.device as i64, spec.mtime, spec.size, bset],
                row_to_file,
            )
            .optional()?)
    }

    /// Carry a content digest forward from a prior snapshot's record of the
    /// same inode.
    pub fn copy_checksum(&mut self, node: NodeId, from_bset: i64, to_bset: i64) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE Files
             SET ChecksumId = (SELECT ChecksumId FROM Files
                               WHERE Inode = ?1 AND Device = ?2 AND BackupSet = ?3)
             WHERE Inode = ?1 AND Device = ?2 AND BackupSet = ?4",
            params![node.0 as i64, node.1 as i64, from_bset, to_bset],
        )?)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Delete snapshots at or below `priority` that ended at or before
    /// `before_time`, strictly older than `current_bset`, together with all
    /// their file records.  One transaction.  Returns
    /// `(files_deleted, snapshots_deleted)`.
    pub fn purge(
        &mut self,
        priority: i64,
        before_time: i64,
        current_bset: i64,
    ) -> Result<(usize, usize)> {
        let tx = self.conn.transaction()?;
        let files = tx.execute(
            "DELETE FROM Files WHERE Files.BackupSet IN
             (SELECT BackupSet FROM Backups
              WHERE Priority <= ?1 AND EndTime IS NOT NULL AND EndTime <= ?2 AND BackupSet < ?3)",
            params![priority, before_time, current_bset],
        )?;
        let sets = tx.execute(
            "DELETE FROM Backups
             WHERE Priority <= ?1 AND EndTime IS NOT NULL AND EndTime <= ?2 AND BackupSet < ?3",
            params![priority, before_time, current_bset],
        )?;
        tx.commit()?;
        info!("purged {files} file record(s) across {sets} snapshot(s)");
        Ok((files, sets))
    }

    /// Checksum entries that no file references and that no other checksum
    /// names as basis — candidates for the sweep that follows a purge.
    pub fn orphan_checksums(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT Checksum FROM CheckSums
             WHERE ChecksumId NOT IN
                   (SELECT DISTINCT ChecksumId FROM Files WHERE ChecksumId IS NOT NULL)
               AND ChecksumId NOT IN
                   (SELECT DISTINCT XattrId FROM Files WHERE XattrId IS NOT NULL)
               AND ChecksumId NOT IN
                   (SELECT DISTINCT AclId FROM Files WHERE AclId IS NOT NULL)
               AND Checksum NOT IN
                   (SELECT DISTINCT Basis FROM CheckSums WHERE Basis IS NOT NULL)",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn delete_checksum(&mut self, digest: &str) -> Result<usize> {
        debug!("deleting checksum {digest}");
        Ok(self
            .conn
            .execute("DELETE FROM CheckSums WHERE Checksum = ?1", params![digest])?)
    }

    // ── Re-encryption support ────────────────────────────────────────────────

    /// All interned names with their ids.
    pub fn list_names(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare("SELECT NameId, Name FROM Names")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rewrite every name row in one transaction (re-keying phase 1).
    pub fn update_names(&mut self, renames: &[(i64, String)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE Names SET Name = ?1 WHERE NameId = ?2")?;
            for (name_id, new_name) in renames {
                stmt.execute(params![new_name, name_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Directory records carrying a content digest, with the snapshot they
    /// appear in, ordered by chain length ascending.
    pub fn directory_digests(&self) -> Result<Vec<(i64, String, NodeId, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT C.ChecksumId, C.Checksum, Files.Inode, Files.Device, Files.BackupSet
             FROM Files JOIN CheckSums C ON Files.ChecksumId = C.ChecksumId
             WHERE Files.Dir = 1
             ORDER BY C.ChainLength ASC, C.Checksum ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                (row.get::<_, i64>(2)? as u64, row.get::<_, i64>(3)? as u64),
                row.get::<_, i64>(4)?,
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Replace a digest in place (directory rehashing).
    pub fn update_checksum_digest(&mut self, checksum_id: i64, new_digest: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE CheckSums SET Checksum = ?1 WHERE ChecksumId = ?2",
            params![new_digest, checksum_id],
        )?)
    }

    /// Every file-content checksum entry, ordered by digest.
    pub fn file_checksums(&self) -> Result<Vec<ChecksumInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT Checksum, ChecksumId, Size, DiskSize, IsFile, Compressed, Encrypted,
                    ChainLength, Basis
             FROM CheckSums WHERE IsFile = 1 ORDER BY Checksum",
        )?;
        let rows = stmt.query_map([], row_to_checksum)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Not-yet-encrypted file checksums at one chain depth, ordered by digest.
    pub fn plaintext_checksums_at_level(&self, chain_length: i64) -> Result<Vec<ChecksumInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT Checksum, ChecksumId, Size, DiskSize, IsFile, Compressed, Encrypted,
                    ChainLength, Basis
             FROM CheckSums
             WHERE Encrypted = 0 AND IsFile = 1 AND ChainLength = ?1
             ORDER BY Checksum",
        )?;
        let rows = stmt.query_map(params![chain_length], row_to_checksum)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn max_chain_length(&self) -> Result<i64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(ChainLength) FROM CheckSums", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// Move a checksum row to its encrypted identity and repoint every basis
    /// reference, in one transaction (re-keying phase 4, per item).
    pub fn reencrypt_checksum(
        &mut self,
        old_digest: &str,
        new_digest: &str,
        disk_size: i64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "UPDATE CheckSums SET Encrypted = 1, DiskSize = ?1, Checksum = ?2 WHERE Checksum = ?3",
            params![disk_size, new_digest, old_digest],
        )?;
        if n == 0 {
            return Err(Error::not_found(format!("checksum {old_digest}")));
        }
        tx.execute(
            "UPDATE CheckSums SET Basis = ?1 WHERE Basis = ?2",
            params![new_digest, old_digest],
        )?;
        tx.commit()?;
        Ok(())
    }
}

// ── Row decoding ─────────────────────────────────────────────────────────────

fn row_to_file(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        name:       row.get(0)?,
        name_id:    row.get(1)?,
        bset_id:    row.get(2)?,
        inode:      row.get::<_, i64>(3)? as u64,
        device:     row.get::<_, i64>(4)? as u64,
        parent:     row.get::<_, i64>(5)? as u64,
        parent_dev: row.get::<_, i64>(6)? as u64,
        is_dir:     row.get(7)?,
        is_link:    row.get(8)?,
        size:       row.get(9)?,
        mtime:      row.get(10)?,
        ctime:      row.get(11)?,
        atime:      row.get(12)?,
        mode:       row.get(13)?,
        uid:        row.get(14)?,
        gid:        row.get(15)?,
        nlinks:     row.get(16)?,
        checksum:       row.get(17)?,
        xattr_checksum: row.get(18)?,
        acl_checksum:   row.get(19)?,
    })
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<SnapshotInfo> {
    Ok(SnapshotInfo {
        bset_id:     row.get(0)?,
        name:        row.get(1)?,
        session:     row.get(2)?,
        start_time:  row.get(3)?,
        end_time:    row.get(4)?,
        client_time: row.get(5)?,
        completed:   row.get(6)?,
        priority:    row.get(7)?,
    })
}

fn row_to_checksum(row: &Row) -> rusqlite::Result<ChecksumInfo> {
    Ok(ChecksumInfo {
        checksum:     row.get(0)?,
        checksum_id:  row.get(1)?,
        size:         row.get(2)?,
        disk_size:    row.get(3)?,
        is_file:      row.get(4)?,
        compressed:   row.get(5)?,
        encrypted:    row.get(6)?,
        chain_length: row.get(7)?,
        basis:        row.get(8)?,
    })
}

fn intern_name(conn: &Connection, name: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row("SELECT NameId FROM Names WHERE Name = ?1", params![name], |row| row.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO Names (Name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

const SNAPSHOT_COLUMNS: &str =
    "BackupSet, Name, Session, StartTime, EndTime, ClientTime, Completed, Priority FROM Backups";

impl CatalogRead for Catalog {
    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} ORDER BY BackupSet ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn last_snapshot(&self, completed_only: bool) -> Result<Option<SnapshotInfo>> {
        let sql = if completed_only {
            format!("SELECT {SNAPSHOT_COLUMNS} WHERE Completed = 1 ORDER BY BackupSet DESC LIMIT 1")
        } else {
            format!("SELECT {SNAPSHOT_COLUMNS} ORDER BY BackupSet DESC LIMIT 1")
        };
        Ok(self.conn.query_row(&sql, [], row_to_snapshot).optional()?)
    }

    fn snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotInfo>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} WHERE Name = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![name], row_to_snapshot)
            .optional()?)
    }

    fn snapshot_for_time(&self, t: i64) -> Result<Option<SnapshotInfo>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS}
             WHERE Completed = 1 AND StartTime <= ?1
             ORDER BY StartTime DESC, BackupSet DESC LIMIT 1"
        );
        Ok(self.conn.query_row(&sql, params![t], row_to_snapshot).optional()?)
    }

    fn file_by_name(&self, name: &str, parent: NodeId, bset: i64) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS}
             WHERE Names.Name = ?1 AND Files.Parent = ?2 AND Files.ParentDev = ?3
               AND Files.BackupSet = ?4"
        );
        Ok(self
            .conn
            .query_row(&sql, params![name, parent.0 as i64, parent.1 as i64, bset], row_to_file)
            .optional()?)
    }

    fn file_by_inode(&self, node: NodeId, bset: i64) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS}
             WHERE Files.Inode = ?1 AND Files.Device = ?2 AND Files.BackupSet = ?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![node.0 as i64, node.1 as i64, bset], row_to_file)
            .optional()?)
    }

    fn read_directory(&self, node: NodeId, bset: i64) -> Result<Vec<FileRecord>> {
        // NameId order is the canonical order for directory hashing.
        let sql = format!(
            "SELECT {FILE_COLUMNS}
             WHERE Files.Parent = ?1 AND Files.ParentDev = ?2 AND Files.BackupSet = ?3
             ORDER BY Files.NameId ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![node.0 as i64, node.1 as i64, bset], row_to_file)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn checksum_info(&self, digest: &str) -> Result<Option<ChecksumInfo>> {
        Ok(self
            .conn
            .query_row(
                "SELECT Checksum, ChecksumId, Size, DiskSize, IsFile, Compressed, Encrypted,
                        ChainLength, Basis
                 FROM CheckSums WHERE Checksum = ?1",
                params![digest],
                row_to_checksum,
            )
            .optional()?)
    }

    fn names_for_checksum(&self, digest: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT Names.Name
             FROM Files
             JOIN Names ON Files.NameId = Names.NameId
             JOIN CheckSums ON Files.ChecksumId = CheckSums.ChecksumId
             WHERE CheckSums.Checksum = ?1",
        )?;
        let rows = stmt.query_map(params![digest], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let cat = Catalog::create(dir.path().join("catalog.db")).unwrap();
        (dir, cat)
    }

    fn spec(name: &str, inode: u64, dir: bool) -> FileSpec {
        FileSpec {
            name: name.to_owned(),
            inode,
            device: 1,
            is_dir: dir,
            size: 6,
            mtime: 1_700_000_000,
            mode: 0o644,
            nlinks: 1,
            ..FileSpec::default()
        }
    }

    #[test]
    fn schema_version_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        drop(Catalog::create(&path).unwrap());
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE Config SET Value = '99' WHERE Key = 'SchemaVersion'", [])
                .unwrap();
        }
        assert!(matches!(
            Catalog::open(&path),
            Err(Error::Schema { found: 99, want: SCHEMA_VERSION })
        ));
    }

    #[test]
    fn last_snapshot_empty_is_none() {
        let (_dir, cat) = catalog();
        assert!(cat.last_snapshot(true).unwrap().is_none());
        assert!(cat.last_snapshot(false).unwrap().is_none());
    }

    #[test]
    fn snapshot_lifecycle() {
        let (_dir, mut cat) = catalog();
        let b1 = cat.begin_snapshot("daily-1", "s1", 10, Some(100)).unwrap();
        assert!(cat.last_snapshot(true).unwrap().is_none());
        cat.complete_snapshot(b1).unwrap();

        let last = cat.last_snapshot(true).unwrap().unwrap();
        assert_eq!(last.bset_id, b1);
        assert!(last.completed);
        assert!(last.end_time.is_some());

        let by_name = cat.snapshot_by_name("daily-1").unwrap().unwrap();
        assert_eq!(by_name.bset_id, b1);
        assert!(cat.snapshot_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn name_interning_is_stable() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_file(&spec("shared", 10, false), ROOT_PARENT, b).unwrap();
        cat.insert_file(&spec("shared", 11, false), ROOT_PARENT, b).unwrap();

        let names = cat.list_names().unwrap();
        assert_eq!(names.len(), 1);
        let id = names[0].0;

        // Still one row, same id, after another insertion elsewhere.
        cat.insert_file(&spec("shared", 12, false), (10, 1), b).unwrap();
        let names = cat.list_names().unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].0, id);
    }

    #[test]
    fn path_resolution_walks_components() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_file(&spec("sub", 2, true), ROOT_PARENT, b).unwrap();
        cat.insert_file(&spec("b.txt", 3, false), (2, 1), b).unwrap();

        let hit = cat.file_by_path(Path::new("/sub/b.txt"), b).unwrap().unwrap();
        assert_eq!(hit.inode, 3);
        assert_eq!(hit.parent_node(), (2, 1));

        assert!(cat.file_by_path(Path::new("/sub/missing"), b).unwrap().is_none());
        assert!(cat.file_by_path(Path::new("/missing/b.txt"), b).unwrap().is_none());
    }

    #[test]
    fn read_directory_is_name_id_ordered() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_files(
            &[spec("zz", 5, false), spec("aa", 6, false), spec("mm", 7, false)],
            ROOT_PARENT,
            b,
        )
        .unwrap();
        let entries = cat.read_directory(ROOT_PARENT, b).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        // Insertion order == NameId order for fresh names.
        assert_eq!(names, ["zz", "aa", "mm"]);
    }

    #[test]
    fn basis_must_exist() {
        let (_dir, mut cat) = catalog();
        assert!(matches!(
            cat.insert_checksum("d1", 1, 1, Some("missing"), true, false, false),
            Err(Error::NotFound(_))
        ));

        cat.insert_checksum("d0", 4, 4, None, true, false, false).unwrap();
        cat.insert_checksum("d1", 4, 4, Some("d0"), true, false, false).unwrap();
        cat.insert_checksum("d2", 4, 4, Some("d1"), true, false, false).unwrap();

        let chain = cat.chain("d2").unwrap();
        let digests: Vec<&str> = chain.iter().map(|c| c.checksum.as_str()).collect();
        assert_eq!(digests, ["d2", "d1", "d0"]);
        assert_eq!(chain[0].chain_length, 2);
        assert_eq!(chain[2].chain_length, 0);
    }

    #[test]
    fn set_checksum_requires_entry() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_file(&spec("f", 9, false), ROOT_PARENT, b).unwrap();
        assert!(cat.set_checksum((9, 1), b, "nope").is_err());

        cat.insert_checksum("real", 6, 6, None, true, false, false).unwrap();
        assert_eq!(cat.set_checksum((9, 1), b, "real").unwrap(), 1);
        let rec = cat.file_by_name("f", ROOT_PARENT, b).unwrap().unwrap();
        assert_eq!(rec.checksum.as_deref(), Some("real"));
    }

    #[test]
    fn clone_directory_copies_rows() {
        let (_dir, mut cat) = catalog();
        let b1 = cat.begin_snapshot("b1", "s1", 0, None).unwrap();
        cat.insert_files(&[spec("a", 2, false), spec("b", 3, false)], ROOT_PARENT, b1)
            .unwrap();
        cat.complete_snapshot(b1).unwrap();

        let b2 = cat.begin_snapshot("b2", "s2", 0, None).unwrap();
        assert_eq!(cat.clone_directory(ROOT_PARENT, b1, b2).unwrap(), 2);
        assert_eq!(cat.read_directory(ROOT_PARENT, b2).unwrap().len(), 2);
        // Source snapshot untouched.
        assert_eq!(cat.read_directory(ROOT_PARENT, b1).unwrap().len(), 2);
    }

    #[test]
    fn snapshot_for_time_picks_latest_completed() {
        let (_dir, mut cat) = catalog();
        let b1 = cat.begin_snapshot("b1", "s1", 0, None).unwrap();
        cat.complete_snapshot(b1).unwrap();
        let b2 = cat.begin_snapshot("b2", "s2", 0, None).unwrap();
        cat.complete_snapshot(b2).unwrap();
        // Never-completed set is invisible to time lookup.
        cat.begin_snapshot("b3", "s3", 0, None).unwrap();

        let now = Utc::now().timestamp();
        let hit = cat.snapshot_for_time(now + 10).unwrap().unwrap();
        assert_eq!(hit.bset_id, b2);
        assert!(cat.snapshot_for_time(0).unwrap().is_none());
    }

    #[test]
    fn purge_deletes_files_and_sets() {
        let (_dir, mut cat) = catalog();
        let b1 = cat.begin_snapshot("b1", "s1", 0, None).unwrap();
        cat.insert_checksum("c1", 1, 1, None, true, false, false).unwrap();
        let mut s = spec("only-in-b1", 2, false);
        s.checksum = Some("c1".into());
        cat.insert_file(&s, ROOT_PARENT, b1).unwrap();
        cat.complete_snapshot(b1).unwrap();

        let b2 = cat.begin_snapshot("b2", "s2", 5, None).unwrap();
        cat.insert_file(&spec("keep", 3, false), ROOT_PARENT, b2).unwrap();
        cat.complete_snapshot(b2).unwrap();

        let b3 = cat.begin_snapshot("b3", "s3", 0, None).unwrap();
        let now = Utc::now().timestamp();
        let (files, sets) = cat.purge(0, now + 10, b3).unwrap();
        assert_eq!((files, sets), (1, 1));

        // No file record points at a deleted snapshot.
        assert!(cat.snapshot_by_name("b1").unwrap().is_none());
        assert!(cat.read_directory(ROOT_PARENT, b1).unwrap().is_empty());
        // Higher-priority set survived.
        assert_eq!(cat.read_directory(ROOT_PARENT, b2).unwrap().len(), 1);

        // The dropped file's checksum is now orphaned and sweepable.
        assert_eq!(cat.orphan_checksums().unwrap(), vec!["c1".to_owned()]);
        assert_eq!(cat.delete_checksum("c1").unwrap(), 1);
    }

    #[test]
    fn orphans_exclude_bases_and_referenced() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_checksum("base", 1, 1, None, true, false, false).unwrap();
        cat.insert_checksum("leaf", 1, 1, Some("base"), true, false, false).unwrap();
        let mut s = spec("f", 2, false);
        s.checksum = Some("leaf".into());
        cat.insert_file(&s, ROOT_PARENT, b).unwrap();

        // "base" is a basis, "leaf" is referenced: neither is orphaned.
        assert!(cat.orphan_checksums().unwrap().is_empty());
    }

    #[test]
    fn names_for_checksum_lists_every_name() {
        let (_dir, mut cat) = catalog();
        let b = cat.begin_snapshot("b", "s", 0, None).unwrap();
        cat.insert_checksum("dup", 2, 2, None, true, false, false).unwrap();
        for (name, inode) in [("one", 2u64), ("two", 3u64)] {
            let mut s = spec(name, inode, false);
            s.checksum = Some("dup".into());
            cat.insert_file(&s, ROOT_PARENT, b).unwrap();
        }
        let mut names = cat.names_for_checksum("dup").unwrap();
        names.sort();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn similar_lookup_and_checksum_carry() {
        let (_dir, mut cat) = catalog();
        let b1 = cat.begin_snapshot("b1", "s1", 0, None).unwrap();
        cat.insert_checksum("c9", 6, 6, None, true, false, false).unwrap();
        let mut s = spec("orig", 42, false);
        s.checksum = Some("c9".into());
        cat.insert_file(&s, ROOT_PARENT, b1).unwrap();
        cat.complete_snapshot(b1).unwrap();

        // Same inode/mtime/size under a new name: move detection hits.
        let b2 = cat.begin_snapshot("b2", "s2", 0, None).unwrap();
        let probe = spec("renamed", 42, false);
        let hit = cat.file_by_similar(&probe, b1).unwrap().unwrap();
        assert_eq!(hit.checksum.as_deref(), Some("c9"));

        cat.insert_file(&probe, ROOT_PARENT, b2).unwrap();
        assert_eq!(cat.copy_checksum((42, 1), b1, b2).unwrap(), 1);
        let rec = cat.file_by_name("renamed", ROOT_PARENT, b2).unwrap().unwrap();
        assert_eq!(rec.checksum.as_deref(), Some("c9"));
    }

    #[test]
    fn splitpath_is_root_first() {
        assert_eq!(splitpath(Path::new("/a/b/c")), ["a", "b", "c"]);
        assert_eq!(splitpath(Path::new("a/b")), ["a", "b"]);
        assert!(splitpath(Path::new("/")).is_empty());
    }
}
