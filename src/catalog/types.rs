//! Typed records for the catalog entities — one definition per entity.
use serde::{Deserialize, Serialize};

/// `(inode, device)` — identifies a file node within one backup run.
pub type NodeId = (u64, u64);

/// Parent sentinel for entries at the root of the backed-up tree.
pub const ROOT_PARENT: NodeId = (0, 0);

/// One backup set.  Created when a client opens a session, sealed at session
/// end, optionally purged later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub bset_id:     i64,
    pub name:        String,
    pub session:     String,
    pub start_time:  i64,
    pub end_time:    Option<i64>,
    pub client_time: Option<i64>,
    pub completed:   bool,
    pub priority:    i64,
}

/// The appearance of an inode within a snapshot.  `name` is the stored form:
/// plaintext, or base64 ciphertext under encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub name:       String,
    pub name_id:    i64,
    pub bset_id:    i64,
    pub inode:      u64,
    pub device:     u64,
    pub parent:     u64,
    pub parent_dev: u64,
    pub is_dir:     bool,
    pub is_link:    bool,
    pub size:       i64,
    pub mtime:      i64,
    pub ctime:      i64,
    pub atime:      i64,
    pub mode:       u32,
    pub uid:        u32,
    pub gid:        u32,
    pub nlinks:     u32,
    /// Content digest; absent for directories and not-yet-finalized files.
    pub checksum:       Option<String>,
    pub xattr_checksum: Option<String>,
    pub acl_checksum:   Option<String>,
}

impl FileRecord {
    #[inline]
    pub fn node(&self) -> NodeId {
        (self.inode, self.device)
    }

    #[inline]
    pub fn parent_node(&self) -> NodeId {
        (self.parent, self.parent_dev)
    }
}

/// A content digest and how its blob is stored.  `basis` points at the digest
/// this blob is a delta against; the relation is acyclic by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub checksum:     String,
    pub checksum_id:  i64,
    pub size:         i64,
    pub disk_size:    i64,
    pub is_file:      bool,
    pub compressed:   bool,
    pub encrypted:    bool,
    pub chain_length: i64,
    pub basis:        Option<String>,
}

/// Insert shape for the write side: what the backup client knows about a file
/// before its content digest is settled.
#[derive(Debug, Clone, Default)]
pub struct FileSpec {
    pub name:    String,
    pub inode:   u64,
    pub device:  u64,
    pub is_dir:  bool,
    pub is_link: bool,
    pub size:    i64,
    pub mtime:   i64,
    pub ctime:   i64,
    pub atime:   i64,
    pub mode:    u32,
    pub uid:     u32,
    pub gid:     u32,
    pub nlinks:  u32,
    pub checksum:       Option<String>,
    pub xattr_checksum: Option<String>,
    pub acl_checksum:   Option<String>,
}
