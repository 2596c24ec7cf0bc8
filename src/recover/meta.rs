//! Post-write metadata restoration: times, mode/owner, extended attributes,
//! and POSIX ACLs.
//!
//! Each restore step is independently toggleable and non-fatal: a failure is
//! logged and recovery proceeds.  Ownership is restored group-first, because
//! only privileged processes may change the owner and that attempt is
//! allowed to fail.

use log::warn;
use std::collections::BTreeMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::catalog::types::FileRecord;

/// Restore mtime/atime.  Uses the symlink-aware call so link targets are not
/// touched through the link.
pub fn restore_times(path: &Path, info: &FileRecord) {
    let mtime = filetime::FileTime::from_unix_time(info.mtime, 0);
    let atime = filetime::FileTime::from_unix_time(info.atime, 0);
    if let Err(e) = filetime::set_symlink_file_times(path, atime, mtime) {
        warn!("unable to set times on {}: {e}", path.display());
    }
}

/// Restore mode bits, then group, then owner.
pub fn restore_perms(path: &Path, info: &FileRecord) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if !info.is_link {
            let perms = std::fs::Permissions::from_mode(info.mode & 0o7777);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!("unable to set permissions on {}: {e}", path.display());
            }
        }
        // Group first: changing the owner may be refused to an unprivileged
        // process, and must not prevent the group change.
        if let Err(e) = std::os::unix::fs::lchown(path, None, Some(info.gid)) {
            warn!("unable to set group of {}: {e}", path.display());
        }
        if let Err(e) = std::os::unix::fs::lchown(path, Some(info.uid), None) {
            warn!("unable to set owner of {}: {e}", path.display());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, info);
    }
}

/// Apply the xattr blob: a JSON object mapping attribute name to
/// base64(value), applied in unspecified order.
pub fn restore_xattrs(path: &Path, blob: &[u8]) {
    let parsed: BTreeMap<String, String> = match serde_json::from_slice(blob) {
        Ok(map) => map,
        Err(e) => {
            warn!("unable to parse extended attributes for {}: {e}", path.display());
            return;
        }
    };
    for (attr, encoded) in parsed {
        let value = match BASE64.decode(&encoded) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad base64 for attribute {attr} on {}: {e}", path.display());
                continue;
            }
        };
        #[cfg(unix)]
        if let Err(e) = xattr::set(path, &attr, &value) {
            warn!("unable to set extended attribute {attr} on {}: {e}", path.display());
        }
        #[cfg(not(unix))]
        let _ = value;
    }
}

// ── POSIX ACLs ───────────────────────────────────────────────────────────────
//
// The ACL blob is the textual long form.  It is applied whole by encoding the
// kernel's binary layout into the `system.posix_acl_access` (and, for
// `default:` entries, `system.posix_acl_default`) extended attribute.

const ACL_EA_VERSION: u32 = 2;
const ACL_UNDEFINED_ID: u32 = u32::MAX;

const TAG_USER_OBJ:  u16 = 0x01;
const TAG_USER:      u16 = 0x02;
const TAG_GROUP_OBJ: u16 = 0x04;
const TAG_GROUP:     u16 = 0x08;
const TAG_MASK:      u16 = 0x10;
const TAG_OTHER:     u16 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AclEntry {
    tag:  u16,
    perm: u16,
    id:   u32,
}

fn parse_perms(s: &str) -> Option<u16> {
    let mut perm = 0u16;
    for c in s.chars() {
        match c {
            'r' => perm |= 0x4,
            'w' => perm |= 0x2,
            'x' => perm |= 0x1,
            '-' => {}
            _ => return None,
        }
    }
    Some(perm)
}

/// Parse the textual long form into access and default entry lists.
fn parse_acl_text(text: &str) -> Result<(Vec<AclEntry>, Vec<AclEntry>), String> {
    let mut access = Vec::new();
    let mut default = Vec::new();
    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields: Vec<&str> = line.split(':').collect();
        let is_default = fields.first() == Some(&"default");
        if is_default {
            fields.remove(0);
        }
        if fields.len() != 3 {
            return Err(format!("malformed ACL entry: {raw}"));
        }
        let qualifier = fields[1];
        let perm = parse_perms(fields[2]).ok_or_else(|| format!("bad permissions: {raw}"))?;
        let (tag, id) = match (fields[0], qualifier.is_empty()) {
            ("user", true)   => (TAG_USER_OBJ, ACL_UNDEFINED_ID),
            ("user", false)  => (
                TAG_USER,
                qualifier.parse().map_err(|_| format!("bad uid: {raw}"))?,
            ),
            ("group", true)  => (TAG_GROUP_OBJ, ACL_UNDEFINED_ID),
            ("group", false) => (
                TAG_GROUP,
                qualifier.parse().map_err(|_| format!("bad gid: {raw}"))?,
            ),
            ("mask", _)  => (TAG_MASK, ACL_UNDEFINED_ID),
            ("other", _) => (TAG_OTHER, ACL_UNDEFINED_ID),
            _ => return Err(format!("unknown ACL tag: {raw}")),
        };
        let entry = AclEntry { tag, perm, id };
        if is_default {
            default.push(entry);
        } else {
            access.push(entry);
        }
    }
    // The kernel requires entries ordered by tag, then qualifier.
    access.sort_by_key(|e| (e.tag, e.id));
    default.sort_by_key(|e| (e.tag, e.id));
    Ok((access, default))
}

/// Encode entries in the `posix_acl_xattr` wire layout (all little-endian).
fn encode_acl(entries: &[AclEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * 8);
    out.extend_from_slice(&ACL_EA_VERSION.to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.tag.to_le_bytes());
        out.extend_from_slice(&e.perm.to_le_bytes());
        out.extend_from_slice(&e.id.to_le_bytes());
    }
    out
}

/// Apply a textual-long-form ACL blob to `path`.
pub fn restore_acl(path: &Path, text: &str) {
    let (access, default) = match parse_acl_text(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("unable to parse ACL for {}: {e}", path.display());
            return;
        }
    };
    #[cfg(unix)]
    {
        if !access.is_empty() {
            if let Err(e) = xattr::set(path, "system.posix_acl_access", &encode_acl(&access)) {
                warn!("unable to apply ACL to {}: {e}", path.display());
            }
        }
        if !default.is_empty() {
            if let Err(e) = xattr::set(path, "system.posix_acl_default", &encode_acl(&default)) {
                warn!("unable to apply default ACL to {}: {e}", path.display());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (access, default);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_form() {
        let text = "user::rw-\nuser:1000:rwx   # alice\ngroup::r--\nmask::rwx\nother::r--\n";
        let (access, default) = parse_acl_text(text).unwrap();
        assert!(default.is_empty());
        assert_eq!(access.len(), 5);
        assert_eq!(access[0], AclEntry { tag: TAG_USER_OBJ, perm: 0x6, id: ACL_UNDEFINED_ID });
        assert_eq!(access[1], AclEntry { tag: TAG_USER, perm: 0x7, id: 1000 });
        assert_eq!(access[4], AclEntry { tag: TAG_OTHER, perm: 0x4, id: ACL_UNDEFINED_ID });
    }

    #[test]
    fn default_entries_split_out() {
        let text = "user::rwx\ngroup::r-x\nother::r-x\ndefault:user::rwx\ndefault:other::---\n";
        let (access, default) = parse_acl_text(text).unwrap();
        assert_eq!(access.len(), 3);
        assert_eq!(default.len(), 2);
        assert_eq!(default[1].tag, TAG_OTHER);
        assert_eq!(default[1].perm, 0);
    }

    #[test]
    fn entries_are_tag_ordered() {
        let text = "other::r--\nuser::rw-\ngroup:50:r--\nuser:10:rw-\ngroup::r--\nmask::rwx\n";
        let (access, _) = parse_acl_text(text).unwrap();
        let tags: Vec<u16> = access.iter().map(|e| e.tag).collect();
        assert_eq!(tags, [TAG_USER_OBJ, TAG_USER, TAG_GROUP_OBJ, TAG_GROUP, TAG_MASK, TAG_OTHER]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_acl_text("wat::rw-").is_err());
        assert!(parse_acl_text("user::rwq").is_err());
        assert!(parse_acl_text("user:notanumber:rwx").is_err());
    }

    #[test]
    fn encoding_layout() {
        let entries = [AclEntry { tag: TAG_USER_OBJ, perm: 0x6, id: ACL_UNDEFINED_ID }];
        let bytes = encode_acl(&entries);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..6], &TAG_USER_OBJ.to_le_bytes());
        assert_eq!(&bytes[6..8], &0x6u16.to_le_bytes());
        assert_eq!(&bytes[8..12], &u32::MAX.to_le_bytes());
    }
}
