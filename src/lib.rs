//! # snapvault — deduplicating content-addressed backup repository
//!
//! Repository guarantees:
//! - Blobs are content-addressed: the digest is BLAKE3 of the plaintext, or
//!   HMAC-SHA512 under the content key once the repository is encrypted
//! - A stored blob may be a binary delta; reconstruction walks the basis
//!   chain from a self-contained root and is byte-exact
//! - Encrypted blobs are `[IV | AES-256-CBC ciphertext | HMAC-SHA512 tag]`,
//!   tag over IV ‖ ciphertext; filename encryption is deterministic so
//!   catalog lookups by name keep working
//! - The catalog is transactional: snapshot completion, batch insertion, and
//!   purge are each atomic against concurrent readers
//! - A basis pointer must name an existing checksum; the chain graph is
//!   acyclic by construction

pub mod error;
pub mod crypto;
pub mod cache;
pub mod delta;
pub mod catalog;
pub mod regen;
pub mod recover;
pub mod reencrypt;
pub mod repo;

// Flat re-exports for the most common types.
pub use cache::{BlobSource, CacheDir};
pub use catalog::types::{ChecksumInfo, FileRecord, FileSpec, NodeId, SnapshotInfo, ROOT_PARENT};
pub use catalog::{remote::RemoteCatalog, Catalog, CatalogRead};
pub use crypto::{CryptoError, CryptoParams, KeySet};
pub use delta::{DeltaError, PatchReader, Signature};
pub use error::{Error, Result};
pub use recover::{
    AuthFailAction, Overwrite, RecoverOptions, Recoverer, ReducePath, SnapshotSelector,
};
pub use regen::Regenerator;
pub use repo::Repository;
