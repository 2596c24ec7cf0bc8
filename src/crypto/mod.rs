//! Key derivation, filename encryption, content cipher streams, and HMACs.
//!
//! Key derivation: PBKDF2-HMAC-SHA512(passphrase, salt=purpose‖client_id)
//! → two independent 32-byte keys (filename key, content key).
//!
//! Filename encryption is deterministic so catalog lookups by name work:
//! IV = HMAC-SHA512(filename_key, name)[..16], then AES-256-CBC over the
//! PKCS-padded name.  Stored form: base64(IV ‖ ciphertext).
//!
//! Encrypted blob layout: [ IV (16 B) | ciphertext (n×16 B) | HMAC-SHA512 tag (64 B) ]
//! where the tag covers IV ‖ ciphertext.

use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Byte length of the IV prepended to every encrypted blob.
pub const IV_LEN: usize = 16;
/// AES block size; ciphertext length is always a multiple of this.
pub const BLOCK_LEN: usize = 16;
/// Byte length of the HMAC-SHA512 tag trailing every encrypted blob.
pub const TAG_LEN: usize = 64;

/// Internal chunk size for streaming encryption/decryption.
const CHUNK: usize = 64 * 1024;

pub type HmacSha512 = Hmac<Sha512>;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    #[error("Decryption failed — wrong key or corrupted data")]
    Decrypt,
    #[error("Encrypted payload too short (minimum {0} bytes)")]
    TooShort(usize),
    #[error("Blob is encrypted but no decryption key was provided")]
    MissingKey,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CryptoError {
    /// Recover a `CryptoError` smuggled through an `io::Error` by the
    /// streaming readers, so callers can classify decrypt failures.
    pub fn from_io(err: &io::Error) -> Option<&CryptoError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<CryptoError>())
    }

    fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

// ── Key material ─────────────────────────────────────────────────────────────

/// KDF tuning.  The iteration count is part of the repository configuration;
/// changing it changes every derived key.
#[derive(Debug, Clone)]
pub struct CryptoParams {
    pub iterations: u32,
}

impl Default for CryptoParams {
    fn default() -> Self {
        Self { iterations: 100_000 }
    }
}

/// The two repository keys.  Stateless after derivation; safe to share by
/// reference.  No operation suspends.
pub struct KeySet {
    filename_key: [u8; 32],
    content_key:  [u8; 32],
}

impl KeySet {
    /// Derive the filename and content keys from a passphrase and the client
    /// identifier.  Distinct salt prefixes make the two keys independent.
    pub fn derive(passphrase: &str, client_id: &str, params: &CryptoParams) -> Self {
        let mut filename_key = [0u8; 32];
        let mut content_key  = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha512>(
            passphrase.as_bytes(),
            format!("filename:{client_id}").as_bytes(),
            params.iterations,
            &mut filename_key,
        );
        pbkdf2::pbkdf2_hmac::<Sha512>(
            passphrase.as_bytes(),
            format!("content:{client_id}").as_bytes(),
            params.iterations,
            &mut content_key,
        );
        Self { filename_key, content_key }
    }

    /// Construct from raw keys (used by tests and key-file import).
    pub fn from_keys(filename_key: [u8; 32], content_key: [u8; 32]) -> Self {
        Self { filename_key, content_key }
    }

    // ── HMAC factories ───────────────────────────────────────────────────────

    /// Incremental HMAC over the content key.  The hex digest of a blob's
    /// plaintext under this MAC is that blob's content digest.
    pub fn content_hmac(&self) -> HmacSha512 {
        HmacSha512::new_from_slice(&self.content_key).expect("HMAC accepts any key length")
    }

    pub fn name_hmac(&self) -> HmacSha512 {
        HmacSha512::new_from_slice(&self.filename_key).expect("HMAC accepts any key length")
    }

    // ── Filename encryption ──────────────────────────────────────────────────

    /// Deterministic filename encryption: the same plaintext always maps to
    /// the same ciphertext, so name lookups against the catalog work.
    pub fn encrypt_name(&self, name: &str) -> String {
        let iv = self.name_iv(name.as_bytes());
        let mut buf = name.as_bytes().to_vec();
        pad(&mut buf);
        let mut cipher = Aes256CbcEnc::new((&self.filename_key).into(), (&iv).into());
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        let mut out = Vec::with_capacity(IV_LEN + buf.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&buf);
        BASE64.encode(out)
    }

    /// Inverse of [`encrypt_name`](Self::encrypt_name).  Fails on tampered
    /// input: the recovered plaintext must re-derive the embedded IV.
    pub fn decrypt_name(&self, stored: &str) -> Result<String, CryptoError> {
        let raw = BASE64.decode(stored).map_err(|_| CryptoError::Decrypt)?;
        if raw.len() < IV_LEN + BLOCK_LEN || (raw.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(CryptoError::TooShort(IV_LEN + BLOCK_LEN));
        }
        let (iv, ct) = raw.split_at(IV_LEN);
        let mut buf = ct.to_vec();
        let mut cipher = Aes256CbcDec::new(
            (&self.filename_key).into(),
            GenericArray::from_slice(iv),
        );
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        unpad(&mut buf)?;
        let name = String::from_utf8(buf).map_err(|_| CryptoError::Decrypt)?;
        if self.name_iv(name.as_bytes())[..] != *iv {
            return Err(CryptoError::Decrypt);
        }
        Ok(name)
    }

    /// Encrypt a path component-wise.  Used before catalog path lookups.
    pub fn encrypt_path(&self, path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for comp in path.components() {
            match comp {
                std::path::Component::RootDir => out.push("/"),
                std::path::Component::Normal(c) => {
                    out.push(self.encrypt_name(&c.to_string_lossy()))
                }
                _ => {}
            }
        }
        out
    }

    fn name_iv(&self, name: &[u8]) -> [u8; IV_LEN] {
        let mut mac = self.name_hmac();
        mac.update(name);
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        iv
    }

    // ── Content cipher ───────────────────────────────────────────────────────

    pub fn content_encryptor(&self, iv: &[u8; IV_LEN]) -> ContentEncryptor {
        ContentEncryptor(Aes256CbcEnc::new((&self.content_key).into(), iv.into()))
    }

    pub fn content_decryptor(&self, iv: &[u8; IV_LEN]) -> ContentDecryptor {
        ContentDecryptor(Aes256CbcDec::new((&self.content_key).into(), iv.into()))
    }
}

/// A fresh random 16-byte IV.
pub fn new_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// PKCS#7: always appends 1..=16 bytes, bringing the buffer to a multiple of
/// the block size.
pub fn pad(buf: &mut Vec<u8>) {
    let n = BLOCK_LEN - (buf.len() % BLOCK_LEN);
    buf.extend(std::iter::repeat(n as u8).take(n));
}

/// Strip and validate PKCS#7 padding in place.
pub fn unpad(buf: &mut Vec<u8>) -> Result<(), CryptoError> {
    let n = *buf.last().ok_or(CryptoError::Decrypt)? as usize;
    if n == 0 || n > BLOCK_LEN || n > buf.len() {
        return Err(CryptoError::Decrypt);
    }
    if buf[buf.len() - n..].iter().any(|&b| b != n as u8) {
        return Err(CryptoError::Decrypt);
    }
    buf.truncate(buf.len() - n);
    Ok(())
}

// ── Block-wise cipher wrappers ───────────────────────────────────────────────

/// Incremental AES-256-CBC encryptor.  Callers feed whole blocks; only the
/// final chunk is padded (see [`pad`]).
pub struct ContentEncryptor(Aes256CbcEnc);

impl ContentEncryptor {
    /// Encrypt in place.  `buf.len()` must be a multiple of [`BLOCK_LEN`].
    pub fn encrypt_blocks(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % BLOCK_LEN, 0);
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

pub struct ContentDecryptor(Aes256CbcDec);

impl ContentDecryptor {
    /// Decrypt in place.  `buf.len()` must be a multiple of [`BLOCK_LEN`].
    pub fn decrypt_blocks(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % BLOCK_LEN, 0);
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

// ── Content digest ───────────────────────────────────────────────────────────

/// The repository digest function: HMAC-SHA512 over plaintext under
/// encryption, plain BLAKE3 otherwise.  Either way the hex digest of a blob's
/// plaintext is its content-addressed identity.
pub enum Digest {
    Plain(Box<blake3::Hasher>),
    Keyed(Box<HmacSha512>),
}

impl Digest {
    pub fn plain() -> Self {
        Digest::Plain(Box::new(blake3::Hasher::new()))
    }

    pub fn for_keys(keys: Option<&KeySet>) -> Self {
        match keys {
            Some(k) => Digest::Keyed(Box::new(k.content_hmac())),
            None    => Digest::plain(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digest::Plain(h) => {
                h.update(data);
            }
            Digest::Keyed(m) => m.update(data),
        }
    }

    pub fn hex(self) -> String {
        match self {
            Digest::Plain(h) => h.finalize().to_hex().to_string(),
            Digest::Keyed(m) => hex::encode(m.finalize().into_bytes()),
        }
    }
}

// ── Streaming blob decryption ────────────────────────────────────────────────

/// Lazy reader for the `[IV | ciphertext | tag]` blob format.
///
/// Bytes are decrypted as they are pulled.  The trailing 64 bytes are held
/// back until EOF (the stream length is unknown), at which point the tag is
/// verified and the final block unpadded.  A tag or padding mismatch surfaces
/// as an `InvalidData` read error carrying [`CryptoError::Decrypt`].
pub struct DecryptReader<R: Read> {
    inner:    R,
    cipher:   ContentDecryptor,
    mac:      HmacSha512,
    carry:    Vec<u8>,
    out:      Vec<u8>,
    out_pos:  usize,
    held:     Option<[u8; BLOCK_LEN]>,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, keys: &KeySet) -> io::Result<Self> {
        let mut iv = [0u8; IV_LEN];
        inner
            .read_exact(&mut iv)
            .map_err(|_| CryptoError::TooShort(IV_LEN + BLOCK_LEN + TAG_LEN).into_io())?;
        let mut mac = keys.content_hmac();
        mac.update(&iv);
        Ok(Self {
            inner,
            cipher: keys.content_decryptor(&iv),
            mac,
            carry: Vec::with_capacity(CHUNK + TAG_LEN),
            out: Vec::with_capacity(CHUNK),
            out_pos: 0,
            held: None,
            finished: false,
        })
    }

    fn decrypt_into_out(&mut self, mut ct: Vec<u8>) {
        self.mac.update(&ct);
        self.cipher.decrypt_blocks(&mut ct);
        for block in ct.chunks_exact(BLOCK_LEN) {
            if let Some(prev) = self.held.take() {
                self.out.extend_from_slice(&prev);
            }
            let mut b = [0u8; BLOCK_LEN];
            b.copy_from_slice(block);
            self.held = Some(b);
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; CHUNK];
        loop {
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                // EOF: split off the tag, decrypt the remainder, verify.
                if self.carry.len() < TAG_LEN {
                    return Err(CryptoError::TooShort(IV_LEN + BLOCK_LEN + TAG_LEN).into_io());
                }
                let tag = self.carry.split_off(self.carry.len() - TAG_LEN);
                if self.carry.len() % BLOCK_LEN != 0 {
                    return Err(CryptoError::Decrypt.into_io());
                }
                let ct = std::mem::take(&mut self.carry);
                self.decrypt_into_out(ct);
                self.mac
                    .clone()
                    .verify_slice(&tag)
                    .map_err(|_| CryptoError::Decrypt.into_io())?;
                let mut last = match self.held.take() {
                    Some(b) => b.to_vec(),
                    None => return Err(CryptoError::Decrypt.into_io()),
                };
                unpad(&mut last).map_err(|e| e.into_io())?;
                self.out.extend_from_slice(&last);
                self.finished = true;
                return Ok(());
            }
            self.carry.extend_from_slice(&chunk[..n]);
            // Withhold the tag-sized suffix; decrypt any whole blocks before it.
            if self.carry.len() > TAG_LEN + BLOCK_LEN {
                let avail = self.carry.len() - TAG_LEN;
                let take = (avail / BLOCK_LEN) * BLOCK_LEN;
                if take > 0 {
                    let ct: Vec<u8> = self.carry.drain(..take).collect();
                    self.decrypt_into_out(ct);
                    return Ok(());
                }
            }
        }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_pos == self.out.len() {
            if self.finished {
                return Ok(0);
            }
            self.out.clear();
            self.out_pos = 0;
            self.fill()?;
        }
        let n = (self.out.len() - self.out_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

/// Encrypt `input` into `output` in the `[IV | ciphertext | tag]` framing.
/// Returns the total on-disk byte count.
pub fn encrypt_blob<R: Read, W: Write>(
    mut input: R,
    output: &mut W,
    keys: &KeySet,
) -> io::Result<u64> {
    let iv = new_iv();
    let mut cipher = keys.content_encryptor(&iv);
    let mut mac = keys.content_hmac();
    output.write_all(&iv)?;
    mac.update(&iv);
    let mut written = IV_LEN as u64;

    let mut chunk = [0u8; CHUNK];
    let mut carry: Vec<u8> = Vec::with_capacity(CHUNK + BLOCK_LEN);
    loop {
        let n = input.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&chunk[..n]);
        let take = (carry.len() / BLOCK_LEN) * BLOCK_LEN;
        if take > 0 {
            let mut ct: Vec<u8> = carry.drain(..take).collect();
            cipher.encrypt_blocks(&mut ct);
            mac.update(&ct);
            output.write_all(&ct)?;
            written += ct.len() as u64;
        }
    }
    pad(&mut carry);
    cipher.encrypt_blocks(&mut carry);
    mac.update(&carry);
    output.write_all(&carry)?;
    written += carry.len() as u64;

    let tag = mac.finalize().into_bytes();
    output.write_all(&tag)?;
    written += TAG_LEN as u64;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn keys() -> KeySet {
        KeySet::derive("hunter2", "testclient", &CryptoParams { iterations: 64 })
    }

    #[test]
    fn name_encryption_is_deterministic() {
        let k = keys();
        assert_eq!(k.encrypt_name("etc"), k.encrypt_name("etc"));
        // Stable across independent derivations of the same key.
        let k2 = keys();
        assert_eq!(k.encrypt_name("etc"), k2.encrypt_name("etc"));
        assert_ne!(k.encrypt_name("etc"), k.encrypt_name("var"));
    }

    #[test]
    fn name_round_trip() {
        let k = keys();
        for name in ["a", "файл.txt", "a-name-longer-than-one-cipher-block.tar.gz"] {
            let ct = k.encrypt_name(name);
            assert_eq!(k.decrypt_name(&ct).unwrap(), name);
        }
    }

    #[test]
    fn tampered_name_fails() {
        let k = keys();
        let ct = k.encrypt_name("secret");
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[IV_LEN + 1] ^= 0x40;
        let tampered = BASE64.encode(raw);
        assert!(matches!(k.decrypt_name(&tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails_name_decrypt() {
        let k = keys();
        let other = KeySet::derive("hunter3", "testclient", &CryptoParams { iterations: 64 });
        let ct = k.encrypt_name("secret");
        assert!(other.decrypt_name(&ct).is_err());
    }

    #[test]
    fn blob_round_trip() {
        let k = keys();
        for len in [0usize, 1, 15, 16, 17, 64 * 1024, 64 * 1024 + 5] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut blob = Vec::new();
            encrypt_blob(Cursor::new(&plain), &mut blob, &k).unwrap();

            let mut out = Vec::new();
            DecryptReader::new(Cursor::new(&blob), &k)
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            assert_eq!(out, plain);
        }
    }

    #[test]
    fn ciphertext_does_not_leak_plaintext() {
        let k = keys();
        let plain = b"s3cret s3cret s3cret";
        let mut blob = Vec::new();
        encrypt_blob(Cursor::new(&plain[..]), &mut blob, &k).unwrap();
        assert!(!blob.windows(6).any(|w| w == b"s3cret"));
    }

    #[test]
    fn corrupted_blob_fails_decrypt() {
        let k = keys();
        let mut blob = Vec::new();
        encrypt_blob(Cursor::new(&b"some content"[..]), &mut blob, &k).unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0x01;
        let mut out = Vec::new();
        let err = DecryptReader::new(Cursor::new(&blob), &k)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap_err();
        assert!(matches!(CryptoError::from_io(&err), Some(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails_blob_decrypt() {
        let k = keys();
        let other = KeySet::derive("hunter3", "testclient", &CryptoParams { iterations: 64 });
        let mut blob = Vec::new();
        encrypt_blob(Cursor::new(&b"payload"[..]), &mut blob, &k).unwrap();
        let mut out = Vec::new();
        assert!(DecryptReader::new(Cursor::new(&blob), &other)
            .unwrap()
            .read_to_end(&mut out)
            .is_err());
    }

    #[test]
    fn digest_modes_differ() {
        let k = keys();
        let mut plain = Digest::plain();
        plain.update(b"data");
        let mut keyed = Digest::for_keys(Some(&k));
        keyed.update(b"data");
        assert_ne!(plain.hex(), keyed.hex());
    }
}
