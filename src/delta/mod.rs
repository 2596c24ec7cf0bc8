//! Signature/delta/patch primitives over byte streams.
//!
//! A [`Signature`] summarises a base stream as fixed-size blocks, each keyed
//! by a rolling weak checksum and a truncated BLAKE3 strong hash.  [`diff`]
//! matches a target stream against a signature and emits a patch of
//! copy/literal ops; [`PatchReader`] reproduces the target lazily from a
//! seekable base plus the patch stream.  The target is reproduced byte-exact:
//! a digest computed over the patched result equals the digest stored in the
//! catalog.
//!
//! # Signature wire format (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic       = 0x47535653  ("SVSG")
//!    4      2   version     = 1
//!    6      4   block_size
//!   10      4   block_count
//!   14      4   header_crc32 over bytes [0..14]
//!   18   N×20   entries: weak (u32) ‖ strong (16 B truncated BLAKE3)
//! ```
//!
//! # Patch wire format
//!
//! ```text
//! magic = 0x54445653 ("SVDT"), version = 1 (u16), then ops:
//!   0x01 COPY    offset (u64) ‖ len (u32)   — bytes from the base
//!   0x02 LITERAL len (u32) ‖ raw bytes      — bytes carried in the patch
//!   0x00 END
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const SIG_MAGIC:   u32 = 0x4753_5653; // "SVSG"
pub const PATCH_MAGIC: u32 = 0x5444_5653; // "SVDT"
pub const FORMAT_VERSION: u16 = 1;

/// Default block size for signatures; small enough that a few changed bytes
/// cost one block of literal data.
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Truncated BLAKE3 length per block entry.
const STRONG_LEN: usize = 16;

const OP_END:     u8 = 0x00;
const OP_COPY:    u8 = 0x01;
const OP_LITERAL: u8 = 0x02;

/// Cap on a single literal op, so patches stream without large buffers.
const MAX_LITERAL: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("Invalid signature data: {0}")]
    BadSignature(String),
    #[error("Invalid patch data: {0}")]
    BadPatch(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Rolling checksum ─────────────────────────────────────────────────────────

/// rsync-style weak checksum: `a` is the byte sum, `b` weights each byte by
/// its distance from the window end; both kept mod 2^16.
#[derive(Clone, Copy)]
struct Rolling {
    a:   u32,
    b:   u32,
    len: u32,
}

impl Rolling {
    fn from(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &x) in window.iter().enumerate() {
            a = a.wrapping_add(x as u32);
            b = b.wrapping_add((len - i as u32) * x as u32);
        }
        Self { a: a & 0xffff, b: b & 0xffff, len }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32) & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.len * out as u32)
            .wrapping_add(self.a)
            & 0xffff;
    }

    fn digest(&self) -> u32 {
        self.a | (self.b << 16)
    }
}

fn strong_hash(window: &[u8]) -> [u8; STRONG_LEN] {
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&blake3::hash(window).as_bytes()[..STRONG_LEN]);
    out
}

// ── Signature ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct BlockSig {
    weak:   u32,
    strong: [u8; STRONG_LEN],
}

/// Block table of a base stream, suitable for delta generation against it.
pub struct Signature {
    block_size: u32,
    blocks:     Vec<BlockSig>,
    /// weak checksum → candidate block indices (collisions resolved by the
    /// strong hash).
    index: HashMap<u32, Vec<u32>>,
}

impl Signature {
    /// Summarise `base` into `block_size` blocks.
    pub fn generate<R: Read>(mut base: R, block_size: u32) -> Result<Self, DeltaError> {
        if block_size == 0 {
            return Err(DeltaError::BadSignature("block_size must be nonzero".into()));
        }
        let mut blocks = Vec::new();
        let mut buf = vec![0u8; block_size as usize];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = base.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            let window = &buf[..filled];
            blocks.push(BlockSig {
                weak:   Rolling::from(window).digest(),
                strong: strong_hash(window),
            });
            if filled < buf.len() {
                break; // trailing short block
            }
        }
        Ok(Self::from_blocks(block_size, blocks))
    }

    fn from_blocks(block_size: u32, blocks: Vec<BlockSig>) -> Self {
        let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
        for (i, b) in blocks.iter().enumerate() {
            index.entry(b.weak).or_default().push(i as u32);
        }
        Self { block_size, blocks, index }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Resolve a weak hit to a block index, confirming with the strong hash.
    fn find(&self, weak: u32, window: &[u8]) -> Option<u32> {
        let candidates = self.index.get(&weak)?;
        let strong = strong_hash(window);
        candidates
            .iter()
            .copied()
            .find(|&i| self.blocks[i as usize].strong == strong)
    }

    /// Serialize in the sidecar wire format.
    pub fn write<W: Write>(&self, mut w: W) -> Result<(), DeltaError> {
        let mut header = Vec::with_capacity(14);
        header.write_u32::<LittleEndian>(SIG_MAGIC)?;
        header.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        header.write_u32::<LittleEndian>(self.block_size)?;
        header.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        w.write_all(&header)?;
        w.write_u32::<LittleEndian>(crc.finalize())?;
        for b in &self.blocks {
            w.write_u32::<LittleEndian>(b.weak)?;
            w.write_all(&b.strong)?;
        }
        Ok(())
    }

    /// Parse a serialized signature.  The header CRC32 must hold before any
    /// entry is read.
    pub fn read<R: Read>(mut r: R) -> Result<Self, DeltaError> {
        let mut header = [0u8; 14];
        r.read_exact(&mut header)?;
        let stored_crc = r.read_u32::<LittleEndian>()?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        if crc.finalize() != stored_crc {
            return Err(DeltaError::BadSignature("header CRC32 mismatch".into()));
        }
        let mut cursor = &header[..];
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != SIG_MAGIC {
            return Err(DeltaError::BadSignature(format!("bad magic {magic:#010x}")));
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(DeltaError::BadSignature(format!("unsupported version {version}")));
        }
        let block_size = cursor.read_u32::<LittleEndian>()?;
        if block_size == 0 {
            return Err(DeltaError::BadSignature("block_size must be nonzero".into()));
        }
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let weak = r.read_u32::<LittleEndian>()?;
            let mut strong = [0u8; STRONG_LEN];
            r.read_exact(&mut strong)?;
            blocks.push(BlockSig { weak, strong });
        }
        Ok(Self::from_blocks(block_size, blocks))
    }
}

// ── Delta generation ─────────────────────────────────────────────────────────

struct PatchWriter<W: Write> {
    out:          W,
    lit:          Vec<u8>,
    pending_copy: Option<(u64, u64)>, // (offset, len) — adjacent copies merge
}

impl<W: Write> PatchWriter<W> {
    fn new(mut out: W) -> Result<Self, DeltaError> {
        out.write_u32::<LittleEndian>(PATCH_MAGIC)?;
        out.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        Ok(Self { out, lit: Vec::new(), pending_copy: None })
    }

    fn literal(&mut self, byte: u8) -> Result<(), DeltaError> {
        self.flush_copy()?;
        self.lit.push(byte);
        if self.lit.len() >= MAX_LITERAL {
            self.flush_literal()?;
        }
        Ok(())
    }

    fn literal_slice(&mut self, bytes: &[u8]) -> Result<(), DeltaError> {
        for &b in bytes {
            self.literal(b)?;
        }
        Ok(())
    }

    fn copy(&mut self, offset: u64, len: u64) -> Result<(), DeltaError> {
        self.flush_literal()?;
        match self.pending_copy {
            Some((o, l)) if o + l == offset => self.pending_copy = Some((o, l + len)),
            Some(_) => {
                self.flush_copy()?;
                self.pending_copy = Some((offset, len));
            }
            None => self.pending_copy = Some((offset, len)),
        }
        Ok(())
    }

    fn flush_literal(&mut self) -> Result<(), DeltaError> {
        if self.lit.is_empty() {
            return Ok(());
        }
        self.out.write_u8(OP_LITERAL)?;
        self.out.write_u32::<LittleEndian>(self.lit.len() as u32)?;
        self.out.write_all(&self.lit)?;
        self.lit.clear();
        Ok(())
    }

    fn flush_copy(&mut self) -> Result<(), DeltaError> {
        if let Some((offset, mut len)) = self.pending_copy.take() {
            let mut off = offset;
            while len > 0 {
                let chunk = len.min(u32::MAX as u64);
                self.out.write_u8(OP_COPY)?;
                self.out.write_u64::<LittleEndian>(off)?;
                self.out.write_u32::<LittleEndian>(chunk as u32)?;
                off += chunk;
                len -= chunk;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), DeltaError> {
        self.flush_copy()?;
        self.flush_literal()?;
        self.out.write_u8(OP_END)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Compute a patch transforming the signature's base into `target`.
pub fn diff<R: Read, W: Write>(
    sig: &Signature,
    mut target: R,
    patch_out: W,
) -> Result<(), DeltaError> {
    let bs = sig.block_size as usize;
    let mut pw = PatchWriter::new(patch_out)?;

    let mut buf: Vec<u8> = Vec::with_capacity(bs * 64);
    let mut start = 0usize; // first unconsumed byte in buf
    let mut eof = false;
    let mut rolling: Option<Rolling> = None;
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        // Keep at least one full window buffered (plus one byte to roll into).
        while !eof && buf.len() - start < bs + 1 {
            let n = target.read(&mut chunk)?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        let avail = buf.len() - start;
        if avail == 0 {
            break;
        }
        if avail < bs {
            // Tail shorter than one block can only be literal.
            pw.literal_slice(&buf[start..])?;
            break;
        }

        let window = &buf[start..start + bs];
        let roll = match rolling {
            Some(r) => r,
            None => {
                let r = Rolling::from(window);
                rolling = Some(r);
                r
            }
        };

        if let Some(idx) = sig.find(roll.digest(), window) {
            pw.copy(idx as u64 * sig.block_size as u64, bs as u64)?;
            start += bs;
            rolling = None;
        } else {
            pw.literal(buf[start])?;
            if start + bs < buf.len() {
                let mut r = roll;
                r.roll(buf[start], buf[start + bs]);
                rolling = Some(r);
            } else {
                rolling = None;
            }
            start += 1;
        }

        // Periodically drop consumed bytes so the buffer stays bounded.
        if start >= bs * 32 {
            buf.drain(..start);
            start = 0;
        }
    }

    pw.finish()
}

// ── Patch application ────────────────────────────────────────────────────────

enum PatchOp {
    Copy { remaining: u64 },
    Literal { remaining: u64 },
}

/// Lazily reproduces the target from a seekable base stream and a patch
/// stream.  Bytes are produced on demand; nothing is materialized beyond the
/// caller's buffer.
pub struct PatchReader<B: Read + Seek, P: Read> {
    base:    B,
    patch:   P,
    current: Option<PatchOp>,
    done:    bool,
}

impl<B: Read + Seek, P: Read> PatchReader<B, P> {
    pub fn new(base: B, mut patch: P) -> Result<Self, DeltaError> {
        let magic = patch.read_u32::<LittleEndian>()?;
        if magic != PATCH_MAGIC {
            return Err(DeltaError::BadPatch(format!("bad magic {magic:#010x}")));
        }
        let version = patch.read_u16::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(DeltaError::BadPatch(format!("unsupported version {version}")));
        }
        Ok(Self { base, patch, current: None, done: false })
    }

    fn next_op(&mut self) -> io::Result<()> {
        let op = self.patch.read_u8()?;
        match op {
            OP_END => {
                self.done = true;
            }
            OP_COPY => {
                let offset = self.patch.read_u64::<LittleEndian>()?;
                let len = self.patch.read_u32::<LittleEndian>()? as u64;
                self.base.seek(SeekFrom::Start(offset))?;
                self.current = Some(PatchOp::Copy { remaining: len });
            }
            OP_LITERAL => {
                let len = self.patch.read_u32::<LittleEndian>()? as u64;
                self.current = Some(PatchOp::Literal { remaining: len });
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown patch opcode {other:#04x}"),
                ));
            }
        }
        Ok(())
    }
}

impl<B: Read + Seek, P: Read> Read for PatchReader<B, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.done {
                return Ok(0);
            }
            match &mut self.current {
                None => self.next_op()?,
                Some(PatchOp::Copy { remaining }) => {
                    if *remaining == 0 {
                        self.current = None;
                        continue;
                    }
                    let want = (*remaining).min(buf.len() as u64) as usize;
                    let n = self.base.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "patch copy range exceeds base length",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                Some(PatchOp::Literal { remaining }) => {
                    if *remaining == 0 {
                        self.current = None;
                        continue;
                    }
                    let want = (*remaining).min(buf.len() as u64) as usize;
                    let n = self.patch.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "patch literal truncated",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
            }
        }
    }
}

/// Convenience: fully apply a patch, writing the target into `out`.
pub fn apply<B: Read + Seek, P: Read, W: Write>(
    base: B,
    patch: P,
    out: &mut W,
) -> Result<u64, DeltaError> {
    let mut reader = PatchReader::new(base, patch)?;
    Ok(io::copy(&mut reader, out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn round_trip(base: &[u8], target: &[u8], block_size: u32) -> Vec<u8> {
        let sig = Signature::generate(Cursor::new(base), block_size).unwrap();
        let mut patch = Vec::new();
        diff(&sig, Cursor::new(target), &mut patch).unwrap();
        let mut out = Vec::new();
        apply(Cursor::new(base), Cursor::new(&patch), &mut out).unwrap();
        out
    }

    #[test]
    fn identical_input_is_all_copies() {
        // Block-aligned length: every window matches, copies merge into one.
        let base: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();
        let sig = Signature::generate(Cursor::new(&base), 512).unwrap();
        let mut patch = Vec::new();
        diff(&sig, Cursor::new(&base), &mut patch).unwrap();
        // Merged copies: header + one COPY op + END.
        assert!(patch.len() < 64, "patch was {} bytes", patch.len());

        let mut out = Vec::new();
        apply(Cursor::new(&base), Cursor::new(&patch), &mut out).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn small_edit_small_patch() {
        let base: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 239) as u8).collect();
        let mut target = base.clone();
        target[500_000..500_004].copy_from_slice(b"EDIT");

        let sig = Signature::generate(Cursor::new(&base), DEFAULT_BLOCK_SIZE).unwrap();
        let mut patch = Vec::new();
        diff(&sig, Cursor::new(&target), &mut patch).unwrap();
        assert!(patch.len() < 4096, "patch was {} bytes", patch.len());

        let mut out = Vec::new();
        apply(Cursor::new(&base), Cursor::new(&patch), &mut out).unwrap();
        assert_eq!(out, target);
    }

    #[test]
    fn disjoint_content_is_all_literal() {
        let base = vec![0u8; 4096];
        let target: Vec<u8> = (0..5000u32).map(|i| (i % 13 + 1) as u8).collect();
        assert_eq!(round_trip(&base, &target, 512), target);
    }

    #[test]
    fn empty_base_and_target() {
        assert_eq!(round_trip(b"", b"hello", 128), b"hello");
        assert_eq!(round_trip(b"hello", b"", 128), b"");
    }

    #[test]
    fn signature_serialization_round_trips() {
        let base: Vec<u8> = (0..9999u32).map(|i| (i % 251) as u8).collect();
        let sig = Signature::generate(Cursor::new(&base), 1024).unwrap();
        let mut wire = Vec::new();
        sig.write(&mut wire).unwrap();
        let sig2 = Signature::read(Cursor::new(&wire)).unwrap();
        assert_eq!(sig2.block_size(), 1024);
        assert_eq!(sig2.block_count(), sig.block_count());

        // A patch built from the deserialized signature still applies.
        let mut target = base.clone();
        target[5000] ^= 0xff;
        let mut patch = Vec::new();
        diff(&sig2, Cursor::new(&target), &mut patch).unwrap();
        let mut out = Vec::new();
        apply(Cursor::new(&base), Cursor::new(&patch), &mut out).unwrap();
        assert_eq!(out, target);
    }

    #[test]
    fn corrupt_signature_header_rejected() {
        let sig = Signature::generate(Cursor::new(b"abcdef"), 4).unwrap();
        let mut wire = Vec::new();
        sig.write(&mut wire).unwrap();
        wire[6] ^= 0x01; // block_size byte
        assert!(matches!(
            Signature::read(Cursor::new(&wire)),
            Err(DeltaError::BadSignature(_))
        ));
    }

    proptest! {
        #[test]
        fn patched_target_is_byte_exact(
            base in proptest::collection::vec(any::<u8>(), 0..8192),
            target in proptest::collection::vec(any::<u8>(), 0..8192),
            block_size in 16u32..512,
        ) {
            prop_assert_eq!(round_trip(&base, &target, block_size), target);
        }
    }
}
