// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! APK Signature Scheme v2 signing block. The signing block sits between the
//! zip entries and the central directory:
//!
//! ```text
//! [content][u64 size][(u64 len, u32 id, value)...][u64 size]["APK Sig Block 42"][CD][EOCD]
//! ```
//!
//! The v2 value is a length-prefixed list of signers, each holding length
//! prefixed signed data, signatures, and public key blocks.

use std::io::{self, Read, Seek};

use bstr::ByteSlice;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::debug;

use crate::{
    format::block::{self, ByteRange, LengthIdValueList, LengthPrefixedList},
    stream::{ByteSource, ReadAt},
};

pub const SIG_BLOCK_MAGIC: [u8; 16] = *b"APK Sig Block 42";

/// ID of the APK Signature Scheme v2 entry in the signing block.
pub const SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109871a;

pub const EOCD_MAGIC: u32 = 0x06054b50;
/// Size of the end of central directory record, excluding the comment.
pub const EOCD_SIZE: u64 = 22;
/// Offset of the central directory offset field in the EOCD record.
pub const EOCD_CD_OFFSET_FIELD: usize = 16;

/// Size of the trailing size field and the magic.
const SIG_BLOCK_FOOTER_SIZE: u64 = 8 + 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Comment length {comment_len} does not fit in {file_len} byte file")]
    CommentOutOfBounds { comment_len: u16, file_len: u64 },
    #[error("Zip comment is too long: {0} bytes")]
    CommentTooLong(usize),
    #[error("Invalid end of central directory magic: {0:#010x}")]
    InvalidEocdMagic(u32),
    #[error("EOCD comment length field ({actual}) does not match expected length ({expected})")]
    EocdCommentMismatch { expected: u16, actual: u16 },
    #[error("Central directory offset {cd_offset} is past EOCD at {eocd_offset}")]
    CentralDirectoryOutOfBounds { cd_offset: u64, eocd_offset: u64 },
    #[error("Central directory offset {0} leaves no room for a signing block")]
    NoRoomForSigningBlock(u64),
    #[error("Invalid signing block magic: {:?}", .0.as_bstr())]
    InvalidMagic([u8; 16]),
    #[error("Signing block size {size} is invalid for central directory at {cd_offset}")]
    SigningBlockOutOfBounds { size: u64, cd_offset: u64 },
    #[error("Signing block size fields do not match: {header} != {footer}")]
    SigningBlockSizeMismatch { header: u64, footer: u64 },
    #[error("{0:?} region does not fit in 32 bits")]
    RegionTooLarge(&'static str),
    #[error("Missing {0:?} field")]
    MissingField(&'static str),
    #[error("Failed to parse {0:?} field")]
    Block(&'static str, #[source] block::Error),
    #[error("Failed to read {0:?} field")]
    ReadField(&'static str, #[source] io::Error),
    #[error("Failed to read zip archive")]
    Zip(#[source] zip::result::ZipError),
}

type Result<T> = std::result::Result<T, Error>;

/// The four contiguous regions of a signed package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppBlock {
    pub content: ByteRange,
    pub signature_block: ByteRange,
    pub central_directory: ByteRange,
    pub end_of_central_directory: ByteRange,
}

fn region(name: &'static str, start: u64, end: u64) -> Result<ByteRange> {
    let length = u32::try_from(end - start).map_err(|_| Error::RegionTooLarge(name))?;

    Ok(ByteRange::new(start, length))
}

/// Get the length of the zip archive comment. This parses the entire central
/// directory, which also confirms that the file is a zip at all.
pub fn eocd_comment_len(reader: impl Read + Seek) -> Result<u16> {
    let archive = zip::ZipArchive::new(reader).map_err(Error::Zip)?;
    let len = archive.comment().len();

    // The EOCD comment length field is 16 bits.
    u16::try_from(len).map_err(|_| Error::CommentTooLong(len))
}

/// Locate the signing block and compute the region boundaries. Every layout
/// check happens here, before any signature or digest work. Offsets are only
/// trusted after they are checked against the file size and each other.
pub fn locate(source: &(impl ReadAt + ?Sized), comment_len: u16) -> Result<AppBlock> {
    let file_len = source
        .file_len()
        .map_err(|e| Error::ReadField("file size", e))?;

    let eocd_offset = file_len
        .checked_sub(EOCD_SIZE + u64::from(comment_len))
        .ok_or(Error::CommentOutOfBounds {
            comment_len,
            file_len,
        })?;

    // The record is addressed relative to the end of the file, like the zip
    // reader does.
    let eocd = source
        .read_array::<{ EOCD_SIZE as usize }>(-i64::from(comment_len) - EOCD_SIZE as i64)
        .map_err(|e| Error::ReadField("EOCD", e))?;

    let magic = LittleEndian::read_u32(&eocd[0..4]);
    if magic != EOCD_MAGIC {
        return Err(Error::InvalidEocdMagic(magic));
    }

    let eocd_comment_len = LittleEndian::read_u16(&eocd[20..22]);
    if eocd_comment_len != comment_len {
        return Err(Error::EocdCommentMismatch {
            expected: comment_len,
            actual: eocd_comment_len,
        });
    }

    let cd_offset = u64::from(LittleEndian::read_u32(
        &eocd[EOCD_CD_OFFSET_FIELD..EOCD_CD_OFFSET_FIELD + 4],
    ));
    if cd_offset > eocd_offset {
        return Err(Error::CentralDirectoryOutOfBounds {
            cd_offset,
            eocd_offset,
        });
    }

    let footer_offset = cd_offset
        .checked_sub(SIG_BLOCK_FOOTER_SIZE)
        .ok_or(Error::NoRoomForSigningBlock(cd_offset))?;

    let mut footer = [0u8; SIG_BLOCK_FOOTER_SIZE as usize];
    source
        .read_exact_at(&mut footer, footer_offset)
        .map_err(|e| Error::ReadField("signing block footer", e))?;

    let mut magic = [0u8; 16];
    magic.copy_from_slice(&footer[8..]);
    if magic != SIG_BLOCK_MAGIC {
        return Err(Error::InvalidMagic(magic));
    }

    // The size field counts everything after the leading size field.
    let size = LittleEndian::read_u64(&footer[..8]);
    let start = size
        .checked_add(8)
        .filter(|_| size >= SIG_BLOCK_FOOTER_SIZE)
        .and_then(|n| cd_offset.checked_sub(n))
        .ok_or(Error::SigningBlockOutOfBounds { size, cd_offset })?;

    let mut header = [0u8; 8];
    source
        .read_exact_at(&mut header, start)
        .map_err(|e| Error::ReadField("signing block header", e))?;

    let header_size = LittleEndian::read_u64(&header);
    if header_size != size {
        return Err(Error::SigningBlockSizeMismatch {
            header: header_size,
            footer: size,
        });
    }

    let app_block = AppBlock {
        content: region("content", 0, start)?,
        signature_block: region("signature block", start, cd_offset)?,
        central_directory: region("central directory", cd_offset, eocd_offset)?,
        end_of_central_directory: region("end of central directory", eocd_offset, file_len)?,
    };

    debug!("Package layout: {app_block:?}");

    Ok(app_block)
}

/// Read the entire signing block into memory.
pub fn read_signing_block(source: &(impl ReadAt + ?Sized), app_block: &AppBlock) -> Result<Vec<u8>> {
    let range = app_block.signature_block;
    let mut buf = crate::stream::try_alloc(range.length as usize)
        .map_err(|e| Error::ReadField("signing block", e))?;

    source
        .read_exact_at(&mut buf, range.offset)
        .map_err(|e| Error::ReadField("signing block", e))?;

    Ok(buf)
}

/// Range of the ID-value pairs within a signing block buffer.
fn pairs_range(block: &[u8]) -> Result<ByteRange> {
    let len = block.len() as u64;
    if len < 8 + SIG_BLOCK_FOOTER_SIZE {
        return Err(Error::MissingField("signing block pairs"));
    }

    region("signing block pairs", 8, len - SIG_BLOCK_FOOTER_SIZE)
}

/// Find the first entry with the specified ID. Entries with other IDs are
/// skipped. The returned range is relative to `block`.
pub fn find_entry(block: &[u8], id: u32) -> Result<Option<ByteRange>> {
    let pairs = pairs_range(block)?;
    let data = pairs
        .slice(block)
        .map_err(|e| Error::Block("signing block pairs", e))?;

    for entry in LengthIdValueList::new(data) {
        let (entry_id, range) = entry.map_err(|e| Error::Block("signing block entry", e))?;

        if entry_id == id {
            return Ok(Some(child(pairs, range)));
        }

        debug!("Skipping signing block entry with ID {entry_id:#010x}");
    }

    Ok(None)
}

/// An `(algorithm ID, data)` record used for both digests and signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlgorithmRecord {
    pub algorithm_id: u32,
    pub data: ByteRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedDataBundle {
    /// The entire signed data block. This is what the signature covers.
    pub raw: ByteRange,
    pub digests: ByteRange,
    pub certificates: ByteRange,
    /// First entry of `digests`.
    pub digest: AlgorithmRecord,
    /// First entry of `certificates`.
    pub certificate: ByteRange,
}

/// Signature information of the first signer. All ranges are relative to the
/// signing block buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackageSignature {
    pub public_key: ByteRange,
    pub signed_data: SignedDataBundle,
    pub signature: AlgorithmRecord,
}

/// Convert a range relative to `parent`'s data into one relative to the buffer
/// that `parent` is relative to. This cannot overflow because the child was
/// parsed from a slice of the parent.
fn child(parent: ByteRange, range: ByteRange) -> ByteRange {
    ByteRange::new(parent.offset + range.offset, range.length)
}

fn slice<'a>(block: &'a [u8], range: ByteRange, name: &'static str) -> Result<&'a [u8]> {
    range.slice(block).map_err(|e| Error::Block(name, e))
}

/// Parse the next length-prefixed block at `pos` within `parent`. An absent
/// block is reported as missing rather than truncated.
fn next_block(
    block: &[u8],
    parent: ByteRange,
    pos: usize,
    name: &'static str,
) -> Result<(ByteRange, usize)> {
    let data = slice(block, parent, name)?;
    let remain = data.get(pos..).unwrap_or_default();

    if remain.is_empty() {
        return Err(Error::MissingField(name));
    }

    let (range, next) = block::parse_length_prefixed(remain).map_err(|e| Error::Block(name, e))?;
    let range = ByteRange::new(range.offset + pos as u64, range.length);

    Ok((child(parent, range), pos + next))
}

/// Get the first entry of a length-prefixed list.
fn first_in_list(block: &[u8], list: ByteRange, name: &'static str) -> Result<ByteRange> {
    let data = slice(block, list, name)?;

    match LengthPrefixedList::new(data).next() {
        Some(r) => Ok(child(list, r.map_err(|e| Error::Block(name, e))?)),
        None => Err(Error::MissingField(name)),
    }
}

/// Parse a `u32` algorithm ID followed by a length-prefixed data block.
fn algorithm_record(block: &[u8], record: ByteRange, name: &'static str) -> Result<AlgorithmRecord> {
    let data = slice(block, record, name)?;
    let id_bytes = data.get(..4).ok_or(Error::Block(
        name,
        block::Error::Truncated {
            field: "algorithm ID",
            offset: record.offset,
            needed: 4,
            available: data.len() as u64,
        },
    ))?;

    let algorithm_id = LittleEndian::read_u32(id_bytes);
    let (range, _) = block::parse_length_prefixed(&data[4..]).map_err(|e| Error::Block(name, e))?;

    Ok(AlgorithmRecord {
        algorithm_id,
        data: child(record, ByteRange::new(range.offset + 4, range.length)),
    })
}

impl PackageSignature {
    /// Parse the first signer of the entry at `value` within `block`.
    pub fn parse(block: &[u8], value: ByteRange) -> Result<Self> {
        let signers = next_block(block, value, 0, "signers")?.0;
        let signer = first_in_list(block, signers, "signer")?;

        let (signed_data, pos) = next_block(block, signer, 0, "signed data")?;
        let (signatures, pos) = next_block(block, signer, pos, "signatures")?;
        let (public_key, _) = next_block(block, signer, pos, "public key")?;

        if public_key.is_empty() {
            return Err(Error::MissingField("public key"));
        }

        let (digests, pos) = next_block(block, signed_data, 0, "digests")?;
        let (certificates, _) = next_block(block, signed_data, pos, "certificates")?;

        let digest_record = first_in_list(block, digests, "digest")?;
        let digest = algorithm_record(block, digest_record, "digest")?;

        let certificate = first_in_list(block, certificates, "certificate")?;

        let signature_record = first_in_list(block, signatures, "signature")?;
        let signature = algorithm_record(block, signature_record, "signature")?;

        Ok(Self {
            public_key,
            signed_data: SignedDataBundle {
                raw: signed_data,
                digests,
                certificates,
                digest,
                certificate,
            },
            signature,
        })
    }

    /// Find the v2 entry in a signing block and parse its first signer.
    pub fn from_signing_block(block: &[u8]) -> Result<Self> {
        let value = find_entry(block, SIGNATURE_SCHEME_V2_BLOCK_ID)?
            .ok_or(Error::MissingField("v2 signature scheme entry"))?;

        Self::parse(block, value)
    }
}

/// Build a signing block containing the specified ID-value pairs.
pub fn encode_signing_block(entries: &[(u32, &[u8])]) -> Result<Vec<u8>> {
    let mut pairs = vec![];

    for (id, value) in entries {
        block::encode_length_id_value(&mut pairs, *id, value)
            .map_err(|e| Error::Block("signing block entry", e))?;
    }

    let size = pairs.len() as u64 + SIG_BLOCK_FOOTER_SIZE;
    let mut result = Vec::with_capacity(pairs.len() + 32);
    result.extend_from_slice(&size.to_le_bytes());
    result.extend_from_slice(&pairs);
    result.extend_from_slice(&size.to_le_bytes());
    result.extend_from_slice(&SIG_BLOCK_MAGIC);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn lp(parts: &[&[u8]]) -> Vec<u8> {
        let mut data = vec![];
        for part in parts {
            block::encode_length_prefixed(&mut data, part).unwrap();
        }
        data
    }

    fn record(id: u32, data: &[u8]) -> Vec<u8> {
        let mut result = id.to_le_bytes().to_vec();
        block::encode_length_prefixed(&mut result, data).unwrap();
        result
    }

    fn signer_value() -> Vec<u8> {
        let digests = lp(&[&record(0x0103, b"digest")]);
        let certificates = lp(&[b"cert", b"ignored cert"]);
        let signed_data = lp(&[&digests, &certificates, b""]);
        let signatures = lp(&[&record(0x0103, b"signature")]);
        let signer = lp(&[&signed_data, &signatures, b"public key"]);

        lp(&[&lp(&[&signer])])
    }

    fn package(block: &[u8], comment: &[u8]) -> Vec<u8> {
        let content = b"zip entries".to_vec();
        let cd = b"central directory";

        let mut data = content;
        data.extend_from_slice(block);
        let cd_offset = data.len() as u32;
        data.extend_from_slice(cd);

        data.extend_from_slice(&EOCD_MAGIC.to_le_bytes());
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&cd_offset.to_le_bytes());
        data.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        data.extend_from_slice(comment);

        data
    }

    #[test]
    fn locate_regions() {
        let value = signer_value();
        let block = encode_signing_block(&[(0x42, b"other"), (SIGNATURE_SCHEME_V2_BLOCK_ID, &value)])
            .unwrap();
        let data = package(&block, b"comment");

        let app_block = locate(&data, 7).unwrap();
        assert_eq!(app_block.content, ByteRange::new(0, 11));
        assert_eq!(
            app_block.signature_block,
            ByteRange::new(11, block.len() as u32)
        );
        assert_eq!(app_block.central_directory.offset, app_block.signature_block.end());
        assert_eq!(app_block.central_directory.length, 17);
        assert_eq!(
            app_block.end_of_central_directory,
            ByteRange::new(app_block.central_directory.end(), 22 + 7)
        );
        assert_eq!(app_block.end_of_central_directory.end(), data.len() as u64);

        let block_data = read_signing_block(&data, &app_block).unwrap();
        assert_eq!(block_data, block);
    }

    #[test]
    fn parse_first_signer() {
        let value = signer_value();
        let block = encode_signing_block(&[(0x42, b"other"), (SIGNATURE_SCHEME_V2_BLOCK_ID, &value)])
            .unwrap();

        let sig = PackageSignature::from_signing_block(&block).unwrap();
        assert_eq!(sig.public_key.slice(&block).unwrap(), b"public key");
        assert_eq!(sig.signed_data.digest.algorithm_id, 0x0103);
        assert_eq!(sig.signed_data.digest.data.slice(&block).unwrap(), b"digest");
        assert_eq!(sig.signed_data.certificate.slice(&block).unwrap(), b"cert");
        assert_eq!(sig.signature.algorithm_id, 0x0103);
        assert_eq!(sig.signature.data.slice(&block).unwrap(), b"signature");

        let raw = sig.signed_data.raw.slice(&block).unwrap();
        assert_eq!(&raw[..4], &sig.signed_data.digests.length.to_le_bytes());
    }

    #[test]
    fn missing_v2_entry() {
        let block = encode_signing_block(&[(0x42, b"other")]).unwrap();

        assert_matches!(
            PackageSignature::from_signing_block(&block),
            Err(Error::MissingField("v2 signature scheme entry"))
        );
    }

    #[test]
    fn missing_and_truncated_fields() {
        // Signer with signed data and signatures, but no public key.
        let signer = lp(&[&lp(&[&lp(&[]), &lp(&[])]), &lp(&[])]);
        let value = lp(&[&lp(&[&signer])]);
        let block = encode_signing_block(&[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)]).unwrap();
        assert_matches!(
            PackageSignature::from_signing_block(&block),
            Err(Error::MissingField("public key"))
        );

        // Signers list length overruns the entry.
        let mut value = lp(&[&lp(&[b"x"])]);
        value[0] = 0xff;
        let block = encode_signing_block(&[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)]).unwrap();
        assert_matches!(
            PackageSignature::from_signing_block(&block),
            Err(Error::Block("signers", block::Error::Truncated { .. }))
        );
    }

    #[test]
    fn bad_magic() {
        let value = signer_value();
        let mut block = encode_signing_block(&[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)]).unwrap();
        let n = block.len();
        block[n - 1] ^= 0xff;
        let data = package(&block, b"");

        assert_matches!(locate(&data, 0), Err(Error::InvalidMagic(_)));
    }

    #[test]
    fn bad_bounds() {
        let value = signer_value();
        let block = encode_signing_block(&[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)]).unwrap();
        let data = package(&block, b"");
        let n = data.len();

        assert_matches!(
            locate(&data, u16::MAX),
            Err(Error::CommentOutOfBounds { .. })
        );
        assert_matches!(locate(&data[..10], 0), Err(Error::CommentOutOfBounds { .. }));

        // Central directory offset past the EOCD.
        let mut bad = data.clone();
        bad[n - 6..n - 2].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_matches!(
            locate(&bad, 0),
            Err(Error::CentralDirectoryOutOfBounds { .. })
        );

        // Central directory offset too small to hold a signing block footer.
        let mut bad = data.clone();
        bad[n - 6..n - 2].copy_from_slice(&4u32.to_le_bytes());
        assert_matches!(locate(&bad, 0), Err(Error::NoRoomForSigningBlock(4)));

        // Trailing size larger than the data before the central directory.
        let mut bad = data.clone();
        let size_offset = 11 + block.len() - 24;
        bad[size_offset..size_offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_matches!(
            locate(&bad, 0),
            Err(Error::SigningBlockOutOfBounds { .. })
        );

        // Leading and trailing sizes disagree.
        let mut bad = data.clone();
        bad[11] ^= 1;
        assert_matches!(
            locate(&bad, 0),
            Err(Error::SigningBlockSizeMismatch { .. })
        );

        // EOCD magic.
        let mut bad = data;
        bad[n - 22] ^= 1;
        assert_matches!(locate(&bad, 0), Err(Error::InvalidEocdMagic(_)));
    }
}
