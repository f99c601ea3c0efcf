// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use ring::digest::{Algorithm, Context};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use thiserror::Error;

use crate::{
    crypto::{self, RsaPrivateKeyExt, RsaPublicKeyExt, SignatureAlgorithm},
    format::padding,
    stream::{
        self, ByteSource, CountingReader, FromReader, ReadAt, ReadDiscardExt, ReadFixedSizeExt,
        ReadStringExt, ToWriter, WriteStringExt, WriteZerosExt,
    },
    util,
};

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_SUB: u32 = 0;

pub const FOOTER_VERSION_MAJOR: u32 = 1;
pub const FOOTER_VERSION_MINOR: u32 = 0;

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";
pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";

/// Maximum header size. This is the same limit as what avbtool enforces. This
/// value is also used as the limit for individual descriptor fields to allow
/// for early fail. No individual field can actually be this size.
pub const HEADER_MAX_SIZE: u64 = 64 * 1024;

/// Number of rollback index slots that libavb tracks.
pub const MAX_ROLLBACK_INDEX_LOCATIONS: usize = 32;

pub const DESCRIPTOR_TAG_PROPERTY: u64 = 0;
pub const DESCRIPTOR_TAG_HASHTREE: u64 = 1;
pub const DESCRIPTOR_TAG_HASH: u64 = 2;
pub const DESCRIPTOR_TAG_KERNEL_CMDLINE: u64 = 3;
pub const DESCRIPTOR_TAG_CHAIN_PARTITION: u64 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?} field: {1}")]
    ReadFieldError(&'static str, io::Error),
    #[error("Failed to write {0:?} field: {1}")]
    WriteFieldError(&'static str, io::Error),
    #[error("{0:?} field is not ASCII encoded: {1:?}")]
    StringNotAscii(&'static str, String),
    #[error("Header exceeds maximum size of {HEADER_MAX_SIZE}")]
    HeaderTooLarge,
    #[error("Descriptor padding is too long or data was not consumed")]
    PaddingTooLong,
    #[error("{0:?} field padding contains non-zero bytes")]
    PaddingNotZero(&'static str),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Invalid VBMeta header magic: {0:?}")]
    InvalidHeaderMagic([u8; 4]),
    #[error("Invalid VBMeta footer magic: {0:?}")]
    InvalidFooterMagic([u8; 4]),
    #[error("Footer version not supported: {0}.{1}")]
    UnsupportedFooterVersion(u32, u32),
    #[error("Header requires unsupported libavb version: {0}.{1}")]
    UnsupportedVersion(u32, u32),
    #[error("RSA public key exponent not supported: {0}")]
    UnsupportedRsaPublicExponent(BigUint),
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(AlgorithmType),
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Incorrect key size ({bytes}) for algorithm {1:?}", bytes = .0 * 8)]
    IncorrectKeySize(usize, AlgorithmType),
    #[error("RSA key size ({}) is not compatible with any AVB signing algorithm", .0 * 8)]
    UnsupportedKey(usize),
    #[error("Must have exactly one hash descriptor")]
    NoHashDescriptor,
    #[error("Header hash does not match header contents")]
    InvalidHeaderHash,
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("{0} byte image size is too small to fit header")]
    TooSmallForHeader(u64),
    #[error("{0} byte image size is too small to fit footer")]
    TooSmallForFooter(u64),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ring_algorithm(name: &str) -> Result<&'static Algorithm> {
    match name {
        "sha256" => Ok(&ring::digest::SHA256),
        "sha512" => Ok(&ring::digest::SHA512),
        a => Err(Error::UnsupportedHashAlgorithm(a.to_owned())),
    }
}

/// Human readable name of a descriptor tag.
pub fn descriptor_name(tag: u64) -> &'static str {
    match tag {
        DESCRIPTOR_TAG_PROPERTY => "property",
        DESCRIPTOR_TAG_HASHTREE => "hashtree",
        DESCRIPTOR_TAG_HASH => "hash",
        DESCRIPTOR_TAG_KERNEL_CMDLINE => "kernel_cmdline",
        DESCRIPTOR_TAG_CHAIN_PARTITION => "chain_partition",
        _ => "unknown",
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmType {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
    Unknown(u32),
}

impl AlgorithmType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
            Self::Unknown(v) => v,
        }
    }

    pub fn to_digest_algorithm(self) -> Option<SignatureAlgorithm> {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Some(SignatureAlgorithm::Sha256WithRsa)
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Some(SignatureAlgorithm::Sha512WithRsa)
            }
            _ => None,
        }
    }

    pub fn digest_len(self) -> usize {
        self.to_digest_algorithm()
            .map(|a| a.digest_len())
            .unwrap_or_default()
    }

    pub fn signature_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 256,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 512,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 1024,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 8 + 2 * 2048 / 8,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 8 + 2 * 4096 / 8,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 8 + 2 * 8192 / 8,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let Some(algo) = self.to_digest_algorithm() else {
            return vec![];
        };

        algo.hash(data)
    }

    pub fn sign(self, key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
        let Some(algo) = self.to_digest_algorithm() else {
            return if self == Self::None {
                Ok(vec![])
            } else {
                Err(Error::UnsupportedAlgorithm(self))
            };
        };

        key.sign_sig(algo, digest).map_err(|e| e.into())
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        let Some(algo) = self.to_digest_algorithm() else {
            return if self == Self::None {
                Ok(())
            } else {
                Err(Error::UnsupportedAlgorithm(self))
            };
        };

        key.verify_sig(algo, digest, signature)
            .map_err(|e| e.into())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashDescriptor")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl HashDescriptor {
    /// Hash the salt followed by exactly `image_size` bytes from the reader.
    pub fn calculate(&self, reader: impl Read) -> Result<Vec<u8>> {
        let algorithm = ring_algorithm(&self.hash_algorithm)?;
        let mut context = Context::new(algorithm);
        context.update(&self.salt);

        stream::copy_n_inspect(reader, io::sink(), self.image_size, |data| {
            context.update(data)
        })?;

        Ok(context.finish().as_ref().to_vec())
    }

    /// Update the root hash from the input reader's contents.
    pub fn update(&mut self, reader: impl Read) -> Result<()> {
        self.root_digest = self.calculate(reader)?;
        Ok(())
    }

    /// Verify the root hash against the input reader.
    pub fn verify(&self, reader: impl Read) -> Result<()> {
        let digest = self.calculate(reader)?;

        if self.root_digest != digest {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(&self.root_digest),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }
}

impl<R: Read> FromReader<R> for HashDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let image_size = reader.read_u64::<BigEndian>()?;

        let hash_algorithm = reader
            .read_string_padded(32)
            .map_err(|e| Error::ReadFieldError("hash_algorithm", e))?;
        if !hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii("hash_algorithm", hash_algorithm));
        }

        let partition_name_len = reader.read_u32::<BigEndian>()?;
        let salt_len = reader.read_u32::<BigEndian>()?;
        let root_digest_len = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;

        if partition_name_len > HEADER_MAX_SIZE as u32 {
            return Err(Error::FieldOutOfBounds("partition_name_len"));
        } else if salt_len > HEADER_MAX_SIZE as u32 {
            return Err(Error::FieldOutOfBounds("salt_len"));
        } else if root_digest_len > HEADER_MAX_SIZE as u32 {
            return Err(Error::FieldOutOfBounds("root_digest_len"));
        }

        let reserved = reader.read_array_exact::<60>()?;

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len as usize)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let salt = reader
            .read_vec_exact(salt_len as usize)
            .map_err(|e| Error::ReadFieldError("salt", e))?;
        let root_digest = reader
            .read_vec_exact(root_digest_len as usize)
            .map_err(|e| Error::ReadFieldError("root_digest", e))?;

        let descriptor = Self {
            image_size,
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        };

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for HashDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        if self.partition_name.len() > HEADER_MAX_SIZE as usize {
            return Err(Error::FieldOutOfBounds("partition_name_len"));
        } else if self.salt.len() > HEADER_MAX_SIZE as usize {
            return Err(Error::FieldOutOfBounds("salt_len"));
        } else if self.root_digest.len() > HEADER_MAX_SIZE as usize {
            return Err(Error::FieldOutOfBounds("root_digest_len"));
        }

        writer.write_u64::<BigEndian>(self.image_size)?;

        if !self.hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii(
                "hash_algorithm",
                self.hash_algorithm.clone(),
            ));
        }
        writer
            .write_string_padded(&self.hash_algorithm, 32)
            .map_err(|e| Error::WriteFieldError("hash_algorithm", e))?;

        writer.write_u32::<BigEndian>(self.partition_name.len() as u32)?;
        writer.write_u32::<BigEndian>(self.salt.len() as u32)?;
        writer.write_u32::<BigEndian>(self.root_digest.len() as u32)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.root_digest)?;

        Ok(())
    }
}

/// A vbmeta descriptor. Only hash descriptors are decoded. Everything else is
/// kept as raw data so that the header can still be re-serialized for
/// signature verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descriptor {
    Hash(HashDescriptor),
    Unknown { tag: u64, data: Vec<u8> },
}

impl Descriptor {
    pub fn tag(&self) -> u64 {
        match self {
            Self::Hash(_) => DESCRIPTOR_TAG_HASH,
            Self::Unknown { tag, .. } => *tag,
        }
    }
}

impl<R: Read> FromReader<R> for Descriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let tag = reader.read_u64::<BigEndian>()?;
        let nbf = reader.read_u64::<BigEndian>()?;

        if nbf > HEADER_MAX_SIZE {
            return Err(Error::FieldOutOfBounds("num_bytes_following"));
        }

        let mut inner_reader = CountingReader::new(reader.take(nbf));

        let descriptor = match tag {
            DESCRIPTOR_TAG_HASH => {
                let d = HashDescriptor::from_reader(&mut inner_reader)?;
                Self::Hash(d)
            }
            _ => {
                let data = inner_reader
                    .read_vec_exact(nbf as usize)
                    .map_err(|e| Error::ReadFieldError("descriptor_data", e))?;

                Self::Unknown { tag, data }
            }
        };

        // The descriptor data is always aligned to 8 bytes.
        padding::read_discard(&mut inner_reader, 8)?;
        if inner_reader.stream_position()? != nbf {
            return Err(Error::PaddingTooLong);
        }

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for Descriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let mut inner_writer = Cursor::new(Vec::new());

        match self {
            Self::Hash(d) => d.to_writer(&mut inner_writer)?,
            Self::Unknown { data, .. } => inner_writer.write_all(data)?,
        }

        let inner_data = inner_writer.into_inner();

        if inner_data.len() > HEADER_MAX_SIZE as usize {
            return Err(Error::FieldOutOfBounds("num_bytes_following"));
        }

        let padding_len = padding::calc(inner_data.len(), 8);
        let nbf = inner_data.len() + padding_len;

        writer.write_u64::<BigEndian>(self.tag())?;
        writer.write_u64::<BigEndian>(nbf as u64)?;
        writer.write_all(&inner_data)?;
        writer.write_zeros_exact(padding_len as u64)?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Header {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub algorithm_type: AlgorithmType,
    pub hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_metadata: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
    pub reserved: [u8; 80],
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                "required_libavb_version_major",
                &self.required_libavb_version_major,
            )
            .field(
                "required_libavb_version_minor",
                &self.required_libavb_version_minor,
            )
            .field("algorithm_type", &self.algorithm_type)
            .field("hash", &hex::encode(&self.hash))
            .field("signature", &hex::encode(&self.signature))
            .field("public_key", &hex::encode(&self.public_key))
            .field(
                "public_key_metadata",
                &hex::encode(&self.public_key_metadata),
            )
            .field("descriptors", &self.descriptors)
            .field("rollback_index", &self.rollback_index)
            .field("flags", &self.flags)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("release_string", &self.release_string)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Header {
    pub const SIZE: usize = 256;

    /// Create an unsigned header containing a single hash descriptor.
    pub fn new(descriptor: HashDescriptor) -> Self {
        Self {
            required_libavb_version_major: VERSION_MAJOR,
            required_libavb_version_minor: 0,
            algorithm_type: AlgorithmType::None,
            hash: vec![],
            signature: vec![],
            public_key: vec![],
            public_key_metadata: vec![],
            descriptors: vec![Descriptor::Hash(descriptor)],
            rollback_index: 0,
            flags: 0,
            rollback_index_location: 0,
            release_string: format!("avbtool {VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_SUB}"),
            reserved: [0u8; 80],
        }
    }

    fn to_writer_internal(&self, mut writer: impl Write, skip_auth_block: bool) -> Result<()> {
        let mut descriptors_writer = Cursor::new(Vec::new());
        for d in &self.descriptors {
            d.to_writer(&mut descriptors_writer)?;
        }
        let descriptors_raw = descriptors_writer.into_inner();

        // Auth block.

        let auth_block_data_size = self
            .hash
            .len()
            .checked_add(self.signature.len())
            .ok_or_else(|| Error::FieldOutOfBounds("auth_block_data_size"))?;
        let auth_block_padding_size = padding::calc(auth_block_data_size, 64);
        let auth_block_size = auth_block_data_size
            .checked_add(auth_block_padding_size)
            .ok_or_else(|| Error::FieldOutOfBounds("auth_block_size"))?;

        let hash_offset = 0usize;
        let signature_offset = hash_offset + self.hash.len();

        // Aux block.

        let aux_block_data_size = descriptors_raw
            .len()
            .checked_add(self.public_key.len())
            .and_then(|s| s.checked_add(self.public_key_metadata.len()))
            .ok_or_else(|| Error::FieldOutOfBounds("aux_block_data_size"))?;
        let aux_block_padding_size = padding::calc(aux_block_data_size, 64);
        let aux_block_size = aux_block_data_size
            .checked_add(aux_block_padding_size)
            .ok_or_else(|| Error::FieldOutOfBounds("aux_block_size"))?;

        let descriptors_offset = 0usize;
        let public_key_offset = descriptors_offset + descriptors_raw.len();
        let public_key_metadata_offset = public_key_offset + self.public_key.len();

        let total_size = Self::SIZE
            .checked_add(auth_block_data_size)
            .and_then(|s| s.checked_add(aux_block_data_size))
            .ok_or_else(|| Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE as usize {
            return Err(Error::HeaderTooLarge);
        }

        // All sizes and offsets are now guaranteed to fit in a u64.

        writer.write_all(&HEADER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_major)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_minor)?;
        writer.write_u64::<BigEndian>(auth_block_size as u64)?;
        writer.write_u64::<BigEndian>(aux_block_size as u64)?;
        writer.write_u32::<BigEndian>(self.algorithm_type.to_raw())?;
        writer.write_u64::<BigEndian>(hash_offset as u64)?;
        writer.write_u64::<BigEndian>(self.hash.len() as u64)?;
        writer.write_u64::<BigEndian>(signature_offset as u64)?;
        writer.write_u64::<BigEndian>(self.signature.len() as u64)?;
        writer.write_u64::<BigEndian>(public_key_offset as u64)?;
        writer.write_u64::<BigEndian>(self.public_key.len() as u64)?;
        writer.write_u64::<BigEndian>(public_key_metadata_offset as u64)?;
        writer.write_u64::<BigEndian>(self.public_key_metadata.len() as u64)?;
        writer.write_u64::<BigEndian>(descriptors_offset as u64)?;
        writer.write_u64::<BigEndian>(descriptors_raw.len() as u64)?;
        writer.write_u64::<BigEndian>(self.rollback_index)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(self.rollback_index_location)?;

        writer
            .write_string_padded(&self.release_string, 48)
            .map_err(|e| Error::WriteFieldError("release_string", e))?;

        writer.write_all(&self.reserved)?;

        // Auth block.
        if !skip_auth_block {
            writer.write_all(&self.hash)?;
            writer.write_all(&self.signature)?;
            writer.write_zeros_exact(auth_block_padding_size as u64)?;
        }

        // Aux block.
        writer.write_all(&descriptors_raw)?;
        writer.write_all(&self.public_key)?;
        writer.write_all(&self.public_key_metadata)?;
        writer.write_zeros_exact(aux_block_padding_size as u64)?;

        Ok(())
    }

    /// Check that libavb 1.x can handle this header.
    pub fn check_version(&self) -> Result<()> {
        if self.required_libavb_version_major != VERSION_MAJOR
            || self.required_libavb_version_minor > VERSION_MINOR
        {
            return Err(Error::UnsupportedVersion(
                self.required_libavb_version_major,
                self.required_libavb_version_minor,
            ));
        }

        Ok(())
    }

    /// Get the hash descriptor if there is exactly one. This is the case for
    /// appended AVB images of hash-verified partitions.
    pub fn hash_descriptor(&self) -> Result<&HashDescriptor> {
        let mut result = None;

        for descriptor in &self.descriptors {
            if let Descriptor::Hash(d) = descriptor {
                if result.is_some() {
                    return Err(Error::NoHashDescriptor);
                }
                result = Some(d);
            }
        }

        result.ok_or(Error::NoHashDescriptor)
    }

    /// Pick the SHA256 algorithm that matches the key size.
    pub fn set_algo_for_key(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;

        for algo in [AlgorithmType::Sha256Rsa2048, AlgorithmType::Sha256Rsa4096] {
            if key_raw.len() == algo.public_key_len() {
                self.algorithm_type = algo;
                return Ok(());
            }
        }

        Err(Error::UnsupportedKey(key.size()))
    }

    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;

        if key_raw.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(key.size(), self.algorithm_type));
        }

        // The public key and the sizes of the hash and signature are included
        // in the data that's about to be signed.
        self.public_key = key_raw;
        self.hash.resize(self.algorithm_type.digest_len(), 0);
        self.signature
            .resize(self.algorithm_type.signature_len(), 0);

        let mut without_auth_writer = Cursor::new(Vec::new());
        self.to_writer_internal(&mut without_auth_writer, true)?;
        let without_auth = without_auth_writer.into_inner();

        let hash = self.algorithm_type.hash(&without_auth);
        let signature = self.algorithm_type.sign(key, &hash)?;

        self.hash = hash;
        self.signature = signature;

        Ok(())
    }

    /// Verify the header's digest and signature against the embedded public key
    /// and return the public key. If the header is not signed, then `None` is
    /// returned.
    pub fn verify(&self) -> Result<Option<RsaPublicKey>> {
        if self.algorithm_type == AlgorithmType::None {
            return Ok(None);
        } else if self.algorithm_type.to_digest_algorithm().is_none() {
            return Err(Error::UnsupportedAlgorithm(self.algorithm_type));
        }

        // Reconstruct the public key.
        let public_key = decode_public_key(&self.public_key)?;

        if self.public_key.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(
                public_key.size(),
                self.algorithm_type,
            ));
        }

        let mut without_auth_writer = Cursor::new(Vec::new());
        self.to_writer_internal(&mut without_auth_writer, true)?;
        let without_auth = without_auth_writer.into_inner();

        let hash = self.algorithm_type.hash(&without_auth);
        if hash != self.hash {
            return Err(Error::InvalidHeaderHash);
        }

        self.algorithm_type
            .verify(&public_key, &hash, &self.signature)?;

        Ok(Some(public_key))
    }
}

impl<R: Read> FromReader<R> for Header {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let magic = reader.read_array_exact::<4>()?;
        if magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(magic));
        }

        let required_libavb_version_major = reader.read_u32::<BigEndian>()?;
        let required_libavb_version_minor = reader.read_u32::<BigEndian>()?;
        let auth_block_size = reader.read_u64::<BigEndian>()?;
        let aux_block_size = reader.read_u64::<BigEndian>()?;

        let algorithm_type_raw = reader.read_u32::<BigEndian>()?;
        let algorithm_type = AlgorithmType::from_raw(algorithm_type_raw);

        let hash_offset = reader.read_u64::<BigEndian>()?;
        let hash_size = reader.read_u64::<BigEndian>()?;
        let signature_offset = reader.read_u64::<BigEndian>()?;
        let signature_size = reader.read_u64::<BigEndian>()?;

        let auth_block_combined = hash_size
            .checked_add(signature_size)
            .ok_or_else(|| Error::FieldOutOfBounds("auth_block_combined"))?;
        let auth_block_padding = padding::calc(auth_block_combined, 64);
        if auth_block_combined.checked_add(auth_block_padding) != Some(auth_block_size) {
            return Err(Error::FieldOutOfBounds("auth_block_size"));
        } else if hash_offset > auth_block_combined - hash_size {
            return Err(Error::FieldOutOfBounds("hash_offset"));
        } else if signature_offset > auth_block_combined - signature_size {
            return Err(Error::FieldOutOfBounds("signature_offset"));
        }

        let public_key_offset = reader.read_u64::<BigEndian>()?;
        let public_key_size = reader.read_u64::<BigEndian>()?;
        let public_key_metadata_offset = reader.read_u64::<BigEndian>()?;
        let public_key_metadata_size = reader.read_u64::<BigEndian>()?;
        let descriptors_offset = reader.read_u64::<BigEndian>()?;
        let descriptors_size = reader.read_u64::<BigEndian>()?;

        let aux_block_combined = public_key_size
            .checked_add(public_key_metadata_size)
            .and_then(|s| s.checked_add(descriptors_size))
            .ok_or_else(|| Error::FieldOutOfBounds("aux_block_combined"))?;
        let aux_block_padding = padding::calc(aux_block_combined, 64);
        if aux_block_combined.checked_add(aux_block_padding) != Some(aux_block_size) {
            return Err(Error::FieldOutOfBounds("aux_block_size"));
        } else if public_key_offset > aux_block_combined - public_key_size {
            return Err(Error::FieldOutOfBounds("public_key_offset"));
        } else if public_key_metadata_offset > aux_block_combined - public_key_metadata_size {
            return Err(Error::FieldOutOfBounds("public_key_metadata_size"));
        } else if descriptors_offset > aux_block_combined - descriptors_size {
            return Err(Error::FieldOutOfBounds("descriptors_offset"));
        }

        let rollback_index = reader.read_u64::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;
        let rollback_index_location = reader.read_u32::<BigEndian>()?;

        let release_string = reader
            .read_string_padded(48)
            .map_err(|e| Error::ReadFieldError("release_string", e))?;

        let reserved = reader.read_array_exact::<80>()?;

        let header_size = reader.stream_position()?;
        let total_size = header_size
            .checked_add(auth_block_size)
            .and_then(|v| v.checked_add(aux_block_size))
            .ok_or_else(|| Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        // All of the size fields above are now guaranteed to fit in usize.

        let auth_block = reader.read_vec_exact(auth_block_size as usize)?;
        let aux_block = reader.read_vec_exact(aux_block_size as usize)?;

        // When we verify() the signatures, we're doing so on re-serialized
        // fields. The padding is the only thing that can escape this, so make
        // sure they don't contain any data.
        if !util::is_zero(
            &auth_block[auth_block_combined as usize..][..auth_block_padding as usize],
        ) {
            return Err(Error::PaddingNotZero("auth_block"));
        }
        if !util::is_zero(&aux_block[aux_block_combined as usize..][..aux_block_padding as usize]) {
            return Err(Error::PaddingNotZero("aux_block"));
        }

        // Auth block data.
        let hash = &auth_block[hash_offset as usize..][..hash_size as usize];
        let signature = &auth_block[signature_offset as usize..][..signature_size as usize];

        // Aux block data.
        let public_key = &aux_block[public_key_offset as usize..][..public_key_size as usize];
        let public_key_metadata =
            &aux_block[public_key_metadata_offset as usize..][..public_key_metadata_size as usize];

        let mut descriptors: Vec<Descriptor> = vec![];
        let mut descriptor_reader = Cursor::new(&aux_block);
        let mut pos = descriptor_reader.seek(SeekFrom::Start(descriptors_offset))?;

        while pos < descriptors_offset + descriptors_size {
            let descriptor = Descriptor::from_reader(&mut descriptor_reader)?;
            descriptors.push(descriptor);
            pos = descriptor_reader.stream_position()?;
        }

        let header = Self {
            required_libavb_version_major,
            required_libavb_version_minor,
            algorithm_type,
            hash: hash.to_owned(),
            signature: signature.to_owned(),
            public_key: public_key.to_owned(),
            public_key_metadata: public_key_metadata.to_owned(),
            descriptors,
            rollback_index,
            flags,
            rollback_index_location,
            release_string,
            reserved,
        };

        Ok(header)
    }
}

impl<W: Write> ToWriter<W> for Header {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.to_writer_internal(writer, false)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
    pub reserved: [u8; 28],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("original_image_size", &self.original_image_size)
            .field("vbmeta_offset", &self.vbmeta_offset)
            .field("vbmeta_size", &self.vbmeta_size)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Default for Footer {
    fn default() -> Self {
        Self {
            version_major: FOOTER_VERSION_MAJOR,
            version_minor: FOOTER_VERSION_MINOR,
            original_image_size: 0,
            vbmeta_offset: 0,
            vbmeta_size: 0,
            reserved: [0u8; 28],
        }
    }
}

impl Footer {
    pub const SIZE: usize = 64;
}

impl<R: Read> FromReader<R> for Footer {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<4>()?;
        if magic != FOOTER_MAGIC {
            return Err(Error::InvalidFooterMagic(magic));
        }

        let version_major = reader.read_u32::<BigEndian>()?;
        let version_minor = reader.read_u32::<BigEndian>()?;
        let original_image_size = reader.read_u64::<BigEndian>()?;
        let vbmeta_offset = reader.read_u64::<BigEndian>()?;
        let vbmeta_size = reader.read_u64::<BigEndian>()?;
        let reserved = reader.read_array_exact::<28>()?;

        let footer = Self {
            version_major,
            version_minor,
            original_image_size,
            vbmeta_offset,
            vbmeta_size,
            reserved,
        };

        Ok(footer)
    }
}

impl<W: Write> ToWriter<W> for Footer {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&FOOTER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.version_major)?;
        writer.write_u32::<BigEndian>(self.version_minor)?;
        writer.write_u64::<BigEndian>(self.original_image_size)?;
        writer.write_u64::<BigEndian>(self.vbmeta_offset)?;
        writer.write_u64::<BigEndian>(self.vbmeta_size)?;
        writer.write_all(&self.reserved)?;
        Ok(())
    }
}

/// Encode a public key in the AVB binary format.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    if key.e() != &BigUint::from(65537u32) {
        return Err(Error::UnsupportedRsaPublicExponent(key.e().clone()));
    }

    // libavb expects certain values to be precomputed so that the bootloader's
    // verification operations can run faster.
    //
    // Values:
    //   n0inv = -1 / n[0] (mod 2 ^ 32)
    //     - Guaranteed to fit in a u32
    //   r = 2 ^ (key size in bits)
    //   rr = r^2 (mod N)
    //     - Guaranteed to fit in key size bits

    let b = BigUint::from(2u64.pow(32));
    let n0inv = b
        .to_bigint()
        .zip(key.n().mod_inverse(&b))
        .map(|(b, inv)| b - inv)
        .and_then(|v| v.to_u32())
        .ok_or(Error::UnsupportedKey(key.size()))?;
    let r = BigUint::from(2u32).pow(key.n().bits());
    let rrmodn = r.modpow(&BigUint::from(2u32), key.n());

    let key_bits = (key.size() * 8)
        .to_u32()
        .ok_or(Error::UnsupportedKey(key.size()))?;

    let mut data = vec![];
    data.extend_from_slice(&key_bits.to_be_bytes());
    data.extend_from_slice(&n0inv.to_be_bytes());

    let modulus_raw = key.n().to_bytes_be();
    data.resize(data.len() + key.size() - modulus_raw.len(), 0);
    data.extend_from_slice(&modulus_raw);

    let rrmodn_raw = rrmodn.to_bytes_be();
    data.resize(data.len() + key.size() - rrmodn_raw.len(), 0);
    data.extend_from_slice(&rrmodn_raw);

    Ok(data)
}

/// Decode a public key from the AVB binary format.
pub fn decode_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    let mut reader = Cursor::new(data);
    let key_bits = reader
        .read_u32::<BigEndian>()?
        .to_usize()
        .ok_or_else(|| Error::FieldOutOfBounds("key_bits"))?;

    // The header, modulus, and rr mod n must all be present.
    let expected_len = (key_bits / 8)
        .checked_mul(2)
        .and_then(|n| n.checked_add(8));
    if key_bits % 8 != 0 || expected_len != Some(data.len()) {
        return Err(Error::FieldOutOfBounds("key_bits"));
    }

    // Skip n0inv.
    reader.read_discard_exact(4)?;

    let modulus_raw = reader.read_vec_exact(key_bits / 8)?;

    let modulus = BigUint::from_bytes_be(&modulus_raw);
    let public_key = RsaPublicKey::new(modulus, BigUint::from(65537u32))?;

    Ok(public_key)
}

/// Load and validate the footer at the end of an appended image.
pub fn load_footer(source: &(impl ReadAt + ?Sized)) -> Result<Footer> {
    let image_size = source.file_len()?;
    if image_size < Footer::SIZE as u64 {
        return Err(Error::TooSmallForFooter(image_size));
    }

    let raw = source.read_array::<{ Footer::SIZE }>(-(Footer::SIZE as i64))?;
    let footer = Footer::from_reader(raw.as_slice())?;

    if footer.version_major != FOOTER_VERSION_MAJOR {
        return Err(Error::UnsupportedFooterVersion(
            footer.version_major,
            footer.version_minor,
        ));
    }

    Ok(footer)
}

/// Load the vbmeta header referenced by a footer. The header must lie entirely
/// before the footer and fit in [`HEADER_MAX_SIZE`].
pub fn load_vbmeta(source: &(impl ReadAt + ?Sized), footer: &Footer) -> Result<Header> {
    let image_size = source.file_len()?;
    let limit = image_size.saturating_sub(Footer::SIZE as u64);

    if footer.vbmeta_size > HEADER_MAX_SIZE {
        return Err(Error::HeaderTooLarge);
    } else if footer
        .vbmeta_offset
        .checked_add(footer.vbmeta_size)
        .is_none_or(|end| end > limit)
    {
        return Err(Error::FieldOutOfBounds("vbmeta_offset"));
    } else if footer.original_image_size > footer.vbmeta_offset {
        return Err(Error::FieldOutOfBounds("original_image_size"));
    }

    let offset = i64::try_from(footer.vbmeta_offset)
        .map_err(|_| Error::FieldOutOfBounds("vbmeta_offset"))?;
    let data = source.read_bytes(offset, footer.vbmeta_size as usize)?;

    // Running out of data here means the header is inconsistent with the
    // footer, not that the partition is unreadable.
    Header::from_reader(Cursor::new(data)).map_err(|e| match e {
        Error::Io(e) => Error::ReadFieldError("vbmeta", e),
        e => e,
    })
}

/// Write a vbmeta header and footer to the specified writer. This is meant for
/// appending vbmeta data to existing partition data, not writing vbmeta images.
/// If `image_size` is specified, then the writer is guaranteed to not grow
/// past that size and an error is returned if the header and footer won't fit.
/// Otherwise, the writer will grow to the necessary size. Returns the size of
/// the new file.
pub fn write_appended_image(
    mut writer: impl Write + Seek,
    header: &Header,
    footer: &mut Footer,
    image_size: Option<u64>,
) -> Result<u64> {
    // avbtool hardcodes a 4096 block size for appended non-sparse images.
    const BLOCK_SIZE: u64 = 4096;

    // Logical image size, excluding the AVB header and footer.
    let logical_image_size = header.hash_descriptor()?.image_size;

    writer.seek(SeekFrom::Start(logical_image_size))?;

    // The header start offset must be block aligned.
    let header_offset = {
        let padding_size = padding::write_zeros(&mut writer, BLOCK_SIZE)?;
        logical_image_size
            .checked_add(padding_size)
            .ok_or_else(|| Error::FieldOutOfBounds("header_offset"))?
    };

    // The header lives at the beginning of the empty space.
    let mut header_buf = Cursor::new(Vec::new());
    header.to_writer(&mut header_buf)?;
    let header_size = header_buf.stream_position()?;
    let header_padding = padding::write_zeros(&mut header_buf, BLOCK_SIZE)?;
    let header_end_padded = header_offset
        .checked_add(header_size)
        .and_then(|s| s.checked_add(header_padding))
        .ok_or_else(|| Error::FieldOutOfBounds("header_end_padded"))?;

    if let Some(s) = image_size {
        if header_end_padded > s {
            return Err(Error::TooSmallForHeader(s));
        }
    }

    writer.write_all(&header_buf.into_inner())?;

    // The footer lives in its own separate block at the end of the empty space.
    let footer_end = if let Some(s) = image_size {
        if s - header_end_padded < BLOCK_SIZE {
            return Err(Error::TooSmallForFooter(s));
        }

        s
    } else {
        header_end_padded
            .checked_add(BLOCK_SIZE)
            .ok_or_else(|| Error::FieldOutOfBounds("footer_end"))?
    };

    let footer_offset = footer_end - Footer::SIZE as u64;
    writer.seek(SeekFrom::Start(footer_offset))?;

    footer.original_image_size = logical_image_size;
    footer.vbmeta_offset = header_offset;
    footer.vbmeta_size = header_size;

    footer.to_writer(&mut writer)?;

    Ok(footer_end)
}
