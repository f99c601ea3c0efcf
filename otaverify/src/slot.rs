// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of partitions with an appended AVB footer. Only images with a
//! single hash descriptor are supported. The vbmeta header must be signed by
//! the trusted key and the rollback index must not be older than the one in
//! the persistent store.

use std::{
    ffi::OsString,
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::{
    crypto,
    error::VerifyError,
    format::avb::{self, Descriptor, Footer, Header, MAX_ROLLBACK_INDEX_LOCATIONS},
    store::{self, KeyValueStore},
    stream::{ReadAt, UserPosFile},
    util::HexBytes,
};

type Result<T> = std::result::Result<T, VerifyError>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlotVerifyFlags: u32 {
        /// Accept images whose rollback index is older than the stored one.
        const ALLOW_ROLLBACK_INDEX_ERROR = 1 << 0;
        /// Never write rollback indexes back to the store.
        const DO_NOT_UPDATE_ROLLBACK_INDEX = 1 << 1;
        /// Reject images whose rollback index is equal to the stored one.
        const NOT_ALLOW_SAME_ROLLBACK_INDEX = 1 << 2;
    }
}

/// Environment that a slot is verified in. This provides access to partition
/// data, the trusted key, and persistent state.
pub trait SlotOps {
    /// Open a partition. The suffix is appended to the partition name.
    fn open_partition(&mut self, partition: &str, suffix: &str) -> Result<Box<dyn ReadAt>>;

    /// Check if the public key embedded in the vbmeta header of `partition` is
    /// trusted.
    fn validate_public_key(
        &mut self,
        partition: &str,
        public_key: &[u8],
        public_key_metadata: &[u8],
    ) -> Result<bool>;

    fn read_rollback_index(&mut self, location: usize) -> Result<u64>;

    fn write_rollback_index(&mut self, location: usize, index: u64) -> Result<()>;

    fn read_is_device_unlocked(&mut self) -> Result<bool>;
}

/// Load a trusted AVB public key. The file can either be in the raw AVB binary
/// format or a PEM-encoded RSA public key.
pub fn load_trusted_key(path: &Path) -> Result<Vec<u8>> {
    let untrusted = |e: crypto::Error| VerifyError::UntrustedKey(Some(e.into()));

    let data = fs::read(path).map_err(|e| untrusted(crypto::Error::ReadFile(path.to_owned(), e)))?;

    if !data.trim_ascii_start().starts_with(b"-----BEGIN ") {
        return Ok(data);
    }

    let pem = std::str::from_utf8(&data).map_err(|e| VerifyError::UntrustedKey(Some(e.into())))?;
    let key = crypto::read_pem_public_key(pem).map_err(untrusted)?;

    avb::encode_public_key(&key).map_err(|e| VerifyError::UntrustedKey(Some(e.into())))
}

/// Partitions are files on the filesystem and persistent state lives in an
/// optional key-value store. Without a store, all rollback indexes read as 0,
/// writes are discarded, and the device is reported as locked.
pub struct FileSlotOps<'a> {
    trusted_key: Vec<u8>,
    store: Option<&'a mut dyn KeyValueStore>,
}

impl<'a> FileSlotOps<'a> {
    pub fn new(trusted_key: Vec<u8>, store: Option<&'a mut dyn KeyValueStore>) -> Self {
        Self { trusted_key, store }
    }

    pub fn partition_path(partition: &str, suffix: &str) -> PathBuf {
        let mut path = OsString::from(partition);
        path.push(suffix);
        PathBuf::from(path)
    }
}

impl SlotOps for FileSlotOps<'_> {
    fn open_partition(&mut self, partition: &str, suffix: &str) -> Result<Box<dyn ReadAt>> {
        let path = Self::partition_path(partition, suffix);
        let file = File::open(&path)?;

        debug!("Opened partition: {path:?}");

        Ok(Box::new(file))
    }

    fn validate_public_key(
        &mut self,
        partition: &str,
        public_key: &[u8],
        _public_key_metadata: &[u8],
    ) -> Result<bool> {
        let trusted = public_key == self.trusted_key.as_slice();

        debug!(
            "Partition {partition:?} public key ({} bytes) trusted: {trusted}",
            public_key.len(),
        );

        Ok(trusted)
    }

    fn read_rollback_index(&mut self, location: usize) -> Result<u64> {
        let Some(kv) = &self.store else {
            return Ok(0);
        };

        Ok(kv.get_u64(&store::rollback_key(location))?.unwrap_or(0))
    }

    fn write_rollback_index(&mut self, location: usize, index: u64) -> Result<()> {
        let Some(kv) = &mut self.store else {
            debug!("No store; discarding rollback index {index} for location {location}");
            return Ok(());
        };

        kv.set_u64(&store::rollback_key(location), index)?;

        Ok(())
    }

    fn read_is_device_unlocked(&mut self) -> Result<bool> {
        let Some(kv) = &self.store else {
            return Ok(false);
        };

        Ok(kv.get_bool(store::UNLOCKED_KEY)?.unwrap_or(false))
    }
}

/// Result of a successful slot verification.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotVerifyResult {
    pub partition: String,
    /// Rollback index for every location. Only the location referenced by the
    /// vbmeta header is non-zero.
    pub rollback_indexes: [u64; MAX_ROLLBACK_INDEX_LOCATIONS],
    pub rollback_index_location: usize,
    pub rollback_index: u64,
    pub image_size: u64,
    pub hash_algorithm: String,
    pub digest: Vec<u8>,
    pub device_unlocked: bool,
}

impl fmt::Debug for SlotVerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotVerifyResult")
            .field("partition", &self.partition)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("rollback_index", &self.rollback_index)
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("digest", &HexBytes(&self.digest))
            .field("device_unlocked", &self.device_unlocked)
            .finish_non_exhaustive()
    }
}

fn footer_error(e: avb::Error) -> VerifyError {
    match e {
        avb::Error::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => e.into(),
        e => VerifyError::NoFooter(e),
    }
}

fn metadata_error(e: avb::Error) -> VerifyError {
    match e {
        avb::Error::Io(e) => e.into(),
        e => VerifyError::InvalidMetadata(e),
    }
}

fn signature_error(e: avb::Error) -> VerifyError {
    match e {
        avb::Error::Crypto(_) | avb::Error::Rsa(_) | avb::Error::InvalidHeaderHash => {
            VerifyError::BadSignature(e.into())
        }
        e => metadata_error(e),
    }
}

/// Load the footer and vbmeta header of an image without verifying anything.
fn load_metadata(source: &dyn ReadAt) -> Result<(Footer, Header)> {
    let footer = avb::load_footer(source).map_err(footer_error)?;
    debug!("Footer: {footer:?}");

    let header = avb::load_vbmeta(source, &footer).map_err(metadata_error)?;
    debug!("Header: {header:?}");

    Ok((footer, header))
}

/// Get the hash descriptor, rejecting any other descriptor type.
fn only_hash_descriptor(header: &Header) -> Result<&avb::HashDescriptor> {
    for descriptor in &header.descriptors {
        if let Descriptor::Unknown { tag, .. } = descriptor {
            return Err(VerifyError::UnsupportedDescriptor(*tag));
        }
    }

    if header.descriptors.is_empty() {
        return Err(VerifyError::MissingField("hash descriptor"));
    }

    header.hash_descriptor().map_err(metadata_error)
}

fn check_stored_rollback_index(
    ops: &mut dyn SlotOps,
    header: &Header,
    flags: SlotVerifyFlags,
) -> Result<usize> {
    let location = header.rollback_index_location as usize;
    if location >= MAX_ROLLBACK_INDEX_LOCATIONS {
        return Err(VerifyError::InvalidMetadata(avb::Error::FieldOutOfBounds(
            "rollback_index_location",
        )));
    }

    let stored = ops.read_rollback_index(location)?;
    let image = header.rollback_index;

    let violation = if flags.contains(SlotVerifyFlags::NOT_ALLOW_SAME_ROLLBACK_INDEX) {
        image <= stored
    } else {
        image < stored
    };

    if violation {
        if flags.contains(SlotVerifyFlags::ALLOW_ROLLBACK_INDEX_ERROR) {
            warn!("Ignoring rollback index {image} at location {location} (stored: {stored})");
        } else {
            return Err(VerifyError::RollbackViolation {
                location,
                stored,
                image,
            });
        }
    }

    Ok(location)
}

/// Verify a single partition.
fn verify_one(
    ops: &mut dyn SlotOps,
    partition: &str,
    suffix: &str,
    flags: SlotVerifyFlags,
) -> Result<SlotVerifyResult> {
    let source = ops.open_partition(partition, suffix)?;
    let (footer, header) = load_metadata(&*source)?;

    header.check_version().map_err(metadata_error)?;

    match header.verify().map_err(signature_error)? {
        Some(_) => debug!("Header signature is valid"),
        None => return Err(VerifyError::BadSignature("vbmeta header is not signed".into())),
    }

    if !ops.validate_public_key(partition, &header.public_key, &header.public_key_metadata)? {
        return Err(VerifyError::UntrustedKey(None));
    }

    let location = check_stored_rollback_index(ops, &header, flags)?;

    let descriptor = only_hash_descriptor(&header)?;
    if descriptor.image_size > footer.vbmeta_offset {
        return Err(VerifyError::FormatError(
            avb::Error::FieldOutOfBounds("image_size").into(),
        ));
    }

    descriptor
        .verify(UserPosFile::new(&*source))
        .map_err(|e| match e {
            avb::Error::InvalidRootDigest { expected, actual } => VerifyError::HashMismatch {
                partition: partition.to_owned(),
                expected,
                actual,
            },
            e => metadata_error(e),
        })?;
    debug!("Partition {partition:?} digest matches");

    let mut rollback_indexes = [0u64; MAX_ROLLBACK_INDEX_LOCATIONS];
    rollback_indexes[location] = header.rollback_index;

    Ok(SlotVerifyResult {
        partition: format!("{partition}{suffix}"),
        rollback_indexes,
        rollback_index_location: location,
        rollback_index: header.rollback_index,
        image_size: descriptor.image_size,
        hash_algorithm: descriptor.hash_algorithm.clone(),
        digest: descriptor.root_digest.clone(),
        device_unlocked: ops.read_is_device_unlocked()?,
    })
}

/// Verify a partition and, if specified, a candidate image that is meant to
/// replace it. The candidate must not have an older rollback index than the
/// current partition at any location. When a candidate is given, its result is
/// returned. Rollback indexes are never persisted here.
pub fn verify_slot(
    ops: &mut dyn SlotOps,
    partition: &str,
    suffix: Option<&str>,
    candidate: Option<&str>,
    flags: SlotVerifyFlags,
) -> Result<SlotVerifyResult> {
    let suffix = suffix.unwrap_or_default();

    let result = verify_slot_inner(ops, partition, suffix, candidate, flags);

    match &result {
        Ok(r) => info!(
            "Partition {:?} verified with rollback index {} at location {}",
            r.partition, r.rollback_index, r.rollback_index_location,
        ),
        Err(e) => warn!("Partition {partition:?} rejected ({}): {e}", e.kind()),
    }

    result
}

fn verify_slot_inner(
    ops: &mut dyn SlotOps,
    partition: &str,
    suffix: &str,
    candidate: Option<&str>,
    flags: SlotVerifyFlags,
) -> Result<SlotVerifyResult> {
    let current = verify_one(ops, partition, suffix, flags)?;

    let Some(candidate) = candidate else {
        return Ok(current);
    };

    let next = verify_one(ops, candidate, suffix, flags)?;

    for (location, (&stored, &image)) in current
        .rollback_indexes
        .iter()
        .zip(next.rollback_indexes.iter())
        .enumerate()
    {
        if image < stored {
            return Err(VerifyError::RollbackViolation {
                location,
                stored,
                image,
            });
        }
    }

    debug!("Candidate {candidate:?} does not roll back {partition:?}");

    Ok(next)
}

/// Write the verified rollback indexes to the store. A stored index is only
/// ever increased. Returns the number of locations that were updated.
///
/// The store holds signed 64-bit integers. If any index does not fit, nothing
/// is written.
pub fn persist_rollback_indexes(
    ops: &mut dyn SlotOps,
    result: &SlotVerifyResult,
    flags: SlotVerifyFlags,
) -> Result<usize> {
    if flags.contains(SlotVerifyFlags::DO_NOT_UPDATE_ROLLBACK_INDEX) {
        debug!("Not updating rollback indexes");
        return Ok(0);
    }

    let mut pending = vec![];

    for (location, &index) in result.rollback_indexes.iter().enumerate() {
        let stored = ops.read_rollback_index(location)?;

        if index > stored {
            if i64::try_from(index).is_err() {
                return Err(store::Error::OutOfRange {
                    key: store::rollback_key(location),
                    value: index.to_string(),
                }
                .into());
            }

            pending.push((location, stored, index));
        }
    }

    for &(location, stored, index) in &pending {
        info!("Updating rollback index at location {location}: {stored} -> {index}");
        ops.write_rollback_index(location, index)?;
    }

    Ok(pending.len())
}

/// Hash descriptor summary of an image.
#[derive(Clone, PartialEq, Eq)]
pub struct HashInfo {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub digest: Vec<u8>,
    pub rollback_index_location: u32,
    pub rollback_index: u64,
}

impl fmt::Debug for HashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashInfo")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("digest", &HexBytes(&self.digest))
            .field("rollback_index_location", &self.rollback_index_location)
            .field("rollback_index", &self.rollback_index)
            .finish()
    }
}

/// Read the hash descriptor information of an image. Nothing is verified.
pub fn read_hash_info(source: &dyn ReadAt) -> Result<HashInfo> {
    let (_, header) = load_metadata(source)?;

    let descriptor = match header.descriptors.first() {
        Some(Descriptor::Hash(d)) => d,
        Some(Descriptor::Unknown { tag, .. }) => {
            return Err(VerifyError::UnsupportedDescriptor(*tag));
        }
        None => return Err(VerifyError::MissingField("hash descriptor")),
    };

    Ok(HashInfo {
        image_size: descriptor.image_size,
        hash_algorithm: descriptor.hash_algorithm.clone(),
        digest: descriptor.root_digest.clone(),
        rollback_index_location: header.rollback_index_location,
        rollback_index: header.rollback_index,
    })
}
