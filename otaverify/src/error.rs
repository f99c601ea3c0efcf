// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    crypto, digest,
    format::{apksig, avb, block, velaimg},
    store,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reason why a package, slot, or image was rejected. Every variant is a
/// distinct failure kind so that callers can act on them individually, but
/// they all map to the same "verification failed" exit status.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Truncated block")]
    TruncatedBlock(#[source] block::Error),
    #[error("Invalid magic")]
    InvalidMagic(#[source] BoxError),
    #[error("Invalid layout")]
    FormatError(#[source] BoxError),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Digest algorithm {digest:#06x} does not match signature algorithm {signature:#06x}")]
    AlgorithmMismatch { digest: u32, signature: u32 },
    #[error("Bad signature")]
    BadSignature(#[source] BoxError),
    #[error("Expected digest {expected}, but have {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("Certificate does not match trusted certificate: {path:?}")]
    UntrustedCertificate {
        path: PathBuf,
        #[source]
        source: Option<crypto::Error>,
    },
    #[error("Public key does not match certificate")]
    KeyCertMismatch(#[source] Option<crypto::Error>),
    #[error("No valid AVB footer")]
    NoFooter(#[source] avb::Error),
    #[error("Unsupported {name} descriptor (tag {0})", name = avb::descriptor_name(*.0))]
    UnsupportedDescriptor(u64),
    #[error("Partition {partition:?} has digest {actual}, but expected {expected}")]
    HashMismatch {
        partition: String,
        expected: String,
        actual: String,
    },
    #[error("Rollback index {image} at location {location} is older than {stored}")]
    RollbackViolation {
        location: usize,
        stored: u64,
        image: u64,
    },
    #[error("Public key is not trusted")]
    UntrustedKey(#[source] Option<BoxError>),
    #[error("Invalid vbmeta metadata")]
    InvalidMetadata(#[source] avb::Error),
    #[error("Persistent store error")]
    Store(#[from] store::Error),
    #[error("I/O error")]
    Io(#[source] io::Error),
    #[error("Out of memory")]
    OutOfMemory(#[source] io::Error),
}

impl VerifyError {
    /// Short name of the failure kind for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TruncatedBlock(_) => "TruncatedBlock",
            Self::InvalidMagic(_) => "InvalidMagic",
            Self::FormatError(_) => "FormatError",
            Self::MissingField(_) => "MissingField",
            Self::AlgorithmMismatch { .. } => "AlgorithmMismatch",
            Self::BadSignature(_) => "BadSignature",
            Self::DigestMismatch { .. } => "DigestMismatch",
            Self::UntrustedCertificate { .. } => "UntrustedCertificate",
            Self::KeyCertMismatch(_) => "KeyCertMismatch",
            Self::NoFooter(_) => "NoFooter",
            Self::UnsupportedDescriptor(_) => "UnsupportedDescriptor",
            Self::HashMismatch { .. } => "HashMismatch",
            Self::RollbackViolation { .. } => "RollbackViolation",
            Self::UntrustedKey(_) => "UntrustedKey",
            Self::InvalidMetadata(_) => "InvalidMetadata",
            Self::Store(_) => "Store",
            Self::Io(_) => "IoError",
            Self::OutOfMemory(_) => "OutOfMemory",
        }
    }
}

impl From<io::Error> for VerifyError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::OutOfMemory {
            Self::OutOfMemory(e)
        } else {
            Self::Io(e)
        }
    }
}

impl From<block::Error> for VerifyError {
    fn from(e: block::Error) -> Self {
        Self::TruncatedBlock(e)
    }
}

impl From<apksig::Error> for VerifyError {
    fn from(e: apksig::Error) -> Self {
        match e {
            apksig::Error::InvalidMagic(_) | apksig::Error::InvalidEocdMagic(_) => {
                Self::InvalidMagic(e.into())
            }
            apksig::Error::MissingField(name) => Self::MissingField(name),
            apksig::Error::Block(_, e) => Self::TruncatedBlock(e),
            apksig::Error::ReadField(_, e) => e.into(),
            e => Self::FormatError(e.into()),
        }
    }
}

impl From<digest::Error> for VerifyError {
    fn from(e: digest::Error) -> Self {
        match e {
            digest::Error::Alloc(e) | digest::Error::ReadRegion { source: e, .. } => e.into(),
            e => Self::FormatError(e.into()),
        }
    }
}

impl From<velaimg::Error> for VerifyError {
    fn from(e: velaimg::Error) -> Self {
        match e {
            velaimg::Error::InvalidMagic(_) => Self::InvalidMagic(e.into()),
            velaimg::Error::Io(e) => e.into(),
            e => Self::FormatError(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn out_of_memory_is_distinct() {
        let e = VerifyError::from(io::Error::from(io::ErrorKind::OutOfMemory));
        assert_matches!(e, VerifyError::OutOfMemory(_));

        let e = VerifyError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_matches!(e, VerifyError::Io(_));
    }

    #[test]
    fn signing_block_errors() {
        let e = VerifyError::from(apksig::Error::InvalidMagic([0u8; 16]));
        assert_matches!(e, VerifyError::InvalidMagic(_));

        let e = VerifyError::from(apksig::Error::MissingField("public key"));
        assert_matches!(e, VerifyError::MissingField("public key"));

        let e = VerifyError::from(apksig::Error::NoRoomForSigningBlock(4));
        assert_matches!(e, VerifyError::FormatError(_));

        let e = VerifyError::from(apksig::Error::Block(
            "signers",
            block::Error::LengthTooLarge(u64::MAX),
        ));
        assert_matches!(e, VerifyError::TruncatedBlock(_));
        assert_eq!(e.kind(), "TruncatedBlock");
    }

    #[test]
    fn messages() {
        let e = VerifyError::UnsupportedDescriptor(avb::DESCRIPTOR_TAG_HASHTREE);
        assert_eq!(e.to_string(), "Unsupported hashtree descriptor (tag 1)");

        let e = VerifyError::UnsupportedDescriptor(42);
        assert_eq!(e.to_string(), "Unsupported unknown descriptor (tag 42)");

        let e = VerifyError::from(store::Error::Read(
            PathBuf::from("store.toml"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        ));
        assert_matches!(e, VerifyError::Store(_));
    }
}
