// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of packages signed with APK Signature Scheme v2. The checks run
//! in a fixed order and stop at the first failure:
//!
//! 1. The layout and signing block are parsed.
//! 2. The digest and signature algorithm IDs must match.
//! 3. The signature over the signed data must be valid for the embedded key.
//! 4. The chunked digest of the package must match the signed digest.
//! 5. The embedded certificate must be identical to the trusted certificate.
//! 6. Optionally, the embedded key must be the certificate's key.

use std::{fs::File, io::BufReader, path::Path};

use tracing::{debug, info, warn};

use crate::{
    crypto::{self, PublicKey, SignatureAlgorithm},
    digest::{self, DigestParams, Region},
    error::VerifyError,
    format::apksig::{self, AppBlock, EOCD_CD_OFFSET_FIELD, PackageSignature},
    stream::{self, ReadAt},
    util::HexBytes,
};

type Result<T> = std::result::Result<T, VerifyError>;

#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    /// Require the signer's public key to be the one in its certificate.
    pub check_public_key: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            check_public_key: true,
        }
    }
}

/// Details about a package that passed verification.
#[derive(Clone, Debug)]
pub struct VerifiedPackage {
    pub app_block: AppBlock,
    pub algorithm_id: u32,
    pub digest: Vec<u8>,
    pub certificate: Vec<u8>,
}

/// Verify the package at `path` against the trusted certificate.
pub fn verify_package(path: &Path, trusted_cert_path: &Path) -> Result<()> {
    verify_package_with(path, trusted_cert_path, &VerifyOptions::default()).map(|_| ())
}

pub fn verify_package_with(
    path: &Path,
    trusted_cert_path: &Path,
    options: &VerifyOptions,
) -> Result<VerifiedPackage> {
    debug!("Verifying package: {path:?}");

    let file = File::open(path)?;
    let comment_len = apksig::eocd_comment_len(BufReader::new(&file))
        .inspect_err(|e| warn!("Package is not a valid zip: {e}"))?;

    verify_app(&file, comment_len, trusted_cert_path, options)
}

/// Verify a package given the length of its zip comment.
pub fn verify_app(
    source: &impl ReadAt,
    comment_len: u16,
    trusted_cert_path: &Path,
    options: &VerifyOptions,
) -> Result<VerifiedPackage> {
    let result = verify_app_inner(source, comment_len, trusted_cert_path, options);

    match &result {
        Ok(p) => info!(
            "Package verified with algorithm {:#06x}, digest {}",
            p.algorithm_id,
            HexBytes(&p.digest),
        ),
        Err(e) => warn!("Package rejected ({}): {e}", e.kind()),
    }

    result
}

fn verify_app_inner(
    source: &impl ReadAt,
    comment_len: u16,
    trusted_cert_path: &Path,
    options: &VerifyOptions,
) -> Result<VerifiedPackage> {
    let app_block = apksig::locate(source, comment_len)?;
    let block = apksig::read_signing_block(source, &app_block)?;
    let signature = PackageSignature::from_signing_block(&block)?;

    let digest_algorithm_id = signature.signed_data.digest.algorithm_id;
    let signature_algorithm_id = signature.signature.algorithm_id;
    if digest_algorithm_id != signature_algorithm_id {
        return Err(VerifyError::AlgorithmMismatch {
            digest: digest_algorithm_id,
            signature: signature_algorithm_id,
        });
    }

    let algorithm = SignatureAlgorithm::from_apk_id(signature_algorithm_id)
        .map_err(|e| VerifyError::BadSignature(e.into()))?;
    debug!("Signature algorithm: {algorithm:?}");

    let public_key = signature.public_key.slice(&block)?;
    let signed_data = signature.signed_data.raw.slice(&block)?;
    let signature_bytes = signature.signature.data.slice(&block)?;

    verify_signature(algorithm, public_key, signed_data, signature_bytes)?;
    debug!("Signed data signature is valid");

    let expected_digest = signature.signed_data.digest.data.slice(&block)?;
    let actual_digest = content_digest(source, &app_block)?;
    if actual_digest != expected_digest {
        return Err(VerifyError::DigestMismatch {
            expected: hex::encode(expected_digest),
            actual: hex::encode(&actual_digest),
        });
    }
    debug!("Content digest matches: {}", HexBytes(&actual_digest));

    let certificate = signature.signed_data.certificate.slice(&block)?;
    verify_certificate_pinned(certificate, trusted_cert_path)?;
    debug!("Certificate matches {trusted_cert_path:?}");

    if options.check_public_key {
        verify_public_key_matches_certificate(public_key, certificate)?;
        debug!("Public key matches certificate");
    }

    Ok(VerifiedPackage {
        app_block,
        algorithm_id: signature_algorithm_id,
        digest: actual_digest,
        certificate: certificate.to_vec(),
    })
}

/// Verify `signature` over the SHA-256 digest of `signed_data` with the DER
/// encoded `SubjectPublicKeyInfo` in `public_key`.
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    signed_data: &[u8],
    signature: &[u8],
) -> Result<()> {
    let key = PublicKey::from_der(public_key).map_err(|e| VerifyError::BadSignature(e.into()))?;
    let digest = algorithm.hash(signed_data);

    key.verify_prehash(algorithm, &digest, signature)
        .map_err(|e| VerifyError::BadSignature(e.into()))
}

/// Compare the certificate with the trusted certificate file. An unreadable
/// trusted certificate is a mismatch.
pub fn verify_certificate_pinned(certificate: &[u8], trusted_cert_path: &Path) -> Result<()> {
    match crypto::cert_matches_trusted(certificate, trusted_cert_path) {
        Ok(true) => Ok(()),
        Ok(false) => Err(VerifyError::UntrustedCertificate {
            path: trusted_cert_path.to_owned(),
            source: None,
        }),
        Err(e) => Err(VerifyError::UntrustedCertificate {
            path: trusted_cert_path.to_owned(),
            source: Some(e),
        }),
    }
}

pub fn verify_public_key_matches_certificate(public_key: &[u8], certificate: &[u8]) -> Result<()> {
    match crypto::public_key_matches_cert(public_key, certificate) {
        Ok(true) => Ok(()),
        Ok(false) => Err(VerifyError::KeyCertMismatch(None)),
        Err(e) => Err(VerifyError::KeyCertMismatch(Some(e))),
    }
}

/// Copy of the EOCD record with the central directory offset pointing to where
/// the signing block starts. This is what the signer hashed, since the signing
/// block did not exist yet at that point.
fn patched_eocd(source: &impl ReadAt, app_block: &AppBlock) -> Result<Vec<u8>> {
    let range = app_block.end_of_central_directory;
    let mut eocd = stream::try_alloc(range.length as usize)?;
    source.read_exact_at(&mut eocd, range.offset)?;

    let field = eocd
        .get_mut(EOCD_CD_OFFSET_FIELD..EOCD_CD_OFFSET_FIELD + 4)
        .ok_or(VerifyError::MissingField("EOCD central directory offset"))?;
    field.copy_from_slice(&app_block.content.length.to_le_bytes());

    Ok(eocd)
}

/// Compute the chunked digest over the content, central directory, and patched
/// EOCD regions.
pub fn content_digest(source: &impl ReadAt, app_block: &AppBlock) -> Result<Vec<u8>> {
    let eocd = patched_eocd(source, app_block)?;
    let regions = [
        Region::source(
            "content",
            source,
            app_block.content.offset,
            u64::from(app_block.content.length),
        ),
        Region::source(
            "central directory",
            source,
            app_block.central_directory.offset,
            u64::from(app_block.central_directory.length),
        ),
        Region::memory("end of central directory", &eocd),
    ];

    Ok(digest::compute(&DigestParams::default(), &regions)?)
}
