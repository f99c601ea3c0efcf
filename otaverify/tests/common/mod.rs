/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

// Each integration test only uses a subset of the helpers.
#![allow(dead_code)]

use std::{
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use p256::ecdsa::{Signature, SigningKey, signature::hazmat::PrehashSigner};
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use otaverify::{
    crypto::{
        APK_SIG_ECDSA_WITH_SHA256, APK_SIG_RSA_PKCS1_V1_5_WITH_SHA256, RsaPrivateKeyExt,
        SignatureAlgorithm,
    },
    digest::{self, DigestParams, Region},
    format::{
        apksig::{self, EOCD_CD_OFFSET_FIELD, EOCD_SIZE, SIGNATURE_SCHEME_V2_BLOCK_ID},
        avb::{Descriptor, Footer, HashDescriptor, Header},
        block,
    },
};

pub const RSA_KEY: &str = "TEST_KEY_DO_NOT_USE_rsa.key";
pub const RSA_CERT: &str = "TEST_KEY_DO_NOT_USE_rsa.crt";
pub const RSA_CERT_PEM: &str = "TEST_KEY_DO_NOT_USE_rsa.crt.pem";
pub const RSA_PUBLIC_KEY_PEM: &str = "TEST_KEY_DO_NOT_USE_rsa.pub.pem";
pub const RSA_OTHER_KEY: &str = "TEST_KEY_DO_NOT_USE_rsa_other.key";
pub const RSA_OTHER_CERT: &str = "TEST_KEY_DO_NOT_USE_rsa_other.crt";
pub const EC_KEY: &str = "TEST_KEY_DO_NOT_USE_ec.key";
pub const EC_CERT: &str = "TEST_KEY_DO_NOT_USE_ec.crt";
pub const EC_PUBLIC_KEY_PEM: &str = "TEST_KEY_DO_NOT_USE_ec.pub.pem";
// Signed by tests/data/sign_package.py, independently of this crate.
pub const RSA_SIGNED_PACKAGE: &str = "TEST_KEY_DO_NOT_USE_rsa_signed.zip";
pub const EC_SIGNED_PACKAGE: &str = "TEST_KEY_DO_NOT_USE_ec_signed.zip";

pub fn data_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

pub fn rsa_key(name: &str) -> RsaPrivateKey {
    let data = fs::read_to_string(data_path(name)).unwrap();
    RsaPrivateKey::from_pkcs8_pem(&data).unwrap()
}

pub fn ec_key(name: &str) -> SigningKey {
    let data = fs::read_to_string(data_path(name)).unwrap();
    SigningKey::from_pkcs8_pem(&data).unwrap()
}

pub fn cert_der(name: &str) -> Vec<u8> {
    fs::read(data_path(name)).unwrap()
}

/// Write data to a temporary file that is deleted when dropped.
pub fn temp_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

#[derive(Clone)]
pub enum TestSigner {
    Rsa(RsaPrivateKey),
    Ec(SigningKey),
}

impl TestSigner {
    pub fn rsa() -> Self {
        Self::Rsa(rsa_key(RSA_KEY))
    }

    pub fn ec() -> Self {
        Self::Ec(ec_key(EC_KEY))
    }

    pub fn algorithm_id(&self) -> u32 {
        match self {
            Self::Rsa(_) => APK_SIG_RSA_PKCS1_V1_5_WITH_SHA256,
            Self::Ec(_) => APK_SIG_ECDSA_WITH_SHA256,
        }
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        let der = match self {
            Self::Rsa(k) => k.to_public_key().to_public_key_der(),
            Self::Ec(k) => k.verifying_key().to_public_key_der(),
        };

        der.unwrap().as_bytes().to_vec()
    }

    /// Sign the SHA-256 digest of `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(data);

        match self {
            Self::Rsa(k) => k.sign_sig(SignatureAlgorithm::Sha256WithRsa, &digest).unwrap(),
            Self::Ec(k) => {
                let signature: Signature = k.sign_prehash(&digest).unwrap();
                signature.to_der().as_bytes().to_vec()
            }
        }
    }
}

/// Create a zip with a few stored entries.
pub fn unsigned_zip(payload: &[u8], comment: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    writer.start_file("payload.bin", options).unwrap();
    writer.write_all(payload).unwrap();
    writer.start_file("META-INF/metadata", options).unwrap();
    writer.write_all(b"ota-type=AB\n").unwrap();
    writer.set_comment(comment);

    writer.finish().unwrap().into_inner()
}

fn length_prefixed(parts: &[&[u8]]) -> Vec<u8> {
    let mut result = vec![];
    for part in parts {
        block::encode_length_prefixed(&mut result, part).unwrap();
    }
    result
}

fn algorithm_record(id: u32, data: &[u8]) -> Vec<u8> {
    let mut result = id.to_le_bytes().to_vec();
    block::encode_length_prefixed(&mut result, data).unwrap();
    result
}

/// Offsets of the regions of an unsigned zip.
pub struct ZipLayout {
    pub central_directory_offset: usize,
    pub eocd_offset: usize,
}

pub fn zip_layout(zip: &[u8], comment_len: usize) -> ZipLayout {
    let eocd_offset = zip.len() - EOCD_SIZE as usize - comment_len;
    let field = &zip[eocd_offset + EOCD_CD_OFFSET_FIELD..][..4];
    let central_directory_offset = u32::from_le_bytes(field.try_into().unwrap()) as usize;

    ZipLayout {
        central_directory_offset,
        eocd_offset,
    }
}

/// Builds a package signed with APK Signature Scheme v2. The fields can be
/// changed to produce packages that are invalid in specific ways.
pub struct PackageBuilder {
    pub signer: TestSigner,
    pub certificate: Vec<u8>,
    pub payload: Vec<u8>,
    pub comment: String,
    pub digest_algorithm_id: u32,
    pub signature_algorithm_id: u32,
    /// Overrides the public key embedded in the signer block.
    pub public_key: Option<Vec<u8>>,
    pub corrupt_signature: bool,
}

impl PackageBuilder {
    pub fn new(signer: TestSigner, certificate: Vec<u8>) -> Self {
        let algorithm_id = signer.algorithm_id();

        Self {
            signer,
            certificate,
            payload: vec![0x42; 5000],
            comment: String::new(),
            digest_algorithm_id: algorithm_id,
            signature_algorithm_id: algorithm_id,
            public_key: None,
            corrupt_signature: false,
        }
    }

    pub fn rsa() -> Self {
        Self::new(TestSigner::rsa(), cert_der(RSA_CERT))
    }

    pub fn ec() -> Self {
        Self::new(TestSigner::ec(), cert_der(EC_CERT))
    }

    /// Compute the digest of the unsigned zip the same way the verifier
    /// computes it for the signed one.
    fn content_digest(zip: &[u8], layout: &ZipLayout) -> Vec<u8> {
        let regions = [
            Region::memory("content", &zip[..layout.central_directory_offset]),
            Region::memory(
                "central directory",
                &zip[layout.central_directory_offset..layout.eocd_offset],
            ),
            Region::memory("end of central directory", &zip[layout.eocd_offset..]),
        ];

        digest::compute(&DigestParams::default(), &regions).unwrap()
    }

    pub fn signing_block_value(&self, digest: &[u8]) -> Vec<u8> {
        let digests = length_prefixed(&[&algorithm_record(self.digest_algorithm_id, digest)]);
        let certificates = length_prefixed(&[&self.certificate]);
        let signed_data = length_prefixed(&[&digests, &certificates, b""]);

        let mut signature = self.signer.sign(&signed_data);
        if self.corrupt_signature {
            let last = signature.len() - 1;
            signature[last] ^= 0x01;
        }

        let signatures =
            length_prefixed(&[&algorithm_record(self.signature_algorithm_id, &signature)]);

        let public_key = self
            .public_key
            .clone()
            .unwrap_or_else(|| self.signer.public_key_der());

        let signer = length_prefixed(&[&signed_data, &signatures, &public_key]);

        length_prefixed(&[&length_prefixed(&[&signer])])
    }

    /// Insert a signing block with the given ID-value entries.
    pub fn insert_signing_block(zip: &[u8], comment_len: usize, entries: &[(u32, &[u8])]) -> Vec<u8> {
        let layout = zip_layout(zip, comment_len);
        let signing_block = apksig::encode_signing_block(entries).unwrap();

        let mut result = zip[..layout.central_directory_offset].to_vec();
        result.extend_from_slice(&signing_block);
        result.extend_from_slice(&zip[layout.central_directory_offset..]);

        let new_offset = (layout.central_directory_offset + signing_block.len()) as u32;
        let field_offset = layout.eocd_offset + signing_block.len() + EOCD_CD_OFFSET_FIELD;
        result[field_offset..field_offset + 4].copy_from_slice(&new_offset.to_le_bytes());

        result
    }

    pub fn build(&self) -> Vec<u8> {
        let zip = unsigned_zip(&self.payload, &self.comment);
        let layout = zip_layout(&zip, self.comment.len());
        let digest = Self::content_digest(&zip, &layout);
        let value = self.signing_block_value(&digest);

        Self::insert_signing_block(
            &zip,
            self.comment.len(),
            &[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)],
        )
    }
}

/// Offset of the "APK Sig Block 42" magic in a signed package.
pub fn signing_block_magic_offset(package: &[u8]) -> usize {
    package
        .windows(16)
        .position(|w| w == apksig::SIG_BLOCK_MAGIC)
        .unwrap()
}

/// Data for a test partition.
pub fn partition_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

/// Builds an appended AVB image containing a hash descriptor.
pub struct AvbImageBuilder {
    pub data: Vec<u8>,
    pub partition_name: String,
    pub rollback_index: u64,
    pub rollback_index_location: u32,
    pub extra_descriptors: Vec<Descriptor>,
    /// Leave the header unsigned if `None`.
    pub key: Option<RsaPrivateKey>,
}

impl AvbImageBuilder {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            partition_name: "system".to_owned(),
            rollback_index: 0,
            rollback_index_location: 0,
            extra_descriptors: vec![],
            key: Some(rsa_key(RSA_KEY)),
        }
    }

    pub fn header(&self) -> Header {
        let mut descriptor = HashDescriptor {
            image_size: self.data.len() as u64,
            hash_algorithm: "sha256".to_owned(),
            partition_name: self.partition_name.clone(),
            salt: vec![0x5a; 32],
            root_digest: vec![],
            flags: 0,
            reserved: [0u8; 60],
        };
        descriptor.update(self.data.as_slice()).unwrap();

        let mut header = Header::new(descriptor);
        header.rollback_index = self.rollback_index;
        header.rollback_index_location = self.rollback_index_location;
        header
            .descriptors
            .extend(self.extra_descriptors.iter().cloned());

        if let Some(key) = &self.key {
            header.set_algo_for_key(key).unwrap();
            header.sign(key).unwrap();
        }

        header
    }

    pub fn build(&self) -> Vec<u8> {
        let header = self.header();
        let mut writer = Cursor::new(self.data.clone());
        let mut footer = Footer::default();

        otaverify::format::avb::write_appended_image(&mut writer, &header, &mut footer, None)
            .unwrap();

        writer.into_inner()
    }
}
