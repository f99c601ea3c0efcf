// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use const_oid::{
    ObjectIdentifier,
    db::rfc5912::{ID_EC_PUBLIC_KEY, RSA_ENCRYPTION},
};
use p256::ecdsa::{Signature, VerifyingKey, signature::hazmat::PrehashVerifier};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::debug;
use x509_cert::{
    Certificate,
    der::{Decode, Encode, pem},
    spki::SubjectPublicKeyInfoRef,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature algorithm ID not supported: {0:#06x}")]
    UnsupportedAlgorithm(u32),
    #[error("Public key algorithm not supported: {0}")]
    UnsupportedKeyType(ObjectIdentifier),
    #[error("Public key type cannot be used with {0:?}")]
    KeyAlgorithmMismatch(SignatureAlgorithm),
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, SignatureAlgorithm),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load RSA private key")]
    LoadKey(#[source] pkcs8::Error),
    #[error("Failed to load public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to encode certificate public key")]
    EncodeCertKey(#[source] x509_cert::der::Error),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to ECDSA verify signature")]
    EcdsaVerify(#[source] p256::ecdsa::Error),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// APK signature scheme ID for RSASSA-PKCS1-v1_5 with SHA2-256.
pub const APK_SIG_RSA_PKCS1_V1_5_WITH_SHA256: u32 = 0x0103;
/// APK signature scheme ID for ECDSA with SHA2-256.
pub const APK_SIG_ECDSA_WITH_SHA256: u32 = 0x0201;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha512WithRsa,
    Sha256WithEcdsaP256,
}

impl SignatureAlgorithm {
    /// Map an APK signing block algorithm ID. Only the SHA-256 variants are
    /// supported. The RSA-PSS, SHA-512, and DSA IDs are rejected.
    pub fn from_apk_id(id: u32) -> Result<Self> {
        match id {
            APK_SIG_RSA_PKCS1_V1_5_WITH_SHA256 => Ok(Self::Sha256WithRsa),
            APK_SIG_ECDSA_WITH_SHA256 => Ok(Self::Sha256WithEcdsaP256),
            id => Err(Error::UnsupportedAlgorithm(id)),
        }
    }

    /// Length of digest required by the signing algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256WithRsa | Self::Sha256WithEcdsaP256 => Sha256::output_size(),
            Self::Sha512WithRsa => Sha512::output_size(),
        }
    }

    /// Compute the digest of the specified data.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256WithRsa | Self::Sha256WithEcdsaP256 => Sha256::digest(data).to_vec(),
            Self::Sha512WithRsa => Sha512::digest(data).to_vec(),
        }
    }
}

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

fn pkcs1v15_scheme(algo: SignatureAlgorithm) -> Result<Pkcs1v15Sign> {
    match algo {
        SignatureAlgorithm::Sha256WithRsa => Ok(Pkcs1v15Sign::new::<Sha256>()),
        SignatureAlgorithm::Sha512WithRsa => Ok(Pkcs1v15Sign::new::<Sha512>()),
        a => Err(Error::KeyAlgorithmMismatch(a)),
    }
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        self.verify(pkcs1v15_scheme(algo)?, digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

pub trait RsaPrivateKeyExt {
    fn sign_sig(&self, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>>;
}

impl RsaPrivateKeyExt for RsaPrivateKey {
    /// Sign a prehashed digest with PKCS#1 v1.5 padding.
    fn sign_sig(&self, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        self.sign(pkcs1v15_scheme(algo)?, digest)
            .map_err(|e| Error::RsaSign(Box::new(e)))
    }
}

/// A public key decoded from a DER `SubjectPublicKeyInfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    EcP256(VerifyingKey),
}

impl PublicKey {
    /// Decode a DER-encoded `SubjectPublicKeyInfo` structure.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let spki = SubjectPublicKeyInfoRef::from_der(der).map_err(|e| Error::LoadPubKey(e.into()))?;
        let oid = spki.algorithm.oid;

        if oid == RSA_ENCRYPTION {
            let key = RsaPublicKey::from_public_key_der(der).map_err(Error::LoadPubKey)?;
            Ok(Self::Rsa(key))
        } else if oid == ID_EC_PUBLIC_KEY {
            // This rejects curves other than P-256.
            let key = VerifyingKey::from_public_key_der(der).map_err(Error::LoadPubKey)?;
            Ok(Self::EcP256(key))
        } else {
            Err(Error::UnsupportedKeyType(oid))
        }
    }

    /// Load a public key from a PEM or DER `SubjectPublicKeyInfo` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

        if is_pem(&data) {
            let (_, der) = pem::decode_vec(&data)
                .map_err(|e| Error::LoadPubKey(x509_cert::der::Error::from(e).into()))?;
            Self::from_der(&der)
        } else {
            Self::from_der(&data)
        }
    }

    /// The SHA-256 signature algorithm matching the key type.
    pub fn sha256_algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Rsa(_) => SignatureAlgorithm::Sha256WithRsa,
            Self::EcP256(_) => SignatureAlgorithm::Sha256WithEcdsaP256,
        }
    }

    /// Verify `signature` over an already computed `digest`. For RSA, the
    /// signature is PKCS#1 v1.5. For P-256, it is an ASN.1 DER ECDSA signature.
    pub fn verify_prehash(
        &self,
        algo: SignatureAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        match self {
            Self::Rsa(key) => key.verify_sig(algo, digest, signature),
            Self::EcP256(key) => {
                if algo != SignatureAlgorithm::Sha256WithEcdsaP256 {
                    return Err(Error::KeyAlgorithmMismatch(algo));
                } else if digest.len() != algo.digest_len() {
                    return Err(Error::InvalidDigestLength(digest.len(), algo));
                }

                let signature = Signature::from_der(signature).map_err(Error::EcdsaVerify)?;

                key.verify_prehash(digest, &signature)
                    .map_err(Error::EcdsaVerify)
            }
        }
    }
}

fn is_pem(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN ")
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace. We'll reformat the data to deal
/// with this because there are certificates in the wild that do not follow the
/// RFC. Only the first certificate is kept.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for line in data.split(|&c| c == b'\n') {
        let line = line.trim_ascii_end();

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            result.extend_from_slice(line);
            result.push(b'\n');

            return Ok(result);
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    Err(Error::PemNoEndTag)
}

/// Load a DER or PEM encoded certificate file and return its DER bytes. The
/// bytes are not parsed further.
pub fn read_cert_der_file(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if is_pem(&data) {
        let data = reformat_pem(&data)?;
        let (_, der) = pem::decode_vec(&data).map_err(|e| Error::LoadCert(e.into()))?;

        Ok(der)
    } else {
        Ok(data)
    }
}

/// Check if `certificate` is byte-for-byte identical to the trusted certificate
/// stored at `trusted_cert_path`.
pub fn cert_matches_trusted(certificate: &[u8], trusted_cert_path: &Path) -> Result<bool> {
    let trusted = read_cert_der_file(trusted_cert_path)?;

    debug!(
        "Comparing {} byte certificate to {} byte trusted certificate",
        certificate.len(),
        trusted.len(),
    );

    Ok(certificate == trusted.as_slice())
}

/// Check if the DER-encoded `SubjectPublicKeyInfo` embedded in `certificate`
/// is byte-for-byte identical to `public_key`.
pub fn public_key_matches_cert(public_key: &[u8], certificate: &[u8]) -> Result<bool> {
    let cert = Certificate::from_der(certificate).map_err(Error::LoadCert)?;
    let cert_key = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(Error::EncodeCertKey)?;

    Ok(cert_key == public_key)
}

/// Read PEM-encoded unencrypted PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKey)
}

/// Read PEM-encoded PKCS8 RSA public key from a string.
pub fn read_pem_public_key(data: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(data).map_err(Error::LoadPubKey)
}
