/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

mod common;

use std::fs;

use assert_matches::assert_matches;

use otaverify::{
    error::VerifyError,
    format::apksig::{self, SIGNATURE_SCHEME_V2_BLOCK_ID},
    package::{self, VerifyOptions},
};

use common::{
    EC_CERT, EC_SIGNED_PACKAGE, PackageBuilder, RSA_CERT, RSA_CERT_PEM, RSA_OTHER_CERT,
    RSA_SIGNED_PACKAGE, cert_der, data_path, signing_block_magic_offset, temp_file, unsigned_zip,
};

fn verify(data: &[u8], cert: &str) -> Result<(), VerifyError> {
    let file = temp_file(data);
    package::verify_package(file.path(), &data_path(cert))
}

fn verify_with(data: &[u8], cert: &str, options: &VerifyOptions) -> Result<(), VerifyError> {
    let file = temp_file(data);
    package::verify_package_with(file.path(), &data_path(cert), options).map(|_| ())
}

#[test]
fn valid_rsa_package() {
    let data = PackageBuilder::rsa().build();

    verify(&data, RSA_CERT).unwrap();
    verify(&data, RSA_CERT_PEM).unwrap();
}

#[test]
fn valid_ec_package() {
    let data = PackageBuilder::ec().build();

    verify(&data, EC_CERT).unwrap();
}

#[test]
fn externally_signed_package() {
    package::verify_package(&data_path(RSA_SIGNED_PACKAGE), &data_path(RSA_CERT)).unwrap();
    package::verify_package(&data_path(RSA_SIGNED_PACKAGE), &data_path(RSA_CERT_PEM)).unwrap();
    package::verify_package(&data_path(EC_SIGNED_PACKAGE), &data_path(EC_CERT)).unwrap();

    assert_matches!(
        package::verify_package(&data_path(RSA_SIGNED_PACKAGE), &data_path(EC_CERT)),
        Err(VerifyError::UntrustedCertificate { source: None, .. })
    );

    let mut data = fs::read(data_path(EC_SIGNED_PACKAGE)).unwrap();
    data[40] ^= 0x01;
    assert_matches!(verify(&data, EC_CERT), Err(VerifyError::DigestMismatch { .. }));
}

#[test]
fn layout_of_externally_signed_package() {
    let data = fs::read(data_path(RSA_SIGNED_PACKAGE)).unwrap();
    let app_block = apksig::locate(&data, 0).unwrap();

    // The signer pads the block so that the central directory is aligned.
    assert_eq!(app_block.central_directory.offset, 4096);
    assert_eq!(app_block.signature_block.end(), 4096);
    assert_eq!(app_block.content.end(), app_block.signature_block.offset);

    // Both size fields exclude the leading size field itself.
    let start = app_block.signature_block.offset as usize;
    let leading = u64::from_le_bytes(data[start..start + 8].try_into().unwrap());
    let trailing = u64::from_le_bytes(data[4096 - 24..4096 - 16].try_into().unwrap());
    assert_eq!(leading, trailing);
    assert_eq!(leading + 8, u64::from(app_block.signature_block.length));

    let signing_block = apksig::read_signing_block(&data, &app_block).unwrap();
    let signature = apksig::PackageSignature::from_signing_block(&signing_block).unwrap();
    assert_eq!(signature.signature.algorithm_id, 0x0103);

    // Alignment padding entry.
    let padding = apksig::find_entry(&signing_block, 0x42726577).unwrap().unwrap();
    assert!(signing_block[padding.offset as usize..padding.end() as usize]
        .iter()
        .all(|b| *b == 0));
}

#[test]
fn valid_package_with_comment() {
    let mut builder = PackageBuilder::rsa();
    builder.comment = "signed by test".to_owned();
    let data = builder.build();

    verify(&data, RSA_CERT).unwrap();
}

#[test]
fn valid_multi_chunk_package() {
    let mut builder = PackageBuilder::ec();
    builder.payload = (0..5 * 1024 * 1024 / 2).map(|i| i as u8).collect();
    let data = builder.build();

    verify(&data, EC_CERT).unwrap();
}

#[test]
fn verify_app_in_memory() {
    let mut builder = PackageBuilder::rsa();
    builder.comment = "abc".to_owned();
    let data = builder.build();

    let result = package::verify_app(
        &data,
        3,
        &data_path(RSA_CERT),
        &VerifyOptions::default(),
    )
    .unwrap();

    assert_eq!(result.algorithm_id, 0x0103);
    assert_eq!(result.digest.len(), 32);
    assert_eq!(result.certificate, cert_der(RSA_CERT));
    assert_eq!(
        result.app_block.signature_block.end(),
        result.app_block.central_directory.offset,
    );
    assert_eq!(result.app_block.content.offset, 0);
}

#[test]
fn modified_content() {
    let mut data = PackageBuilder::rsa().build();
    data[100] ^= 0x01;

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::DigestMismatch { .. }));
}

#[test]
fn modified_central_directory() {
    let mut data = PackageBuilder::rsa().build();

    // First byte of the first entry's file name.
    let cd_offset = signing_block_magic_offset(&data) + 16;
    assert_eq!(data[cd_offset + 46], b'p');
    data[cd_offset + 46] = b'q';

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::DigestMismatch { .. }));
}

#[test]
fn modified_comment() {
    let mut builder = PackageBuilder::rsa();
    builder.comment = "hello".to_owned();
    let mut data = builder.build();

    let last = data.len() - 1;
    data[last] = b'O';

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::DigestMismatch { .. }));
}

#[test]
fn bad_signature() {
    for mut builder in [PackageBuilder::rsa(), PackageBuilder::ec()] {
        builder.corrupt_signature = true;
        let data = builder.build();
        let cert = if builder.digest_algorithm_id == 0x0103 {
            RSA_CERT
        } else {
            EC_CERT
        };

        assert_matches!(verify(&data, cert), Err(VerifyError::BadSignature(_)));
    }
}

#[test]
fn signature_checked_before_digest() {
    let mut builder = PackageBuilder::rsa();
    builder.corrupt_signature = true;
    let mut data = builder.build();
    data[100] ^= 0x01;

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::BadSignature(_)));
}

#[test]
fn untrusted_certificate() {
    let data = PackageBuilder::rsa().build();

    assert_matches!(
        verify(&data, RSA_OTHER_CERT),
        Err(VerifyError::UntrustedCertificate { source: None, .. })
    );
    assert_matches!(
        verify(&data, "nonexistent.crt"),
        Err(VerifyError::UntrustedCertificate {
            source: Some(_),
            ..
        })
    );
}

#[test]
fn public_key_not_from_certificate() {
    // Signed with the RSA key, but claims the other certificate.
    let mut builder = PackageBuilder::rsa();
    builder.certificate = cert_der(RSA_OTHER_CERT);
    let data = builder.build();

    assert_matches!(
        verify(&data, RSA_OTHER_CERT),
        Err(VerifyError::KeyCertMismatch(None))
    );

    let options = VerifyOptions {
        check_public_key: false,
    };
    verify_with(&data, RSA_OTHER_CERT, &options).unwrap();
}

#[test]
fn algorithm_mismatch() {
    let mut builder = PackageBuilder::rsa();
    builder.digest_algorithm_id = 0x0201;
    let data = builder.build();

    assert_matches!(
        verify(&data, RSA_CERT),
        Err(VerifyError::AlgorithmMismatch {
            digest: 0x0201,
            signature: 0x0103,
        })
    );
}

#[test]
fn unsupported_algorithm() {
    // RSASSA-PKCS1-v1_5 with SHA2-512.
    let mut builder = PackageBuilder::rsa();
    builder.digest_algorithm_id = 0x0104;
    builder.signature_algorithm_id = 0x0104;
    let data = builder.build();

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::BadSignature(_)));
}

#[test]
fn invalid_signing_block_magic() {
    let mut data = PackageBuilder::rsa().build();
    let offset = signing_block_magic_offset(&data);
    data[offset] = b'X';

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::InvalidMagic(_)));
}

#[test]
fn unsigned_package() {
    let data = unsigned_zip(&[0u8; 1000], "");

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::InvalidMagic(_)));
}

#[test]
fn signing_block_size_mismatch() {
    let mut data = PackageBuilder::rsa().build();
    let magic_offset = signing_block_magic_offset(&data);

    let size = u64::from_le_bytes(data[magic_offset - 8..magic_offset].try_into().unwrap());
    let start = magic_offset + 16 - (size as usize + 8);
    data[start] ^= 0x01;

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::FormatError(_)));
}

#[test]
fn missing_v2_entry() {
    let zip = unsigned_zip(&[0u8; 1000], "");
    let data = PackageBuilder::insert_signing_block(&zip, 0, &[(0x42424242, b"not a signature")]);

    assert_matches!(
        verify(&data, RSA_CERT),
        Err(VerifyError::MissingField("v2 signature scheme entry"))
    );
}

#[test]
fn truncated_signer() {
    let zip = unsigned_zip(&[0u8; 1000], "");
    // Signers list claims 100 bytes, but only 4 follow.
    let value = [100u8, 0, 0, 0, 1, 2, 3, 4];
    let data =
        PackageBuilder::insert_signing_block(&zip, 0, &[(SIGNATURE_SCHEME_V2_BLOCK_ID, &value)]);

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::TruncatedBlock(_)));
}

#[test]
fn not_a_zip() {
    let data = vec![0xffu8; 4096];

    assert_matches!(verify(&data, RSA_CERT), Err(VerifyError::FormatError(_)));
}

#[test]
fn layout_of_signed_package() {
    let data = PackageBuilder::rsa().build();
    let app_block = apksig::locate(&data, 0).unwrap();

    let magic_offset = signing_block_magic_offset(&data) as u64;
    assert_eq!(app_block.signature_block.end(), magic_offset + 16);
    assert_eq!(app_block.end_of_central_directory.end(), data.len() as u64);
    assert_eq!(app_block.end_of_central_directory.length, 22);
}
