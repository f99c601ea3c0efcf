/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::OpenOptions,
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use ring::rand::{SecureRandom, SystemRandom};

use crate::{
    cli::status,
    crypto,
    format::avb::{self, Footer, HashDescriptor, Header, MAX_ROLLBACK_INDEX_LOCATIONS},
    util::HexBytes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

fn partition_name(cli: &SignCli) -> Result<String> {
    if let Some(name) = &cli.partition_name {
        return Ok(name.clone());
    }

    let Some(stem) = cli.image.file_stem().and_then(|s| s.to_str()) else {
        bail!("Cannot determine partition name from path: {:?}", cli.image);
    };

    Ok(stem.to_owned())
}

fn salt(cli: &SignCli) -> Result<Vec<u8>> {
    if let Some(salt) = &cli.salt {
        return hex::decode(salt).with_context(|| format!("Invalid hex salt: {salt:?}"));
    }

    let mut salt = vec![0u8; cli.hash_algorithm.digest_len()];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| anyhow::anyhow!("Failed to generate random salt"))?;

    Ok(salt)
}

fn sign_subcommand(cli: &SignCli) -> Result<()> {
    let location = cli.rollback_index_location;
    if location as usize >= MAX_ROLLBACK_INDEX_LOCATIONS {
        bail!("Rollback index location must be less than {MAX_ROLLBACK_INDEX_LOCATIONS}: {location}");
    }

    let private_key = crypto::read_pem_key_file(&cli.key)
        .with_context(|| format!("Failed to load key: {:?}", cli.key))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.image)
        .with_context(|| format!("Failed to open image: {:?}", cli.image))?;

    if avb::load_footer(&file).is_ok() {
        bail!("Image already has an AVB footer: {:?}", cli.image);
    }

    let image_size = file
        .metadata()
        .with_context(|| format!("Failed to stat image: {:?}", cli.image))?
        .len();

    let mut descriptor = HashDescriptor {
        image_size,
        hash_algorithm: cli.hash_algorithm.name().to_owned(),
        partition_name: partition_name(cli)?,
        salt: salt(cli)?,
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    };
    descriptor
        .update(BufReader::new(&file))
        .with_context(|| format!("Failed to hash image: {:?}", cli.image))?;

    let digest = descriptor.root_digest.clone();

    let mut header = Header::new(descriptor);
    header.rollback_index = cli.rollback_index;
    header.rollback_index_location = location;
    header
        .set_algo_for_key(&private_key)
        .context("Failed to select signing algorithm")?;
    header
        .sign(&private_key)
        .context("Failed to sign vbmeta header")?;

    let mut writer = BufWriter::new(file);

    let mut footer = Footer::default();
    let new_size = avb::write_appended_image(&mut writer, &header, &mut footer, None)
        .with_context(|| format!("Failed to write AVB metadata: {:?}", cli.image))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush image: {:?}", cli.image))?;

    status!("Signed {:?} with {:?}", cli.image, header.algorithm_type);
    println!("Digest: {}", HexBytes(&digest));
    println!("Image size: {image_size} -> {new_size}");

    Ok(())
}

pub fn avb_main(cli: &AvbCli) -> Result<()> {
    match &cli.command {
        AvbCommand::Sign(c) => sign_subcommand(c),
    }
}

/// Append a signed vbmeta header and AVB footer to a raw image.
///
/// The header contains a single hash descriptor covering the whole input file.
/// This is meant for producing test images. The image is modified in place.
#[derive(Debug, Parser)]
struct SignCli {
    /// Path to raw image.
    #[arg(value_name = "IMAGE", value_parser)]
    image: PathBuf,

    /// Path to RSA private key (unencrypted PKCS8 PEM).
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,

    /// Partition name to store in the hash descriptor.
    ///
    /// Defaults to the image's file name without the extension.
    #[arg(long, value_name = "NAME")]
    partition_name: Option<String>,

    #[arg(long, value_name = "INDEX", default_value_t = 0)]
    rollback_index: u64,

    #[arg(long, value_name = "LOCATION", default_value_t = 0)]
    rollback_index_location: u32,

    #[arg(long, value_name = "ALGO", value_enum, default_value_t = HashAlgorithm::Sha256)]
    hash_algorithm: HashAlgorithm,

    /// Salt as a hex string. A random salt is used by default.
    #[arg(long, value_name = "HEX")]
    salt: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AvbCommand {
    Sign(SignCli),
}

/// Create AVB-signed images.
#[derive(Debug, Parser)]
pub struct AvbCli {
    #[command(subcommand)]
    command: AvbCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_partition_name() {
        let cli = SignCli::try_parse_from(["sign", "out/boot.img", "--key", "key.pem"]).unwrap();
        assert_eq!(partition_name(&cli).unwrap(), "boot");
        assert_eq!(cli.hash_algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn salt_from_hex() {
        let cli = SignCli::try_parse_from([
            "sign",
            "boot.img",
            "--key",
            "key.pem",
            "--salt",
            "00ff",
            "--hash-algorithm",
            "sha512",
        ])
        .unwrap();
        assert_eq!(salt(&cli).unwrap(), [0x00, 0xff]);

        let cli = SignCli::try_parse_from(["sign", "boot.img", "-k", "key.pem"]).unwrap();
        assert_eq!(salt(&cli).unwrap().len(), 32);
    }
}
