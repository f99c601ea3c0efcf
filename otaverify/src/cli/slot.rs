/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use crate::{
    cli::{args::CliError, status},
    config::Config,
    slot::{self, FileSlotOps, HashInfo, SlotVerifyFlags},
    store::{KeyValueStore, TomlStore},
    util::HexBytes,
};

fn flags_from_cli(cli: &VerifySlotCli) -> SlotVerifyFlags {
    let mut flags = SlotVerifyFlags::empty();

    if cli.allow_rollback_index_error {
        flags |= SlotVerifyFlags::ALLOW_ROLLBACK_INDEX_ERROR;
    }
    if cli.upgrade {
        flags |= SlotVerifyFlags::NOT_ALLOW_SAME_ROLLBACK_INDEX
            | SlotVerifyFlags::DO_NOT_UPDATE_ROLLBACK_INDEX;
    }
    if cli.no_update_rollback_index {
        flags |= SlotVerifyFlags::DO_NOT_UPDATE_ROLLBACK_INDEX;
    }

    flags
}

pub fn verify_slot_main(cli: &VerifySlotCli, config: &Config) -> Result<()> {
    let key_path = cli
        .key
        .as_deref()
        .or(config.slot.public_key.as_deref())
        .ok_or(CliError::MissingArgument("--key"))?;
    let trusted_key = slot::load_trusted_key(key_path)
        .with_context(|| format!("Failed to load trusted key: {key_path:?}"))?;

    let store_path = if cli.no_store {
        None
    } else {
        cli.store.as_deref().or(config.slot.store.as_deref())
    };
    let mut store = store_path
        .map(|p| TomlStore::open(p).with_context(|| format!("Failed to open store: {p:?}")))
        .transpose()?;

    let suffix = cli.suffix.as_deref().or(config.slot.suffix.as_deref());
    let flags = flags_from_cli(cli);
    debug!("Slot verification flags: {flags:?}");

    let mut ops = FileSlotOps::new(
        trusted_key,
        store.as_mut().map(|s| s as &mut dyn KeyValueStore),
    );

    let result = slot::verify_slot(
        &mut ops,
        &cli.partition,
        suffix,
        cli.candidate.as_deref(),
        flags,
    )
    .with_context(|| format!("Failed to verify partition: {:?}", cli.partition))?;

    // A candidate is not booted yet, so its indexes are not committed.
    let updated = if cli.candidate.is_some() {
        debug!("Not persisting rollback indexes of candidate image");
        0
    } else {
        slot::persist_rollback_indexes(&mut ops, &result, flags)
            .context("Failed to persist rollback indexes")?
    };

    status!("Partition verified: {:?}", result.partition);
    println!("Rollback index: {}", result.rollback_index);
    println!("Rollback index location: {}", result.rollback_index_location);
    println!("Digest: {}", HexBytes(&result.digest));

    if updated > 0 {
        status!("Updated {updated} rollback index location(s)");
    }

    Ok(())
}

fn print_hash_info(info: &HashInfo) {
    let rows = [
        ("Image Size", format!("{} bytes", info.image_size)),
        ("Hash Algorithm", info.hash_algorithm.clone()),
        ("Digest Length", info.digest.len().to_string()),
        ("Digest", HexBytes(&info.digest).to_string()),
        ("Rollback Loc", info.rollback_index_location.to_string()),
        ("Rollback Index", info.rollback_index.to_string()),
    ];

    for (label, value) in rows {
        println!("{label:<16} : {value}");
    }
}

pub fn slot_info_main(cli: &SlotInfoCli) -> Result<()> {
    let file = File::open(&cli.image)
        .with_context(|| format!("Failed to open image: {:?}", cli.image))?;
    let info = slot::read_hash_info(&file)
        .with_context(|| format!("Failed to read hash descriptor: {:?}", cli.image))?;

    print_hash_info(&info);

    Ok(())
}

/// Verify an AVB-signed partition.
///
/// The image must have an AVB footer, a vbmeta header signed by the trusted
/// key, and a single hash descriptor whose digest matches the partition data.
/// Rollback indexes are checked against, and afterwards written to, the store.
#[derive(Debug, Parser)]
pub struct VerifySlotCli {
    /// Path to partition image, without the slot suffix.
    #[arg(value_name = "PARTITION")]
    partition: String,

    /// Path to trusted public key (AVB binary format or PEM).
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,

    /// Slot suffix to append to partition paths (eg. `_a`).
    #[arg(short, long, value_name = "SUFFIX")]
    suffix: Option<String>,

    /// Path to candidate image that will replace the partition.
    ///
    /// The candidate is verified too and must not have a lower rollback index
    /// than the partition at any location.
    #[arg(long, value_name = "IMAGE")]
    candidate: Option<String>,

    /// Accept images with a rollback index older than the stored one.
    #[arg(long)]
    allow_rollback_index_error: bool,

    /// Require the rollback index to be newer than the stored one and leave
    /// the store untouched.
    #[arg(long)]
    upgrade: bool,

    /// Don't write rollback indexes to the store.
    #[arg(long)]
    no_update_rollback_index: bool,

    /// Path to key-value store with rollback indexes.
    #[arg(long, value_name = "FILE", value_parser, conflicts_with = "no_store")]
    store: Option<PathBuf>,

    /// Don't use a store. All rollback indexes read as 0.
    #[arg(long)]
    no_store: bool,
}

/// Show the hash descriptor of an AVB-signed image without verifying it.
#[derive(Debug, Parser)]
pub struct SlotInfoCli {
    /// Path to image.
    #[arg(value_name = "IMAGE", value_parser)]
    image: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_flags() {
        let cli = VerifySlotCli::try_parse_from(["verify-slot", "boot", "--upgrade"]).unwrap();
        assert_eq!(
            flags_from_cli(&cli),
            SlotVerifyFlags::NOT_ALLOW_SAME_ROLLBACK_INDEX
                | SlotVerifyFlags::DO_NOT_UPDATE_ROLLBACK_INDEX,
        );

        let cli = VerifySlotCli::try_parse_from([
            "verify-slot",
            "boot",
            "--allow-rollback-index-error",
        ])
        .unwrap();
        assert_eq!(
            flags_from_cli(&cli),
            SlotVerifyFlags::ALLOW_ROLLBACK_INDEX_ERROR,
        );
    }

    #[test]
    fn store_conflicts_with_no_store() {
        assert!(
            VerifySlotCli::try_parse_from([
                "verify-slot",
                "boot",
                "--store",
                "store.toml",
                "--no-store",
            ])
            .is_err()
        );
    }
}
