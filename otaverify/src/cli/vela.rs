/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::status,
    config::Config,
    format::velaimg::{self, DEFAULT_PUBLIC_KEY_PATH},
    util::HexBytes,
};

pub fn vela_verify_main(cli: &VelaVerifyCli, config: &Config) -> Result<()> {
    let key = cli
        .key
        .clone()
        .or_else(|| config.vela.public_key.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_KEY_PATH));

    let file = File::open(&cli.image)
        .with_context(|| format!("Failed to open Vela image: {:?}", cli.image))?;

    let header = velaimg::verify_vela_image(&file, &key)
        .with_context(|| format!("Failed to verify Vela image: {:?}", cli.image))?;

    status!("Vela image verified: {:?}", cli.image);
    println!("Payload size: {}", header.image_size);
    println!("Digest: {}", HexBytes(&header.hash));

    Ok(())
}

/// Verify a Vela OS image.
///
/// The payload digest must match the header and the header's digest must be
/// signed by the public key.
#[derive(Debug, Parser)]
pub struct VelaVerifyCli {
    /// Path to Vela image.
    #[arg(value_name = "IMAGE", value_parser)]
    image: PathBuf,

    /// Path to public key (PEM or DER).
    ///
    /// Defaults to /etc/public.key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,
}
