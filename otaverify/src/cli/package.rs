/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::{args::CliError, status, warning},
    config::Config,
    package::{self, VerifyOptions},
    util::HexBytes,
};

pub fn verify_package_main(cli: &VerifyPackageCli, config: &Config) -> Result<()> {
    let cert = cli
        .cert
        .as_deref()
        .or(config.package.trusted_cert.as_deref())
        .ok_or(CliError::MissingArgument("--cert"))?;

    let options = VerifyOptions {
        check_public_key: !cli.no_check_public_key
            && config.package.check_public_key.unwrap_or(true),
    };
    let delete_on_failure =
        cli.delete_on_failure || config.package.delete_on_failure.unwrap_or(false);

    match package::verify_package_with(&cli.package, cert, &options) {
        Ok(p) => {
            status!("Package verified: {:?}", cli.package);
            println!("Algorithm: {:#06x}", p.algorithm_id);
            println!("Digest: {}", HexBytes(&p.digest));

            Ok(())
        }
        Err(e) => {
            if delete_on_failure {
                match fs::remove_file(&cli.package) {
                    Ok(()) => warning!("Deleted rejected package: {:?}", cli.package),
                    Err(e) => warning!("Failed to delete package: {:?}: {e}", cli.package),
                }
            }

            Err(e).with_context(|| format!("Failed to verify package: {:?}", cli.package))
        }
    }
}

/// Verify a package signed with APK Signature Scheme v2.
///
/// The package's signing certificate must be identical to the trusted
/// certificate.
#[derive(Debug, Parser)]
pub struct VerifyPackageCli {
    /// Path to package.
    #[arg(value_name = "PACKAGE", value_parser)]
    package: PathBuf,

    /// Path to trusted certificate (DER or PEM).
    #[arg(short, long, value_name = "FILE", value_parser)]
    cert: Option<PathBuf>,

    /// Don't require the signer's public key to match the certificate.
    #[arg(long)]
    no_check_public_key: bool,

    /// Delete the package if it fails verification.
    #[arg(long)]
    delete_on_failure: bool,
}
