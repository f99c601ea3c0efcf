/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    /// DER or PEM certificate that packages must be signed with.
    pub trusted_cert: Option<PathBuf>,
    pub check_public_key: Option<bool>,
    pub delete_on_failure: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    /// Trusted AVB public key, either in AVB binary format or PEM.
    pub public_key: Option<PathBuf>,
    /// Key-value store holding rollback indexes.
    pub store: Option<PathBuf>,
    pub suffix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VelaConfig {
    pub public_key: Option<PathBuf>,
}

/// Defaults for command line options. Every field is optional and options
/// specified on the command line take precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub slot: SlotConfig,
    #[serde(default)]
    pub vela: VelaConfig,
}

pub fn parse_config(data: &str, path: &Path) -> Result<Config> {
    toml_edit::de::from_str(data).map_err(|e| Error::Parse(path.to_owned(), e))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

    parse_config(&data, path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_full() {
        let data = r#"
            [package]
            trusted_cert = "/etc/ota/release.x509.der"
            check_public_key = false

            [slot]
            public_key = "/etc/avb/key.bin"
            store = "/data/avb/store.toml"
            suffix = "_b"

            [vela]
            public_key = "/etc/public.key"
        "#;

        let config = parse_config(data, Path::new("test.toml")).unwrap();

        assert_eq!(
            config.package.trusted_cert.as_deref(),
            Some(Path::new("/etc/ota/release.x509.der")),
        );
        assert_eq!(config.package.check_public_key, Some(false));
        assert_eq!(config.package.delete_on_failure, None);
        assert_eq!(config.slot.suffix.as_deref(), Some("_b"));
        assert_eq!(
            config.vela.public_key.as_deref(),
            Some(Path::new("/etc/public.key")),
        );
    }

    #[test]
    fn parse_empty() {
        let config = parse_config("", Path::new("test.toml")).unwrap();
        assert_eq!(config, Config::default());

        let config = parse_config("[slot]\n", Path::new("test.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn reject_unknown_fields() {
        assert_matches!(
            parse_config("[package]\ntrusted_certs = \"a\"\n", Path::new("test.toml")),
            Err(Error::Parse(_, _))
        );
        assert_matches!(
            parse_config("[boot]\n", Path::new("test.toml")),
            Err(Error::Parse(_, _))
        );
        assert_matches!(
            parse_config("[package]\ncheck_public_key = \"yes\"\n", Path::new("test.toml")),
            Err(Error::Parse(_, _))
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vela]\npublic_key = \"key.pem\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.vela.public_key.as_deref(), Some(Path::new("key.pem")));

        let missing = file.path().with_extension("missing");
        assert_matches!(load_config(&missing), Err(Error::Read(_, _)));
    }
}
