// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Persistent key-value properties, like rollback indexes and the device unlock
//! state. Keys are flat strings, such as `persist.avb.rollback.0`.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use toml_edit::{DocumentMut, Item, Value, value};
use tracing::debug;

use crate::util;

pub const ROLLBACK_KEY_PREFIX: &str = "persist.avb.rollback.";
pub const UNLOCKED_KEY: &str = "persist.avb.unlocked";

/// Key holding the rollback index for `location`.
pub fn rollback_key(location: usize) -> String {
    format!("{ROLLBACK_KEY_PREFIX}{location}")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read store: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse store: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::TomlError),
    #[error("Failed to write store: {0:?}")]
    Write(PathBuf, #[source] io::Error),
    #[error("Key {key:?} is a {actual}, not a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Key {0:?} does not contain valid hex")]
    InvalidHex(String, #[source] hex::FromHexError),
    #[error("Key {key:?} holds {len} bytes, but limit is {max_len}")]
    BufferTooLarge {
        key: String,
        len: usize,
        max_len: usize,
    },
    #[error("Key {key:?} value {value} is out of range")]
    OutOfRange { key: String, value: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Typed access to persistent properties. Missing keys are reported as `None`
/// so that callers can pick the default.
pub trait KeyValueStore {
    fn get_int(&self, key: &str) -> Result<Option<i64>>;

    fn set_int(&mut self, key: &str, value: i64) -> Result<()>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()>;

    /// Get a binary value. Values longer than `max_len` are an error rather
    /// than being silently truncated.
    fn get_buffer(&self, key: &str, max_len: usize) -> Result<Option<Vec<u8>>>;

    fn set_buffer(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Read an unsigned counter stored as a TOML/property integer.
    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get_int(key)?
            .map(|v| {
                u64::try_from(v).map_err(|_| Error::OutOfRange {
                    key: key.to_owned(),
                    value: v.to_string(),
                })
            })
            .transpose()
    }

    fn set_u64(&mut self, key: &str, value: u64) -> Result<()> {
        let value = i64::try_from(value).map_err(|_| Error::OutOfRange {
            key: key.to_owned(),
            value: value.to_string(),
        })?;

        self.set_int(key, value)
    }
}

fn check_buffer_len(key: &str, len: usize, max_len: usize) -> Result<()> {
    if len > max_len {
        return Err(Error::BufferTooLarge {
            key: key.to_owned(),
            len,
            max_len,
        });
    }

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum MemoryValue {
    Int(i64),
    Bool(bool),
    Buffer(Vec<u8>),
}

impl MemoryValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Buffer(_) => "buffer",
        }
    }
}

/// Store that only lives in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, MemoryValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str, expected: &'static str, actual: &MemoryValue) -> Error {
        Error::WrongType {
            key: key.to_owned(),
            expected,
            actual: actual.type_name(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(MemoryValue::Int(v)) => Ok(Some(*v)),
            Some(v) => Err(Self::wrong_type(key, "integer", v)),
        }
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<()> {
        self.values.insert(key.to_owned(), MemoryValue::Int(value));
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(MemoryValue::Bool(v)) => Ok(Some(*v)),
            Some(v) => Err(Self::wrong_type(key, "boolean", v)),
        }
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.values.insert(key.to_owned(), MemoryValue::Bool(value));
        Ok(())
    }

    fn get_buffer(&self, key: &str, max_len: usize) -> Result<Option<Vec<u8>>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(MemoryValue::Buffer(v)) => {
                check_buffer_len(key, v.len(), max_len)?;
                Ok(Some(v.clone()))
            }
            Some(v) => Err(Self::wrong_type(key, "buffer", v)),
        }
    }

    fn set_buffer(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .insert(key.to_owned(), MemoryValue::Buffer(value.to_vec()));
        Ok(())
    }
}

/// Store backed by a TOML file. Every write rewrites the whole file through a
/// temporary file in the same directory, so the file is never left partially
/// written. Comments and formatting of untouched keys are preserved.
#[derive(Debug)]
pub struct TomlStore {
    path: PathBuf,
    document: DocumentMut,
}

impl TomlStore {
    /// Open the store at `path`. A missing file is treated as an empty store
    /// and is only created on the first write.
    pub fn open(path: &Path) -> Result<Self> {
        let document = match fs::read_to_string(path) {
            Ok(data) => data
                .parse::<DocumentMut>()
                .map_err(|e| Error::Parse(path.to_owned(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Store does not exist yet: {path:?}");
                DocumentMut::new()
            }
            Err(e) => return Err(Error::Read(path.to_owned(), e)),
        };

        Ok(Self {
            path: path.to_owned(),
            document,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_value(&self, key: &str) -> Option<&Value> {
        self.document.get(key).and_then(Item::as_value)
    }

    fn wrong_type(key: &str, expected: &'static str, actual: &Value) -> Error {
        Error::WrongType {
            key: key.to_owned(),
            expected,
            actual: actual.type_name(),
        }
    }

    fn set_and_save(&mut self, key: &str, item: Item) -> Result<()> {
        let old = self.document.insert(key, item);

        if let Err(e) = self.save() {
            // Keep the in-memory view consistent with the file.
            match old {
                Some(item) => self.document.insert(key, item),
                None => self.document.remove(key),
            };

            return Err(e);
        }

        Ok(())
    }

    fn save(&self) -> Result<()> {
        let write_error = |e| Error::Write(self.path.clone(), e);

        let mut temp_file = NamedTempFile::with_prefix_in(
            self.path
                .file_name()
                .unwrap_or_else(|| OsStr::new("otaverify-store")),
            util::parent_path(&self.path),
        )
        .map_err(write_error)?;

        temp_file
            .write_all(self.document.to_string().as_bytes())
            .map_err(write_error)?;
        temp_file.as_file().sync_all().map_err(write_error)?;

        temp_file
            .persist(&self.path)
            .map_err(|e| write_error(e.error))?;

        debug!("Saved store: {:?}", self.path);

        Ok(())
    }
}

impl KeyValueStore for TomlStore {
    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(Value::Integer(v)) => Ok(Some(*v.value())),
            Some(v) => Err(Self::wrong_type(key, "integer", v)),
        }
    }

    fn set_int(&mut self, key: &str, v: i64) -> Result<()> {
        self.set_and_save(key, value(v))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(Value::Boolean(v)) => Ok(Some(*v.value())),
            Some(v) => Err(Self::wrong_type(key, "boolean", v)),
        }
    }

    fn set_bool(&mut self, key: &str, v: bool) -> Result<()> {
        self.set_and_save(key, value(v))
    }

    fn get_buffer(&self, key: &str, max_len: usize) -> Result<Option<Vec<u8>>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(Value::String(v)) => {
                let hex_str = v.value();
                check_buffer_len(key, hex_str.len() / 2, max_len)?;

                let data =
                    hex::decode(hex_str).map_err(|e| Error::InvalidHex(key.to_owned(), e))?;

                Ok(Some(data))
            }
            Some(v) => Err(Self::wrong_type(key, "hex string", v)),
        }
    }

    fn set_buffer(&mut self, key: &str, v: &[u8]) -> Result<()> {
        self.set_and_save(key, value(hex::encode(v)))
    }
}
