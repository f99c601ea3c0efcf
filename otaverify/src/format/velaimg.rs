// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    crypto::PublicKey,
    error::VerifyError,
    stream::{self, FromReader, ReadAt, ReadFixedSizeExt, ToWriter, UserPosFile},
    util::HexBytes,
};

pub const VELA_MAGIC: [u8; 8] = *b"VELAOS!!";

/// Default location of the image signing public key on the device.
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "/etc/public.key";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid Vela image magic: {:?}", HexBytes(.0))]
    InvalidMagic([u8; 8]),
    #[error("Payload ({image_size} bytes) and signature ({sign_size} bytes) exceed {file_size} byte file")]
    PayloadOutOfBounds {
        image_size: u32,
        sign_size: u32,
        file_size: u64,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Header at the start of a Vela OS image. The payload and signature follow
/// immediately after.
#[derive(Clone, PartialEq, Eq)]
pub struct VelaHeader {
    pub image_size: u32,
    pub sign_size: u32,
    pub hash: [u8; 32],
}

impl fmt::Debug for VelaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VelaHeader")
            .field("image_size", &self.image_size)
            .field("sign_size", &self.sign_size)
            .field("hash", &HexBytes(&self.hash))
            .finish()
    }
}

impl VelaHeader {
    pub const SIZE: usize = 48;

    pub fn payload_offset(&self) -> u64 {
        Self::SIZE as u64
    }

    pub fn signature_offset(&self) -> u64 {
        self.payload_offset() + u64::from(self.image_size)
    }

    /// Total number of bytes covered by the header, payload, and signature.
    pub fn total_size(&self) -> u64 {
        self.signature_offset() + u64::from(self.sign_size)
    }
}

impl<R: Read> FromReader<R> for VelaHeader {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<8>()?;
        if magic != VELA_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let image_size = reader.read_u32::<LittleEndian>()?;
        let sign_size = reader.read_u32::<LittleEndian>()?;
        let hash = reader.read_array_exact::<32>()?;

        Ok(Self {
            image_size,
            sign_size,
            hash,
        })
    }
}

impl<W: Write> ToWriter<W> for VelaHeader {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&VELA_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.image_size)?;
        writer.write_u32::<LittleEndian>(self.sign_size)?;
        writer.write_all(&self.hash)?;

        Ok(())
    }
}

/// Read the header and check that the payload and signature fit in the file.
pub fn load_header(source: &(impl ReadAt + ?Sized)) -> Result<VelaHeader> {
    let mut reader = UserPosFile::new(source);
    let header = VelaHeader::from_reader(&mut reader)?;

    let file_size = source.file_len()?;
    if header.total_size() > file_size {
        return Err(Error::PayloadOutOfBounds {
            image_size: header.image_size,
            sign_size: header.sign_size,
            file_size,
        });
    }

    Ok(header)
}

/// Verify a Vela OS image. The SHA-256 digest of the payload must match the
/// header and the signature must be valid for the header's digest.
pub fn verify_vela_image(
    source: &(impl ReadAt + ?Sized),
    public_key_path: &Path,
) -> std::result::Result<VelaHeader, VerifyError> {
    let header = load_header(source)?;
    debug!("Vela header: {header:?}");

    let mut reader = UserPosFile::new(source);
    reader.seek(SeekFrom::Start(header.payload_offset()))?;

    let mut context = Context::new(&ring::digest::SHA256);
    stream::copy_n_inspect(
        &mut reader,
        io::sink(),
        u64::from(header.image_size),
        |data| context.update(data),
    )?;
    let digest = context.finish();

    if digest.as_ref() != header.hash.as_slice() {
        warn!("Vela image payload digest does not match header");
        return Err(VerifyError::DigestMismatch {
            expected: hex::encode(header.hash),
            actual: hex::encode(digest),
        });
    }

    debug!("Vela image payload digest matches header");

    let mut signature = stream::try_alloc(header.sign_size as usize)?;
    source.read_exact_at(&mut signature, header.signature_offset())?;

    let public_key = PublicKey::from_file(public_key_path)
        .map_err(|e| VerifyError::UntrustedKey(Some(e.into())))?;

    public_key
        .verify_prehash(public_key.sha256_algorithm(), &header.hash, &signature)
        .inspect_err(|e| warn!("Vela image signature rejected: {e}"))
        .map_err(|e| VerifyError::BadSignature(e.into()))?;

    info!("Vela image signature verified");

    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn header_bytes(image_size: u32, sign_size: u32) -> Vec<u8> {
        let header = VelaHeader {
            image_size,
            sign_size,
            hash: [0x11; 32],
        };
        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();
        writer.into_inner()
    }

    #[test]
    fn parse_header() {
        let data = header_bytes(4, 2);
        assert_eq!(data.len(), VelaHeader::SIZE);
        assert_eq!(&data[8..12], &[4, 0, 0, 0]);

        let header = VelaHeader::from_reader(data.as_slice()).unwrap();
        assert_eq!(header.image_size, 4);
        assert_eq!(header.sign_size, 2);
        assert_eq!(header.signature_offset(), 52);
        assert_eq!(header.total_size(), 54);
    }

    #[test]
    fn bad_magic() {
        let mut data = header_bytes(0, 0);
        data[0] = b'X';

        assert_matches!(
            VelaHeader::from_reader(data.as_slice()),
            Err(Error::InvalidMagic(_))
        );
    }

    #[test]
    fn payload_out_of_bounds() {
        let mut data = header_bytes(16, 8);
        data.extend_from_slice(&[0u8; 20]);

        assert_matches!(
            load_header(&data),
            Err(Error::PayloadOutOfBounds { file_size: 68, .. })
        );

        data.extend_from_slice(&[0u8; 4]);
        assert!(load_header(&data).is_ok());
    }

    #[test]
    fn truncated_header() {
        let data = header_bytes(0, 0);

        assert_matches!(load_header(&data[..40]), Err(Error::Io(_)));
    }
}
