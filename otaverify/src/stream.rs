// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use num_traits::ToPrimitive;

use crate::util;

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Allocate a zero-filled buffer of the specified size. Sizes frequently come
/// from length fields in untrusted input, so allocation failures are reported
/// as [`io::ErrorKind::OutOfMemory`] instead of aborting.
pub fn try_alloc(size: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
    buf.resize(size, 0);

    Ok(buf)
}

/// Extensions for readers to read and discard data (eg. for padding).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = try_alloc(size)?;
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for readers to read UTF-8 strings.
pub trait ReadStringExt {
    /// Read a string of exactly `size` bytes.
    fn read_string_exact(&mut self, size: usize) -> io::Result<String>;

    /// Read a `size`-byte field containing a string followed by NULL padding.
    /// Everything after the first NULL byte must be zero.
    fn read_string_padded(&mut self, size: usize) -> io::Result<String>;
}

impl<R: Read> ReadStringExt for R {
    fn read_string_exact(&mut self, size: usize) -> io::Result<String> {
        let buf = self.read_vec_exact(size)?;

        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_string_padded(&mut self, size: usize) -> io::Result<String> {
        let buf = self.read_vec_exact(size)?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());

        if !util::is_zero(&buf[end..]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "String padding contains non-zero bytes",
            ));
        }

        String::from_utf8(buf[..end].to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Extensions for writers to write strings into fixed-size fields.
pub trait WriteStringExt {
    /// Write a string followed by NULL padding up to `size` bytes.
    fn write_string_padded(&mut self, value: &str, size: usize) -> io::Result<()>;
}

impl<W: Write> WriteStringExt for W {
    fn write_string_padded(&mut self, value: &str, size: usize) -> io::Result<()> {
        if value.len() > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{value:?} exceeds {size} byte field"),
            ));
        }

        self.write_all(value.as_bytes())?;
        self.write_zeros_exact((size - value.len()) as u64)?;

        Ok(())
    }
}

/// Extensions for file-like types to query the file size. No guarantees are
/// made about the state of the underlying file position after performing any
/// operation.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

macro_rules! file_len_blanket_impl {
    ($type:ty) => {
        impl<F: ?Sized + FileLen> FileLen for $type {
            fn file_len(&self) -> io::Result<u64> {
                (**self).file_len()
            }
        }
    };
}

file_len_blanket_impl!(&F);
file_len_blanket_impl!(Arc<F>);
file_len_blanket_impl!(Box<F>);

/// Extensions for file-like types that support reads at specific offsets. No
/// guarantees are made about the state of underlying file position after
/// performing any operation.
pub trait ReadAt: FileLen {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill `buf` completely. A short read is an error, never a partial
    /// success.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let size = buf.len();
        let mut n = 0;

        while n < size {
            match self.read_at(&mut buf[n..], offset + n as u64) {
                Ok(0) => break,
                Ok(r) => n += r,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes at {offset}, but reached EOF after {n} bytes"),
            ));
        }

        Ok(())
    }
}

macro_rules! read_at_blanket_impl {
    ($type:ty) => {
        impl<R: ?Sized + ReadAt> ReadAt for $type {
            fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
                (**self).read_at(buf, offset)
            }

            fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
                (**self).read_exact_at(buf, offset)
            }
        }
    };
}

read_at_blanket_impl!(&R);
read_at_blanket_impl!(Arc<R>);
read_at_blanket_impl!(Box<R>);

/// Extensions for file-like types that support writes at specific offsets. No
/// guarantees are made about the state of the underlying file position after
/// performing any operation.
pub trait WriteAt: FileLen {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let n = self.write_at(buf, offset)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Expected to write {} bytes at {offset}, but reached EOF after {n} bytes",
                    buf.len(),
                ),
            ));
        }
        Ok(())
    }

    fn file_flush(&self) -> io::Result<()>;
}

macro_rules! write_at_blanket_impl {
    ($type:ty) => {
        impl<W: ?Sized + WriteAt> WriteAt for $type {
            fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
                (**self).write_at(buf, offset)
            }

            fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
                (**self).write_all_at(buf, offset)
            }

            fn file_flush(&self) -> io::Result<()> {
                (**self).file_flush()
            }
        }
    };
}

write_at_blanket_impl!(&W);
write_at_blanket_impl!(Arc<W>);
write_at_blanket_impl!(Box<W>);

/// Resolve an offset that is either absolute (`>= 0`) or relative to the end of
/// a file of `file_len` bytes (`< 0`). This mirrors `SEEK_SET` and `SEEK_END`.
pub fn resolve_offset(file_len: u64, offset: i64) -> io::Result<u64> {
    if offset >= 0 {
        Ok(offset.unsigned_abs())
    } else {
        file_len.checked_sub(offset.unsigned_abs()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Offset {offset} is before the start of the {file_len} byte file"),
            )
        })
    }
}

/// Bounded reads from a partition or file at absolute or end-relative offsets.
/// Every read either returns exactly the requested number of bytes or fails.
pub trait ByteSource: ReadAt {
    fn read_bytes(&self, offset: i64, len: usize) -> io::Result<Vec<u8>> {
        let offset = resolve_offset(self.file_len()?, offset)?;
        let mut buf = try_alloc(len)?;
        self.read_exact_at(&mut buf, offset)?;

        Ok(buf)
    }

    fn read_array<const N: usize>(&self, offset: i64) -> io::Result<[u8; N]> {
        let offset = resolve_offset(self.file_len()?, offset)?;
        let mut buf = [0u8; N];
        self.read_exact_at(&mut buf, offset)?;

        Ok(buf)
    }
}

impl<R: ?Sized + ReadAt> ByteSource for R {}

/// Writes to a partition or file at absolute or end-relative offsets.
pub trait ByteSink: WriteAt {
    fn write_bytes(&self, offset: i64, data: &[u8]) -> io::Result<()> {
        let offset = resolve_offset(self.file_len()?, offset)?;
        self.write_all_at(data, offset)
    }
}

impl<W: ?Sized + WriteAt> ByteSink for W {}

/// A reader wrapper that implements [`Seek`], but only for reporting the
/// current file position.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos == SeekFrom::Current(0) {
            Ok(self.offset)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Can only report current offset",
            ))
        }
    }
}

/// In-memory data is a valid source for every verifier.
impl FileLen for [u8] {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = offset
            .to_usize()
            .and_then(|o| self.get(o..))
            .unwrap_or_default();
        let n = data.len().min(buf.len());

        buf[..n].copy_from_slice(&data[..n]);

        Ok(n)
    }
}

impl FileLen for Vec<u8> {
    fn file_len(&self) -> io::Result<u64> {
        self.as_slice().file_len()
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl ReadAt for File {
    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }

    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

impl WriteAt for File {
    /// Write data to offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_write(self, buf, offset)
    }

    /// Write data to offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::write_at(self, buf, offset)
    }

    fn file_flush(&self) -> io::Result<()> {
        (&*self).flush()
    }
}

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

/// A file wrapper than implements the standard [`Read`] and [`Seek`] traits on
/// top of [`ReadAt`]. The file position is unique for every instance, even if
/// the underlying file is shared.
pub struct UserPosFile<F> {
    file: F,
    offset: u64,
}

impl<F> UserPosFile<F> {
    pub fn new(file: F) -> Self {
        Self { file, offset: 0 }
    }
}

impl<F: ReadAt> Read for UserPosFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<F: FileLen> Seek for UserPosFile<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.offset = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => resolve_offset(self.file.file_len()?, o)
                .or_else(|_| {
                    // Seeking past the end is allowed, like regular files.
                    self.file
                        .file_len()?
                        .to_i64()
                        .and_then(|s| s.checked_add(o))
                        .and_then(|s| s.to_u64())
                        .ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "Offset would be before the start of the file",
                            )
                        })
                })?,
            SeekFrom::Current(o) => self
                .offset
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Offset would be before the start of the file",
                    )
                })?,
        };

        Ok(self.offset)
    }
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If either `reader` or `writer` reaches
/// EOF before `size` bytes are copied, an error is returned.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

    use super::*;

    #[test]
    fn read_discard() {
        let mut reader = Cursor::new(b"foobar");
        reader.read_discard_exact(3).unwrap();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ba");

        let n = reader.read_discard(2).unwrap();
        assert_eq!(n, 1);

        assert_eq!(reader.stream_position().unwrap(), 6);
    }

    #[test]
    fn write_zeros() {
        let mut writer = Cursor::new([0u8; 6]);

        writer.write_zeros_exact(2).unwrap();
        writer.write_all(b"foo").unwrap();

        let n = writer.write_zeros(2).unwrap();
        assert_eq!(n, 1);

        assert_eq!(&writer.into_inner(), b"\0\0foo\0");
    }

    #[test]
    fn padded_strings() {
        let mut writer = Cursor::new(Vec::new());
        writer.write_string_padded("sha256", 8).unwrap();
        assert_eq!(writer.get_ref(), b"sha256\0\0");

        let err = writer.write_string_padded("too long", 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut reader = Cursor::new(b"sha256\0\0");
        assert_eq!(reader.read_string_padded(8).unwrap(), "sha256");

        let mut reader = Cursor::new(b"sha\0x\0\0\0");
        let err = reader.read_string_padded(8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn counting_reader() {
        let raw_reader = Cursor::new(b"foobar");
        let mut reader = CountingReader::new(raw_reader);

        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf[..0]).unwrap();
        reader.read_exact(&mut buf[..3]).unwrap();
        reader.read_exact(&mut buf[3..4]).unwrap();
        reader.read_exact(&mut buf[4..6]).unwrap();
        assert_eq!(&buf, b"foobar");

        assert_eq!(reader.stream_position().unwrap(), 6);
        assert!(reader.seek(SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn byte_source_offsets() {
        let data = b"headerbodyfooter".to_vec();

        assert_eq!(data.read_bytes(0, 6).unwrap(), b"header");
        assert_eq!(data.read_bytes(-6, 6).unwrap(), b"footer");
        assert_eq!(&data.read_array::<4>(6).unwrap(), b"body");
        assert_eq!(&data.read_array::<4>(-10).unwrap(), b"body");

        // Reads are never silently shortened.
        let err = data.read_bytes(-6, 7).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = data.read_bytes(-17, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = data.read_bytes(100, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn byte_sink_offsets() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"foobar").unwrap();

        file.write_bytes(-3, b"BAR").unwrap();
        file.write_bytes(0, b"F").unwrap();

        let err = file.write_bytes(-7, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut data = vec![0u8; 6];
        file.read_exact_at(&mut data, 0).unwrap();
        assert_eq!(data, b"FooBAR");
    }

    #[test]
    fn try_alloc_huge() {
        let err = try_alloc(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn user_pos_file() {
        let mut raw_file = tempfile::tempfile().unwrap();
        raw_file.write_all(b"foobar").unwrap();

        let mut file = UserPosFile::new(raw_file);
        let mut buf = [0u8; 3];

        file.rewind().unwrap();
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"foo");

        let pos = file.seek(SeekFrom::End(-3)).unwrap();
        assert_eq!(pos, 3);

        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bar");
    }

    #[test]
    fn copy_n() {
        let mut reader = Cursor::new(b"foobar");
        let mut writer = Cursor::new([0u8; 6]);
        let mut inspected = vec![];

        copy_n_inspect(&mut reader, &mut writer, 6, |d| inspected.extend_from_slice(d)).unwrap();
        assert_eq!(writer.get_ref(), b"foobar");
        assert_eq!(inspected, b"foobar");

        // Reader early EOF.
        reader.seek(SeekFrom::Start(3)).unwrap();
        writer.rewind().unwrap();
        let err = copy_n_inspect(&mut reader, &mut writer, 6, |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Writer early EOF.
        reader.rewind().unwrap();
        writer.seek(SeekFrom::Start(3)).unwrap();
        let err = copy_n_inspect(&mut reader, &mut writer, 6, |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
