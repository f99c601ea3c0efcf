// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, Write};

use num_traits::PrimInt;

use crate::stream::{ReadDiscardExt, WriteZerosExt};

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a block boundary.
pub fn calc<N: PrimInt>(offset: N, block_size: N) -> N {
    let r = offset % block_size;
    if r == N::zero() {
        N::zero()
    } else {
        block_size - r
    }
}

/// Read and discard data until the next multiple of the block size. [`Seek`] is
/// only used for querying the file position.
pub fn read_discard(mut reader: impl Read + Seek, block_size: u64) -> io::Result<u64> {
    let pos = reader.stream_position()?;
    let padding = calc(pos, block_size);

    reader.read_discard_exact(padding)?;

    Ok(padding)
}

/// Write zeros until the next multiple of the block size. [`Seek`] is only used
/// for querying the file position.
pub fn write_zeros(mut writer: impl Write + Seek, block_size: u64) -> io::Result<u64> {
    let pos = writer.stream_position()?;
    let padding = calc(pos, block_size);

    writer.write_zeros_exact(padding)?;

    Ok(padding)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, Write};

    use super::*;

    #[test]
    fn calc_padding() {
        assert_eq!(calc(0u64, 64), 0);
        assert_eq!(calc(1u64, 64), 63);
        assert_eq!(calc(64u64, 64), 0);
        assert_eq!(calc(4097usize, 4096), 4095);
    }

    #[test]
    fn round_trip_padding() {
        let mut writer = Cursor::new(Vec::new());
        writer.write_all(b"abc").unwrap();
        assert_eq!(write_zeros(&mut writer, 8).unwrap(), 5);
        assert_eq!(writer.get_ref(), b"abc\0\0\0\0\0");

        let mut reader = Cursor::new(writer.into_inner());
        reader.seek(io::SeekFrom::Start(3)).unwrap();
        assert_eq!(read_discard(&mut reader, 8).unwrap(), 5);
        assert_eq!(reader.stream_position().unwrap(), 8);
    }
}
