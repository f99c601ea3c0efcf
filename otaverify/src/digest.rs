// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Two-level chunked content digest. Each region is split into fixed-size
//! chunks, every chunk is hashed with a prefix byte and its length, and the
//! chunk digests are hashed together with a second prefix byte and the total
//! chunk count.

use std::io;

use ring::digest::{Algorithm, Context};
use thiserror::Error;
use tracing::debug;

use crate::{
    stream::{self, ReadAt},
    util::NumBytes,
};

pub const APK_CHUNK_SIZE: u32 = 1024 * 1024;
pub const APK_CHUNK_PREFIX: u8 = 0xa5;
pub const APK_TOP_PREFIX: u8 = 0x5a;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Chunk size must be non-zero")]
    ZeroChunkSize,
    #[error("Chunk count {0} does not fit in 32 bits")]
    TooManyChunks(u64),
    #[error("Failed to allocate chunk buffer")]
    Alloc(#[source] io::Error),
    #[error("Failed to read {region:?} region at offset {offset}")]
    ReadRegion {
        region: &'static str,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Parameters of the chunked digest. The defaults match APK signature scheme
/// v2 with SHA-256.
#[derive(Clone, Copy, Debug)]
pub struct DigestParams {
    pub chunk_size: u32,
    pub chunk_prefix: u8,
    pub top_prefix: u8,
    pub algorithm: &'static Algorithm,
}

impl Default for DigestParams {
    fn default() -> Self {
        Self {
            chunk_size: APK_CHUNK_SIZE,
            chunk_prefix: APK_CHUNK_PREFIX,
            top_prefix: APK_TOP_PREFIX,
            algorithm: &ring::digest::SHA256,
        }
    }
}

impl DigestParams {
    /// Number of chunks a region of `len` bytes is split into. An empty region
    /// still counts as one (empty) chunk.
    pub fn chunk_count(&self, len: u64) -> u64 {
        if len == 0 {
            1
        } else {
            len.div_ceil(u64::from(self.chunk_size))
        }
    }
}

/// A region of data to include in the digest.
#[derive(Clone, Copy)]
pub enum Region<'a> {
    /// A range of a file or partition.
    Source {
        name: &'static str,
        source: &'a dyn ReadAt,
        offset: u64,
        length: u64,
    },
    /// Data that only exists in memory, like a patched copy of a record.
    Memory { name: &'static str, data: &'a [u8] },
}

impl<'a> Region<'a> {
    pub fn source(name: &'static str, source: &'a dyn ReadAt, offset: u64, length: u64) -> Self {
        Self::Source {
            name,
            source,
            offset,
            length,
        }
    }

    pub fn memory(name: &'static str, data: &'a [u8]) -> Self {
        Self::Memory { name, data }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Source { name, .. } | Self::Memory { name, .. } => name,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Source { length, .. } => *length,
            Self::Memory { data, .. } => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        match self {
            Self::Source {
                source,
                offset: base,
                ..
            } => source.read_exact_at(buf, base + offset),
            Self::Memory { data, .. } => data.read_exact_at(buf, offset),
        }
    }
}

/// Total number of chunks across all regions.
pub fn total_chunk_count(params: &DigestParams, regions: &[Region]) -> u64 {
    regions.iter().map(|r| params.chunk_count(r.len())).sum()
}

/// Compute the top-level digest over `regions` in order. The total chunk count
/// is computed before any data is read and any failed or short read aborts the
/// entire computation.
pub fn compute(params: &DigestParams, regions: &[Region]) -> Result<Vec<u8>> {
    if params.chunk_size == 0 {
        return Err(Error::ZeroChunkSize);
    }

    let total = total_chunk_count(params, regions);
    let total_u32 = u32::try_from(total).map_err(|_| Error::TooManyChunks(total))?;

    debug!(
        "Computing chunked digest over {} regions with {total} chunks",
        regions.len(),
    );

    let mut top_context = Context::new(params.algorithm);
    top_context.update(&[params.top_prefix]);
    top_context.update(&total_u32.to_le_bytes());

    let mut buf = stream::try_alloc(params.chunk_size as usize).map_err(Error::Alloc)?;

    for region in regions {
        let len = region.len();
        let mut offset = 0;

        debug!("Digesting {:?} region: {:?}", region.name(), NumBytes(len));

        loop {
            let n = (len - offset).min(u64::from(params.chunk_size)) as usize;

            region
                .read_exact_at(&mut buf[..n], offset)
                .map_err(|e| Error::ReadRegion {
                    region: region.name(),
                    offset,
                    source: e,
                })?;

            let mut context = Context::new(params.algorithm);
            context.update(&[params.chunk_prefix]);
            context.update(&(n as u32).to_le_bytes());
            context.update(&buf[..n]);

            top_context.update(context.finish().as_ref());

            offset += n as u64;
            if offset >= len {
                break;
            }
        }
    }

    Ok(top_context.finish().as_ref().to_vec())
}
