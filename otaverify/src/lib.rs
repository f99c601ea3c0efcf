/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Verification of signed update packages and AVB-protected partitions.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic over the
//! [`stream::ReadAt`] family of traits so that they can operate on files,
//! memory buffers, and anything else that supports positional reads.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod format;
pub mod package;
pub mod slot;
pub mod store;
pub mod stream;
pub mod util;
