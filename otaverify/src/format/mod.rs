/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod apksig;
pub mod avb;
pub mod block;
pub mod padding;
pub mod velaimg;
