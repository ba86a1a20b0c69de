// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Integer helpers shared by the table and allocation code.

use crate::{Error, Result};

/// Nesting depth limit for images that open other images.
pub(crate) const MAX_NESTING_DEPTH: u32 = 10;

// Tables bigger than this are refused rather than loaded into memory.
pub(crate) const MAX_RAM_POINTER_TABLE_SIZE: u64 = 35_000_000;

/// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor != 0)
}

/// Rounds `value` up to a multiple of `align`, a power of two.
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Allocates a zeroed table of `len` entries, failing instead of aborting when memory runs out.
pub(crate) fn alloc_table<T: Copy + Default>(len: u64) -> Result<Vec<T>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len as usize)
        .map_err(Error::OutOfMemory)?;
    table.resize(len as usize, T::default());
    Ok(table)
}

/// Returns an Error if the given offset doesn't align to a cluster boundary.
pub(crate) fn offset_is_cluster_boundary(offset: u64, cluster_bits: u32) -> Result<()> {
    if offset & ((0x01 << cluster_bits) - 1) != 0 {
        return Err(Error::InvalidOffset(offset));
    }
    Ok(())
}
