// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Version 2 cluster reference counts and the cluster allocator built on them.
//!
//! Counts are 16 bit and live in cluster-sized refcount blocks, reached through a contiguous
//! refcount table. Only one block is held in memory at a time. Every change is written
//! through to the file before the call returns.

use std::collections::TryReserveError;
use std::io;

use log::debug;
use remain::sorted;
use thiserror::Error;

use crate::header::{REFCOUNT_TABLE_CLUSTERS_OFFSET, REFCOUNT_TABLE_OFFSET_OFFSET};
use crate::qcow_raw_file::QcowRawFile;
use crate::util::div_round_up_u64;
use crate::vec_cache::VecCache;
use crate::ErrorKind;

const REFCOUNT_MAX: i32 = 0xffff;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid sub-cluster allocation of {0} bytes")]
    InvalidByteAllocation(u64),
    #[error("Cluster {0} has no refcount to release")]
    NeverCounted(u64),
    #[error("Out of memory for the refcount table")]
    OutOfMemory(#[source] TryReserveError),
    #[error("Refcount of cluster {0} would exceed 65535")]
    Overflow(u64),
    #[error("Failed to read refcount block")]
    ReadingBlock(#[source] io::Error),
    #[error("Failed to read refcount table")]
    ReadingTable(#[source] io::Error),
    #[error("Refcount of cluster {0} would drop below zero")]
    Underflow(u64),
    #[error("Failed to write refcount block")]
    WritingBlock(#[source] io::Error),
    #[error("Failed to write refcount table location to header")]
    WritingHeader(#[source] io::Error),
    #[error("Failed to write refcount table")]
    WritingTable(#[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidByteAllocation(_) => ErrorKind::InvalidArgument,
            Error::NeverCounted(_) => ErrorKind::InvalidState,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Overflow(_) | Error::Underflow(_) => ErrorKind::OutOfRange,
            Error::ReadingBlock(_)
            | Error::ReadingTable(_)
            | Error::WritingBlock(_)
            | Error::WritingHeader(_)
            | Error::WritingTable(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Represents the refcount entries for an open qcow file.
#[derive(Clone, Debug)]
pub struct RefCount {
    table: VecCache<u64>,
    table_offset: u64,
    // The single cached refcount block and the file offset it came from, 0 when empty.
    block: Vec<u16>,
    block_offset: u64,
    cluster_bits: u32,
    cluster_size: u64,
    // Allocation cursors. Clusters below `free_cluster_index` are known to be in use.
    free_cluster_index: u64,
    free_byte_offset: u64,
}

impl RefCount {
    /// Creates a `RefCount` from `raw_file`, reading the refcount table of
    /// `table_clusters` clusters from `table_offset`.
    pub fn new(
        raw_file: &QcowRawFile,
        table_offset: u64,
        table_clusters: u32,
        cluster_bits: u32,
    ) -> Result<RefCount> {
        let entries = u64::from(table_clusters) << (cluster_bits - 3);
        let mut table = Vec::new();
        table
            .try_reserve_exact(entries as usize)
            .map_err(Error::OutOfMemory)?;
        table.resize(entries as usize, 0);
        raw_file
            .read_pointer_table_into(table_offset, &mut table)
            .map_err(Error::ReadingTable)?;
        let cluster_size = 1u64 << cluster_bits;
        Ok(RefCount {
            table: VecCache::from_vec(table),
            table_offset,
            block: vec![0; (cluster_size / 2) as usize],
            block_offset: 0,
            cluster_bits,
            cluster_size,
            free_cluster_index: 0,
            free_byte_offset: 0,
        })
    }

    /// Returns the refcount table entries.
    pub fn table(&self) -> &[u64] {
        self.table.get_values()
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    fn table_index(&self, cluster_index: u64) -> usize {
        (cluster_index >> (self.cluster_bits - 1)) as usize
    }

    fn block_index(&self, cluster_index: u64) -> usize {
        (cluster_index & ((1 << (self.cluster_bits - 1)) - 1)) as usize
    }

    fn load_block(&mut self, raw_file: &QcowRawFile, offset: u64) -> Result<()> {
        if self.block_offset == offset {
            return Ok(());
        }
        self.block_offset = 0;
        self.block = raw_file
            .read_refcount_block(offset)
            .map_err(Error::ReadingBlock)?;
        self.block_offset = offset;
        Ok(())
    }

    /// Drops the cached refcount block.
    pub fn invalidate(&mut self) {
        self.block_offset = 0;
    }

    /// Returns the refcount of the cluster with index `cluster_index`. Clusters the table does
    /// not reach have a count of zero.
    pub fn get_refcount(&mut self, raw_file: &QcowRawFile, cluster_index: u64) -> Result<u16> {
        let table_index = self.table_index(cluster_index);
        let block_offset = match self.table.get(table_index) {
            Some(&offset) if offset != 0 => offset,
            _ => return Ok(0),
        };
        self.load_block(raw_file, block_offset)?;
        Ok(self.block[self.block_index(cluster_index)])
    }

    /// Adds `addend` to the refcount of a single cluster and returns the new count.
    ///
    /// Increments may grow the refcount table and allocate a new refcount block; the block is
    /// itself counted before the requested update is made.
    pub fn update_cluster_refcount(
        &mut self,
        raw_file: &QcowRawFile,
        cluster_index: u64,
        addend: i32,
    ) -> Result<u16> {
        let table_index = self.table_index(cluster_index);
        if table_index >= self.table.len() {
            if addend < 0 {
                return Err(Error::NeverCounted(cluster_index));
            }
            self.grow_table(raw_file, table_index as u64 + 1)?;
        }

        let mut block_offset = self.table[table_index];
        if block_offset == 0 {
            if addend < 0 {
                return Err(Error::NeverCounted(cluster_index));
            }
            block_offset = self.new_block(raw_file, table_index)?;
        }
        // Counting a new block may have loaded a different one.
        self.load_block(raw_file, block_offset)?;

        let block_index = self.block_index(cluster_index);
        let refcount = i32::from(self.block[block_index]) + addend;
        if refcount < 0 {
            return Err(Error::Underflow(cluster_index));
        }
        if refcount > REFCOUNT_MAX {
            return Err(Error::Overflow(cluster_index));
        }
        if refcount == 0 {
            if cluster_index < self.free_cluster_index {
                self.free_cluster_index = cluster_index;
            }
            // A released cluster can no longer take compressed payloads.
            if self.free_byte_offset >> self.cluster_bits == cluster_index {
                self.free_byte_offset = 0;
            }
        }
        let refcount = refcount as u16;
        self.block[block_index] = refcount;
        raw_file
            .write_refcount(block_offset + block_index as u64 * 2, refcount)
            .map_err(Error::WritingBlock)?;
        Ok(refcount)
    }

    // Allocates, zeroes and links the refcount block for `table_index`, then counts it.
    fn new_block(&mut self, raw_file: &QcowRawFile, table_index: usize) -> Result<u64> {
        let offset = self.alloc_clusters_noref(raw_file, self.cluster_size)?;
        debug!("New refcount block for table entry {table_index} at {offset:#x}");
        self.block.fill(0);
        raw_file
            .write_refcount_block(offset, &self.block)
            .map_err(Error::WritingBlock)?;
        self.block_offset = offset;
        self.table[table_index] = offset;
        raw_file
            .write_pointer(self.table_offset + table_index as u64 * 8, offset)
            .map_err(Error::WritingTable)?;
        self.update_refcount(raw_file, offset, self.cluster_size, 1)?;
        Ok(offset)
    }

    /// Applies `addend` to every cluster overlapping `[offset, offset + length)`.
    pub fn update_refcount(
        &mut self,
        raw_file: &QcowRawFile,
        offset: u64,
        length: u64,
        addend: i32,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let mask = self.cluster_size - 1;
        let last = (offset + length - 1) & !mask;
        let mut cluster_offset = offset & !mask;
        while cluster_offset <= last {
            self.update_cluster_refcount(raw_file, cluster_offset >> self.cluster_bits, addend)?;
            cluster_offset += self.cluster_size;
        }
        Ok(())
    }

    // Moves the refcount table to a bigger place. The table grows by half until it reaches
    // `min_entries`.
    fn grow_table(&mut self, raw_file: &QcowRawFile, min_entries: u64) -> Result<()> {
        let old_entries = self.table.len() as u64;
        if min_entries <= old_entries {
            return Ok(());
        }
        let entry_shift = self.cluster_bits - 3;
        let mut clusters = old_entries >> entry_shift;
        let new_entries = loop {
            clusters = if clusters == 0 {
                1
            } else {
                (clusters * 3 + 1) / 2
            };
            if min_entries <= clusters << entry_shift {
                break clusters << entry_shift;
            }
        };

        let mut new_table = Vec::new();
        new_table
            .try_reserve_exact(new_entries as usize)
            .map_err(Error::OutOfMemory)?;
        new_table.extend_from_slice(self.table.get_values());
        new_table.resize(new_entries as usize, 0);

        let new_offset = self.alloc_clusters_noref(raw_file, new_entries * 8)?;
        debug!(
            "Growing refcount table from {old_entries} to {new_entries} entries at {new_offset:#x}"
        );
        raw_file
            .write_pointer_table(new_offset, &new_table)
            .map_err(Error::WritingTable)?;
        raw_file
            .write_pointer(REFCOUNT_TABLE_OFFSET_OFFSET, new_offset)
            .map_err(Error::WritingHeader)?;
        raw_file
            .write_u32(REFCOUNT_TABLE_CLUSTERS_OFFSET, clusters as u32)
            .map_err(Error::WritingHeader)?;

        let old_offset = self.table_offset;
        self.table = VecCache::from_vec(new_table);
        self.table_offset = new_offset;
        self.update_refcount(raw_file, new_offset, new_entries * 8, 1)?;
        self.update_refcount(raw_file, old_offset, old_entries * 8, -1)
    }

    /// Finds `size` bytes of contiguous free clusters without counting them.
    pub fn alloc_clusters_noref(&mut self, raw_file: &QcowRawFile, size: u64) -> Result<u64> {
        let nb_clusters = div_round_up_u64(size, self.cluster_size).max(1);
        loop {
            if self.get_refcount(raw_file, self.free_cluster_index)? == 0 {
                self.free_cluster_index += 1;
                let mut free = true;
                for _ in 1..nb_clusters {
                    if self.get_refcount(raw_file, self.free_cluster_index)? != 0 {
                        free = false;
                        break;
                    }
                    self.free_cluster_index += 1;
                }
                if free {
                    return Ok((self.free_cluster_index - nb_clusters) << self.cluster_bits);
                }
            }
            self.free_cluster_index += 1;
        }
    }

    /// Allocates and counts `size` bytes of contiguous clusters.
    pub fn alloc_clusters(&mut self, raw_file: &QcowRawFile, size: u64) -> Result<u64> {
        let offset = self.alloc_clusters_noref(raw_file, size)?;
        self.update_refcount(raw_file, offset, size.max(1), 1)?;
        Ok(offset)
    }

    /// Carves `size` bytes out of a partially used cluster, used for compressed payloads.
    ///
    /// Every payload takes a reference on each cluster it touches. A payload may straddle
    /// into the next cluster when that cluster is the next one allocated.
    pub fn alloc_bytes(&mut self, raw_file: &QcowRawFile, size: u64) -> Result<u64> {
        if size == 0 || size > self.cluster_size {
            return Err(Error::InvalidByteAllocation(size));
        }
        let mask = self.cluster_size - 1;
        if self.free_byte_offset == 0 {
            self.free_byte_offset = self.alloc_clusters(raw_file, self.cluster_size)?;
        }
        loop {
            let free_in_cluster = self.cluster_size - (self.free_byte_offset & mask);
            if size <= free_in_cluster {
                let offset = self.free_byte_offset;
                self.free_byte_offset += size;
                if free_in_cluster == size {
                    self.free_byte_offset = 0;
                }
                // The cluster's first payload uses the reference taken when it was allocated.
                if offset & mask != 0 {
                    self.update_cluster_refcount(raw_file, offset >> self.cluster_bits, 1)?;
                }
                return Ok(offset);
            }

            let new_cluster = self.alloc_clusters(raw_file, self.cluster_size)?;
            if (self.free_byte_offset & !mask) + self.cluster_size == new_cluster {
                let offset = self.free_byte_offset;
                self.update_cluster_refcount(raw_file, offset >> self.cluster_bits, 1)?;
                self.free_byte_offset += size;
                return Ok(offset);
            }
            self.free_byte_offset = new_cluster;
        }
    }

    /// Drops one reference from every cluster overlapping `[offset, offset + size)`.
    pub fn free_clusters(&mut self, raw_file: &QcowRawFile, offset: u64, size: u64) -> Result<()> {
        self.update_refcount(raw_file, offset, size, -1)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::raw_file::RawFile;

    // 512 byte clusters: table at cluster 1, block at cluster 2, clusters 0..=2 counted.
    fn small_image() -> (QcowRawFile, RefCount) {
        let raw = RawFile::new(TempFile::new().unwrap().into_file());
        let raw = QcowRawFile::from(raw, 512).unwrap();
        raw.write_at(0, &[0u8; 512]).unwrap();
        let mut table = vec![0u64; 64];
        table[0] = 1024;
        raw.write_pointer_table(512, &table).unwrap();
        let mut block = vec![0u16; 256];
        block[..3].fill(1);
        raw.write_refcount_block(1024, &block).unwrap();
        let refcount = RefCount::new(&raw, 512, 1, 9).unwrap();
        (raw, refcount)
    }

    #[test]
    fn reads_counts() {
        let (raw, mut rc) = small_image();
        assert_eq!(rc.get_refcount(&raw, 0).unwrap(), 1);
        assert_eq!(rc.get_refcount(&raw, 2).unwrap(), 1);
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 0);
        // Past the table.
        assert_eq!(rc.get_refcount(&raw, 1 << 20).unwrap(), 0);
    }

    #[test]
    fn update_writes_through() {
        let (raw, mut rc) = small_image();
        assert_eq!(rc.update_cluster_refcount(&raw, 5, 1).unwrap(), 1);
        assert_eq!(rc.update_cluster_refcount(&raw, 5, 1).unwrap(), 2);
        let block = raw.read_refcount_block(1024).unwrap();
        assert_eq!(block[5], 2);
    }

    #[test]
    fn underflow_and_overflow() {
        let (raw, mut rc) = small_image();
        assert!(matches!(
            rc.update_cluster_refcount(&raw, 7, -1),
            Err(Error::Underflow(7))
        ));
        raw.write_refcount(1024 + 7 * 2, 0xffff).unwrap();
        rc.invalidate();
        let err = rc.update_cluster_refcount(&raw, 7, 1).unwrap_err();
        assert!(matches!(err, Error::Overflow(7)));
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        // A failed update leaves the count alone.
        assert_eq!(rc.get_refcount(&raw, 7).unwrap(), 0xffff);
    }

    #[test]
    fn release_of_uncounted_block() {
        let (raw, mut rc) = small_image();
        // Cluster 256 would live in the second refcount block, which does not exist.
        assert!(matches!(
            rc.update_cluster_refcount(&raw, 256, -1),
            Err(Error::NeverCounted(256))
        ));
    }

    #[test]
    fn allocates_after_used_clusters() {
        let (raw, mut rc) = small_image();
        assert_eq!(rc.alloc_clusters(&raw, 512).unwrap(), 3 * 512);
        assert_eq!(rc.alloc_clusters(&raw, 1024).unwrap(), 4 * 512);
        assert_eq!(rc.get_refcount(&raw, 5).unwrap(), 1);
        assert_eq!(rc.free_cluster_index, 6);

        // Freeing rewinds the cursor so the hole is reused.
        rc.free_clusters(&raw, 3 * 512, 512).unwrap();
        assert_eq!(rc.free_cluster_index, 3);
        assert_eq!(rc.alloc_clusters(&raw, 512).unwrap(), 3 * 512);
    }

    #[test]
    fn multi_cluster_allocation_skips_holes_too_small() {
        let (raw, mut rc) = small_image();
        // Cluster 4 is busy, leaving a one-cluster hole at 3.
        rc.update_cluster_refcount(&raw, 4, 1).unwrap();
        assert_eq!(rc.alloc_clusters(&raw, 1024).unwrap(), 5 * 512);
    }

    #[test]
    fn new_block_counts_itself() {
        let (raw, mut rc) = small_image();
        // Cluster 300 needs refcount block 1, which is allocated at the first free cluster.
        assert_eq!(rc.update_cluster_refcount(&raw, 300, 1).unwrap(), 1);
        assert_eq!(rc.table()[1], 3 * 512);
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 1);
        assert_eq!(rc.get_refcount(&raw, 300).unwrap(), 1);
        assert_eq!(raw.read_pointer_table(512, 2, None).unwrap()[1], 3 * 512);
    }

    #[test]
    fn table_grows_when_index_is_beyond_it() {
        let (raw, mut rc) = small_image();
        // 64 blocks of 256 clusters: cluster 64 * 256 needs a 65th table entry.
        let cluster = 64 * 256;
        rc.update_cluster_refcount(&raw, cluster, 1).unwrap();
        // One cluster grows to (1 * 3 + 1) / 2 = 2 clusters of 64 entries.
        assert_eq!(rc.table().len(), 128);
        assert_ne!(rc.table_offset(), 512);
        assert_eq!(rc.get_refcount(&raw, cluster).unwrap(), 1);
        // The released table cluster is reused for the new refcount block.
        assert_eq!(rc.table()[64], 512);
        assert_eq!(rc.get_refcount(&raw, 1).unwrap(), 1);
        let mut header = [0u8; 12];
        raw.read_at(48, &mut header).unwrap();
        assert_eq!(
            u64::from_be_bytes(header[..8].try_into().unwrap()),
            rc.table_offset()
        );
        assert_eq!(u32::from_be_bytes(header[8..].try_into().unwrap()), 2);
    }

    #[test]
    fn byte_allocations_share_clusters() {
        let (raw, mut rc) = small_image();
        let a = rc.alloc_bytes(&raw, 100).unwrap();
        assert_eq!(a, 3 * 512);
        let b = rc.alloc_bytes(&raw, 100).unwrap();
        assert_eq!(b, 3 * 512 + 100);
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 2);

        // Does not fit in the 312 bytes left but the next cluster is contiguous.
        let c = rc.alloc_bytes(&raw, 400).unwrap();
        assert_eq!(c, 3 * 512 + 200);
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 3);
        assert_eq!(rc.get_refcount(&raw, 4).unwrap(), 1);

        assert!(matches!(
            rc.alloc_bytes(&raw, 513),
            Err(Error::InvalidByteAllocation(513))
        ));
    }

    #[test]
    fn released_byte_cluster_is_not_refilled() {
        let (raw, mut rc) = small_image();
        let a = rc.alloc_bytes(&raw, 100).unwrap();
        rc.free_clusters(&raw, a, 100).unwrap();
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 0);
        // The whole-cluster allocation takes the freed cluster back.
        assert_eq!(rc.alloc_clusters(&raw, 512).unwrap(), 3 * 512);
        assert_eq!(rc.alloc_bytes(&raw, 100).unwrap(), 4 * 512);
        assert_eq!(rc.get_refcount(&raw, 3).unwrap(), 1);
    }
}
