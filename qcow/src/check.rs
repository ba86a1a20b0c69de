// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Offline consistency check of version 2 refcounts.

use log::warn;
use serde::Serialize;

use crate::cluster::{ClusterEntry, EntryFlags};
use crate::header::ImageVersion;
use crate::util::{alloc_table, div_round_up_u64};
use crate::{Error, QcowFile, Result};

/// A cluster whose stored refcount differs from the number of references found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RefcountMismatch {
    pub cluster: u64,
    pub stored: u16,
    pub expected: u16,
}

/// Problems found by `check_refcounts`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub refcount_mismatches: Vec<RefcountMismatch>,
    /// Live table entries whose copied flag disagrees with a refcount of one.
    pub copied_flag_errors: Vec<u64>,
    /// Compressed entries carrying the copied flag.
    pub compressed_copied: Vec<u64>,
    /// References to clusters past the end of the file.
    pub invalid_offsets: Vec<u64>,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.refcount_mismatches.is_empty()
            && self.copied_flag_errors.is_empty()
            && self.compressed_copied.is_empty()
            && self.invalid_offsets.is_empty()
    }
}

// Reference counts rebuilt from the metadata, one per cluster of the file.
struct ExpectedCounts {
    counts: Vec<u16>,
    cluster_bits: u32,
}

impl ExpectedCounts {
    fn add(&mut self, result: &mut CheckResult, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let first = offset >> self.cluster_bits;
        let last = (offset + size - 1) >> self.cluster_bits;
        for cluster in first..=last {
            match self.counts.get_mut(cluster as usize) {
                Some(count) => *count = count.saturating_add(1),
                None => {
                    warn!("Reference to cluster {cluster} past the end of the file");
                    result.invalid_offsets.push(cluster << self.cluster_bits);
                }
            }
        }
    }
}

impl QcowFile {
    /// Rebuilds the refcount of every cluster from the image metadata and compares it with the
    /// stored refcounts. Nothing is repaired.
    pub fn check_refcounts(&mut self) -> Result<CheckResult> {
        if self.geometry.version != ImageVersion::V2 {
            return Err(Error::Unsupported("refcount check"));
        }
        let cluster_bits = self.geometry.cluster_bits;
        let cluster_size = self.geometry.cluster_size;
        let file_size = self
            .raw_file
            .physical_size()
            .map_err(Error::GettingFileSize)?;
        let nb_clusters = div_round_up_u64(file_size, cluster_size);

        let mut result = CheckResult::default();
        let mut expected = ExpectedCounts {
            counts: alloc_table(nb_clusters)?,
            cluster_bits,
        };

        // Header.
        expected.add(&mut result, 0, cluster_size);

        let l1_table_offset = self.header.l1_table_offset;
        let l1_size = self.header.l1_size;
        self.check_l1(&mut expected, &mut result, l1_table_offset, l1_size, true)?;
        let snapshot_tables: Vec<(u64, u32)> = self
            .snapshots
            .iter()
            .map(|sn| (sn.l1_table_offset, sn.l1_size))
            .collect();
        for (offset, size) in snapshot_tables {
            self.check_l1(&mut expected, &mut result, offset, size, false)?;
        }
        expected.add(
            &mut result,
            self.header.snapshots_offset,
            self.snapshots_size,
        );

        let refcounts = self
            .refcounts
            .as_ref()
            .ok_or(Error::Unsupported("refcount check"))?;
        let table_offset = refcounts.table_offset();
        let table_bytes = refcounts.table().len() as u64 * 8;
        let blocks: Vec<u64> = refcounts
            .table()
            .iter()
            .copied()
            .filter(|&b| b != 0)
            .collect();
        expected.add(&mut result, table_offset, table_bytes);
        for block in blocks {
            expected.add(&mut result, block, cluster_size);
        }

        for (cluster, &count) in expected.counts.iter().enumerate() {
            let stored = self.refcount(cluster as u64)?;
            if stored != count {
                warn!("Cluster {cluster}: refcount {stored}, referenced {count} times");
                result.refcount_mismatches.push(RefcountMismatch {
                    cluster: cluster as u64,
                    stored,
                    expected: count,
                });
            }
        }
        Ok(result)
    }

    fn check_l1(
        &mut self,
        expected: &mut ExpectedCounts,
        result: &mut CheckResult,
        l1_table_offset: u64,
        l1_size: u32,
        check_copied: bool,
    ) -> Result<()> {
        let geometry = self.geometry;
        let copied = EntryFlags::COPIED.bits();
        let compressed = EntryFlags::COMPRESSED.bits();

        expected.add(result, l1_table_offset, u64::from(l1_size) * 8);
        let mut l1_table = alloc_table(u64::from(l1_size))?;
        self.raw_file
            .read_pointer_table_into(l1_table_offset, &mut l1_table)
            .map_err(Error::ReadingPointers)?;

        for l1_entry in l1_table {
            if l1_entry == 0 {
                continue;
            }
            let l2_offset = l1_entry & !copied;
            if check_copied {
                self.check_copied_flag(result, l1_entry)?;
            }
            let l2_table = self
                .raw_file
                .read_pointer_cluster(l2_offset, None)
                .map_err(Error::ReadingPointers)?;
            for entry in l2_table {
                if entry == 0 {
                    continue;
                }
                if entry & compressed != 0 {
                    if entry & copied != 0 {
                        warn!("Compressed entry {entry:#x} has the copied flag set");
                        result.compressed_copied.push(entry);
                    }
                    if let ClusterEntry::Compressed { offset, size } =
                        geometry.decode_l2(entry & !copied)
                    {
                        let (start, len) = geometry.compressed_extent(offset, size);
                        expected.add(result, start, len);
                    }
                } else {
                    if check_copied {
                        self.check_copied_flag(result, entry)?;
                    }
                    expected.add(result, entry & !copied, geometry.cluster_size);
                }
            }
            expected.add(result, l2_offset, geometry.cluster_size);
        }
        Ok(())
    }

    // The copied flag must be set exactly when the referenced cluster has one reference.
    fn check_copied_flag(&mut self, result: &mut CheckResult, entry: u64) -> Result<()> {
        let copied = EntryFlags::COPIED.bits();
        let refcount = self.refcount((entry & !copied) >> self.geometry.cluster_bits)?;
        if (refcount == 1) != (entry & copied != 0) {
            warn!("Entry {entry:#x} has refcount {refcount} but disagreeing copied flag");
            result.copied_flag_errors.push(entry);
        }
        Ok(())
    }
}
