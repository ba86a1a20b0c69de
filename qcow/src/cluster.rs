// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Decoding and encoding of L1/L2 table entries for both on-disk versions.

use bitflags::bitflags;

use crate::header::ImageVersion;
use crate::util::div_round_up_u64;
use crate::SECTOR_SIZE;

bitflags! {
    /// Flag bits of a version 2 table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// The referenced cluster has a refcount of exactly one and may be written in place.
        const COPIED = 1 << 63;
        /// The entry points at a compressed payload.
        const COMPRESSED = 1 << 62;
    }
}

/// A version 1 entry is compressed when its top bit is set. Version 1 has no copied flag.
pub const V1_COMPRESSED_FLAG: u64 = 1 << 63;

/// Where the data of one guest cluster lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEntry {
    Unallocated,
    Normal { offset: u64, copied: bool },
    /// `size` is the number of payload bytes to read at `offset`.
    Compressed { offset: u64, size: u64 },
}

impl ClusterEntry {
    pub fn is_allocated(&self) -> bool {
        !matches!(self, ClusterEntry::Unallocated)
    }
}

/// Cluster and table dimensions of an image plus the bit layout of its compressed entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterGeometry {
    pub version: ImageVersion,
    pub cluster_bits: u32,
    pub cluster_size: u64,
    pub cluster_sectors: u64,
    pub l2_bits: u32,
    pub l2_size: u64,
    csize_shift: u32,
    csize_mask: u64,
    cluster_offset_mask: u64,
}

impl ClusterGeometry {
    pub fn new(version: ImageVersion, cluster_bits: u32, l2_bits: u32) -> Self {
        let (csize_shift, csize_mask) = match version {
            ImageVersion::V1 => (63 - cluster_bits, (1u64 << cluster_bits) - 1),
            ImageVersion::V2 => (62 - (cluster_bits - 8), (1u64 << (cluster_bits - 8)) - 1),
        };
        ClusterGeometry {
            version,
            cluster_bits,
            cluster_size: 1 << cluster_bits,
            cluster_sectors: 1 << (cluster_bits - 9),
            l2_bits,
            l2_size: 1 << l2_bits,
            csize_shift,
            csize_mask,
            cluster_offset_mask: (1u64 << csize_shift) - 1,
        }
    }

    pub fn l1_index(&self, offset: u64) -> u64 {
        offset >> (self.cluster_bits + self.l2_bits)
    }

    pub fn l2_index(&self, offset: u64) -> usize {
        ((offset >> self.cluster_bits) & (self.l2_size - 1)) as usize
    }

    /// Number of L1 entries needed to map `size` guest bytes.
    pub fn l1_entries_for(&self, size: u64) -> u64 {
        div_round_up_u64(size, 1 << (self.cluster_bits + self.l2_bits))
    }

    /// Sector index of `sector` within its cluster.
    pub fn sector_in_cluster(&self, sector: u64) -> u64 {
        sector & (self.cluster_sectors - 1)
    }

    pub fn decode_l2(&self, entry: u64) -> ClusterEntry {
        if entry == 0 {
            return ClusterEntry::Unallocated;
        }
        match self.version {
            ImageVersion::V1 => {
                if entry & V1_COMPRESSED_FLAG != 0 {
                    ClusterEntry::Compressed {
                        offset: entry & self.cluster_offset_mask,
                        size: (entry >> self.csize_shift) & self.csize_mask,
                    }
                } else {
                    ClusterEntry::Normal {
                        offset: entry,
                        copied: false,
                    }
                }
            }
            ImageVersion::V2 => {
                let flags = EntryFlags::from_bits_truncate(entry);
                if flags.contains(EntryFlags::COMPRESSED) {
                    let offset = entry & self.cluster_offset_mask;
                    let sectors = ((entry >> self.csize_shift) & self.csize_mask) + 1;
                    ClusterEntry::Compressed {
                        offset,
                        size: sectors * SECTOR_SIZE - (offset & (SECTOR_SIZE - 1)),
                    }
                } else {
                    let offset = entry & !EntryFlags::COPIED.bits();
                    if offset == 0 {
                        return ClusterEntry::Unallocated;
                    }
                    ClusterEntry::Normal {
                        offset,
                        copied: flags.contains(EntryFlags::COPIED),
                    }
                }
            }
        }
    }

    /// Entry for an uncompressed cluster. `copied` is ignored by version 1.
    pub fn encode_normal(&self, offset: u64, copied: bool) -> u64 {
        match self.version {
            ImageVersion::V1 => offset,
            ImageVersion::V2 => l1_entry_make(offset, copied),
        }
    }

    /// Entry for a compressed payload of `size` bytes at `offset`.
    pub fn encode_compressed(&self, offset: u64, size: u64) -> u64 {
        match self.version {
            ImageVersion::V1 => offset | V1_COMPRESSED_FLAG | (size << self.csize_shift),
            ImageVersion::V2 => {
                let extra_sectors = ((offset + size - 1) >> 9) - (offset >> 9);
                offset | EntryFlags::COMPRESSED.bits() | (extra_sectors << self.csize_shift)
            }
        }
    }

    /// The byte range whose refcounts a compressed payload holds: every sector it touches.
    pub fn compressed_extent(&self, offset: u64, size: u64) -> (u64, u64) {
        let start = offset & !(SECTOR_SIZE - 1);
        (start, offset + size - start)
    }
}

/// Make a version 2 L1 entry, flagging it copied when its refcount is one.
pub fn l1_entry_make(cluster_addr: u64, refcount_is_one: bool) -> u64 {
    cluster_addr | (refcount_is_one as u64 * EntryFlags::COPIED.bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_v2() {
        let g = ClusterGeometry::new(ImageVersion::V2, 12, 9);
        assert_eq!(g.cluster_sectors, 8);
        assert_eq!(g.l1_index(0x20_1000), 1);
        assert_eq!(g.l2_index(0x20_1000), 1);
        assert_eq!(g.l1_entries_for(1 << 20), 1);
        assert_eq!(g.l1_entries_for((2 << 20) + 1), 2);
        assert_eq!(g.sector_in_cluster(13), 5);
    }

    #[test]
    fn normal_entries_v2() {
        let g = ClusterGeometry::new(ImageVersion::V2, 12, 9);
        assert_eq!(g.decode_l2(0), ClusterEntry::Unallocated);
        let e = g.encode_normal(0x5000, true);
        assert_eq!(e, 0x8000_0000_0000_5000);
        assert_eq!(
            g.decode_l2(e),
            ClusterEntry::Normal {
                offset: 0x5000,
                copied: true
            }
        );
        assert_eq!(
            g.decode_l2(0x5000),
            ClusterEntry::Normal {
                offset: 0x5000,
                copied: false
            }
        );
    }

    #[test]
    fn compressed_entries_v2() {
        let g = ClusterGeometry::new(ImageVersion::V2, 12, 9);
        // 300 bytes starting 256 bytes into a sector spill into the next sector.
        let e = g.encode_compressed(0x10100, 300);
        assert_eq!(e & EntryFlags::COPIED.bits(), 0);
        assert_eq!(e >> 58 & 0xf, 1);
        match g.decode_l2(e) {
            ClusterEntry::Compressed { offset, size } => {
                assert_eq!(offset, 0x10100);
                assert_eq!(size, 1024 - 256);
                assert_eq!(g.compressed_extent(offset, size), (0x10000, 1024));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn compressed_entries_v1() {
        let g = ClusterGeometry::new(ImageVersion::V1, 9, 12);
        let e = g.encode_compressed(0x5123, 300);
        assert_eq!(e >> 63, 1);
        assert_eq!(
            g.decode_l2(e),
            ClusterEntry::Compressed {
                offset: 0x5123,
                size: 300
            }
        );
        assert_eq!(
            g.decode_l2(0x6000),
            ClusterEntry::Normal {
                offset: 0x6000,
                copied: false
            }
        );
        // Version 1 never sets a copied flag.
        assert_eq!(g.encode_normal(0x6000, true), 0x6000);
    }
}
