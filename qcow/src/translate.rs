// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Guest offset to host cluster translation, including the allocation paths taken by writes.

use log::{debug, error};

use crate::cluster::{ClusterEntry, EntryFlags};
use crate::header::{ImageVersion, L1_SIZE_OFFSET, L1_TABLE_OFFSET_OFFSET};
use crate::util::{align_up, alloc_table, MAX_RAM_POINTER_TABLE_SIZE};
use crate::vec_cache::VecCache;
use crate::{Error, QcowFile, Result, SECTOR_SIZE};

/// How `get_cluster_offset` treats a cluster that is not yet privately allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterMode {
    /// Report the current mapping without changing anything.
    Lookup,
    /// Allocate an uncompressed cluster that sectors `n_start..n_end` of the cluster are
    /// about to be written to. The other sectors are filled from the previous content.
    Allocate { n_start: u64, n_end: u64 },
    /// Reserve `size` bytes for a compressed payload.
    AllocateCompressed { size: u64 },
}

impl QcowFile {
    /// Translates the guest byte `offset` to the cluster holding it.
    ///
    /// In the allocating modes the returned cluster is private to the active image and may be
    /// written in place; any previous shared or compressed mapping is released.
    pub fn get_cluster_offset(&mut self, offset: u64, mode: ClusterMode) -> Result<ClusterEntry> {
        match self.geometry.version {
            ImageVersion::V1 => self.cluster_offset_v1(offset, mode),
            ImageVersion::V2 => self.cluster_offset_v2(offset, mode),
        }
    }

    fn cluster_offset_v2(&mut self, offset: u64, mode: ClusterMode) -> Result<ClusterEntry> {
        let allocate = mode != ClusterMode::Lookup;
        let geometry = self.geometry;

        let l1_index = geometry.l1_index(offset) as usize;
        if l1_index >= self.l1_table.len() {
            if !allocate {
                return Ok(ClusterEntry::Unallocated);
            }
            self.grow_l1_table(l1_index as u64 + 1)?;
        }

        let l1_entry = self.l1_table[l1_index];
        let l2_offset = l1_entry & !EntryFlags::COPIED.bits();
        let (l2_offset, slot) = if l2_offset == 0 {
            if !allocate {
                return Ok(ClusterEntry::Unallocated);
            }
            self.new_l2_table(l1_index, None)?
        } else {
            self.check_table_offset(l2_offset)?;
            if allocate && l1_entry & EntryFlags::COPIED.bits() == 0 {
                // The L2 table is shared with a snapshot, give the active image its own copy.
                debug!("Copying shared L2 table at {l2_offset:#x}");
                self.free_clusters(l2_offset, geometry.cluster_size)?;
                self.l2_cache.invalidate(l2_offset);
                self.new_l2_table(l1_index, Some(l2_offset))?
            } else {
                (l2_offset, self.load_l2_table(l2_offset)?)
            }
        };

        let l2_index = geometry.l2_index(offset);
        let entry = geometry.decode_l2(self.l2_cache.table(slot)[l2_index]);
        if let ClusterEntry::Normal { offset, .. } = entry {
            self.check_table_offset(offset)?;
        }
        match (entry, mode) {
            (_, ClusterMode::Lookup) => return Ok(entry),
            (ClusterEntry::Normal { copied: true, .. }, ClusterMode::Allocate { .. }) => {
                return Ok(entry)
            }
            (ClusterEntry::Normal { offset, .. }, _) => {
                self.free_clusters(offset, geometry.cluster_size)?
            }
            (ClusterEntry::Compressed { offset, size }, _) => {
                let (start, len) = geometry.compressed_extent(offset, size);
                self.free_clusters(start, len)?
            }
            (ClusterEntry::Unallocated, _) => {}
        }

        let new_entry = match mode {
            ClusterMode::Allocate { n_start, n_end } => {
                let cluster_offset = self.alloc_clusters(geometry.cluster_size)?;
                if n_end - n_start < geometry.cluster_sectors {
                    let start_sector = (offset & !(geometry.cluster_size - 1)) / SECTOR_SIZE;
                    self.copy_sectors(start_sector, cluster_offset, 0, n_start)?;
                    self.copy_sectors(start_sector, cluster_offset, n_end, geometry.cluster_sectors)?;
                }
                geometry.encode_normal(cluster_offset, true)
            }
            ClusterMode::AllocateCompressed { size } => {
                let payload_offset = self.alloc_bytes(size)?;
                geometry.encode_compressed(payload_offset, size)
            }
            ClusterMode::Lookup => return Ok(entry),
        };
        self.set_l2_entry(l2_offset, l2_index, new_entry)?;
        Ok(geometry.decode_l2(new_entry))
    }

    fn cluster_offset_v1(&mut self, offset: u64, mode: ClusterMode) -> Result<ClusterEntry> {
        let allocate = mode != ClusterMode::Lookup;
        let geometry = self.geometry;

        let l1_index = geometry.l1_index(offset) as usize;
        if l1_index >= self.l1_table.len() {
            if allocate {
                return Err(Error::InvalidOffset(offset));
            }
            return Ok(ClusterEntry::Unallocated);
        }

        let mut l2_offset = self.l1_table[l1_index];
        let slot = if l2_offset == 0 {
            if !allocate {
                return Ok(ClusterEntry::Unallocated);
            }
            // New L2 tables go to the cluster-aligned end of the file.
            l2_offset = align_up(self.file_end()?, geometry.cluster_size);
            let slot = self.l2_cache.insert_with(l2_offset, |table| {
                table.fill(0);
                Ok::<(), Error>(())
            })?;
            self.raw_file
                .write_pointer_table(l2_offset, self.l2_cache.table(slot))
                .map_err(Error::WritingPointers)?;
            self.l1_table[l1_index] = l2_offset;
            self.raw_file
                .write_pointer(self.header.l1_table_offset + l1_index as u64 * 8, l2_offset)
                .map_err(Error::WritingPointers)?;
            slot
        } else {
            self.check_table_offset(l2_offset)?;
            self.load_l2_table(l2_offset)?
        };

        let l2_index = geometry.l2_index(offset);
        let entry = geometry.decode_l2(self.l2_cache.table(slot)[l2_index]);
        let new_entry = match (entry, mode) {
            (_, ClusterMode::Lookup) => return Ok(entry),
            (ClusterEntry::Normal { .. }, ClusterMode::Allocate { .. }) => return Ok(entry),
            (_, ClusterMode::Allocate { n_start, n_end }) => {
                let partial = n_end - n_start < geometry.cluster_sectors;
                let start_sector = (offset & !(geometry.cluster_size - 1)) / SECTOR_SIZE;
                let cluster_offset = align_up(self.file_end()?, geometry.cluster_size);
                match entry {
                    ClusterEntry::Compressed { .. } if partial => {
                        // Keep the rest of the cluster by writing it out decompressed.
                        self.decompress_cluster(entry)?;
                        let mut data = self.cluster_cache.data().to_vec();
                        if let Some(cipher) = &self.cipher {
                            cipher.encrypt_sectors(start_sector, &mut data);
                        }
                        self.raw_file
                            .write_at(cluster_offset, &data)
                            .map_err(Error::WritingData)?;
                    }
                    _ => {
                        self.raw_file
                            .file()
                            .truncate(cluster_offset + geometry.cluster_size)
                            .map_err(Error::SettingFileSize)?;
                        if let (Some(cipher), true) = (&self.cipher, partial) {
                            // Sectors outside the write must read back as zeros.
                            let mut zeros = vec![0u8; geometry.cluster_size as usize];
                            cipher.encrypt_sectors(start_sector, &mut zeros);
                            let (head, tail) = (n_start * SECTOR_SIZE, n_end * SECTOR_SIZE);
                            self.raw_file
                                .write_at(cluster_offset, &zeros[..head as usize])
                                .map_err(Error::WritingData)?;
                            self.raw_file
                                .write_at(cluster_offset + tail, &zeros[tail as usize..])
                                .map_err(Error::WritingData)?;
                        }
                    }
                }
                geometry.encode_normal(cluster_offset, false)
            }
            (_, ClusterMode::AllocateCompressed { size }) => {
                // The payload is appended at the exact end of the file. A cluster it replaces
                // is not reclaimed.
                let payload_offset = self.file_end()?;
                geometry.encode_compressed(payload_offset, size)
            }
        };
        self.set_l2_entry(l2_offset, l2_index, new_entry)?;
        Ok(geometry.decode_l2(new_entry))
    }

    fn file_end(&self) -> Result<u64> {
        self.raw_file
            .physical_size()
            .map_err(Error::GettingFileSize)
    }

    // L2 tables and data clusters start on a cluster boundary.
    fn check_table_offset(&self, offset: u64) -> Result<()> {
        if offset & (self.geometry.cluster_size - 1) != 0 {
            error!("Table entry points at misaligned offset {offset:#x}");
            return Err(Error::InvalidOffset(offset));
        }
        Ok(())
    }

    pub(crate) fn load_l2_table(&mut self, l2_offset: u64) -> Result<usize> {
        if let Some(slot) = self.l2_cache.lookup(l2_offset) {
            return Ok(slot);
        }
        let raw_file = &self.raw_file;
        self.l2_cache.insert_with(l2_offset, |table| {
            raw_file
                .read_pointer_table_into(l2_offset, table)
                .map_err(Error::ReadingPointers)
        })
    }

    // Allocates an L2 table for `l1_index`, copying `copy_from` or zeroed. The table reaches
    // the file before the L1 entry that points at it.
    fn new_l2_table(&mut self, l1_index: usize, copy_from: Option<u64>) -> Result<(u64, usize)> {
        let l2_offset = self.alloc_clusters(self.geometry.cluster_size)?;
        let raw_file = &self.raw_file;
        let slot = self.l2_cache.insert_with(l2_offset, |table| match copy_from {
            Some(old) => raw_file
                .read_pointer_table_into(old, table)
                .map_err(Error::ReadingPointers),
            None => {
                table.fill(0);
                Ok(())
            }
        })?;
        self.raw_file
            .write_pointer_table(l2_offset, self.l2_cache.table(slot))
            .map_err(Error::WritingPointers)?;

        let l1_entry = self.geometry.encode_normal(l2_offset, true);
        self.l1_table[l1_index] = l1_entry;
        self.raw_file
            .write_pointer(self.header.l1_table_offset + l1_index as u64 * 8, l1_entry)
            .map_err(Error::WritingPointers)?;
        Ok((l2_offset, slot))
    }

    fn set_l2_entry(&mut self, l2_offset: u64, l2_index: usize, entry: u64) -> Result<()> {
        if let Some(table) = self.l2_cache.get_mut(l2_offset) {
            table[l2_index] = entry;
        }
        self.raw_file
            .write_pointer(l2_offset + l2_index as u64 * 8, entry)
            .map_err(Error::WritingPointers)
    }

    /// Grows the L1 table by half until it holds `min_size` entries, moving it to newly
    /// allocated clusters.
    pub(crate) fn grow_l1_table(&mut self, min_size: u64) -> Result<()> {
        let old_size = self.l1_table.len() as u64;
        if min_size <= old_size {
            return Ok(());
        }
        let mut new_size = old_size.max(1);
        while min_size > new_size {
            new_size = (new_size * 3 + 1) / 2;
        }
        if new_size > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(Error::TooManyL1Entries(new_size));
        }

        let mut new_table = alloc_table(new_size)?;
        new_table[..old_size as usize].copy_from_slice(self.l1_table.get_values());

        let new_offset = self.alloc_clusters(new_size * 8)?;
        debug!("Growing L1 table from {old_size} to {new_size} entries at {new_offset:#x}");
        self.raw_file
            .write_pointer_table(new_offset, &new_table)
            .map_err(Error::WritingPointers)?;
        self.raw_file
            .write_pointer(L1_TABLE_OFFSET_OFFSET, new_offset)
            .map_err(Error::WritingHeader)?;
        self.raw_file
            .write_u32(L1_SIZE_OFFSET, new_size as u32)
            .map_err(Error::WritingHeader)?;

        let old_offset = self.header.l1_table_offset;
        self.l1_table = VecCache::from_vec(new_table);
        self.header.l1_table_offset = new_offset;
        self.header.l1_size = new_size as u32;
        self.free_clusters(old_offset, old_size * 8)
    }

    // Allocation helpers over the version 2 refcounts.

    pub(crate) fn alloc_clusters(&mut self, size: u64) -> Result<u64> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("cluster allocation"))?;
        refcounts
            .alloc_clusters(&self.raw_file, size)
            .map_err(Error::Refcount)
    }

    fn alloc_bytes(&mut self, size: u64) -> Result<u64> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("cluster allocation"))?;
        refcounts
            .alloc_bytes(&self.raw_file, size)
            .map_err(Error::Refcount)
    }

    pub(crate) fn free_clusters(&mut self, offset: u64, size: u64) -> Result<()> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("cluster allocation"))?;
        refcounts
            .free_clusters(&self.raw_file, offset, size)
            .map_err(Error::Refcount)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use crate::{CreateOptions, ImageVersion, RawFile};

    use super::*;

    fn new_image(version: ImageVersion, size: u64) -> QcowFile {
        let file = RawFile::new(TempFile::new().unwrap().into_file());
        let options = CreateOptions {
            version,
            size,
            ..Default::default()
        };
        QcowFile::create(file, &options).unwrap()
    }

    #[test]
    fn lookup_does_not_allocate() {
        let mut q = new_image(ImageVersion::V2, 1 << 20);
        assert_eq!(
            q.get_cluster_offset(0x3000, ClusterMode::Lookup).unwrap(),
            ClusterEntry::Unallocated
        );
        // Beyond the L1 table too.
        assert_eq!(
            q.get_cluster_offset(64 << 20, ClusterMode::Lookup).unwrap(),
            ClusterEntry::Unallocated
        );
        assert_eq!(q.l1_table(), &[0]);
        assert_eq!(q.refcount(4).unwrap(), 0);
    }

    #[test]
    fn first_write_allocates_l2_then_data() {
        let mut q = new_image(ImageVersion::V2, 1 << 20);
        let mode = ClusterMode::Allocate {
            n_start: 0,
            n_end: 8,
        };
        let entry = q.get_cluster_offset(0, mode).unwrap();
        // L2 table at cluster 4, data at cluster 5.
        assert_eq!(q.l1_table()[0], 0x4000 | EntryFlags::COPIED.bits());
        assert_eq!(
            entry,
            ClusterEntry::Normal {
                offset: 0x5000,
                copied: true
            }
        );
        // Allocating again returns the same private cluster.
        assert_eq!(q.get_cluster_offset(0x200, mode).unwrap(), entry);
        assert_eq!(q.get_cluster_offset(0, ClusterMode::Lookup).unwrap(), entry);
    }

    #[test]
    fn l1_grows_for_writes_past_its_end() {
        let mut q = new_image(ImageVersion::V2, 1 << 20);
        let mode = ClusterMode::Allocate {
            n_start: 0,
            n_end: 8,
        };
        // L1 entry 3 covers 6 MiB.
        q.get_cluster_offset(6 << 20, mode).unwrap();
        // 1 -> 2 -> 3 -> 5 entries.
        assert_eq!(q.l1_table().len(), 5);
        assert_eq!(q.header().l1_size, 5);
        let reopened = QcowFile::from(q.raw_file.file().try_clone().unwrap()).unwrap();
        assert_eq!(reopened.l1_table(), q.l1_table());
        // The old one-entry table at cluster 1 was released and reused for the L2 table.
        assert_eq!(q.l1_table()[3], 0x1000 | EntryFlags::COPIED.bits());
        assert_eq!(q.refcount(1).unwrap(), 1);
    }

    #[test]
    fn compressed_allocation_releases_normal_cluster() {
        let mut q = new_image(ImageVersion::V2, 1 << 20);
        let ClusterEntry::Normal { offset, .. } = q
            .get_cluster_offset(
                0,
                ClusterMode::Allocate {
                    n_start: 0,
                    n_end: 8,
                },
            )
            .unwrap()
        else {
            panic!("expected a normal cluster");
        };
        let entry = q
            .get_cluster_offset(0, ClusterMode::AllocateCompressed { size: 100 })
            .unwrap();
        assert!(matches!(entry, ClusterEntry::Compressed { .. }));
        // The data cluster was freed and immediately reused for the compressed payload.
        match entry {
            ClusterEntry::Compressed { offset: c, .. } => assert_eq!(c, offset),
            _ => unreachable!(),
        }
        assert_eq!(q.refcount(offset >> 12).unwrap(), 1);
    }

    #[test]
    fn misaligned_l2_entry_is_corrupt() {
        let mut q = new_image(ImageVersion::V2, 1 << 20);
        q.get_cluster_offset(
            0,
            ClusterMode::Allocate {
                n_start: 0,
                n_end: 8,
            },
        )
        .unwrap();
        // Point L2 entry 0 at an unaligned host offset.
        q.raw_file
            .write_pointer(0x4000, 0x5200 | EntryFlags::COPIED.bits())
            .unwrap();
        q.l2_cache.reset();
        assert!(matches!(
            q.get_cluster_offset(0, ClusterMode::Lookup),
            Err(Error::InvalidOffset(0x5200))
        ));
    }

    #[test]
    fn v1_allocates_at_file_end() {
        let mut q = new_image(ImageVersion::V1, 4 << 20);
        let end = q.file_end().unwrap();
        assert_eq!(end, 48 + 2 * 8);
        let entry = q
            .get_cluster_offset(
                0,
                ClusterMode::Allocate {
                    n_start: 0,
                    n_end: 8,
                },
            )
            .unwrap();
        // The L2 table takes the first aligned cluster, the data the next one.
        assert_eq!(q.l1_table()[0], 0x1000);
        assert_eq!(
            entry,
            ClusterEntry::Normal {
                offset: 0x2000,
                copied: false
            }
        );
        assert_eq!(q.file_end().unwrap(), 0x3000);
        assert!(matches!(
            q.get_cluster_offset(
                8 << 20,
                ClusterMode::Allocate {
                    n_start: 0,
                    n_end: 8
                }
            ),
            Err(Error::InvalidOffset(_))
        ));
    }
}
