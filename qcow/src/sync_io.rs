// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Sector granular synchronous I/O.

use std::cmp::min;

use crate::cluster::ClusterEntry;
use crate::decoder::Encoder;
use crate::header::ImageVersion;
use crate::translate::ClusterMode;
use crate::util::align_up;
use crate::{Error, QcowFile, Result, SECTOR_SIZE};

impl QcowFile {
    /// Reads `buf.len() / 512` sectors starting at `sector`.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = self.sector_count(buf.len())?;
        self.check_range(sector, count)?;
        self.check_key()?;
        self.read_sectors_unchecked(sector, buf)
    }

    /// Writes whole sectors from `buf` starting at `sector`.
    ///
    /// Clusters shared with a snapshot or stored compressed are replaced by private copies
    /// first.
    pub fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let count = self.sector_count(buf.len())?;
        self.check_range(sector, count)?;
        self.check_key()?;
        let res = self.write_sectors_unchecked(sector, buf);
        self.cluster_cache.invalidate();
        res
    }

    /// Stores one whole cluster compressed.
    ///
    /// Data that does not shrink is written uncompressed instead. An empty `buf` only rounds
    /// the file length up to a whole sector.
    pub fn write_compressed(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            let len = self
                .raw_file
                .physical_size()
                .map_err(Error::GettingFileSize)?;
            return self
                .raw_file
                .file()
                .truncate(align_up(len, SECTOR_SIZE))
                .map_err(Error::SettingFileSize);
        }

        let count = self.sector_count(buf.len())?;
        if count != self.geometry.cluster_sectors {
            return Err(Error::CompressedSpan(count));
        }
        if self.geometry.sector_in_cluster(sector) != 0 {
            return Err(Error::CompressedUnaligned(sector));
        }
        self.check_range(sector, count)?;
        self.check_key()?;

        let res = self.write_compressed_cluster(sector, buf);
        self.cluster_cache.invalidate();
        res
    }

    fn write_compressed_cluster(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let Some(compressed) = self.encoder.encode(buf).map_err(Error::Compressing)? else {
            return self.write_sectors_unchecked(sector, buf);
        };
        let mode = ClusterMode::AllocateCompressed {
            size: compressed.len() as u64,
        };
        match self.get_cluster_offset(sector * SECTOR_SIZE, mode)? {
            ClusterEntry::Compressed { offset, .. } => self
                .raw_file
                .write_at(offset, &compressed)
                .map_err(Error::WritingData),
            _ => Err(Error::InvalidOffset(sector * SECTOR_SIZE)),
        }
    }

    /// Reports whether the cluster holding `sector` is allocated in this image, and how many
    /// sectors from `sector` up to `count` share that status.
    pub fn is_allocated(&mut self, sector: u64, count: u64) -> Result<(bool, u64)> {
        self.check_range(sector, 1)?;
        let entry = self.get_cluster_offset(sector * SECTOR_SIZE, ClusterMode::Lookup)?;
        let in_cluster = self.geometry.cluster_sectors - self.geometry.sector_in_cluster(sector);
        Ok((entry.is_allocated(), min(in_cluster, count)))
    }

    /// Discards every cluster of a version 1 image. Version 2 images are left untouched.
    pub fn make_empty(&mut self) -> Result<()> {
        if self.geometry.version != ImageVersion::V1 {
            return Ok(());
        }
        let l1_len = self.l1_table.len();
        self.l1_table.get_values_mut().fill(0);
        self.raw_file
            .write_pointer_table(self.header.l1_table_offset, self.l1_table.get_values())
            .map_err(Error::WritingPointers)?;
        self.raw_file
            .file()
            .truncate(self.header.l1_table_offset + l1_len as u64 * 8)
            .map_err(Error::SettingFileSize)?;
        self.l2_cache.reset();
        self.cluster_cache.invalidate();
        Ok(())
    }

    fn sector_count(&self, len: usize) -> Result<u64> {
        if len as u64 % SECTOR_SIZE != 0 {
            return Err(Error::UnalignedBuffer(len));
        }
        Ok(len as u64 / SECTOR_SIZE)
    }

    pub(crate) fn check_range(&self, sector: u64, count: u64) -> Result<()> {
        match sector.checked_add(count) {
            Some(end) if end <= self.total_sectors => Ok(()),
            _ => Err(Error::InvalidSectorRange { sector, count }),
        }
    }

    pub(crate) fn check_key(&self) -> Result<()> {
        if self.is_encrypted() && self.cipher.is_none() {
            return Err(Error::NeedsKey);
        }
        Ok(())
    }

    // Reads without range or key checks. Copy-on-write uses it for sectors past the end of
    // the disk that share a cluster with the last guest sector.
    pub(crate) fn read_sectors_unchecked(&mut self, mut sector: u64, buf: &mut [u8]) -> Result<()> {
        let cluster_sectors = self.geometry.cluster_sectors;
        let mut pos = 0;
        while pos < buf.len() {
            let index_in_cluster = self.geometry.sector_in_cluster(sector);
            let remaining = (buf.len() - pos) as u64 / SECTOR_SIZE;
            let n = min(cluster_sectors - index_in_cluster, remaining);
            let chunk = &mut buf[pos..pos + (n * SECTOR_SIZE) as usize];

            let entry = self.get_cluster_offset(sector * SECTOR_SIZE, ClusterMode::Lookup)?;
            self.read_span(entry, sector, chunk)?;

            sector += n;
            pos += chunk.len();
        }
        Ok(())
    }

    // Fills `chunk`, which lies within a single cluster, from the mapping `entry`.
    pub(crate) fn read_span(
        &mut self,
        entry: ClusterEntry,
        sector: u64,
        chunk: &mut [u8],
    ) -> Result<()> {
        let index_in_cluster = self.geometry.sector_in_cluster(sector);
        match entry {
            ClusterEntry::Unallocated => self.read_backing(sector, chunk),
            ClusterEntry::Compressed { .. } => {
                self.decompress_cluster(entry)?;
                let start = (index_in_cluster * SECTOR_SIZE) as usize;
                chunk.copy_from_slice(&self.cluster_cache.data()[start..start + chunk.len()]);
                Ok(())
            }
            ClusterEntry::Normal { offset, .. } => {
                self.raw_file
                    .read_at(offset + index_in_cluster * SECTOR_SIZE, chunk)
                    .map_err(Error::ReadingData)?;
                if let Some(cipher) = &self.cipher {
                    cipher.decrypt_sectors(sector, chunk);
                }
                Ok(())
            }
        }
    }

    // Unallocated sectors come from the backing image, or read as zeros without one.
    pub(crate) fn read_backing(&mut self, sector: u64, chunk: &mut [u8]) -> Result<()> {
        match self.backing_file.as_mut() {
            Some(backing) => backing.read_sectors(sector, chunk),
            None => {
                chunk.fill(0);
                Ok(())
            }
        }
    }

    fn write_sectors_unchecked(&mut self, mut sector: u64, buf: &[u8]) -> Result<()> {
        let cluster_sectors = self.geometry.cluster_sectors;
        let mut pos = 0;
        while pos < buf.len() {
            let index_in_cluster = self.geometry.sector_in_cluster(sector);
            let remaining = (buf.len() - pos) as u64 / SECTOR_SIZE;
            let n = min(cluster_sectors - index_in_cluster, remaining);
            let chunk = &buf[pos..pos + (n * SECTOR_SIZE) as usize];

            let offset = self.writable_sector_offset(sector, n)?;
            match &self.cipher {
                Some(cipher) => {
                    let mut data = chunk.to_vec();
                    cipher.encrypt_sectors(sector, &mut data);
                    self.raw_file.write_at(offset, &data)
                }
                None => self.raw_file.write_at(offset, chunk),
            }
            .map_err(Error::WritingData)?;

            sector += n;
            pos += chunk.len();
        }
        Ok(())
    }

    /// Allocates the cluster holding `sector` for a write of `n` sectors and returns the host
    /// offset of `sector`.
    pub(crate) fn writable_sector_offset(&mut self, sector: u64, n: u64) -> Result<u64> {
        let index_in_cluster = self.geometry.sector_in_cluster(sector);
        let mode = ClusterMode::Allocate {
            n_start: index_in_cluster,
            n_end: index_in_cluster + n,
        };
        match self.get_cluster_offset(sector * SECTOR_SIZE, mode)? {
            ClusterEntry::Normal { offset, .. } if offset % SECTOR_SIZE == 0 => {
                Ok(offset + index_in_cluster * SECTOR_SIZE)
            }
            ClusterEntry::Normal { offset, .. } => Err(Error::InvalidOffset(offset)),
            _ => Err(Error::InvalidOffset(sector * SECTOR_SIZE)),
        }
    }

    // Fills sectors `n_start..n_end` of the new cluster at `cluster_offset` with the current
    // content of the guest cluster starting at `start_sector`.
    pub(crate) fn copy_sectors(
        &mut self,
        start_sector: u64,
        cluster_offset: u64,
        n_start: u64,
        n_end: u64,
    ) -> Result<()> {
        if n_end <= n_start {
            return Ok(());
        }
        let mut buf = vec![0u8; ((n_end - n_start) * SECTOR_SIZE) as usize];
        self.read_sectors_unchecked(start_sector + n_start, &mut buf)?;
        if let Some(cipher) = &self.cipher {
            cipher.encrypt_sectors(start_sector + n_start, &mut buf);
        }
        self.raw_file
            .write_at(cluster_offset + n_start * SECTOR_SIZE, &buf)
            .map_err(Error::WritingData)
    }

    /// Makes the cluster cache hold the decompressed content of `entry`.
    pub(crate) fn decompress_cluster(&mut self, entry: ClusterEntry) -> Result<()> {
        let ClusterEntry::Compressed { offset, size } = entry else {
            return Ok(());
        };
        if self.cluster_cache.cached_offset() == Some(offset) {
            return Ok(());
        }
        // The payload is addressed in whole sectors, the last of which may end past EOF.
        let mut input = vec![0u8; size as usize];
        self.raw_file
            .read_at_zero_fill(offset, &mut input)
            .map_err(Error::ReadingData)?;
        self.cluster_cache
            .load(offset, &input, &self.decoder)
            .map_err(Error::Decompressing)
    }
}
