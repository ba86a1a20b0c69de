// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;
use std::mem::size_of;

use byteorder::{BigEndian, ByteOrder};

use crate::raw_file::RawFile;

/// A qcow file. Reads and writes the big-endian tables stored in it and the clusters they
/// point to.
#[derive(Debug)]
pub struct QcowRawFile {
    file: RawFile,
    cluster_size: u64,
}

impl QcowRawFile {
    /// Creates a `QcowRawFile` from the given `RawFile`, `None` is returned if `cluster_size`
    /// is not a power of two.
    pub fn from(file: RawFile, cluster_size: u64) -> Option<Self> {
        if !cluster_size.is_power_of_two() {
            return None;
        }
        Some(QcowRawFile {
            file,
            cluster_size,
        })
    }

    /// Reads `count` 64 bit offsets and returns them as a vector.
    /// `mask` optionally `&`s out some of the bits on the file.
    pub fn read_pointer_table(
        &self,
        offset: u64,
        count: u64,
        mask: Option<u64>,
    ) -> io::Result<Vec<u64>> {
        let mut bytes = vec![0u8; count as usize * size_of::<u64>()];
        self.file.pread(offset, &mut bytes)?;
        let mut table = vec![0u64; count as usize];
        BigEndian::read_u64_into(&bytes, &mut table);
        if let Some(m) = mask {
            for ptr in &mut table {
                *ptr &= m;
            }
        }
        Ok(table)
    }

    /// Reads a cluster's worth of 64 bit offsets and returns them as a vector.
    pub fn read_pointer_cluster(&self, offset: u64, mask: Option<u64>) -> io::Result<Vec<u64>> {
        let count = self.cluster_size / size_of::<u64>() as u64;
        self.read_pointer_table(offset, count, mask)
    }

    /// Same as `read_pointer_table` but fills an existing slice.
    pub fn read_pointer_table_into(&self, offset: u64, table: &mut [u64]) -> io::Result<()> {
        let mut bytes = vec![0u8; table.len() * size_of::<u64>()];
        self.file.pread(offset, &mut bytes)?;
        BigEndian::read_u64_into(&bytes, table);
        Ok(())
    }

    /// Writes a pointer table to `offset` in the file.
    pub fn write_pointer_table(&self, offset: u64, table: &[u64]) -> io::Result<()> {
        let mut bytes = vec![0u8; table.len() * size_of::<u64>()];
        BigEndian::write_u64_into(table, &mut bytes);
        self.file.pwrite(offset, &bytes)
    }

    /// Writes the single table entry stored at `offset`.
    pub fn write_pointer(&self, offset: u64, value: u64) -> io::Result<()> {
        let mut bytes = [0u8; 8];
        BigEndian::write_u64(&mut bytes, value);
        self.file.pwrite(offset, &bytes)
    }

    /// Read a refcount block from the file and returns a Vec containing the block.
    /// Always returns a cluster's worth of data.
    pub fn read_refcount_block(&self, offset: u64) -> io::Result<Vec<u16>> {
        let mut bytes = vec![0u8; self.cluster_size as usize];
        self.file.pread(offset, &mut bytes)?;
        let mut block = vec![0u16; self.cluster_size as usize / size_of::<u16>()];
        BigEndian::read_u16_into(&bytes, &mut block);
        Ok(block)
    }

    /// Writes the single 16 bit refcount stored at `offset`.
    pub fn write_refcount(&self, offset: u64, value: u16) -> io::Result<()> {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.file.pwrite(offset, &bytes)
    }

    /// Writes a whole refcount block to `offset` in the file.
    pub fn write_refcount_block(&self, offset: u64, block: &[u16]) -> io::Result<()> {
        let mut bytes = vec![0u8; block.len() * size_of::<u16>()];
        BigEndian::write_u16_into(block, &mut bytes);
        self.file.pwrite(offset, &bytes)
    }

    /// Writes a 32 bit header field.
    pub fn write_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.file.pwrite(offset, &bytes)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.pread(offset, buf)
    }

    /// Same as `read_at`, but bytes past the end of the file read as zeros.
    pub fn read_at_zero_fill(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.pread_zero_fill(offset, buf).map(|_| ())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.pwrite(offset, buf)
    }

    /// Returns a reference to the underlying file.
    pub fn file(&self) -> &RawFile {
        &self.file
    }

    pub fn physical_size(&self) -> io::Result<u64> {
        self.file.len()
    }
}
