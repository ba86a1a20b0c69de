// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cmp::min;
use std::fmt::{self, Debug, Formatter};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use log::debug;

use crate::header::{detect_image_type, ImageType};
use crate::raw_file::RawFile;
use crate::{Error, QcowFile, Result, SECTOR_SIZE};

/// Sector reads from the image an overlay falls back to for unallocated clusters.
pub trait BackingFileOps: Send {
    /// Number of whole sectors the image provides.
    fn total_sectors(&self) -> io::Result<u64>;
    /// Fills `buf` with sectors starting at `sector`. The range lies within `total_sectors`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;
}

impl BackingFileOps for QcowFile {
    fn total_sectors(&self) -> io::Result<u64> {
        Ok(QcowFile::total_sectors(self))
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        QcowFile::read_sectors(self, sector, buf)
    }
}

impl BackingFileOps for RawFile {
    fn total_sectors(&self) -> io::Result<u64> {
        Ok(self.len()? / SECTOR_SIZE)
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.pread(sector * SECTOR_SIZE, buf)
            .map_err(Error::BackingFileIo)
    }
}

/// Backing file wrapper
pub struct BackingFile {
    inner: Box<dyn BackingFileOps>,
    total_sectors: u64,
}

impl BackingFile {
    /// Opens the image at `path` read-only. Images carrying the qcow magic are opened as
    /// qcow images with one less level of nesting allowed, anything else is read raw.
    pub fn new(path: &Path, max_nesting_depth: u32) -> Result<Self> {
        if max_nesting_depth == 0 {
            return Err(Error::MaxNestingDepthExceeded);
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(Error::BackingFileIo)?;
        let raw_file = RawFile::new(file);

        let inner: Box<dyn BackingFileOps> = match detect_image_type(&raw_file)? {
            ImageType::Raw => Box::new(raw_file),
            ImageType::Qcow => {
                let backing_qcow =
                    QcowFile::open_raw(raw_file, path.parent(), max_nesting_depth - 1)
                        .map_err(|e| Error::BackingFileOpen(Box::new(e)))?;
                Box::new(backing_qcow)
            }
        };
        debug!("Opened backing file {}", path.display());
        Self::from_ops(inner)
    }

    /// Wraps an already open image.
    pub fn from_ops(inner: Box<dyn BackingFileOps>) -> Result<Self> {
        let total_sectors = inner.total_sectors().map_err(Error::BackingFileIo)?;
        Ok(BackingFile {
            inner,
            total_sectors,
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Reads sectors starting at `sector`. Sectors past the end of the backing image read
    /// as zeros.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = buf.len() as u64 / SECTOR_SIZE;
        let available = min(self.total_sectors.saturating_sub(sector), count);
        let (head, tail) = buf.split_at_mut((available * SECTOR_SIZE) as usize);
        if !head.is_empty() {
            self.inner.read_sectors(sector, head)?;
        }
        tail.fill(0);
        Ok(())
    }
}

impl Debug for BackingFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingFile")
            .field("total_sectors", &self.total_sectors)
            .finish()
    }
}
