// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Reader and writer for the qcow (version 1) and qcow2 (version 2) copy-on-write disk image
//! formats.
//!
//! An image maps guest sectors to host file clusters through a two level table. Clusters may
//! be shared with snapshots (version 2), compressed, encrypted with AES-128-CBC, or left
//! unallocated so reads fall through to a backing image.

pub mod async_io;
mod backing;
mod check;
mod cluster;
mod crypt;
mod decoder;
mod header;
mod qcow_raw_file;
mod raw_file;
mod refcount;
mod snapshot;
mod sync_io;
mod translate;
mod util;
mod vec_cache;

use std::cmp::min;
use std::collections::TryReserveError;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str;

use libc::EINVAL;
use log::{debug, info};
use remain::sorted;
use serde::Serialize;
use thiserror::Error;
use vmm_sys_util::file_traits::FileSync;

pub use crate::async_io::{AioState, AsyncIo, AsyncIoError, QcowAsync, RawFileSync};
pub use crate::backing::{BackingFile, BackingFileOps};
pub use crate::check::{CheckResult, RefcountMismatch};
pub use crate::cluster::{ClusterEntry, ClusterGeometry, EntryFlags};
pub use crate::crypt::SectorCipher;
pub use crate::header::{
    detect_image_type, CryptMethod, ImageType, ImageVersion, QcowHeader, QCOW_MAGIC,
};
pub use crate::raw_file::RawFile;
pub use crate::snapshot::{SnapshotInfo, SnapshotRequest};
pub use crate::translate::ClusterMode;

use crate::decoder::{ClusterCache, ZlibDecoder, ZlibEncoder};
use crate::qcow_raw_file::QcowRawFile;
use crate::refcount::RefCount;
use crate::snapshot::QcowSnapshot;
use crate::util::{alloc_table, offset_is_cluster_boundary, MAX_NESTING_DEPTH};
use crate::vec_cache::{SlotCache, VecCache, L2_CACHE_SIZE};

/// Guest I/O is addressed in 512 byte sectors.
pub const SECTOR_SIZE: u64 = 512;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Async I/O error")]
    AsyncIo(#[source] AsyncIoError),
    #[error("Backing file io error")]
    BackingFileIo(#[source] io::Error),
    #[error("Backing file open error")]
    BackingFileOpen(#[source] Box<Error>),
    #[error("Backing file name is too long: {0} bytes")]
    BackingFileTooLong(usize),
    #[error("Compressed write must cover exactly one cluster, got {0} sectors")]
    CompressedSpan(u64),
    #[error("Compressed write at sector {0} does not start a cluster")]
    CompressedUnaligned(u64),
    #[error("Failed to compress cluster")]
    Compressing(#[source] decoder::Error),
    #[error("Failed to decompress cluster")]
    Decompressing(#[source] decoder::Error),
    #[error("Failed to get file size")]
    GettingFileSize(#[source] io::Error),
    #[error("Failed to parse filename")]
    InvalidBackingFileName(#[source] str::Utf8Error),
    #[error("Invalid cluster bits: {0}")]
    InvalidClusterBits(u32),
    #[error("Invalid L1 table size: {0}")]
    InvalidL1TableSize(u32),
    #[error("Invalid L2 bits: {0}")]
    InvalidL2Bits(u32),
    #[error("Invalid magic")]
    InvalidMagic,
    #[error("Invalid offset: {0:#x}")]
    InvalidOffset(u64),
    #[error("Sectors {sector}..+{count} are outside the image")]
    InvalidSectorRange { sector: u64, count: u64 },
    #[error("Invalid image size: {0}")]
    InvalidSize(u64),
    #[error("Maximum disk nesting depth exceeded")]
    MaxNestingDepthExceeded,
    #[error("Image is encrypted and no key has been set")]
    NeedsKey,
    #[error("Failed to open file")]
    OpeningFile(#[source] io::Error),
    #[error("Out of memory")]
    OutOfMemory(#[source] TryReserveError),
    #[error("Failed to read data")]
    ReadingData(#[source] io::Error),
    #[error("Failed to read header")]
    ReadingHeader(#[source] io::Error),
    #[error("Failed to read pointers")]
    ReadingPointers(#[source] io::Error),
    #[error("Failed to read snapshot table")]
    ReadingSnapshots(#[source] io::Error),
    #[error("Refcount error")]
    Refcount(#[source] refcount::Error),
    #[error("Failed to set file size")]
    SettingFileSize(#[source] io::Error),
    #[error("Snapshot {0} already exists")]
    SnapshotExists(String),
    #[error("Snapshot id or name is too long: {0} bytes")]
    SnapshotNameTooLong(usize),
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),
    #[error("Failed to sync file")]
    SyncingFile(#[source] io::Error),
    #[error("L1 entry table too large: {0}")]
    TooManyL1Entries(u64),
    #[error("Ref count table too large: {0}")]
    TooManyRefcounts(u64),
    #[error("Buffer of {0} bytes is not a whole number of sectors")]
    UnalignedBuffer(usize),
    #[error("Operation not supported by this image: {0}")]
    Unsupported(&'static str),
    #[error("Unsupported crypt method: {0}")]
    UnsupportedCryptMethod(u32),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Failed to write data")]
    WritingData(#[source] io::Error),
    #[error("Failed to write header")]
    WritingHeader(#[source] io::Error),
    #[error("Failed to write pointers")]
    WritingPointers(#[source] io::Error),
    #[error("Failed to write snapshot table")]
    WritingSnapshots(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The header or a table is malformed or unsupported.
    Format,
    /// On-disk data contradicts itself.
    Corrupt,
    /// The image is encrypted and no key was set.
    NeedsKey,
    /// A count or span is outside its allowed range.
    OutOfRange,
    /// The caller passed a malformed request.
    InvalidArgument,
    Io,
    OutOfMemory,
    /// The request does not make sense for the image in its current state.
    InvalidState,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BackingFileOpen(e) => e.kind(),
            Error::Refcount(e) => e.kind(),
            Error::BackingFileTooLong(_)
            | Error::InvalidBackingFileName(_)
            | Error::InvalidClusterBits(_)
            | Error::InvalidL1TableSize(_)
            | Error::InvalidL2Bits(_)
            | Error::InvalidMagic
            | Error::InvalidSize(_)
            | Error::MaxNestingDepthExceeded
            | Error::TooManyL1Entries(_)
            | Error::TooManyRefcounts(_)
            | Error::UnsupportedCryptMethod(_)
            | Error::UnsupportedFormat(_)
            | Error::UnsupportedVersion(_) => ErrorKind::Format,
            Error::Decompressing(_) | Error::InvalidOffset(_) => ErrorKind::Corrupt,
            Error::NeedsKey => ErrorKind::NeedsKey,
            Error::CompressedSpan(_) | Error::InvalidSectorRange { .. } => ErrorKind::OutOfRange,
            Error::CompressedUnaligned(_)
            | Error::SnapshotExists(_)
            | Error::SnapshotNameTooLong(_)
            | Error::SnapshotNotFound(_)
            | Error::UnalignedBuffer(_) => ErrorKind::InvalidArgument,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Compressing(_) | Error::Unsupported(_) => ErrorKind::InvalidState,
            Error::AsyncIo(_)
            | Error::BackingFileIo(_)
            | Error::GettingFileSize(_)
            | Error::OpeningFile(_)
            | Error::ReadingData(_)
            | Error::ReadingHeader(_)
            | Error::ReadingPointers(_)
            | Error::ReadingSnapshots(_)
            | Error::SettingFileSize(_)
            | Error::SyncingFile(_)
            | Error::WritingData(_)
            | Error::WritingHeader(_)
            | Error::WritingPointers(_)
            | Error::WritingSnapshots(_) => ErrorKind::Io,
        }
    }
}

/// Parameters of a new image.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub version: ImageVersion,
    /// Virtual disk size in bytes.
    pub size: u64,
    pub backing_file: Option<String>,
    pub encrypted: bool,
}

/// Driver level facts about an open image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub cluster_size: u64,
    /// Guest offset where saved VM state would start. Version 1 images have none.
    pub vm_state_offset: Option<u64>,
}

/// Summary of an image, as printed by `qcow-img info`.
#[derive(Clone, Debug, Serialize)]
pub struct ImageInfo {
    pub format: &'static str,
    pub virtual_size: u64,
    pub actual_size: u64,
    pub cluster_size: u64,
    pub encrypted: bool,
    pub backing_file: Option<String>,
    pub snapshots: Vec<SnapshotInfo>,
}

/// Represents a qcow or qcow2 file. This is a sparse file format maintained by the qemu
/// project.
///
/// # Example
///
/// ```
/// # use qcow::{QcowFile, RawFile};
/// # use std::io::{Read, Seek, SeekFrom};
/// # fn test(file: std::fs::File) -> std::io::Result<()> {
///     let raw_img = RawFile::new(file);
///     let mut q = QcowFile::from(raw_img).expect("Can't open qcow file");
///     let mut buf = [0u8; 12];
///     q.seek(SeekFrom::Start(10 as u64))?;
///     q.read(&mut buf[..])?;
/// #   Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct QcowFile {
    raw_file: QcowRawFile,
    header: QcowHeader,
    geometry: ClusterGeometry,
    total_sectors: u64,
    l1_table: VecCache<u64>,
    l1_vm_state_index: u64,
    l2_cache: SlotCache<u64>,
    // Version 2 only.
    refcounts: Option<RefCount>,
    cluster_cache: ClusterCache,
    decoder: ZlibDecoder,
    encoder: ZlibEncoder,
    // Set once a key is supplied for an encrypted image.
    cipher: Option<SectorCipher>,
    backing_file: Option<BackingFile>,
    snapshots: Vec<QcowSnapshot>,
    snapshots_size: u64,
    current_offset: u64,
}

impl QcowFile {
    /// Creates a QcowFile from `file`. File must be a valid qcow or qcow2 image.
    ///
    /// Relative backing file names are resolved against the working directory. The max
    /// nesting depth of backing images is set to the default of 10.
    pub fn from(file: RawFile) -> Result<QcowFile> {
        Self::from_with_nesting_depth(file, MAX_NESTING_DEPTH)
    }

    /// Creates a QcowFile from `file` and with a max nesting depth.
    pub fn from_with_nesting_depth(file: RawFile, max_nesting_depth: u32) -> Result<QcowFile> {
        Self::open_raw(file, None, max_nesting_depth)
    }

    /// Opens the image at `path`. Relative backing file names are resolved against the
    /// directory holding the image.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<QcowFile> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(Error::OpeningFile)?;
        Self::open_raw(RawFile::new(file), path.parent(), MAX_NESTING_DEPTH)
    }

    fn open_raw(
        file: RawFile,
        base_dir: Option<&Path>,
        max_nesting_depth: u32,
    ) -> Result<QcowFile> {
        let header = QcowHeader::new(&file)?;
        let geometry = header.geometry();
        let raw_file = QcowRawFile::from(file, geometry.cluster_size)
            .ok_or(Error::InvalidClusterBits(header.cluster_bits))?;

        if header.version == ImageVersion::V2 {
            offset_is_cluster_boundary(header.l1_table_offset, header.cluster_bits)?;
            offset_is_cluster_boundary(header.refcount_table_offset, header.cluster_bits)?;
        }

        let backing_file = header
            .backing_file
            .as_deref()
            .map(|name| BackingFile::new(&resolve_backing_path(base_dir, name), max_nesting_depth))
            .transpose()?;

        let mut l1_table = alloc_table(u64::from(header.l1_size))?;
        raw_file
            .read_pointer_table_into(header.l1_table_offset, &mut l1_table)
            .map_err(Error::ReadingPointers)?;

        let (refcounts, snapshots, snapshots_size) = match header.version {
            ImageVersion::V1 => (None, Vec::new(), 0),
            ImageVersion::V2 => {
                let refcounts = RefCount::new(
                    &raw_file,
                    header.refcount_table_offset,
                    header.refcount_table_clusters,
                    header.cluster_bits,
                )
                .map_err(Error::Refcount)?;
                let (snapshots, size) = snapshot::read_snapshots(
                    &raw_file,
                    header.snapshots_offset,
                    header.nb_snapshots,
                )?;
                (Some(refcounts), snapshots, size)
            }
        };

        debug!(
            "Opened {} image: {} bytes, {} byte clusters, {} L1 entries",
            header.version,
            header.size,
            geometry.cluster_size,
            l1_table.len()
        );

        Ok(QcowFile {
            total_sectors: header.size / SECTOR_SIZE,
            l1_vm_state_index: geometry.l1_entries_for(header.size),
            l1_table: VecCache::from_vec(l1_table),
            l2_cache: SlotCache::new(L2_CACHE_SIZE, geometry.l2_size as usize),
            refcounts,
            cluster_cache: ClusterCache::new(geometry.cluster_size as usize),
            decoder: ZlibDecoder::default(),
            encoder: ZlibEncoder::default(),
            cipher: None,
            backing_file,
            snapshots,
            snapshots_size,
            current_offset: 0,
            raw_file,
            header,
            geometry,
        })
    }

    /// Writes a new, empty image into `file` and opens it.
    pub fn create(file: RawFile, options: &CreateOptions) -> Result<QcowFile> {
        Self::create_in(file, options, None)
    }

    /// Creates (or truncates) the file at `path` and writes a new, empty image into it.
    pub fn create_at<P: AsRef<Path>>(path: P, options: &CreateOptions) -> Result<QcowFile> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::OpeningFile)?;
        Self::create_in(RawFile::new(file), options, path.parent())
    }

    fn create_in(file: RawFile, options: &CreateOptions, base_dir: Option<&Path>) -> Result<QcowFile> {
        let header = QcowHeader::create_for_size_and_path(
            options.version,
            options.size,
            options.backing_file.as_deref(),
            options.encrypted,
        )?;
        file.truncate(0).map_err(Error::SettingFileSize)?;
        header.write_to(&file)?;

        let l1_end = header.l1_table_offset + u64::from(header.l1_size) * 8;
        match header.version {
            ImageVersion::V1 => {
                // Extending the file zeroes the L1 table.
                file.truncate(l1_end).map_err(Error::SettingFileSize)?;
            }
            ImageVersion::V2 => {
                let cluster_size = header.geometry().cluster_size;
                let block_offset = header.refcount_table_offset + cluster_size;
                let end = block_offset + cluster_size;
                file.truncate(end).map_err(Error::SettingFileSize)?;
                file.pwrite(header.refcount_table_offset, &block_offset.to_be_bytes())
                    .map_err(Error::WritingHeader)?;

                // Header, L1 table, refcount table and the block itself are all in use.
                let used = end >> header.cluster_bits;
                if used > cluster_size / 2 {
                    return Err(Error::InvalidSize(header.size));
                }
                let block: Vec<u8> = (0..cluster_size / 2)
                    .flat_map(|i| u16::from(i < used).to_be_bytes())
                    .collect();
                file.pwrite(block_offset, &block)
                    .map_err(Error::WritingHeader)?;
            }
        }
        info!(
            "Created {} image of {} bytes{}",
            header.version,
            header.size,
            header
                .backing_file
                .as_deref()
                .map(|b| format!(" backed by {b}"))
                .unwrap_or_default()
        );

        Self::open_raw(file, base_dir, MAX_NESTING_DEPTH)
    }

    /// Replaces the backing image. Reads of unallocated clusters are served from it.
    pub fn set_backing_file(&mut self, backing: Option<BackingFile>) {
        self.backing_file = backing;
    }

    /// Supplies the passphrase of an encrypted image. Does nothing for unencrypted images.
    pub fn set_key(&mut self, passphrase: &[u8]) {
        if self.header.crypt_method == CryptMethod::Aes {
            self.cipher = Some(SectorCipher::new(passphrase));
            // Cached plaintext may have been produced with another key.
            self.cluster_cache.invalidate();
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.crypt_method == CryptMethod::Aes
    }

    /// Returns the `QcowHeader` for this file.
    pub fn header(&self) -> &QcowHeader {
        &self.header
    }

    pub fn geometry(&self) -> &ClusterGeometry {
        &self.geometry
    }

    /// Returns the L1 lookup table for this file. This is only useful for debugging.
    pub fn l1_table(&self) -> &[u64] {
        self.l1_table.get_values()
    }

    /// Returns the refcount table for this file. This is only useful for debugging.
    pub fn ref_table(&self) -> &[u64] {
        self.refcounts.as_ref().map_or(&[], |r| r.table())
    }

    /// Returns the reference count of the cluster with index `cluster_index`.
    pub fn refcount(&mut self, cluster_index: u64) -> Result<u16> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("refcounts"))?;
        refcounts
            .get_refcount(&self.raw_file, cluster_index)
            .map_err(Error::Refcount)
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.size
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn cluster_size(&self) -> u64 {
        self.geometry.cluster_size
    }

    pub fn get_info(&self) -> DriverInfo {
        DriverInfo {
            cluster_size: self.geometry.cluster_size,
            vm_state_offset: match self.header.version {
                ImageVersion::V1 => None,
                ImageVersion::V2 => Some(
                    self.l1_vm_state_index << (self.geometry.cluster_bits + self.geometry.l2_bits),
                ),
            },
        }
    }

    pub fn image_info(&self) -> Result<ImageInfo> {
        Ok(ImageInfo {
            format: self.header.version.format_name(),
            virtual_size: self.header.size,
            actual_size: self
                .raw_file
                .physical_size()
                .map_err(Error::GettingFileSize)?,
            cluster_size: self.geometry.cluster_size,
            encrypted: self.is_encrypted(),
            backing_file: self.header.backing_file.clone(),
            snapshots: self.snapshot_list(),
        })
    }

    /// Flushes the image file to stable storage. Metadata is always written through, so
    /// this only has to sync the host file.
    pub fn flush(&self) -> Result<()> {
        self.raw_file
            .file()
            .sync_all()
            .map_err(Error::SyncingFile)
    }

    // Limits the range so that it doesn't exceed the virtual size of the file.
    fn limit_range_file(&self, address: u64, count: usize) -> usize {
        if address.checked_add(count as u64).is_none() || address > self.virtual_size() {
            return 0;
        }
        min(count as u64, self.virtual_size() - address) as usize
    }
}

fn resolve_backing_path(base_dir: Option<&Path>, name: &str) -> PathBuf {
    let path = Path::new(name);
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

impl AsRawFd for QcowFile {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_file.file().as_raw_fd()
    }
}

// The byte stream interface works on whole sectors underneath. Partial sectors at either end
// are read, patched and written back.
impl Read for QcowFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let address = self.current_offset;
        let read_count = self.limit_range_file(address, buf.len());
        if read_count == 0 {
            return Ok(0);
        }

        let start = address & !(SECTOR_SIZE - 1);
        let end = (address + read_count as u64).next_multiple_of(SECTOR_SIZE);
        let mut sectors = vec![0u8; (end - start) as usize];
        self.read_sectors(start / SECTOR_SIZE, &mut sectors)
            .map_err(io::Error::other)?;
        let skip = (address - start) as usize;
        buf[..read_count].copy_from_slice(&sectors[skip..skip + read_count]);

        self.current_offset += read_count as u64;
        Ok(read_count)
    }
}

impl Seek for QcowFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset: Option<u64> = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.virtual_size().checked_sub(increment as u64))
                } else {
                    self.virtual_size().checked_add(off as u64)
                }
            }
            SeekFrom::Current(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.current_offset.checked_sub(increment as u64))
                } else {
                    self.current_offset.checked_add(off as u64)
                }
            }
        };

        match new_offset {
            Some(o) if o <= self.virtual_size() => {
                self.current_offset = o;
                Ok(o)
            }
            _ => Err(io::Error::from_raw_os_error(EINVAL)),
        }
    }
}

impl Write for QcowFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let address = self.current_offset;
        let write_count = self.limit_range_file(address, buf.len());
        if write_count == 0 {
            return Ok(0);
        }

        let start = address & !(SECTOR_SIZE - 1);
        let end = (address + write_count as u64).next_multiple_of(SECTOR_SIZE);
        let skip = (address - start) as usize;
        if skip == 0 && write_count as u64 == end - start {
            self.write_sectors(start / SECTOR_SIZE, &buf[..write_count])
                .map_err(io::Error::other)?;
        } else {
            let mut sectors = vec![0u8; (end - start) as usize];
            self.read_sectors(start / SECTOR_SIZE, &mut sectors)
                .map_err(io::Error::other)?;
            sectors[skip..skip + write_count].copy_from_slice(&buf[..write_count]);
            self.write_sectors(start / SECTOR_SIZE, &sectors)
                .map_err(io::Error::other)?;
        }

        self.current_offset += write_count as u64;
        Ok(write_count)
    }

    fn flush(&mut self) -> io::Result<()> {
        QcowFile::flush(self).map_err(io::Error::other)
    }
}

impl FileSync for QcowFile {
    fn fsync(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}
