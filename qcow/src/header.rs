// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Header parsing, validation, and creation for version 1 and version 2 images.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{self, Cursor, Write};
use std::str::{self, FromStr};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::cluster::ClusterGeometry;
use crate::raw_file::RawFile;
use crate::util::{align_up, MAX_RAM_POINTER_TABLE_SIZE};
use crate::{Error, Result};

pub const QCOW_MAGIC: u32 = 0x5146_49fb;
pub const MAX_BACKING_FILE_SIZE: u32 = 1023;

pub const V1_HEADER_SIZE: u64 = 48;
pub const V2_HEADER_SIZE: u64 = 72;

// Byte offsets of the version 2 header fields rewritten in place.
pub const L1_SIZE_OFFSET: u64 = 36;
pub const L1_TABLE_OFFSET_OFFSET: u64 = 40;
pub const REFCOUNT_TABLE_OFFSET_OFFSET: u64 = 48;
pub const REFCOUNT_TABLE_CLUSTERS_OFFSET: u64 = 56;
pub const NB_SNAPSHOTS_OFFSET: u64 = 60;
pub const SNAPSHOTS_OFFSET_OFFSET: u64 = 64;

const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 16;
// Version 1 L2 tables hold between 512 bytes and 64 KiB of entries.
const MIN_V1_L2_BITS: u32 = 6;
const MAX_V1_L2_BITS: u32 = 13;

const DEFAULT_CLUSTER_BITS: u32 = 12;
const V1_BACKED_CLUSTER_BITS: u32 = 9;
const V1_BACKED_L2_BITS: u32 = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageType {
    Raw,
    Qcow,
}

impl Display for ImageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ImageType::Raw => write!(f, "raw"),
            ImageType::Qcow => write!(f, "qcow"),
        }
    }
}

/// On-disk format revision.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ImageVersion {
    V1,
    #[default]
    V2,
}

impl ImageVersion {
    pub fn number(&self) -> u32 {
        match self {
            ImageVersion::V1 => 1,
            ImageVersion::V2 => 2,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            ImageVersion::V1 => "qcow",
            ImageVersion::V2 => "qcow2",
        }
    }

    fn header_size(&self) -> u64 {
        match self {
            ImageVersion::V1 => V1_HEADER_SIZE,
            ImageVersion::V2 => V2_HEADER_SIZE,
        }
    }
}

impl Display for ImageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.format_name())
    }
}

impl FromStr for ImageVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qcow" | "1" => Ok(ImageVersion::V1),
            "qcow2" | "2" => Ok(ImageVersion::V2),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum CryptMethod {
    #[default]
    None,
    Aes,
}

impl CryptMethod {
    fn from_raw(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CryptMethod::None),
            1 => Ok(CryptMethod::Aes),
            v => Err(Error::UnsupportedCryptMethod(v)),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            CryptMethod::None => 0,
            CryptMethod::Aes => 1,
        }
    }
}

/// Contains the information from the header of a qcow file.
///
/// Both versions are held in the same structure. Fields the version 1 layout lacks are zero;
/// `l2_bits` and `l1_size` are stored by one version and derived by the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QcowHeader {
    pub magic: u32,
    pub version: ImageVersion,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub mtime: u32,

    pub cluster_bits: u32,
    pub l2_bits: u32,
    pub size: u64,
    pub crypt_method: CryptMethod,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    pub backing_file: Option<String>,
}

impl QcowHeader {
    /// Creates a QcowHeader from a reference to a file.
    pub fn new(f: &RawFile) -> Result<QcowHeader> {
        // A version 1 header is shorter than the buffer.
        let mut buf = [0u8; V2_HEADER_SIZE as usize];
        let len = f
            .pread_zero_fill(0, &mut buf)
            .map_err(Error::ReadingHeader)? as u64;
        let mut cur = Cursor::new(&buf[..]);

        // Reads the next u32 from the header.
        fn read_u32_be(c: &mut Cursor<&[u8]>) -> Result<u32> {
            c.read_u32::<BigEndian>().map_err(Error::ReadingHeader)
        }

        // Reads the next u64 from the header.
        fn read_u64_be(c: &mut Cursor<&[u8]>) -> Result<u64> {
            c.read_u64::<BigEndian>().map_err(Error::ReadingHeader)
        }

        let magic = read_u32_be(&mut cur)?;
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let mut header = match read_u32_be(&mut cur)? {
            1 => Self::parse_v1(&mut cur, magic)?,
            2 => QcowHeader {
                magic,
                version: ImageVersion::V2,
                backing_file_offset: read_u64_be(&mut cur)?,
                backing_file_size: read_u32_be(&mut cur)?,
                mtime: 0,
                cluster_bits: read_u32_be(&mut cur)?,
                l2_bits: 0,
                size: read_u64_be(&mut cur)?,
                crypt_method: CryptMethod::from_raw(read_u32_be(&mut cur)?)?,
                l1_size: read_u32_be(&mut cur)?,
                l1_table_offset: read_u64_be(&mut cur)?,
                refcount_table_offset: read_u64_be(&mut cur)?,
                refcount_table_clusters: read_u32_be(&mut cur)?,
                nb_snapshots: read_u32_be(&mut cur)?,
                snapshots_offset: read_u64_be(&mut cur)?,
                backing_file: None,
            },
            v => return Err(Error::UnsupportedVersion(v)),
        };
        if len < header.version.header_size() {
            return Err(Error::ReadingHeader(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }

        header.validate()?;

        if header.backing_file_offset != 0 {
            let len = header.backing_file_size.min(MAX_BACKING_FILE_SIZE) as usize;
            let mut name = vec![0u8; len];
            f.pread(header.backing_file_offset, &mut name)
                .map_err(Error::ReadingHeader)?;
            let name = str::from_utf8(&name).map_err(Error::InvalidBackingFileName)?;
            header.backing_file = Some(name.to_string());
        }

        Ok(header)
    }

    fn parse_v1(cur: &mut Cursor<&[u8]>, magic: u32) -> Result<QcowHeader> {
        let backing_file_offset = cur.read_u64::<BigEndian>().map_err(Error::ReadingHeader)?;
        let backing_file_size = cur.read_u32::<BigEndian>().map_err(Error::ReadingHeader)?;
        let mtime = cur.read_u32::<BigEndian>().map_err(Error::ReadingHeader)?;
        let size = cur.read_u64::<BigEndian>().map_err(Error::ReadingHeader)?;
        let cluster_bits = cur.read_u8().map_err(Error::ReadingHeader)?;
        let l2_bits = cur.read_u8().map_err(Error::ReadingHeader)?;
        let _padding = cur.read_u16::<BigEndian>().map_err(Error::ReadingHeader)?;
        let crypt_method = cur.read_u32::<BigEndian>().map_err(Error::ReadingHeader)?;
        let l1_table_offset = cur.read_u64::<BigEndian>().map_err(Error::ReadingHeader)?;
        Ok(QcowHeader {
            magic,
            version: ImageVersion::V1,
            backing_file_offset,
            backing_file_size,
            mtime,
            cluster_bits: u32::from(cluster_bits),
            l2_bits: u32::from(l2_bits),
            size,
            crypt_method: CryptMethod::from_raw(crypt_method)?,
            l1_size: 0,
            l1_table_offset,
            refcount_table_offset: 0,
            refcount_table_clusters: 0,
            nb_snapshots: 0,
            snapshots_offset: 0,
            backing_file: None,
        })
    }

    // Range checks shared by both versions. Fills in the derived fields.
    fn validate(&mut self) -> Result<()> {
        if self.size <= 1 {
            return Err(Error::InvalidSize(self.size));
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterBits(self.cluster_bits));
        }
        match self.version {
            ImageVersion::V1 => {
                if !(MIN_V1_L2_BITS..=MAX_V1_L2_BITS).contains(&self.l2_bits) {
                    return Err(Error::InvalidL2Bits(self.l2_bits));
                }
                let l1_size = self.geometry().l1_entries_for(self.size);
                if l1_size > MAX_RAM_POINTER_TABLE_SIZE {
                    return Err(Error::TooManyL1Entries(l1_size));
                }
                self.l1_size = l1_size as u32;
            }
            ImageVersion::V2 => {
                self.l2_bits = self.cluster_bits - 3;
                let l1_vm_state_index = self.geometry().l1_entries_for(self.size);
                if u64::from(self.l1_size) < l1_vm_state_index {
                    return Err(Error::InvalidL1TableSize(self.l1_size));
                }
                if u64::from(self.l1_size) > MAX_RAM_POINTER_TABLE_SIZE {
                    return Err(Error::TooManyL1Entries(u64::from(self.l1_size)));
                }
                let refcount_entries =
                    u64::from(self.refcount_table_clusters) << (self.cluster_bits - 3);
                if refcount_entries > MAX_RAM_POINTER_TABLE_SIZE {
                    return Err(Error::TooManyRefcounts(refcount_entries));
                }
            }
        }
        Ok(())
    }

    /// Builds the header of a new image of `size` bytes.
    ///
    /// Version 1 images backed by another file use 512 byte clusters and 4096-entry L2
    /// tables, everything else uses 4 KiB clusters with cluster-sized L2 tables. The L1 table
    /// follows the header; a version 2 image places its one-cluster refcount table and first
    /// refcount block right after it.
    pub fn create_for_size_and_path(
        version: ImageVersion,
        size: u64,
        backing_file: Option<&str>,
        encrypted: bool,
    ) -> Result<QcowHeader> {
        if size <= 1 {
            return Err(Error::InvalidSize(size));
        }
        if let Some(path) = backing_file {
            if path.len() > MAX_BACKING_FILE_SIZE as usize {
                return Err(Error::BackingFileTooLong(path.len()));
            }
        }

        let backing_file_offset = backing_file.map_or(0, |_| version.header_size());
        let backing_file_size = backing_file.map_or(0, |p| p.len()) as u32;
        let header_size = align_up(version.header_size() + u64::from(backing_file_size), 8);

        let (cluster_bits, l2_bits) = match (version, backing_file) {
            (ImageVersion::V1, Some(_)) => (V1_BACKED_CLUSTER_BITS, V1_BACKED_L2_BITS),
            (ImageVersion::V1, None) => (DEFAULT_CLUSTER_BITS, DEFAULT_CLUSTER_BITS - 3),
            (ImageVersion::V2, _) => (DEFAULT_CLUSTER_BITS, DEFAULT_CLUSTER_BITS - 3),
        };
        let geometry = ClusterGeometry::new(version, cluster_bits, l2_bits);
        let l1_size = geometry.l1_entries_for(size);
        if l1_size > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(Error::TooManyL1Entries(l1_size));
        }

        let (l1_table_offset, refcount_table_offset, refcount_table_clusters) = match version {
            ImageVersion::V1 => (header_size, 0, 0),
            ImageVersion::V2 => {
                let l1_table_offset = align_up(header_size, geometry.cluster_size);
                let l1_bytes = align_up(l1_size * 8, geometry.cluster_size);
                (l1_table_offset, l1_table_offset + l1_bytes, 1)
            }
        };

        Ok(QcowHeader {
            magic: QCOW_MAGIC,
            version,
            backing_file_offset,
            backing_file_size,
            mtime: 0,
            cluster_bits,
            l2_bits,
            size,
            crypt_method: if encrypted {
                CryptMethod::Aes
            } else {
                CryptMethod::None
            },
            l1_size: l1_size as u32,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots: 0,
            snapshots_offset: 0,
            backing_file: backing_file.map(String::from),
        })
    }

    pub fn geometry(&self) -> ClusterGeometry {
        ClusterGeometry::new(self.version, self.cluster_bits, self.l2_bits)
    }

    /// Bytes taken by the fixed header plus the backing file name, rounded up to 8.
    pub fn header_size(&self) -> u64 {
        align_up(
            self.version.header_size() + u64::from(self.backing_file_size),
            8,
        )
    }

    /// Serializes the fixed header fields.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(V2_HEADER_SIZE as usize);

        // Appends the next u32 to the header.
        fn write_u32_be(b: &mut Vec<u8>, value: u32) -> Result<()> {
            b.write_u32::<BigEndian>(value)
                .map_err(Error::WritingHeader)
        }

        // Appends the next u64 to the header.
        fn write_u64_be(b: &mut Vec<u8>, value: u64) -> Result<()> {
            b.write_u64::<BigEndian>(value)
                .map_err(Error::WritingHeader)
        }

        write_u32_be(&mut buf, self.magic)?;
        write_u32_be(&mut buf, self.version.number())?;
        write_u64_be(&mut buf, self.backing_file_offset)?;
        write_u32_be(&mut buf, self.backing_file_size)?;
        match self.version {
            ImageVersion::V1 => {
                write_u32_be(&mut buf, self.mtime)?;
                write_u64_be(&mut buf, self.size)?;
                buf.write_all(&[self.cluster_bits as u8, self.l2_bits as u8, 0, 0])
                    .map_err(Error::WritingHeader)?;
                write_u32_be(&mut buf, self.crypt_method.to_raw())?;
                write_u64_be(&mut buf, self.l1_table_offset)?;
            }
            ImageVersion::V2 => {
                write_u32_be(&mut buf, self.cluster_bits)?;
                write_u64_be(&mut buf, self.size)?;
                write_u32_be(&mut buf, self.crypt_method.to_raw())?;
                write_u32_be(&mut buf, self.l1_size)?;
                write_u64_be(&mut buf, self.l1_table_offset)?;
                write_u64_be(&mut buf, self.refcount_table_offset)?;
                write_u32_be(&mut buf, self.refcount_table_clusters)?;
                write_u32_be(&mut buf, self.nb_snapshots)?;
                write_u64_be(&mut buf, self.snapshots_offset)?;
            }
        }
        Ok(buf)
    }

    /// Write the header and the backing file name to `file`.
    pub fn write_to(&self, file: &RawFile) -> Result<()> {
        file.pwrite(0, &self.to_bytes()?)
            .map_err(Error::WritingHeader)?;
        if let Some(path) = &self.backing_file {
            file.pwrite(self.backing_file_offset, path.as_bytes())
                .map_err(Error::WritingHeader)?;
        }
        Ok(())
    }
}

/// Detect the type of an image file by checking for the qcow magic.
pub fn detect_image_type(file: &RawFile) -> Result<ImageType> {
    let mut magic = [0u8; 4];
    file.pread_zero_fill(0, &mut magic)
        .map_err(Error::ReadingHeader)?;
    let image_type = if u32::from_be_bytes(magic) == QCOW_MAGIC {
        ImageType::Qcow
    } else {
        ImageType::Raw
    };
    Ok(image_type)
}
