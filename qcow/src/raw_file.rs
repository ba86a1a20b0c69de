// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::file_traits::{FileSetLen, FileSync};

/// Positional access to the host file holding an image.
///
/// Every access names its own offset, so the same handle can serve metadata and data I/O
/// without tracking a cursor.
#[derive(Debug)]
pub struct RawFile {
    file: File,
}

impl RawFile {
    pub fn new(file: File) -> Self {
        RawFile { file }
    }

    /// Fills `buf` with the bytes at `offset`. Fails with `UnexpectedEof` if the file ends
    /// first.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Fills `buf` with the bytes at `offset`, zeroing the part lying past the end of the
    /// file. Returns the number of bytes taken from the file.
    pub fn pread_zero_fill(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    buf[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Writes all of `buf` at `offset`, extending the file if needed.
    pub fn pwrite(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// Returns the current length of the file in bytes.
    pub fn len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn metadata(&self) -> io::Result<Metadata> {
        self.file.metadata()
    }

    pub fn try_clone(&self) -> io::Result<RawFile> {
        Ok(RawFile {
            file: self.file.try_clone()?,
        })
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl FileSync for RawFile {
    fn fsync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl FileSetLen for RawFile {
    fn set_len(&self, len: u64) -> io::Result<()> {
        self.truncate(len)
    }
}

impl AsRawFd for RawFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn short_read_fails() {
        let file = RawFile::new(TempFile::new().unwrap().into_file());
        file.pwrite(0, &[0xab; 100]).unwrap();

        let mut buf = [0xffu8; 200];
        let err = file.pread(50, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        file.pread(50, &mut buf[..50]).unwrap();
        assert!(buf[..50].iter().all(|&b| b == 0xab));
    }

    #[test]
    fn zero_fill_read_past_end() {
        let file = RawFile::new(TempFile::new().unwrap().into_file());
        file.pwrite(0, &[0xab; 100]).unwrap();

        let mut buf = [0xffu8; 200];
        assert_eq!(file.pread_zero_fill(50, &mut buf).unwrap(), 50);
        assert!(buf[..50].iter().all(|&b| b == 0xab));
        assert!(buf[50..].iter().all(|&b| b == 0));
        assert_eq!(file.pread_zero_fill(1000, &mut buf).unwrap(), 0);
        assert_eq!(file.len().unwrap(), 100);
    }

    #[test]
    fn truncate_extends_with_zeros() {
        let mut file = RawFile::new(TempFile::new().unwrap().into_file());
        assert!(file.is_empty().unwrap());
        FileSetLen::set_len(&file, 4096).unwrap();
        file.fsync().unwrap();
        assert_eq!(file.len().unwrap(), 4096);

        let mut buf = [1u8; 16];
        file.pread(4000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
