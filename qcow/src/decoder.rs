// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{self, Debug, Formatter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Decompressed cluster is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Zlib compress error")]
    ZlibCompress(#[source] flate2::CompressError),
    #[error("Zlib decompress error")]
    ZlibDecompress(#[source] flate2::DecompressError),
    #[error("Zlib unexpected status: {0:?}")]
    ZlibUnexpectedStatus(flate2::Status),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generic trait for decoding compressed clusters
pub trait Decoder {
    fn decode(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Generic trait for compressing a cluster. `None` means the data did not shrink.
pub trait Encoder {
    fn encode(&self, input: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Raw deflate streams, no zlib header.
#[derive(Debug, Default)]
pub struct ZlibDecoder {}

impl Decoder for ZlibDecoder {
    fn decode(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        use flate2::{Decompress, FlushDecompress, Status};

        let mut decompressor = Decompress::new(false);
        let status = decompressor
            .decompress(input, output, FlushDecompress::Finish)
            .map_err(Error::ZlibDecompress)?;
        let total_out = decompressor.total_out() as usize;
        match status {
            Status::StreamEnd => Ok(total_out),
            // Output buffer filled up before the end marker.
            Status::Ok | Status::BufError if total_out == output.len() => Ok(total_out),
            _ => Err(Error::ZlibUnexpectedStatus(status)),
        }
    }
}

#[derive(Debug, Default)]
pub struct ZlibEncoder {}

impl Encoder for ZlibEncoder {
    fn encode(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        use flate2::{Compress, Compression, FlushCompress, Status};

        let mut compressor = Compress::new(Compression::best(), false);
        let mut output = vec![0u8; input.len()];
        let status = compressor
            .compress(input, &mut output, FlushCompress::Finish)
            .map_err(Error::ZlibCompress)?;
        let total_out = compressor.total_out() as usize;
        if status != Status::StreamEnd || total_out >= input.len() {
            return Ok(None);
        }
        output.truncate(total_out);
        Ok(Some(output))
    }
}

const NO_CLUSTER: u64 = u64::MAX;

/// The most recently decompressed cluster, tagged with the file offset of its compressed
/// payload.
pub struct ClusterCache {
    data: Vec<u8>,
    offset: u64,
}

impl ClusterCache {
    pub fn new(cluster_size: usize) -> Self {
        ClusterCache {
            data: vec![0; cluster_size],
            offset: NO_CLUSTER,
        }
    }

    /// Returns the payload offset the cache currently holds.
    pub fn cached_offset(&self) -> Option<u64> {
        (self.offset != NO_CLUSTER).then_some(self.offset)
    }

    pub fn invalidate(&mut self) {
        self.offset = NO_CLUSTER;
    }

    /// Decompresses `input`, the payload stored at `offset`. The whole cluster must be
    /// produced.
    pub fn load(&mut self, offset: u64, input: &[u8], decoder: &dyn Decoder) -> Result<()> {
        self.offset = NO_CLUSTER;
        let actual = decoder.decode(input, &mut self.data)?;
        if actual != self.data.len() {
            return Err(Error::SizeMismatch {
                expected: self.data.len(),
                actual,
            });
        }
        self.offset = offset;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Debug for ClusterCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCache")
            .field("offset", &self.cached_offset())
            .finish()
    }
}
