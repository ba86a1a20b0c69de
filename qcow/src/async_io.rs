// Copyright © 2021 Intel Corporation
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Completion driven sector I/O.
//!
//! Each request is a small state machine. It resolves one cluster span at a time through the
//! image metadata, which stays synchronous, and suspends whenever guest data has to move
//! through the [`AsyncIo`] backend. The caller feeds completions back by calling
//! [`QcowAsync::process_completions`].

use std::cmp::min;
use std::collections::{HashMap, VecDeque};
use std::io;

use log::{debug, warn};

use crate::cluster::ClusterEntry;
use crate::raw_file::RawFile;
use crate::translate::ClusterMode;
use crate::{Error, QcowFile, Result, SECTOR_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum AsyncIoError {
    /// Failed reading from file.
    #[error("Failed reading from file")]
    ReadAt(#[source] io::Error),
    /// Failed writing to file.
    #[error("Failed writing to file")]
    WriteAt(#[source] io::Error),
    /// A request with the same user data is still in flight.
    #[error("Request {0} is already in flight")]
    InFlight(u64),
    /// A completion arrived for a request not waiting on I/O.
    #[error("Unexpected completion for request {0}")]
    UnexpectedCompletion(u64),
}

pub type AsyncIoResult<T> = std::result::Result<T, AsyncIoError>;

/// Result of one backend operation. Reads hand back the filled buffer.
#[derive(Debug)]
pub struct IoCompletion {
    pub user_data: u64,
    pub result: io::Result<Vec<u8>>,
}

/// Positional I/O whose results are collected later.
pub trait AsyncIo: Send {
    /// Starts filling `buf` from `offset`.
    fn read_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()>;
    /// Starts writing `buf` at `offset`.
    fn write_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()>;
    /// Drops the operation tagged `user_data`. Returns false if there was none.
    fn cancel(&mut self, user_data: u64) -> bool;
    fn next_completed_request(&mut self) -> Option<IoCompletion>;
}

/// Backend that performs every operation on submission and queues its completion.
#[derive(Debug)]
pub struct RawFileSync {
    file: RawFile,
    completion_list: VecDeque<IoCompletion>,
}

impl RawFileSync {
    pub fn new(file: RawFile) -> Self {
        RawFileSync {
            file,
            completion_list: VecDeque::new(),
        }
    }
}

impl AsyncIo for RawFileSync {
    fn read_at(&mut self, offset: u64, mut buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
        self.file
            .pread(offset, &mut buf)
            .map_err(AsyncIoError::ReadAt)?;
        self.completion_list.push_back(IoCompletion {
            user_data,
            result: Ok(buf),
        });
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: Vec<u8>, user_data: u64) -> AsyncIoResult<()> {
        self.file
            .pwrite(offset, &buf)
            .map_err(AsyncIoError::WriteAt)?;
        self.completion_list.push_back(IoCompletion {
            user_data,
            result: Ok(Vec::new()),
        });
        Ok(())
    }

    fn cancel(&mut self, user_data: u64) -> bool {
        let before = self.completion_list.len();
        self.completion_list.retain(|c| c.user_data != user_data);
        self.completion_list.len() != before
    }

    fn next_completed_request(&mut self) -> Option<IoCompletion> {
        self.completion_list.pop_front()
    }
}

/// Where a request stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AioState {
    /// Looking up or allocating the cluster of the next span.
    ResolvingCluster,
    /// The span was filled from the backing image and is waiting to be accounted.
    AwaitingBackingRead,
    AwaitingRawRead,
    AwaitingRawWrite,
    Done,
    Failed,
}

/// Outcome of a guest request. Reads return the data, writes an empty buffer.
#[derive(Debug)]
pub struct AioCompletion {
    pub user_data: u64,
    pub result: Result<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AioOp {
    Read,
    Write,
}

#[derive(Debug)]
struct AioRequest {
    op: AioOp,
    // Next sector to transfer and the matching position in `buf`.
    sector: u64,
    pos: usize,
    // Bytes of the span being transferred.
    span: usize,
    buf: Vec<u8>,
    state: AioState,
}

impl AioRequest {
    fn finish_span(&mut self) {
        self.pos += self.span;
        self.sector += self.span as u64 / SECTOR_SIZE;
        self.span = 0;
        self.state = AioState::ResolvingCluster;
    }
}

/// Drives sector requests against a `QcowFile` over an [`AsyncIo`] backend.
///
/// Metadata updates are not serialized between requests; callers must not have two writes
/// touching the same L2 table in flight at once.
#[derive(Debug)]
pub struct QcowAsync<A: AsyncIo> {
    io: A,
    requests: HashMap<u64, AioRequest>,
    // Requests whose span completed without backend I/O.
    ready: VecDeque<u64>,
    completed: VecDeque<AioCompletion>,
}

impl<A: AsyncIo> QcowAsync<A> {
    pub fn new(io: A) -> Self {
        QcowAsync {
            io,
            requests: HashMap::new(),
            ready: VecDeque::new(),
            completed: VecDeque::new(),
        }
    }

    /// Starts reading `nb_sectors` sectors from `sector`.
    pub fn submit_read(
        &mut self,
        qcow: &mut QcowFile,
        sector: u64,
        nb_sectors: u64,
        user_data: u64,
    ) -> Result<()> {
        let buf = vec![0u8; (nb_sectors * SECTOR_SIZE) as usize];
        self.submit(qcow, AioOp::Read, sector, buf, user_data)
    }

    /// Starts writing `buf`, a whole number of sectors, at `sector`.
    pub fn submit_write(
        &mut self,
        qcow: &mut QcowFile,
        sector: u64,
        buf: Vec<u8>,
        user_data: u64,
    ) -> Result<()> {
        if buf.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::UnalignedBuffer(buf.len()));
        }
        qcow.cluster_cache.invalidate();
        self.submit(qcow, AioOp::Write, sector, buf, user_data)
    }

    fn submit(
        &mut self,
        qcow: &mut QcowFile,
        op: AioOp,
        sector: u64,
        buf: Vec<u8>,
        user_data: u64,
    ) -> Result<()> {
        if self.requests.contains_key(&user_data) {
            return Err(Error::AsyncIo(AsyncIoError::InFlight(user_data)));
        }
        qcow.check_range(sector, buf.len() as u64 / SECTOR_SIZE)?;
        qcow.check_key()?;
        let request = AioRequest {
            op,
            sector,
            pos: 0,
            span: 0,
            buf,
            state: AioState::ResolvingCluster,
        };
        self.drive(qcow, request, user_data);
        Ok(())
    }

    /// Feeds every available completion back into its request until no more progress can
    /// be made. Returns the number of events handled.
    pub fn process_completions(&mut self, qcow: &mut QcowFile) -> usize {
        let mut handled = 0;
        loop {
            if let Some(user_data) = self.ready.pop_front() {
                self.resume(qcow, user_data, None);
            } else if let Some(c) = self.io.next_completed_request() {
                self.resume(qcow, c.user_data, Some(c.result));
            } else {
                break;
            }
            handled += 1;
        }
        handled
    }

    pub fn next_completed_request(&mut self) -> Option<AioCompletion> {
        self.completed.pop_front()
    }

    /// Abandons the request tagged `user_data`. Its completion is never reported and
    /// metadata already changed on its behalf stays changed.
    pub fn cancel(&mut self, user_data: u64) -> bool {
        if self.requests.remove(&user_data).is_none() {
            return false;
        }
        self.io.cancel(user_data);
        self.ready.retain(|&ud| ud != user_data);
        debug!("Cancelled request {user_data}");
        true
    }

    /// State of the request tagged `user_data`, until its completion has been collected.
    pub fn request_state(&self, user_data: u64) -> Option<AioState> {
        if let Some(req) = self.requests.get(&user_data) {
            return Some(req.state);
        }
        self.completed
            .iter()
            .find(|c| c.user_data == user_data)
            .map(|c| match c.result {
                Ok(_) => AioState::Done,
                Err(_) => AioState::Failed,
            })
    }

    fn resume(
        &mut self,
        qcow: &mut QcowFile,
        user_data: u64,
        event: Option<io::Result<Vec<u8>>>,
    ) {
        let Some(mut req) = self.requests.remove(&user_data) else {
            // Cancelled.
            return;
        };
        if let Err(e) = Self::complete_span(qcow, &mut req, user_data, event) {
            self.fail(req, user_data, e);
            return;
        }
        self.drive(qcow, req, user_data);
    }

    // Accounts the transfer the request was suspended on.
    fn complete_span(
        qcow: &mut QcowFile,
        req: &mut AioRequest,
        user_data: u64,
        event: Option<io::Result<Vec<u8>>>,
    ) -> Result<()> {
        match (req.state, event) {
            (AioState::AwaitingBackingRead, None) => {}
            (AioState::AwaitingRawRead, Some(Ok(mut data))) => {
                if let Some(cipher) = &qcow.cipher {
                    cipher.decrypt_sectors(req.sector, &mut data);
                }
                req.buf[req.pos..req.pos + req.span].copy_from_slice(&data[..req.span]);
            }
            (AioState::AwaitingRawWrite, Some(Ok(_))) => {}
            (AioState::AwaitingRawRead, Some(Err(e))) => {
                return Err(Error::AsyncIo(AsyncIoError::ReadAt(e)));
            }
            (AioState::AwaitingRawWrite, Some(Err(e))) => {
                return Err(Error::AsyncIo(AsyncIoError::WriteAt(e)));
            }
            _ => {
                return Err(Error::AsyncIo(AsyncIoError::UnexpectedCompletion(
                    user_data,
                )))
            }
        }
        req.finish_span();
        Ok(())
    }

    fn drive(&mut self, qcow: &mut QcowFile, mut req: AioRequest, user_data: u64) {
        match self.advance(qcow, &mut req, user_data) {
            Ok(()) if req.state == AioState::Done => {
                let buf = match req.op {
                    AioOp::Read => std::mem::take(&mut req.buf),
                    AioOp::Write => Vec::new(),
                };
                self.completed.push_back(AioCompletion {
                    user_data,
                    result: Ok(buf),
                });
            }
            Ok(()) => {
                self.requests.insert(user_data, req);
            }
            Err(e) => self.fail(req, user_data, e),
        }
    }

    // The request is dropped. `request_state` reports it as failed until the completion is
    // collected.
    fn fail(&mut self, req: AioRequest, user_data: u64, e: Error) {
        warn!("Request {user_data} failed at sector {}: {e}", req.sector);
        self.completed.push_back(AioCompletion {
            user_data,
            result: Err(e),
        });
    }

    // Processes spans until one needs to wait or the request is done.
    fn advance(&mut self, qcow: &mut QcowFile, req: &mut AioRequest, user_data: u64) -> Result<()> {
        let cluster_sectors = qcow.geometry.cluster_sectors;
        loop {
            if req.pos == req.buf.len() {
                req.state = AioState::Done;
                return Ok(());
            }
            let index_in_cluster = qcow.geometry.sector_in_cluster(req.sector);
            let remaining = (req.buf.len() - req.pos) as u64 / SECTOR_SIZE;
            let n = min(cluster_sectors - index_in_cluster, remaining);
            req.span = (n * SECTOR_SIZE) as usize;
            let range = req.pos..req.pos + req.span;

            match req.op {
                AioOp::Read => {
                    let entry =
                        qcow.get_cluster_offset(req.sector * SECTOR_SIZE, ClusterMode::Lookup)?;
                    match entry {
                        ClusterEntry::Normal { offset, .. } => {
                            let host = offset + index_in_cluster * SECTOR_SIZE;
                            self.io
                                .read_at(host, vec![0u8; req.span], user_data)
                                .map_err(Error::AsyncIo)?;
                            req.state = AioState::AwaitingRawRead;
                            return Ok(());
                        }
                        ClusterEntry::Unallocated if qcow.backing_file.is_some() => {
                            qcow.read_span(entry, req.sector, &mut req.buf[range])?;
                            req.state = AioState::AwaitingBackingRead;
                            self.ready.push_back(user_data);
                            return Ok(());
                        }
                        // Zeros and compressed clusters are served from memory.
                        _ => {
                            qcow.read_span(entry, req.sector, &mut req.buf[range])?;
                            req.finish_span();
                        }
                    }
                }
                AioOp::Write => {
                    let host = qcow.writable_sector_offset(req.sector, n)?;
                    qcow.cluster_cache.invalidate();
                    let mut data = req.buf[range].to_vec();
                    if let Some(cipher) = &qcow.cipher {
                        cipher.encrypt_sectors(req.sector, &mut data);
                    }
                    self.io
                        .write_at(host, data, user_data)
                        .map_err(Error::AsyncIo)?;
                    req.state = AioState::AwaitingRawWrite;
                    return Ok(());
                }
            }
        }
    }
}
