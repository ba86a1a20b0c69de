// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Internal snapshots of version 2 images.
//!
//! A snapshot is a frozen copy of the L1 table. Taking one adds a reference to every cluster
//! reachable from the live table, so later writes copy instead of overwriting in place.

use byteorder::{BigEndian, ByteOrder};
use log::info;
use serde::Serialize;

use crate::cluster::{ClusterEntry, EntryFlags};
use crate::header::{ImageVersion, NB_SNAPSHOTS_OFFSET, SNAPSHOTS_OFFSET_OFFSET};
use crate::qcow_raw_file::QcowRawFile;
use crate::util::{align_up, alloc_table};
use crate::{Error, QcowFile, Result};

// l1_table_offset, l1_size, id_str_size, name_size, date_sec, date_nsec, vm_clock_nsec,
// vm_state_size, extra_data_size.
const SNAPSHOT_HEADER_SIZE: u64 = 40;

/// One record of the on-disk snapshot table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct QcowSnapshot {
    pub l1_table_offset: u64,
    pub l1_size: u32,
    pub id: String,
    pub name: String,
    pub vm_state_size: u32,
    pub date_sec: u32,
    pub date_nsec: u32,
    pub vm_clock_nsec: u64,
}

impl QcowSnapshot {
    fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            vm_state_size: self.vm_state_size,
            date_sec: self.date_sec,
            date_nsec: self.date_nsec,
            vm_clock_nsec: self.vm_clock_nsec,
        }
    }
}

/// Parameters of a new snapshot. An empty or missing `id` is replaced by the next free
/// numeric id.
#[derive(Clone, Debug, Default)]
pub struct SnapshotRequest {
    pub id: Option<String>,
    pub name: String,
    pub date_sec: u32,
    pub date_nsec: u32,
    pub vm_clock_nsec: u64,
    pub vm_state_size: u32,
}

/// A snapshot as reported by `snapshot_list`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub vm_state_size: u32,
    pub date_sec: u32,
    pub date_nsec: u32,
    pub vm_clock_nsec: u64,
}

/// Reads `count` snapshot records starting at `offset`. Returns them with the number of bytes
/// the table spans.
pub(crate) fn read_snapshots(
    raw_file: &QcowRawFile,
    offset: u64,
    count: u32,
) -> Result<(Vec<QcowSnapshot>, u64)> {
    let mut snapshots = Vec::new();
    snapshots
        .try_reserve_exact(count as usize)
        .map_err(Error::OutOfMemory)?;

    let mut pos = offset;
    for _ in 0..count {
        pos = align_up(pos, 8);
        let mut h = [0u8; SNAPSHOT_HEADER_SIZE as usize];
        raw_file
            .read_at(pos, &mut h)
            .map_err(Error::ReadingSnapshots)?;
        pos += SNAPSHOT_HEADER_SIZE;

        let id_size = BigEndian::read_u16(&h[12..14]) as usize;
        let name_size = BigEndian::read_u16(&h[14..16]) as usize;
        let extra_data_size = BigEndian::read_u32(&h[36..40]);
        pos += u64::from(extra_data_size);

        let mut strings = vec![0u8; id_size + name_size];
        raw_file
            .read_at(pos, &mut strings)
            .map_err(Error::ReadingSnapshots)?;
        pos += strings.len() as u64;

        snapshots.push(QcowSnapshot {
            l1_table_offset: BigEndian::read_u64(&h[0..8]),
            l1_size: BigEndian::read_u32(&h[8..12]),
            id: String::from_utf8_lossy(&strings[..id_size]).into_owned(),
            name: String::from_utf8_lossy(&strings[id_size..]).into_owned(),
            date_sec: BigEndian::read_u32(&h[16..20]),
            date_nsec: BigEndian::read_u32(&h[20..24]),
            vm_clock_nsec: BigEndian::read_u64(&h[24..32]),
            vm_state_size: BigEndian::read_u32(&h[32..36]),
        });
    }
    Ok((snapshots, pos - offset))
}

fn encode_snapshots(snapshots: &[QcowSnapshot]) -> Vec<u8> {
    let mut buf = Vec::new();
    for sn in snapshots {
        buf.resize(align_up(buf.len() as u64, 8) as usize, 0);
        let mut h = [0u8; SNAPSHOT_HEADER_SIZE as usize];
        BigEndian::write_u64(&mut h[0..8], sn.l1_table_offset);
        BigEndian::write_u32(&mut h[8..12], sn.l1_size);
        BigEndian::write_u16(&mut h[12..14], sn.id.len() as u16);
        BigEndian::write_u16(&mut h[14..16], sn.name.len() as u16);
        BigEndian::write_u32(&mut h[16..20], sn.date_sec);
        BigEndian::write_u32(&mut h[20..24], sn.date_nsec);
        BigEndian::write_u64(&mut h[24..32], sn.vm_clock_nsec);
        BigEndian::write_u32(&mut h[32..36], sn.vm_state_size);
        buf.extend_from_slice(&h);
        buf.extend_from_slice(sn.id.as_bytes());
        buf.extend_from_slice(sn.name.as_bytes());
    }
    buf
}

impl QcowFile {
    /// Takes a snapshot of the live image and returns its id.
    pub fn snapshot_create(&mut self, request: &SnapshotRequest) -> Result<String> {
        self.check_snapshots_supported()?;

        let id = match request.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.next_snapshot_id(),
        };
        if self.snapshots.iter().any(|sn| sn.id == id) {
            return Err(Error::SnapshotExists(id));
        }
        for s in [&id, &request.name] {
            if s.len() > usize::from(u16::MAX) {
                return Err(Error::SnapshotNameTooLong(s.len()));
            }
        }

        let l1_table_offset = self.header.l1_table_offset;
        let l1_size = self.header.l1_size;
        self.update_snapshot_refcount(l1_table_offset, l1_size, 1)?;

        let l1_bytes = u64::from(l1_size) * 8;
        let snapshot_l1_offset = self.alloc_clusters(l1_bytes)?;
        self.raw_file
            .write_pointer_table(snapshot_l1_offset, self.l1_table.get_values())
            .map_err(Error::WritingPointers)?;

        self.snapshots.push(QcowSnapshot {
            l1_table_offset: snapshot_l1_offset,
            l1_size,
            id: id.clone(),
            name: request.name.clone(),
            vm_state_size: request.vm_state_size,
            date_sec: request.date_sec,
            date_nsec: request.date_nsec,
            vm_clock_nsec: request.vm_clock_nsec,
        });
        self.write_snapshots()?;
        info!("Created snapshot {id} ({})", request.name);
        Ok(id)
    }

    /// Makes the snapshot named by `id_or_name` the live image. Changes made since it was
    /// taken are discarded.
    pub fn snapshot_goto(&mut self, id_or_name: &str) -> Result<()> {
        self.check_snapshots_supported()?;
        let index = self.find_snapshot(id_or_name)?;
        let (sn_l1_offset, sn_l1_size) = {
            let sn = &self.snapshots[index];
            (sn.l1_table_offset, sn.l1_size)
        };

        let l1_table_offset = self.header.l1_table_offset;
        let l1_size = self.header.l1_size;
        self.update_snapshot_refcount(l1_table_offset, l1_size, -1)?;

        self.grow_l1_table(u64::from(sn_l1_size))?;
        let mut l1_table = alloc_table::<u64>(self.l1_table.len() as u64)?;
        self.raw_file
            .read_pointer_table_into(sn_l1_offset, &mut l1_table[..sn_l1_size as usize])
            .map_err(Error::ReadingPointers)?;
        self.raw_file
            .write_pointer_table(self.header.l1_table_offset, &l1_table)
            .map_err(Error::WritingPointers)?;
        self.l1_table.get_values_mut().copy_from_slice(&l1_table);

        let l1_table_offset = self.header.l1_table_offset;
        let l1_size = self.header.l1_size;
        self.update_snapshot_refcount(l1_table_offset, l1_size, 1)?;
        self.cluster_cache.invalidate();
        info!("Reverted to snapshot {}", self.snapshots[index].id);
        Ok(())
    }

    /// Deletes the snapshot named by `id_or_name` and releases the clusters only it used.
    pub fn snapshot_delete(&mut self, id_or_name: &str) -> Result<()> {
        self.check_snapshots_supported()?;
        let index = self.find_snapshot(id_or_name)?;
        let (sn_l1_offset, sn_l1_size) = {
            let sn = &self.snapshots[index];
            (sn.l1_table_offset, sn.l1_size)
        };

        self.update_snapshot_refcount(sn_l1_offset, sn_l1_size, -1)?;
        // Clusters only the live image references again may be written in place.
        let l1_table_offset = self.header.l1_table_offset;
        let l1_size = self.header.l1_size;
        self.update_snapshot_refcount(l1_table_offset, l1_size, 0)?;
        self.free_clusters(sn_l1_offset, u64::from(sn_l1_size) * 8)?;

        let sn = self.snapshots.remove(index);
        self.write_snapshots()?;
        info!("Deleted snapshot {} ({})", sn.id, sn.name);
        Ok(())
    }

    pub fn snapshot_list(&self) -> Vec<SnapshotInfo> {
        self.snapshots.iter().map(QcowSnapshot::info).collect()
    }

    fn check_snapshots_supported(&self) -> Result<()> {
        if self.geometry.version != ImageVersion::V2 {
            return Err(Error::Unsupported("snapshots"));
        }
        Ok(())
    }

    fn next_snapshot_id(&self) -> String {
        let max = self
            .snapshots
            .iter()
            .map(|sn| leading_number(&sn.id))
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    // Ids take precedence over names.
    fn find_snapshot(&self, id_or_name: &str) -> Result<usize> {
        self.snapshots
            .iter()
            .position(|sn| sn.id == id_or_name)
            .or_else(|| self.snapshots.iter().position(|sn| sn.name == id_or_name))
            .ok_or_else(|| Error::SnapshotNotFound(id_or_name.to_string()))
    }

    fn adjust_refcount(&mut self, cluster_index: u64, addend: i32) -> Result<u16> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("refcounts"))?;
        if addend == 0 {
            refcounts.get_refcount(&self.raw_file, cluster_index)
        } else {
            refcounts.update_cluster_refcount(&self.raw_file, cluster_index, addend)
        }
        .map_err(Error::Refcount)
    }

    fn adjust_refcount_range(&mut self, offset: u64, len: u64, addend: i32) -> Result<()> {
        let refcounts = self
            .refcounts
            .as_mut()
            .ok_or(Error::Unsupported("refcounts"))?;
        refcounts
            .update_refcount(&self.raw_file, offset, len, addend)
            .map_err(Error::Refcount)
    }

    // Adds `addend` to the refcount of every L2 table and cluster reachable from the L1 table
    // at `l1_table_offset`, then sets the copied flag on exactly the entries whose cluster is
    // referenced once. An addend of 0 only recomputes the flags.
    fn update_snapshot_refcount(
        &mut self,
        l1_table_offset: u64,
        l1_size: u32,
        addend: i32,
    ) -> Result<()> {
        let live = l1_table_offset == self.header.l1_table_offset;
        self.l2_cache.reset();

        let mut l1_table = if live {
            self.l1_table.get_values().to_vec()
        } else {
            let mut table = alloc_table(u64::from(l1_size))?;
            self.raw_file
                .read_pointer_table_into(l1_table_offset, &mut table)
                .map_err(Error::ReadingPointers)?;
            table
        };

        let geometry = self.geometry;
        let copied = EntryFlags::COPIED.bits();
        let mut l1_modified = false;
        for l1_entry in l1_table.iter_mut() {
            let l2_offset = *l1_entry & !copied;
            if l2_offset == 0 {
                continue;
            }
            let mut l2_table = self
                .raw_file
                .read_pointer_cluster(l2_offset, None)
                .map_err(Error::ReadingPointers)?;
            let mut l2_modified = false;
            for l2_entry in l2_table.iter_mut() {
                if *l2_entry == 0 {
                    continue;
                }
                let mut entry = *l2_entry & !copied;
                let refcount = match geometry.decode_l2(entry) {
                    ClusterEntry::Unallocated => continue,
                    ClusterEntry::Compressed { offset, size } => {
                        if addend != 0 {
                            let (start, len) = geometry.compressed_extent(offset, size);
                            self.adjust_refcount_range(start, len, addend)?;
                        }
                        // Compressed clusters are never written in place.
                        2
                    }
                    ClusterEntry::Normal { offset, .. } => {
                        self.adjust_refcount(offset >> geometry.cluster_bits, addend)?
                    }
                };
                if refcount == 1 {
                    entry |= copied;
                }
                if entry != *l2_entry {
                    *l2_entry = entry;
                    l2_modified = true;
                }
            }
            if l2_modified {
                self.raw_file
                    .write_pointer_table(l2_offset, &l2_table)
                    .map_err(Error::WritingPointers)?;
            }

            let refcount = self.adjust_refcount(l2_offset >> geometry.cluster_bits, addend)?;
            let entry = if refcount == 1 {
                l2_offset | copied
            } else {
                l2_offset
            };
            if entry != *l1_entry {
                *l1_entry = entry;
                l1_modified = true;
            }
        }

        if l1_modified {
            self.raw_file
                .write_pointer_table(l1_table_offset, &l1_table)
                .map_err(Error::WritingPointers)?;
            if live {
                self.l1_table.get_values_mut().copy_from_slice(&l1_table);
            }
        }
        Ok(())
    }

    // Writes the snapshot table to newly allocated clusters, points the header at it and
    // frees the previous copy. An empty table is recorded with offset 0.
    fn write_snapshots(&mut self) -> Result<()> {
        let buf = encode_snapshots(&self.snapshots);
        let new_offset = if buf.is_empty() {
            0
        } else {
            let offset = self.alloc_clusters(buf.len() as u64)?;
            self.raw_file
                .write_at(offset, &buf)
                .map_err(Error::WritingSnapshots)?;
            offset
        };

        let count = self.snapshots.len() as u32;
        self.raw_file
            .write_pointer(SNAPSHOTS_OFFSET_OFFSET, new_offset)
            .map_err(Error::WritingHeader)?;
        self.raw_file
            .write_u32(NB_SNAPSHOTS_OFFSET, count)
            .map_err(Error::WritingHeader)?;

        let old_offset = self.header.snapshots_offset;
        let old_size = self.snapshots_size;
        self.header.snapshots_offset = new_offset;
        self.header.nb_snapshots = count;
        self.snapshots_size = buf.len() as u64;
        if old_size > 0 {
            self.free_clusters(old_offset, old_size)?;
        }
        Ok(())
    }
}

// Numeric value of the leading digits of `s`, 0 when there are none.
fn leading_number(s: &str) -> u64 {
    s.bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |n, d| n.saturating_mul(10).saturating_add(u64::from(d - b'0')))
}
