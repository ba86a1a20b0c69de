// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use qcow::{
    AioState, ClusterEntry, ClusterMode, CreateOptions, Error, ErrorKind, ImageVersion, QcowAsync,
    QcowFile, RawFileSync, SnapshotRequest,
};
use vmm_sys_util::tempdir::TempDir;

const MIB: u64 = 1 << 20;

fn temp_dir() -> TempDir {
    TempDir::new_with_prefix("/tmp/qcow_images").unwrap()
}

fn create(path: &Path, version: ImageVersion, size: u64) -> QcowFile {
    let options = CreateOptions {
        version,
        size,
        ..Default::default()
    };
    QcowFile::create_at(path, &options).unwrap()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

fn read_sector(q: &mut QcowFile, sector: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    q.read_sectors(sector, &mut buf).unwrap();
    buf
}

fn snapshot(q: &mut QcowFile, name: &str) -> String {
    q.snapshot_create(&SnapshotRequest {
        name: name.to_string(),
        date_sec: 1_700_000_000,
        ..Default::default()
    })
    .unwrap()
}

fn innermost(mut e: &Error) -> &Error {
    while let Error::BackingFileOpen(inner) = e {
        e = inner;
    }
    e
}

#[test]
fn sparse_write_and_read() {
    let dir = temp_dir();
    let path = dir.as_path().join("a.qcow2");
    let mut q = create(&path, ImageVersion::V2, MIB);
    assert_eq!(q.cluster_size(), 4096);

    q.write_sectors(0, &[0xaa; 512]).unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0xaa; 512]);
    assert_eq!(read_sector(&mut q, 1), vec![0; 512]);

    // Data survives reopening.
    q.flush().unwrap();
    drop(q);
    let mut q = QcowFile::open(&path, false).unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0xaa; 512]);
    assert!(q.check_refcounts().unwrap().is_clean());
}

// Writes a version 2 image with 512 byte clusters and a one cluster disk: header, L1 table,
// refcount table and refcount block each take one cluster.
fn create_one_cluster_image(path: &Path) {
    let mut image = vec![0u8; 2048];
    image[0..4].copy_from_slice(&0x5146_49fbu32.to_be_bytes());
    image[4..8].copy_from_slice(&2u32.to_be_bytes());
    // cluster_bits
    image[20..24].copy_from_slice(&9u32.to_be_bytes());
    image[24..32].copy_from_slice(&512u64.to_be_bytes());
    // One L1 entry at 512, one refcount table cluster at 1024.
    image[36..40].copy_from_slice(&1u32.to_be_bytes());
    image[40..48].copy_from_slice(&512u64.to_be_bytes());
    image[48..56].copy_from_slice(&1024u64.to_be_bytes());
    image[56..60].copy_from_slice(&1u32.to_be_bytes());
    image[1024..1032].copy_from_slice(&1536u64.to_be_bytes());
    for cluster in 0..4 {
        let pos = 1536 + cluster * 2;
        image[pos..pos + 2].copy_from_slice(&1u16.to_be_bytes());
    }
    std::fs::write(path, &image).unwrap();
}

#[test]
fn smallest_clusters_on_a_one_cluster_disk() {
    let dir = temp_dir();
    let path = dir.as_path().join("tiny.qcow2");
    create_one_cluster_image(&path);
    let mut q = QcowFile::open(&path, true).unwrap();
    assert_eq!(q.cluster_size(), 512);
    assert_eq!(q.total_sectors(), 1);
    assert!(q.check_refcounts().unwrap().is_clean());

    assert_eq!(read_sector(&mut q, 0), vec![0; 512]);
    q.write_sectors(0, &[0x11; 512]).unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0x11; 512]);
    let err = q.read_sectors(1, &mut [0u8; 512]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);

    q.write_compressed(0, &[0x22; 512]).unwrap();
    assert!(matches!(
        q.get_cluster_offset(0, ClusterMode::Lookup).unwrap(),
        ClusterEntry::Compressed { .. }
    ));
    assert_eq!(read_sector(&mut q, 0), vec![0x22; 512]);
    assert!(q.check_refcounts().unwrap().is_clean());

    snapshot(&mut q, "s1");
    q.write_sectors(0, &[0x33; 512]).unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0x33; 512]);
    assert!(q.check_refcounts().unwrap().is_clean());

    q.snapshot_goto("s1").unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0x22; 512]);
    let result = q.check_refcounts().unwrap();
    assert!(result.is_clean(), "{result:?}");

    q.snapshot_delete("s1").unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0x22; 512]);
    assert!(q.check_refcounts().unwrap().is_clean());
}

#[test]
fn encrypted_image_needs_the_right_key() {
    let dir = temp_dir();
    let path = dir.as_path().join("b.qcow2");
    let options = CreateOptions {
        size: MIB,
        encrypted: true,
        ..Default::default()
    };
    let mut q = QcowFile::create_at(&path, &options).unwrap();
    let mut buf = vec![0u8; 512];
    assert_eq!(
        q.read_sectors(10, &mut buf).unwrap_err().kind(),
        ErrorKind::NeedsKey
    );

    q.set_key(b"secret");
    q.write_sectors(10, &[0x55; 512]).unwrap();
    drop(q);

    let mut q = QcowFile::open(&path, true).unwrap();
    assert!(q.is_encrypted());
    q.set_key(b"secret");
    assert_eq!(read_sector(&mut q, 10), vec![0x55; 512]);

    // A wrong key silently yields other bytes.
    q.set_key(b"not the secret");
    assert_ne!(read_sector(&mut q, 10), vec![0x55; 512]);
    // Unallocated sectors read as zeros whatever the key.
    assert_eq!(read_sector(&mut q, 100), vec![0; 512]);
}

#[test]
fn compressed_cluster_uses_less_space() {
    let dir = temp_dir();
    let path = dir.as_path().join("c.qcow2");
    let mut q = create(&path, ImageVersion::V2, MIB);
    // Allocate the L2 table first so the compressed write only adds its payload.
    q.write_sectors(0, &[1; 4096]).unwrap();
    let before = file_len(&path);

    let data: Vec<u8> = (0..4096).map(|i| (i / 512) as u8).collect();
    q.write_compressed(8, &data).unwrap();
    let grown = file_len(&path) - before;
    assert!(grown > 0 && grown < 1024, "grew by {grown}");

    match q.get_cluster_offset(4096, ClusterMode::Lookup).unwrap() {
        ClusterEntry::Compressed { offset, size } => {
            assert!(offset >= before);
            assert!(size < 4096);
        }
        other => panic!("expected a compressed cluster, got {other:?}"),
    }
    let mut back = vec![0u8; 4096];
    q.read_sectors(8, &mut back).unwrap();
    assert_eq!(back, data);

    // Overwriting part of it turns it back into a normal cluster.
    q.write_sectors(9, &[0xee; 512]).unwrap();
    assert!(matches!(
        q.get_cluster_offset(4096, ClusterMode::Lookup).unwrap(),
        ClusterEntry::Normal { .. }
    ));
    q.read_sectors(8, &mut back).unwrap();
    assert_eq!(&back[..512], &data[..512]);
    assert_eq!(&back[512..1024], &[0xee; 512][..]);
    assert_eq!(&back[1024..], &data[1024..]);
    assert!(q.check_refcounts().unwrap().is_clean());
}

#[test]
fn snapshot_goto_and_delete() {
    let dir = temp_dir();
    let path = dir.as_path().join("d.qcow2");
    let mut q = create(&path, ImageVersion::V2, MIB);
    let original = vec![0x11u8; 4096];
    q.write_sectors(0, &original).unwrap();

    let id = snapshot(&mut q, "s1");
    assert_eq!(id, "1");
    q.write_sectors(0, &[0x22; 4096]).unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![0x22; 512]);

    q.snapshot_goto("s1").unwrap();
    let mut back = vec![0u8; 4096];
    q.read_sectors(0, &mut back).unwrap();
    assert_eq!(back, original);

    // The first field of the snapshot record is the offset of its private L1 copy.
    let mut field = [0u8; 8];
    File::open(&path)
        .unwrap()
        .read_exact_at(&mut field, q.header().snapshots_offset)
        .unwrap();
    let l1_copy = u64::from_be_bytes(field);
    let l1_cluster = l1_copy >> 12;
    assert_eq!(q.refcount(l1_cluster).unwrap(), 1);

    q.snapshot_delete("s1").unwrap();
    assert_eq!(q.refcount(l1_cluster).unwrap(), 0);
    assert!(q.snapshot_list().is_empty());
    assert_eq!(q.header().nb_snapshots, 0);
    assert!(q.check_refcounts().unwrap().is_clean());

    // The live data is private again and can be overwritten in place.
    let ClusterEntry::Normal { offset, copied } =
        q.get_cluster_offset(0, ClusterMode::Lookup).unwrap()
    else {
        panic!("expected a normal cluster");
    };
    assert!(copied);
    q.write_sectors(0, &[0x33; 512]).unwrap();
    assert_eq!(
        q.get_cluster_offset(0, ClusterMode::Lookup).unwrap(),
        ClusterEntry::Normal {
            offset,
            copied: true
        }
    );
}

#[test]
fn snapshots_survive_reopen() {
    let dir = temp_dir();
    let path = dir.as_path().join("e.qcow2");
    let mut q = create(&path, ImageVersion::V2, MIB);
    q.write_sectors(0, &[1; 512]).unwrap();
    snapshot(&mut q, "first");
    q.write_sectors(0, &[2; 512]).unwrap();
    snapshot(&mut q, "second");
    q.write_sectors(0, &[3; 512]).unwrap();
    drop(q);

    let mut q = QcowFile::open(&path, true).unwrap();
    let names: Vec<String> = q.snapshot_list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["first", "second"]);
    assert_eq!(q.snapshot_list()[0].date_sec, 1_700_000_000);

    q.snapshot_goto("1").unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![1; 512]);
    q.snapshot_goto("second").unwrap();
    assert_eq!(read_sector(&mut q, 0), vec![2; 512]);
    assert!(q.check_refcounts().unwrap().is_clean());

    let err = q.snapshot_goto("third").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn backing_chain_reads_through() {
    let dir = temp_dir();
    let base_path = dir.as_path().join("base.qcow2");
    let mut base = create(&base_path, ImageVersion::V2, MIB);
    base.write_sectors(0, &[0xb0; 8192]).unwrap();
    drop(base);

    let overlay_path = dir.as_path().join("overlay.qcow2");
    let options = CreateOptions {
        size: MIB,
        backing_file: Some("base.qcow2".to_string()),
        ..Default::default()
    };
    let mut overlay = QcowFile::create_at(&overlay_path, &options).unwrap();
    assert_eq!(
        overlay.header().backing_file.as_deref(),
        Some("base.qcow2")
    );
    assert_eq!(read_sector(&mut overlay, 3), vec![0xb0; 512]);

    // A partial write copies the rest of the cluster up from the base.
    overlay.write_sectors(2, &[0x0f; 512]).unwrap();
    let mut cluster = vec![0u8; 4096];
    overlay.read_sectors(0, &mut cluster).unwrap();
    assert_eq!(&cluster[..1024], &[0xb0; 1024][..]);
    assert_eq!(&cluster[1024..1536], &[0x0f; 512][..]);
    assert_eq!(&cluster[1536..], &[0xb0; 2560][..]);
    assert_eq!(read_sector(&mut overlay, 20), vec![0; 512]);
    drop(overlay);

    // The base is untouched.
    let mut base = QcowFile::open(&base_path, false).unwrap();
    assert_eq!(read_sector(&mut base, 2), vec![0xb0; 512]);

    // Reopening resolves the relative name against the overlay's directory.
    let mut overlay = QcowFile::open(&overlay_path, false).unwrap();
    assert_eq!(read_sector(&mut overlay, 2), vec![0x0f; 512]);
    assert_eq!(read_sector(&mut overlay, 15), vec![0xb0; 512]);
}

#[test]
fn raw_backing_file() {
    let dir = temp_dir();
    let raw_path = dir.as_path().join("base.raw");
    let mut raw = File::create(&raw_path).unwrap();
    raw.write_all(&[0x42; 1536]).unwrap();
    drop(raw);

    let options = CreateOptions {
        size: MIB,
        backing_file: Some(raw_path.to_string_lossy().into_owned()),
        ..Default::default()
    };
    let mut q = QcowFile::create_at(dir.as_path().join("top.qcow2"), &options).unwrap();
    assert_eq!(read_sector(&mut q, 2), vec![0x42; 512]);
    // Past the end of the raw file.
    assert_eq!(read_sector(&mut q, 3), vec![0; 512]);
}

#[test]
fn self_referencing_backing_file_is_rejected() {
    let dir = temp_dir();
    let path: PathBuf = dir.as_path().join("loop.qcow2");
    let options = CreateOptions {
        size: MIB,
        backing_file: Some("loop.qcow2".to_string()),
        ..Default::default()
    };
    let err = QcowFile::create_at(&path, &options).unwrap_err();
    assert!(matches!(innermost(&err), Error::MaxNestingDepthExceeded));
    assert_eq!(err.kind(), ErrorKind::Format);

    let err = QcowFile::open(&path, false).unwrap_err();
    assert!(matches!(innermost(&err), Error::MaxNestingDepthExceeded));
}

#[test]
fn missing_backing_file() {
    let dir = temp_dir();
    let options = CreateOptions {
        size: MIB,
        backing_file: Some("nowhere.qcow2".to_string()),
        ..Default::default()
    };
    let err = QcowFile::create_at(dir.as_path().join("f.qcow2"), &options).unwrap_err();
    assert!(matches!(err, Error::BackingFileIo(_)));
}

#[test]
fn version_1_image() {
    let dir = temp_dir();
    let path = dir.as_path().join("old.qcow");
    let mut q = create(&path, ImageVersion::V1, 4 * MIB);
    assert_eq!(q.header().version, ImageVersion::V1);
    assert_eq!(q.image_info().unwrap().format, "qcow");

    let data: Vec<u8> = (0..3 * 512).map(|i| (i % 13) as u8).collect();
    q.write_sectors(7, &data).unwrap();
    q.write_compressed(64, &[9; 4096]).unwrap();
    drop(q);

    let mut q = QcowFile::open(&path, true).unwrap();
    let mut back = vec![0u8; data.len()];
    q.read_sectors(7, &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(read_sector(&mut q, 70), vec![9; 512]);
    assert!(q.get_info().vm_state_offset.is_none());

    assert_eq!(
        q.snapshot_create(&SnapshotRequest::default())
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidState
    );

    q.make_empty().unwrap();
    assert_eq!(read_sector(&mut q, 7), vec![0; 512]);
    assert!(!q.is_allocated(0, 8).unwrap().0);
}

#[test]
fn byte_stream_access() {
    let dir = temp_dir();
    let mut q = create(&dir.as_path().join("g.qcow2"), ImageVersion::V2, MIB);
    q.seek(SeekFrom::Start(1000)).unwrap();
    q.write_all(b"hello across a sector boundary").unwrap();

    let mut buf = [0u8; 30];
    q.seek(SeekFrom::Start(1000)).unwrap();
    q.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello across a sector boundary");
    assert_eq!(read_sector(&mut q, 1)[..24], [0u8; 24]);
    assert_eq!(q.seek(SeekFrom::End(0)).unwrap(), MIB);
}

#[test]
fn async_requests_match_sync_io() {
    let dir = temp_dir();
    let path = dir.as_path().join("h.qcow2");
    let mut q = create(&path, ImageVersion::V2, MIB);
    q.write_compressed(0, &[5; 4096]).unwrap();

    let file = qcow::RawFile::new(
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap(),
    );
    let mut aio = QcowAsync::new(RawFileSync::new(file));

    // Two requests in flight on different clusters.
    aio.submit_write(&mut q, 16, vec![6; 8192], 1).unwrap();
    aio.submit_read(&mut q, 4, 8, 2).unwrap();
    assert_eq!(aio.request_state(1), Some(AioState::AwaitingRawWrite));
    aio.process_completions(&mut q);

    let mut results = Vec::new();
    while let Some(c) = aio.next_completed_request() {
        results.push((c.user_data, c.result.unwrap()));
    }
    results.sort_by_key(|(ud, _)| *ud);
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_empty());
    let mut expected = vec![5u8; 2048];
    expected.extend_from_slice(&[0; 2048]);
    assert_eq!(results[1].1, expected);

    let mut back = vec![0u8; 8192];
    q.read_sectors(16, &mut back).unwrap();
    assert_eq!(back, vec![6; 8192]);
    assert!(q.check_refcounts().unwrap().is_clean());
}

#[test]
fn out_of_range_requests() {
    let dir = temp_dir();
    let mut q = create(&dir.as_path().join("i.qcow2"), ImageVersion::V2, MIB);
    let mut buf = vec![0u8; 1024];
    let err = q.read_sectors(2047, &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    let err = q.write_sectors(u64::MAX, &buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    let err = q.read_sectors(0, &mut buf[..100]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
