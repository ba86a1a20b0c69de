// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use log::debug;
use qcow::{CreateOptions, ImageInfo, ImageVersion, QcowFile, SnapshotRequest};

fn create_command() -> Command {
    Command::new("create")
        .about("Create a new image")
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .help("Image format")
                .value_parser(["qcow", "qcow2"])
                .default_value("qcow2"),
        )
        .arg(
            Arg::new("backing")
                .short('b')
                .long("backing")
                .help("Backing file, relative names resolve against the image directory")
                .num_args(1),
        )
        .arg(
            Arg::new("encrypt")
                .short('e')
                .long("encrypt")
                .help("Encrypt guest data with AES-128-CBC")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("file").required(true))
        .arg(
            Arg::new("size")
                .help("Virtual size in bytes, with an optional K, M, G or T suffix")
                .required(true),
        )
}

fn snapshot_command() -> Command {
    Command::new("snapshot")
        .about("List, create, apply or delete snapshots")
        .arg(
            Arg::new("list")
                .short('l')
                .help("List snapshots")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("create").short('c').help("Create a snapshot").num_args(1))
        .arg(Arg::new("apply").short('a').help("Revert to a snapshot").num_args(1))
        .arg(Arg::new("delete").short('d').help("Delete a snapshot").num_args(1))
        .group(
            ArgGroup::new("action")
                .args(["list", "create", "apply", "delete"])
                .required(true),
        )
        .arg(Arg::new("file").required(true))
}

fn cli() -> Command {
    Command::new("qcow-img")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Create, inspect and snapshot qcow and qcow2 images.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(create_command())
        .subcommand(
            Command::new("info")
                .about("Show image information")
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_parser(["human", "json"])
                        .default_value("human"),
                )
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(snapshot_command())
        .subcommand(
            Command::new("check")
                .about("Check refcounts of a qcow2 image")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("map")
                .about("Show allocated and unallocated extents")
                .arg(Arg::new("file").required(true)),
        )
}

/// Parses a size such as `4096`, `64K` or `10G`.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => bail!("Unknown size suffix {c:?}"),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("Invalid size {s:?}"))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| anyhow!("Size {s:?} is too large"))
}

fn file_arg(matches: &ArgMatches) -> Result<&String> {
    matches
        .get_one::<String>("file")
        .ok_or_else(|| anyhow!("Missing image file"))
}

fn open(matches: &ArgMatches, writable: bool) -> Result<QcowFile> {
    let path = file_arg(matches)?;
    QcowFile::open(path, writable).with_context(|| format!("Failed to open {path}"))
}

fn do_create(matches: &ArgMatches) -> Result<()> {
    let path = file_arg(matches)?;
    let size = matches
        .get_one::<String>("size")
        .ok_or_else(|| anyhow!("Missing size"))?;
    let version = match matches.get_one::<String>("format").map(String::as_str) {
        Some("qcow") => ImageVersion::V1,
        _ => ImageVersion::V2,
    };
    let options = CreateOptions {
        version,
        size: parse_size(size)?,
        backing_file: matches.get_one::<String>("backing").cloned(),
        encrypted: matches.get_flag("encrypt"),
    };
    let qcow = QcowFile::create_at(path, &options)
        .with_context(|| format!("Failed to create {path}"))?;
    qcow.flush().context("Failed to sync image")?;
    println!(
        "Formatting '{path}', fmt={} size={}",
        version.format_name(),
        options.size
    );
    Ok(())
}

fn print_info(info: &ImageInfo, path: &str) {
    println!("image: {path}");
    println!("file format: {}", info.format);
    println!("virtual size: {} bytes", info.virtual_size);
    println!("disk size: {} bytes", info.actual_size);
    println!("cluster_size: {}", info.cluster_size);
    if let Some(backing) = &info.backing_file {
        println!("backing file: {backing}");
    }
    if info.encrypted {
        println!("encrypted: yes");
    }
    if !info.snapshots.is_empty() {
        println!("Snapshot list:");
        print_snapshots(&info.snapshots);
    }
}

fn print_snapshots(snapshots: &[qcow::SnapshotInfo]) {
    println!("{:<10}{:<20}{:>12}{:>22}", "ID", "TAG", "VM SIZE", "DATE");
    for sn in snapshots {
        println!(
            "{:<10}{:<20}{:>12}{:>22}",
            sn.id, sn.name, sn.vm_state_size, sn.date_sec
        );
    }
}

fn do_info(matches: &ArgMatches) -> Result<()> {
    let qcow = open(matches, false)?;
    let info = qcow.image_info()?;
    match matches.get_one::<String>("output").map(String::as_str) {
        Some("json") => {
            let json = serde_json::to_string_pretty(&info).context("Failed to encode JSON")?;
            println!("{json}");
        }
        _ => print_info(&info, file_arg(matches)?),
    }
    Ok(())
}

fn do_snapshot(matches: &ArgMatches) -> Result<()> {
    if matches.get_flag("list") {
        let qcow = open(matches, false)?;
        print_snapshots(&qcow.snapshot_list());
        return Ok(());
    }

    let mut qcow = open(matches, true)?;
    if let Some(name) = matches.get_one::<String>("create") {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock is before the epoch")?;
        let request = SnapshotRequest {
            name: name.clone(),
            date_sec: now.as_secs() as u32,
            date_nsec: now.subsec_nanos(),
            ..Default::default()
        };
        let id = qcow
            .snapshot_create(&request)
            .with_context(|| format!("Failed to create snapshot {name}"))?;
        debug!("Snapshot {name} has id {id}");
    } else if let Some(name) = matches.get_one::<String>("apply") {
        qcow.snapshot_goto(name)
            .with_context(|| format!("Failed to apply snapshot {name}"))?;
    } else if let Some(name) = matches.get_one::<String>("delete") {
        qcow.snapshot_delete(name)
            .with_context(|| format!("Failed to delete snapshot {name}"))?;
    }
    qcow.flush().context("Failed to sync image")?;
    Ok(())
}

// Returns whether the image is clean.
fn do_check(matches: &ArgMatches) -> Result<bool> {
    let mut qcow = open(matches, false)?;
    let result = qcow.check_refcounts()?;
    for m in &result.refcount_mismatches {
        println!(
            "ERROR cluster {} refcount={} reference={}",
            m.cluster, m.stored, m.expected
        );
    }
    for entry in &result.copied_flag_errors {
        println!("ERROR copied flag wrong in entry {entry:#x}");
    }
    for entry in &result.compressed_copied {
        println!("ERROR compressed entry {entry:#x} has the copied flag");
    }
    for offset in &result.invalid_offsets {
        println!("ERROR reference to {offset:#x} past the end of the file");
    }
    if result.is_clean() {
        println!("No errors were found on the image.");
    }
    Ok(result.is_clean())
}

fn do_map(matches: &ArgMatches) -> Result<()> {
    let mut qcow = open(matches, false)?;
    let total = qcow.total_sectors();
    println!("{:<20}{:<20}{}", "Offset", "Length", "Mapped");
    let mut sector = 0;
    // Adjacent spans with the same state are printed as one extent.
    let mut extent: Option<(u64, u64, bool)> = None;
    while sector < total {
        let (allocated, n) = qcow.is_allocated(sector, total - sector)?;
        extent = match extent {
            Some((start, len, state)) if state == allocated => Some((start, len + n, state)),
            Some((start, len, state)) => {
                print_extent(start, len, state);
                Some((sector, n, allocated))
            }
            None => Some((sector, n, allocated)),
        };
        sector += n;
    }
    if let Some((start, len, state)) = extent {
        print_extent(start, len, state);
    }
    Ok(())
}

fn print_extent(start: u64, len: u64, allocated: bool) {
    println!(
        "{:<#20x}{:<#20x}{}",
        start * 512,
        len * 512,
        if allocated { "yes" } else { "no" }
    );
}

fn run(matches: &ArgMatches) -> Result<bool> {
    match matches.subcommand() {
        Some(("create", m)) => do_create(m)?,
        Some(("info", m)) => do_info(m)?,
        Some(("snapshot", m)) => do_snapshot(m)?,
        Some(("check", m)) => return do_check(m),
        Some(("map", m)) => do_map(m)?,
        _ => bail!("Unknown command"),
    }
    Ok(true)
}

fn main() {
    env_logger::init();

    let matches = cli().get_matches();
    match run(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:?}");
            process::exit(1);
        }
    }
}
