// Copyright © 2026 The qcow2-fuse Authors
//
// SPDX-License-Identifier: Apache-2.0

mod fuse;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, Command};
use fuser::MountOption;
use log::info;

use crate::fuse::QcowFs;

// The mount exposes the image under its own file name, minus the .qcow2
// extension if it has one.
fn image_entry_name(image: &Path) -> String {
    match image.file_stem() {
        Some(stem) if image.extension().is_some_and(|e| e == "qcow2") => {
            stem.to_string_lossy().into_owned()
        }
        _ => image
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "device".to_string()),
    }
}

fn main() {
    let cmd_arguments = Command::new("qcow2-fuse")
        .version(env!("CARGO_PKG_VERSION"))
        .author("The qcow2-fuse Authors")
        .about("Mount a qcow2 disk image as a flat file.")
        .arg(
            Arg::new("image")
                .help("Path to the qcow2 image")
                .value_name("IMAGE")
                .required(true),
        )
        .arg(
            Arg::new("mountpoint")
                .help("Directory to mount the image under")
                .value_name("DIR")
                .required(true),
        )
        .arg(
            Arg::new("read-only")
                .long("read-only")
                .short('r')
                .help("Mount the image read-only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("allow-other")
                .long("allow-other")
                .help("Allow other users to access the mount")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log level (off, error, warn, info, debug, trace)")
                .default_value("warn"),
        )
        .get_matches();

    let log_level = cmd_arguments
        .get_one::<String>("log-level")
        .map(|l| l.as_str())
        .unwrap_or("warn");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let image = PathBuf::from(cmd_arguments.get_one::<String>("image").unwrap());
    let mountpoint = PathBuf::from(cmd_arguments.get_one::<String>("mountpoint").unwrap());
    let read_only = cmd_arguments.get_flag("read-only");

    let file = match OpenOptions::new().read(true).write(!read_only).open(&image) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("qcow2-fuse: failed to open {}: {}", image.display(), e);
            process::exit(1);
        }
    };

    let device = match qcow2::open(file) {
        Ok(device) => device,
        Err(e) => {
            eprintln!(
                "qcow2-fuse: not a usable qcow2 image {}: {}",
                image.display(),
                e
            );
            process::exit(1);
        }
    };

    let name = image_entry_name(&image);
    info!(
        "serving {} as \"{}\", {} bytes",
        image.display(),
        name,
        device.size().unwrap_or(0)
    );

    let mut options = vec![
        MountOption::FSName("qcow2-fuse".to_string()),
        MountOption::DefaultPermissions,
    ];
    if read_only {
        options.push(MountOption::RO);
    }
    if cmd_arguments.get_flag("allow-other") {
        options.push(MountOption::AllowOther);
    }

    let fs = QcowFs::new(device, name, read_only);
    if let Err(e) = fuser::mount2(fs, &mountpoint, &options) {
        eprintln!("qcow2-fuse: mount failed: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_strips_qcow2_extension() {
        assert_eq!(image_entry_name(Path::new("/tmp/disk.qcow2")), "disk");
        assert_eq!(image_entry_name(Path::new("disk.qcow2")), "disk");
    }

    #[test]
    fn entry_name_keeps_other_extensions() {
        assert_eq!(image_entry_name(Path::new("/tmp/disk.img")), "disk.img");
        assert_eq!(image_entry_name(Path::new("plain")), "plain");
    }
}
