// Copyright © 2026 The qcow2-fuse Authors
//
// SPDX-License-Identifier: Apache-2.0

//! FUSE presentation of a guest block device: a root directory holding a
//! single regular file with the image's flat contents.

use std::cmp::min;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyWrite,
    Request,
};
use log::{debug, error, warn};
use qcow2::GuestDevice;

/// How long the kernel may cache attributes and entries. The device never
/// resizes or renames, so this is purely a chattiness knob.
const TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;
const IMAGE_INO: u64 = 2;

pub struct QcowFs {
    device: GuestDevice,
    name: String,
    read_only: bool,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl QcowFs {
    pub fn new(device: GuestDevice, name: String, read_only: bool) -> QcowFs {
        QcowFs {
            device,
            name,
            read_only,
            // SAFETY: getuid/getgid cannot fail.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            mounted_at: SystemTime::now(),
        }
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn image_attr(&self) -> FileAttr {
        let size = self.device.size().unwrap_or(0);
        FileAttr {
            ino: IMAGE_INO,
            size,
            blocks: size.div_ceil(512),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: FileType::RegularFile,
            perm: if self.read_only { 0o444 } else { 0o644 },
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for QcowFs {
    fn destroy(&mut self) {
        debug!("unmounting, closing the device");
        self.device.close();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == ROOT_INO && name.to_str() == Some(self.name.as_str()) {
            reply.entry(&TTL, &self.image_attr(), 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match ino {
            ROOT_INO => reply.attr(&TTL, &self.root_attr()),
            IMAGE_INO => reply.attr(&TTL, &self.image_attr()),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            return reply.error(libc::ENOTDIR);
        }
        let entries = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (IMAGE_INO, FileType::RegularFile, self.name.as_str()),
        ];
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino != IMAGE_INO {
            return reply.error(libc::ENOENT);
        }
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let device_size = match self.device.size() {
            Ok(size) => size,
            Err(e) => return reply.error(e.errno()),
        };
        // The kernel reads past EOF; clamp instead of erroring.
        let offset = offset as u64;
        if offset >= device_size {
            return reply.data(&[]);
        }
        let length = min(u64::from(size), device_size - offset) as usize;

        let mut buf = vec![0u8; length];
        match self.device.read_at(&mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) if e.completed > 0 => {
                warn!("short read of {length} bytes at {offset}: {e}");
                reply.data(&buf[..e.completed]);
            }
            Err(e) => {
                error!("read of {length} bytes at {offset} failed: {e}");
                reply.error(e.source.errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if ino != IMAGE_INO {
            return reply.error(libc::ENOENT);
        }
        if self.read_only {
            return reply.error(libc::EROFS);
        }
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.device.write_at(data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) if e.completed > 0 => {
                warn!("short write of {} bytes at {offset}: {e}", data.len());
                reply.written(e.completed as u32);
            }
            Err(e) => {
                error!("write of {} bytes at {offset} failed: {e}", data.len());
                reply.error(e.source.errno());
            }
        }
    }
}
