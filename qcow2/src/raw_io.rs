// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Positioned I/O over the backing image file.
//!
//! All operations take `&self` so that table lookups can run concurrently
//! under a shared lock; the handle is cheaply cloneable and every clone
//! refers to the same underlying file.

use std::cmp::min;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

const COPY_CHUNK_SIZE: usize = 65536;

/// A qcow file opened for cluster-granular access.
#[derive(Clone, Debug)]
pub struct RawIo {
    file: Arc<File>,
    cluster_size: u64,
    cluster_mask: u64,
}

impl RawIo {
    /// Creates a `RawIo` from the given `File`. `None` is returned if
    /// `cluster_size` is not a power of two.
    pub fn new(file: File, cluster_size: u64) -> Option<RawIo> {
        if cluster_size.count_ones() != 1 {
            return None;
        }
        Some(RawIo {
            file: Arc::new(file),
            cluster_size,
            cluster_mask: cluster_size - 1,
        })
    }

    /// Reads the big-endian u64 at `offset`.
    pub fn read_u64(&self, offset: u64) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Writes `value` big-endian at `offset`.
    pub fn write_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.file.write_all_at(&buf, offset)
    }

    /// Reads the big-endian u16 at `offset`.
    pub fn read_u16(&self, offset: u64) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BigEndian::read_u16(&buf))
    }

    /// Writes `value` big-endian at `offset`.
    pub fn write_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.file.write_all_at(&buf, offset)
    }

    /// Fills `buf` from the file starting at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Writes all of `buf` to the file starting at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Copies `length` bytes within the file from `src` to `dst`.
    pub fn copy(&self, dst: u64, src: u64, length: u64) -> io::Result<()> {
        let mut buf = vec![0u8; min(COPY_CHUNK_SIZE as u64, length) as usize];
        let mut done = 0;
        while done < length {
            let count = min(buf.len() as u64, length - done) as usize;
            self.file.read_exact_at(&mut buf[..count], src + done)?;
            self.file.write_all_at(&buf[..count], dst + done)?;
            done += count as u64;
        }
        Ok(())
    }

    /// Fills `length` bytes at `dst` with `value`.
    pub fn fill(&self, dst: u64, length: u64, value: u8) -> io::Result<()> {
        let buf = vec![value; min(COPY_CHUNK_SIZE as u64, length) as usize];
        let mut done = 0;
        while done < length {
            let count = min(buf.len() as u64, length - done) as usize;
            self.file.write_all_at(&buf[..count], dst + done)?;
            done += count as u64;
        }
        Ok(())
    }

    /// Extends the file so the cluster starting at `offset` is fully
    /// addressable, which translates to truncate(2). Already-long-enough
    /// files are left alone.
    pub fn grow_to_cluster_end(&self, offset: u64) -> io::Result<()> {
        let end = (offset & !self.cluster_mask) + self.cluster_size;
        if self.file.metadata()?.len() < end {
            self.file.set_len(end)?;
        }
        Ok(())
    }

    /// Returns a reference to the underlying file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the size of the file's clusters.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }
}
