// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Guest-side access to qcow2 disk images.
//!
//! A qcow2 file maps guest clusters to host clusters through a two-level
//! table tree; clusters are materialized copy-on-write on first write and
//! reference counted so shared storage is never mutated in place. This
//! crate exposes that translation as a [`GuestDevice`]: a flat, randomly
//! addressable, reference-count-consistent byte store over the image.
//!
//! # Example
//!
//! ```no_run
//! # use std::fs::OpenOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = OpenOptions::new().read(true).write(true).open("disk.qcow2")?;
//! let device = qcow2::open(file)?;
//! let mut buf = vec![0u8; 4096];
//! device.read_at(&mut buf, 0)?;
//! device.write_at(b"hello", 65536)?;
//! # Ok(())
//! # }
//! ```

mod entry;
mod guest;
mod header;
mod raw_io;
mod refcount;

use std::fs::File;
use std::io;

use remain::sorted;
use thiserror::Error;

pub use crate::entry::{Entry, Mapping};
pub use crate::guest::GuestDevice;
pub use crate::header::Header;
pub use crate::raw_io::RawIo;
pub use crate::refcount::RefCounts;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate cluster")]
    AllocatingCluster(#[source] refcount::Error),
    #[error("backing files not supported")]
    BackingFilesNotSupported,
    #[error("compressed clusters not supported")]
    CompressedClustersNotSupported,
    #[error("device is closed")]
    DeviceClosed,
    #[error("encrypted images not supported")]
    EncryptedImagesNotSupported,
    #[error("file larger than max of 16 TB: {0}")]
    FileTooBig(u64),
    #[error("failed to free cluster")]
    FreeingCluster(#[source] refcount::Error),
    #[error("image is marked corrupt and cannot be modified")]
    ImageCorrupt,
    #[error("image is marked dirty and cannot be modified")]
    ImageDirty,
    #[error("invalid cluster size")]
    InvalidClusterSize,
    #[error("invalid L1 table offset")]
    InvalidL1TableOffset,
    #[error("invalid L1 table size: {0}")]
    InvalidL1TableSize(u32),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("invalid offset: {0}")]
    InvalidOffset(u64),
    #[error("invalid refcount table offset")]
    InvalidRefcountTableOffset,
    #[error("misaligned mapping entry: {0:#x}")]
    MisalignedEntry(u64),
    #[error("no refcount clusters")]
    NoRefcountClusters,
    #[error("failed to read data")]
    ReadingData(#[source] io::Error),
    #[error("failed to read header")]
    ReadingHeader(#[source] io::Error),
    #[error("failed to read pointers")]
    ReadingPointers(#[source] io::Error),
    #[error("request for {length} bytes at {offset} is out of range")]
    RequestOutOfRange { offset: u64, length: usize },
    #[error("failed to seed refcounts")]
    SeedingRefCounts(#[source] refcount::Error),
    #[error("unknown incompatible features: {0:#x}")]
    UnknownIncompatibleFeatures(u64),
    #[error("unsupported refcount order")]
    UnsupportedRefcountOrder,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("failed to write data")]
    WritingData(#[source] io::Error),
    #[error("failed to write header")]
    WritingHeader(#[source] io::Error),
    #[error("failed to write pointers")]
    WritingPointers(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno a presentation layer should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AllocatingCluster(refcount::Error::NoFreeClusters) => libc::ENOSPC,
            Error::CompressedClustersNotSupported => libc::ENOTSUP,
            Error::DeviceClosed => libc::EBADF,
            Error::ImageCorrupt | Error::ImageDirty => libc::EROFS,
            Error::ReadingData(e)
            | Error::ReadingHeader(e)
            | Error::ReadingPointers(e)
            | Error::WritingData(e)
            | Error::WritingHeader(e)
            | Error::WritingPointers(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::RequestOutOfRange { .. } => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}

/// Error from a multi-cluster transfer. `completed` bytes were applied
/// before the failure and are not rolled back.
#[derive(Debug, Error)]
#[error("transfer failed after {completed} bytes")]
pub struct TransferError {
    pub completed: usize,
    #[source]
    pub source: Error,
}

impl TransferError {
    pub(crate) fn closed() -> TransferError {
        TransferError {
            completed: 0,
            source: Error::DeviceClosed,
        }
    }
}

pub type TransferResult = std::result::Result<usize, TransferError>;

/// Opens an existing qcow2 image as a [`GuestDevice`].
pub fn open(file: File) -> Result<GuestDevice> {
    let header = Header::open(file)?;
    let refcounts = RefCounts::new(
        header.raw_io().clone(),
        header.refcount_table_offset,
        header.refcount_table_clusters,
    );
    let l1_offset = header.l1_table_offset;
    let size = header.size;
    Ok(GuestDevice::open(header, refcounts, l1_offset, size))
}

/// Formats `file` as a fresh v3 image of the given virtual size and opens
/// it as a [`GuestDevice`].
///
/// The new image holds the header, an all-zero L1 table, the refcount
/// table, and one seeded refcount block accounting for those metadata
/// clusters; everything else is allocated on demand.
pub fn create(file: File, virtual_size: u64) -> Result<GuestDevice> {
    let header = Header::create(file, 3, virtual_size)?;
    let io = header.raw_io().clone();
    let cluster_size = header.cluster_size();

    let table_clusters = u64::from(header.refcount_table_clusters);
    let refblock_cluster = header.refcount_table_offset / cluster_size + table_clusters;

    // Zero the L1 table, the refcount table, and the first refcount block,
    // then point the table at the block.
    io.fill(
        header.l1_table_offset,
        header.refcount_table_offset - header.l1_table_offset,
        0,
    )
    .map_err(Error::WritingPointers)?;
    io.fill(header.refcount_table_offset, table_clusters * cluster_size, 0)
        .map_err(Error::WritingPointers)?;
    io.fill(refblock_cluster * cluster_size, cluster_size, 0)
        .map_err(Error::WritingPointers)?;
    io.write_u64(header.refcount_table_offset, refblock_cluster * cluster_size)
        .map_err(Error::WritingPointers)?;

    // One reference for each metadata cluster, the block included.
    let refcounts = RefCounts::new(
        io,
        header.refcount_table_offset,
        header.refcount_table_clusters,
    );
    for cluster in 0..=refblock_cluster {
        refcounts.set(cluster, 1).map_err(Error::SeedingRefCounts)?;
    }

    let l1_offset = header.l1_table_offset;
    let size = header.size;
    Ok(GuestDevice::open(header, refcounts, l1_offset, size))
}

// Ceiling of the division of `dividend`/`divisor`.
pub(crate) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + if dividend % divisor != 0 { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn create_then_reopen() {
        let file = TempFile::new().unwrap().into_file();
        let reread = file.try_clone().unwrap();

        let device = create(file, 0x100_0000).unwrap();
        assert_eq!(device.size().unwrap(), 0x100_0000);
        device.write_at(b"persisted", 4096).unwrap();
        device.close();

        let device = open(reread).unwrap();
        assert_eq!(device.size().unwrap(), 0x100_0000);
        let mut buf = [0u8; 9];
        device.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn open_rejects_garbage() {
        let file = TempFile::new().unwrap().into_file();
        assert!(matches!(open(file), Err(Error::ReadingHeader(_))));
    }

    #[test]
    fn div_round_up() {
        assert_eq!(div_round_up_u64(0, 16), 0);
        assert_eq!(div_round_up_u64(1, 16), 1);
        assert_eq!(div_round_up_u64(16, 16), 1);
        assert_eq!(div_round_up_u64(17, 16), 2);
    }
}
