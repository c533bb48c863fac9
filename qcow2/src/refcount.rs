// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Cluster reference counting over the on-disk refcount structure.
//!
//! Counts are read from and written to the image directly on every call,
//! matching the statelessness of the translation engine; nothing here
//! caches refcount blocks between operations.

use std::io;

use log::error;
use remain::sorted;
use thiserror::Error;

use crate::raw_io::RawIo;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster {0} is not referenced")]
    DecrementingUnreferenced(u64),
    #[error("cluster {0} is outside the refcount table coverage")]
    InvalidIndex(u64),
    #[error("no free clusters")]
    NoFreeClusters,
    #[error("failed to read refcounts")]
    ReadingRefCounts(#[source] io::Error),
    #[error("failed to write refcounts")]
    WritingRefCounts(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tracks how many table entries reference each host cluster of an open
/// qcow file, and hands out clusters whose count is zero.
#[derive(Debug)]
pub struct RefCounts {
    io: RawIo,
    refcount_table_offset: u64,
    table_entries: u64,
    refcount_block_entries: u64, // number of refcounts in a cluster.
    cluster_size: u64,
    // Next cluster index the allocation scan starts from.
    free_hint: u64,
}

impl RefCounts {
    /// Creates a `RefCounts` over the table at `refcount_table_offset`
    /// spanning `refcount_table_clusters` clusters.
    pub fn new(io: RawIo, refcount_table_offset: u64, refcount_table_clusters: u32) -> RefCounts {
        let cluster_size = io.cluster_size();
        RefCounts {
            io,
            refcount_table_offset,
            table_entries: u64::from(refcount_table_clusters) * cluster_size / 8,
            refcount_block_entries: cluster_size / 2,
            cluster_size,
            free_hint: 0,
        }
    }

    /// The highest cluster count the table can describe.
    pub fn max_clusters(&self) -> u64 {
        self.table_entries * self.refcount_block_entries
    }

    // Gets the table index and the index into the refcount block for the
    // given cluster.
    fn refcount_index(&self, cluster: u64) -> (u64, u64) {
        (
            cluster / self.refcount_block_entries,
            cluster % self.refcount_block_entries,
        )
    }

    // Host offset of the refcount block covering `cluster`, zero if the
    // block has not been allocated.
    fn block_offset(&self, cluster: u64) -> Result<u64> {
        let (table_index, _) = self.refcount_index(cluster);
        self.io
            .read_u64(self.refcount_table_offset + table_index * 8)
            .map_err(Error::ReadingRefCounts)
    }

    /// Returns the refcount of `cluster`. A missing refcount block means
    /// every cluster it covers has an implicit count of zero.
    pub fn get(&self, cluster: u64) -> Result<u16> {
        if cluster >= self.max_clusters() {
            return Err(Error::InvalidIndex(cluster));
        }
        let block = self.block_offset(cluster)?;
        if block == 0 {
            return Ok(0);
        }
        let (_, block_index) = self.refcount_index(cluster);
        self.io
            .read_u16(block + block_index * 2)
            .map_err(Error::ReadingRefCounts)
    }

    // Also used by `create` when seeding the metadata clusters of a fresh
    // image.
    pub(crate) fn set(&self, cluster: u64, count: u16) -> Result<()> {
        let block = self.block_offset(cluster)?;
        if block == 0 {
            return Err(Error::InvalidIndex(cluster));
        }
        let (_, block_index) = self.refcount_index(cluster);
        self.io
            .write_u16(block + block_index * 2, count)
            .map_err(Error::WritingRefCounts)
    }

    // Makes sure the refcount block covering `cluster` exists. A missing
    // block means its whole range is free, so the block claims `cluster`
    // itself and accounts for its own allocation. Returns true if a block
    // was created (and `cluster` is therefore no longer free).
    fn ensure_block(&mut self, cluster: u64) -> Result<bool> {
        let (table_index, _) = self.refcount_index(cluster);
        let slot = self.refcount_table_offset + table_index * 8;
        let block = self.io.read_u64(slot).map_err(Error::ReadingRefCounts)?;
        if block != 0 {
            return Ok(false);
        }
        let offset = cluster * self.cluster_size;
        self.io
            .fill(offset, self.cluster_size, 0)
            .map_err(Error::WritingRefCounts)?;
        self.io
            .write_u64(slot, offset)
            .map_err(Error::WritingRefCounts)?;
        self.set(cluster, 1)?;
        Ok(true)
    }

    /// Allocates `count` contiguous clusters with a refcount of one each,
    /// returning the index of the first. The backing file is extended to
    /// cover the run.
    pub fn allocate(&mut self, count: u64) -> Result<u64> {
        debug_assert!(count > 0);
        // Cluster 0 holds the image header and is never handed out; this
        // also keeps a freshly placed refcount block from landing at
        // offset zero, which the table cannot represent.
        let mut idx = self.free_hint.max(1);
        'scan: while idx.checked_add(count).is_some() && idx + count <= self.max_clusters() {
            for cluster in idx..idx + count {
                if self.ensure_block(cluster)? || self.get(cluster)? != 0 {
                    idx = cluster + 1;
                    continue 'scan;
                }
            }
            for cluster in idx..idx + count {
                self.set(cluster, 1)?;
            }
            self.io
                .grow_to_cluster_end((idx + count - 1) * self.cluster_size)
                .map_err(Error::WritingRefCounts)?;
            self.free_hint = idx + count;
            return Ok(idx);
        }
        error!("no free clusters left in the refcount table coverage");
        Err(Error::NoFreeClusters)
    }

    /// Drops one reference to `cluster`, returning the new count. A cluster
    /// whose count reaches zero becomes eligible for reuse by the next
    /// allocation scan.
    pub fn decrement(&mut self, cluster: u64) -> Result<u16> {
        let count = self.get(cluster)?;
        if count == 0 {
            return Err(Error::DecrementingUnreferenced(cluster));
        }
        self.set(cluster, count - 1)?;
        if count == 1 && cluster < self.free_hint {
            self.free_hint = cluster;
        }
        Ok(count - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    const CLUSTER_SIZE: u64 = 4096;

    // A refcount structure laid out the way `create` seeds fresh images:
    // cluster 0 stands in for the header, the table follows it, then the
    // first refcount block, with every metadata cluster counted once.
    fn seeded_refcounts(table_clusters: u32) -> RefCounts {
        let io = RawIo::new(TempFile::new().unwrap().into_file(), CLUSTER_SIZE).unwrap();
        let table_offset = CLUSTER_SIZE;
        let block_cluster = 1 + u64::from(table_clusters);
        io.fill(
            table_offset,
            (u64::from(table_clusters) + 1) * CLUSTER_SIZE,
            0,
        )
        .unwrap();
        io.write_u64(table_offset, block_cluster * CLUSTER_SIZE)
            .unwrap();
        let refcounts = RefCounts::new(io, table_offset, table_clusters);
        for cluster in 0..=block_cluster {
            refcounts.set(cluster, 1).unwrap();
        }
        refcounts
    }

    #[test]
    fn missing_block_reads_zero() {
        let refcounts = seeded_refcounts(1);
        // Cluster 3 is covered by the seeded block but unused.
        assert_eq!(refcounts.get(3).unwrap(), 0);
        // Cluster 2048 falls under a table entry with no block.
        assert_eq!(refcounts.get(2048).unwrap(), 0);
    }

    #[test]
    fn out_of_coverage_rejected() {
        let refcounts = seeded_refcounts(1);
        let over = refcounts.max_clusters();
        match refcounts.get(over) {
            Err(Error::InvalidIndex(c)) if c == over => (),
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn allocate_skips_seeded_metadata() {
        let mut refcounts = seeded_refcounts(1);
        // Clusters 0..=2 hold header, table, and block.
        let first = refcounts.allocate(1).unwrap();
        assert_eq!(first, 3);
        assert_eq!(refcounts.get(3).unwrap(), 1);
        assert_eq!(refcounts.get(4).unwrap(), 0);

        let second = refcounts.allocate(1).unwrap();
        assert_eq!(second, 4);
    }

    #[test]
    fn allocate_grows_missing_block() {
        let mut refcounts = seeded_refcounts(1);
        // Force the scan into a range with no refcount block yet. The new
        // block claims the first free cluster of the range for itself.
        refcounts.free_hint = 2048;
        let idx = refcounts.allocate(1).unwrap();
        assert_eq!(idx, 2049);
        assert_eq!(refcounts.get(2048).unwrap(), 1); // the block
        assert_eq!(refcounts.get(2049).unwrap(), 1); // the allocation
        assert_ne!(refcounts.block_offset(2048).unwrap(), 0);
    }

    #[test]
    fn allocate_run() {
        let mut refcounts = seeded_refcounts(1);
        let first = refcounts.allocate(3).unwrap();
        for cluster in first..first + 3 {
            assert_eq!(refcounts.get(cluster).unwrap(), 1);
        }
    }

    #[test]
    fn allocate_extends_file() {
        let mut refcounts = seeded_refcounts(1);
        let idx = refcounts.allocate(1).unwrap();
        let len = refcounts.io.file().metadata().unwrap().len();
        assert!(len >= (idx + 1) * CLUSTER_SIZE);
    }

    #[test]
    fn decrement_frees_for_reuse() {
        let mut refcounts = seeded_refcounts(1);
        let a = refcounts.allocate(1).unwrap();
        let b = refcounts.allocate(1).unwrap();
        assert_ne!(a, b);
        assert_eq!(refcounts.decrement(a).unwrap(), 0);
        // The freed cluster is handed out again before fresh ones.
        assert_eq!(refcounts.allocate(1).unwrap(), a);
    }

    #[test]
    fn decrement_shared_cluster_keeps_storage() {
        let mut refcounts = seeded_refcounts(1);
        let a = refcounts.allocate(1).unwrap();
        refcounts.set(a, 2).unwrap();
        assert_eq!(refcounts.decrement(a).unwrap(), 1);
        // Still referenced; the scan must not reuse it.
        let b = refcounts.allocate(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn double_free_rejected() {
        let mut refcounts = seeded_refcounts(1);
        let a = refcounts.allocate(1).unwrap();
        refcounts.decrement(a).unwrap();
        match refcounts.decrement(a) {
            Err(Error::DecrementingUnreferenced(c)) if c == a => (),
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn exhaustion_reported() {
        let mut refcounts = seeded_refcounts(1);
        // Shrink the coverage to four clusters; three are already taken by
        // the seeded metadata.
        refcounts.table_entries = 1;
        refcounts.refcount_block_entries = 4;
        refcounts.allocate(1).unwrap();
        match refcounts.allocate(1) {
            Err(Error::NoFreeClusters) => (),
            r => panic!("unexpected result {r:?}"),
        }
    }
}
