// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The guest-facing block device: address translation over the L1/L2
//! mapping tables and copy-on-write cluster materialization.
//!
//! Lookups are stateless. Every table entry is re-read from the image on
//! every call, so externally visible mutations of the backing file take
//! effect immediately and there is no cache to invalidate.

use std::cmp::min;
use std::ops::Range;
use std::sync::RwLock;

use crate::entry::{Entry, Mapping};
use crate::header::Header;
use crate::raw_io::RawIo;
use crate::refcount::RefCounts;
use crate::{Error, Result, TransferError, TransferResult};

/// The two levels of the mapping table tree. Validity rules differ per
/// level: the zero and compressed flags are meaningful at L2 only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Level {
    L1,
    L2,
}

/// Decomposes an arbitrary byte range into per-cluster segments.
struct Splitter {
    cluster_size: u64,
    size: u64,
}

impl Splitter {
    fn new(cluster_size: u64, size: u64) -> Splitter {
        Splitter { cluster_size, size }
    }

    /// Walks `[offset, offset + length)` cluster by cluster, invoking
    /// `op(buffer_range, cluster_index, intra_cluster_offset)` for each
    /// segment. The first and last segment may be partial; the rest are
    /// whole clusters.
    ///
    /// A request reaching past the device size is rejected whole. The walk
    /// stops at the first failing segment; bytes already applied stay
    /// applied, and the error reports how many.
    fn split<F>(&self, length: usize, offset: u64, mut op: F) -> TransferResult
    where
        F: FnMut(Range<usize>, u64, u64) -> Result<()>,
    {
        if offset
            .checked_add(length as u64)
            .map_or(true, |end| end > self.size)
        {
            return Err(TransferError {
                completed: 0,
                source: Error::RequestOutOfRange { offset, length },
            });
        }

        let mut index = offset / self.cluster_size;
        let mut intra = offset % self.cluster_size;
        let mut done = 0;
        while done < length {
            let take = min((self.cluster_size - intra) as usize, length - done);
            if let Err(source) = op(done..done + take, index, intra) {
                return Err(TransferError {
                    completed: done,
                    source,
                });
            }
            done += take;
            index += 1;
            intra = 0;
        }
        Ok(done)
    }
}

/// Exposes the guest-visible contents of a qcow2 image as a flat,
/// randomly addressable byte store.
///
/// Reads run concurrently under a shared lock; the whole
/// read-validate-allocate-rewrite sequence of a write holds the exclusive
/// side, so at most one copy-on-write materialization is in flight per
/// device and no reader ever observes a torn table entry.
#[derive(Debug)]
pub struct GuestDevice {
    state: RwLock<State>,
}

#[derive(Debug)]
enum State {
    Open(GuestInner),
    Closed,
}

#[derive(Debug)]
struct GuestInner {
    header: Header,
    refcounts: RefCounts,
    l1_offset: u64,
    size: u64,
}

impl GuestDevice {
    /// Binds the collaborators into an addressable device. No I/O happens
    /// here beyond what the caller already performed to obtain them.
    pub fn open(header: Header, refcounts: RefCounts, l1_offset: u64, size: u64) -> GuestDevice {
        GuestDevice {
            state: RwLock::new(State::Open(GuestInner {
                header,
                refcounts,
                l1_offset,
                size,
            })),
        }
    }

    /// Reads `buf.len()` bytes starting at guest offset `offset`.
    ///
    /// Unmapped and zero-flagged clusters read back as zeroes. On failure
    /// partway through, the error carries the number of bytes already
    /// filled in.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> TransferResult {
        let state = self.state.read().unwrap();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Err(TransferError::closed()),
        };
        let splitter = Splitter::new(inner.cluster_size(), inner.size);
        splitter.split(buf.len(), offset, |range, index, intra| {
            inner.read_segment(&mut buf[range], index, intra)
        })
    }

    /// Writes `buf` at guest offset `offset`, materializing clusters
    /// copy-on-write as needed.
    ///
    /// Bytes applied before a failure are not rolled back; the error
    /// carries the count. A segment identical to the current contents is
    /// acknowledged without allocating anything, so clusters shared with
    /// snapshots stay shared.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> TransferResult {
        let mut state = self.state.write().unwrap();
        let inner = match &mut *state {
            State::Open(inner) => inner,
            State::Closed => return Err(TransferError::closed()),
        };
        let splitter = Splitter::new(inner.cluster_size(), inner.size);
        splitter.split(buf.len(), offset, |range, index, intra| {
            inner.write_segment(&buf[range], index, intra)
        })
    }

    /// Total addressable size in bytes, constant for the device's lifetime.
    pub fn size(&self) -> Result<u64> {
        match &*self.state.read().unwrap() {
            State::Open(inner) => Ok(inner.size),
            State::Closed => Err(Error::DeviceClosed),
        }
    }

    /// Releases the bound collaborators. Every later operation fails with
    /// [`Error::DeviceClosed`].
    pub fn close(&self) {
        *self.state.write().unwrap() = State::Closed;
    }
}

impl GuestInner {
    fn io(&self) -> &RawIo {
        self.header.raw_io()
    }

    fn cluster_size(&self) -> u64 {
        self.header.cluster_size()
    }

    // Number of entries in one L2 table (and per-table span of one L1
    // entry).
    fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }

    // Byte offset of the L1 slot covering guest cluster `index`.
    fn l1_slot(&self, index: u64) -> u64 {
        self.l1_offset + (index / self.l2_entries()) * 8
    }

    // Byte offset of the L2 slot covering guest cluster `index`, given the
    // L1 entry referencing the L2 table.
    fn l2_slot(&self, l1: Entry, index: u64) -> u64 {
        l1.offset() + (index % self.l2_entries()) * 8
    }

    fn validate_entry(&self, level: Level, entry: Entry) -> Result<()> {
        if level == Level::L2 {
            if entry.is_zero() {
                return Ok(());
            }
            if entry.is_compressed() {
                return Err(Error::CompressedClustersNotSupported);
            }
        }
        if entry.offset() % self.cluster_size() != 0 {
            return Err(Error::MisalignedEntry(entry.raw()));
        }
        Ok(())
    }

    // Reads and validates the table entry at `slot`.
    fn entry_at(&self, level: Level, slot: u64) -> Result<Entry> {
        let raw = self.io().read_u64(slot).map_err(Error::ReadingPointers)?;
        let entry = Entry::from_raw(raw);
        self.validate_entry(level, entry)?;
        Ok(entry)
    }

    // Resolves the L2 entry covering guest cluster `index` without forcing
    // allocation. `None` means the L1 entry is unmapped: the whole L2 table
    // is absent and no further I/O is issued for the lookup.
    fn l2_entry(&self, index: u64) -> Result<Option<Entry>> {
        let l1 = self.entry_at(Level::L1, self.l1_slot(index))?;
        if !l1.has_offset() {
            return Ok(None);
        }
        Ok(Some(self.entry_at(Level::L2, self.l2_slot(l1, index))?))
    }

    // Like `entry_at`, but the returned entry may be written through:
    // a slot that is not exclusively owned is materialized first.
    fn writable_entry_at(&mut self, level: Level, slot: u64) -> Result<Entry> {
        let entry = self.entry_at(level, slot)?;
        if entry.is_writable() {
            return Ok(entry);
        }
        self.materialize(slot, entry)
    }

    // Resolves a writable L2 entry for guest cluster `index`, materializing
    // the L2 table and the data cluster as needed.
    fn writable_l2_entry(&mut self, index: u64) -> Result<Entry> {
        let l1_slot = self.l1_slot(index);
        let l1 = self.writable_entry_at(Level::L1, l1_slot)?;
        let l2_slot = self.l2_slot(l1, index);
        self.writable_entry_at(Level::L2, l2_slot)
    }

    // Replaces the non-writable entry `old` at `slot` with a freshly
    // allocated, exclusively owned cluster carrying the old contents (or
    // zeroes if there were none). The slot is rewritten before the old
    // cluster is dereferenced, so the slot never references a cluster
    // whose refcount has already been released.
    fn materialize(&mut self, slot: u64, old: Entry) -> Result<Entry> {
        let cluster_size = self.cluster_size();
        let index = self
            .refcounts
            .allocate(1)
            .map_err(Error::AllocatingCluster)?;
        let offset = index * cluster_size;

        if old.has_offset() {
            self.io()
                .copy(offset, old.offset(), cluster_size)
                .map_err(Error::WritingData)?;
        } else {
            self.io()
                .fill(offset, cluster_size, 0)
                .map_err(Error::WritingData)?;
        }

        let entry = Entry::exclusive(offset);
        self.io()
            .write_u64(slot, entry.raw())
            .map_err(Error::WritingPointers)?;

        if old.has_offset() {
            self.refcounts
                .decrement(old.offset() / cluster_size)
                .map_err(Error::FreeingCluster)?;
        }
        Ok(entry)
    }

    fn read_segment(&self, buf: &mut [u8], index: u64, intra: u64) -> Result<()> {
        let entry = match self.l2_entry(index)? {
            Some(entry) => entry,
            None => {
                buf.fill(0);
                return Ok(());
            }
        };
        match entry.mapping() {
            Mapping::Backed { offset, .. } => {
                self.io()
                    .read_at(buf, offset + intra)
                    .map_err(Error::ReadingData)?;
            }
            Mapping::Unmapped | Mapping::Zero => buf.fill(0),
        }
        Ok(())
    }

    fn write_segment(&mut self, buf: &[u8], index: u64, intra: u64) -> Result<()> {
        self.header.autoclear()?;

        // Identical contents: acknowledge without touching the mapping, so
        // no allocation happens and shared clusters stay shared.
        let mut current = vec![0u8; buf.len()];
        self.read_segment(&mut current, index, intra)?;
        if current.as_slice() == buf {
            return Ok(());
        }

        let entry = self.writable_l2_entry(index)?;
        self.io()
            .write_at(buf, entry.offset() + intra)
            .map_err(Error::WritingData)?;
        Ok(())
    }
}
