// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Codec for the 64 bit entries stored in the L1 and L2 mapping tables.
//!
//! Pure bit decoding; validation and I/O belong to the table walker in
//! [`crate::guest`].

// Bit 63: the cluster is owned exclusively by this image and may be
// rewritten in place.
const EXCLUSIVE_FLAG: u64 = 1 << 63;
// Bit 62: the cluster is stored compressed. Meaningful at L2 only.
const COMPRESSED_FLAG: u64 = 1 << 62;
// Bit 0: the cluster reads as zeroes and has no backing storage. L2 only.
const ZERO_FLAG: u64 = 1;
// Bits 9-55 hold the host offset of the referenced cluster; bits 1-8 and
// 56-61 are reserved.
const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

/// Decoded state of a mapping entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mapping {
    /// No backing storage. An unmapped L1 entry means the whole L2 table it
    /// would reference is absent.
    Unmapped,
    /// Reads back as zeroes without backing storage (L2 only).
    Zero,
    /// Backed by the host cluster at `offset`.
    Backed { offset: u64, exclusive: bool },
}

/// A raw L1/L2 table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry(u64);

impl Entry {
    pub fn from_raw(raw: u64) -> Entry {
        Entry(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Encodes an entry referencing `offset` with the exclusive bit set and
    /// the compressed/zero bits clear.
    pub fn exclusive(offset: u64) -> Entry {
        Entry(offset | EXCLUSIVE_FLAG)
    }

    pub fn is_compressed(self) -> bool {
        self.0 & COMPRESSED_FLAG != 0
    }

    /// Zero-cluster flag. Meaningful for L2 entries only.
    pub fn is_zero(self) -> bool {
        self.0 & ZERO_FLAG != 0
    }

    /// Host offset of the referenced cluster with all flag bits masked out.
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// True iff the entry references backing storage. An entry with offset
    /// zero and no zero flag is unmapped.
    pub fn has_offset(self) -> bool {
        !self.is_zero() && self.offset() != 0
    }

    pub fn is_exclusive(self) -> bool {
        self.0 & EXCLUSIVE_FLAG != 0
    }

    /// True iff the referenced cluster may be overwritten in place.
    pub fn is_writable(self) -> bool {
        self.has_offset() && self.is_exclusive()
    }

    pub fn mapping(self) -> Mapping {
        if self.is_zero() {
            Mapping::Zero
        } else if self.offset() == 0 {
            Mapping::Unmapped
        } else {
            Mapping::Backed {
                offset: self.offset(),
                exclusive: self.is_exclusive(),
            }
        }
    }
}
