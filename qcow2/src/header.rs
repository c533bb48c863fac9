// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The qcow2 image header and the format-level bookkeeping tied to it.

use std::fs::File;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};

use crate::raw_io::RawIo;
use crate::{div_round_up_u64, Error, Result};

/// QCOW magic constant that starts the header.
const QCOW_MAGIC: u32 = 0x5146_49fb;
/// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS.
const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to the same range qemu accepts.
const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;
// Maximum virtual disk size supported, 16 TB.
const MAX_QCOW_FILE_SIZE: u64 = 0x01 << 44;
// Only 2 byte refcounts are supported, 2^refcount_order bits.
const DEFAULT_REFCOUNT_ORDER: u32 = 4;

const V2_BARE_HEADER_SIZE: u32 = 72;
const V3_BARE_HEADER_SIZE: u32 = 104;

// Incompatible feature bits. An image with the dirty or corrupt bit set may
// still be read; mutating it in place is refused.
const INCOMPATIBLE_FEATURES_DIRTY: u64 = 1;
const INCOMPATIBLE_FEATURES_CORRUPT: u64 = 1 << 1;
const INCOMPATIBLE_FEATURES_KNOWN: u64 =
    INCOMPATIBLE_FEATURES_DIRTY | INCOMPATIBLE_FEATURES_CORRUPT;

/// Contains the information from the header of a qcow file, bound to the
/// image's raw I/O handle.
#[derive(Debug)]
pub struct Header {
    io: RawIo,
    autocleared: bool,

    pub magic: u32,
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    // v3 entries
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_size: u32,
}

/// The numeric header fields, parsed but not yet validated or bound to an
/// I/O handle.
struct Fields {
    magic: u32,
    version: u32,
    backing_file_offset: u64,
    backing_file_size: u32,
    cluster_bits: u32,
    size: u64,
    crypt_method: u32,
    l1_size: u32,
    l1_table_offset: u64,
    refcount_table_offset: u64,
    refcount_table_clusters: u32,
    nb_snapshots: u32,
    snapshots_offset: u64,
    incompatible_features: u64,
    compatible_features: u64,
    autoclear_features: u64,
    refcount_order: u32,
    header_size: u32,
}

impl Fields {
    fn parse(file: &File) -> Result<Fields> {
        let mut buf = [0u8; V2_BARE_HEADER_SIZE as usize];
        file.read_exact_at(&mut buf, 0).map_err(Error::ReadingHeader)?;

        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = BigEndian::read_u32(&buf[4..8]);

        // The v3 extension fields; v2 (and the v1 rejected later) get the
        // fixed defaults.
        let (incompatible_features, compatible_features, autoclear_features, refcount_order, header_size) =
            if version <= 2 {
                (0, 0, 0, DEFAULT_REFCOUNT_ORDER, V2_BARE_HEADER_SIZE)
            } else {
                let mut ext = [0u8; (V3_BARE_HEADER_SIZE - V2_BARE_HEADER_SIZE) as usize];
                file.read_exact_at(&mut ext, u64::from(V2_BARE_HEADER_SIZE))
                    .map_err(Error::ReadingHeader)?;
                (
                    BigEndian::read_u64(&ext[0..8]),
                    BigEndian::read_u64(&ext[8..16]),
                    BigEndian::read_u64(&ext[16..24]),
                    BigEndian::read_u32(&ext[24..28]),
                    BigEndian::read_u32(&ext[28..32]),
                )
            };

        Ok(Fields {
            magic,
            version,
            backing_file_offset: BigEndian::read_u64(&buf[8..16]),
            backing_file_size: BigEndian::read_u32(&buf[16..20]),
            cluster_bits: BigEndian::read_u32(&buf[20..24]),
            size: BigEndian::read_u64(&buf[24..32]),
            crypt_method: BigEndian::read_u32(&buf[32..36]),
            l1_size: BigEndian::read_u32(&buf[36..40]),
            l1_table_offset: BigEndian::read_u64(&buf[40..48]),
            refcount_table_offset: BigEndian::read_u64(&buf[48..56]),
            refcount_table_clusters: BigEndian::read_u32(&buf[56..60]),
            nb_snapshots: BigEndian::read_u32(&buf[60..64]),
            snapshots_offset: BigEndian::read_u64(&buf[64..72]),
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_size,
        })
    }

    fn validate(&self) -> Result<()> {
        // Only v2 and v3 files are supported.
        if self.version != 2 && self.version != 3 {
            return Err(Error::UnsupportedVersion(self.version));
        }

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterSize);
        }
        let cluster_size = 0x01u64 << self.cluster_bits;

        // Limit the total size of the disk.
        if self.size > MAX_QCOW_FILE_SIZE {
            return Err(Error::FileTooBig(self.size));
        }

        // No support for backing files or encryption.
        if self.backing_file_offset != 0 {
            return Err(Error::BackingFilesNotSupported);
        }
        if self.crypt_method != 0 {
            return Err(Error::EncryptedImagesNotSupported);
        }

        // Only support two byte refcounts.
        let refcount_bits = 0x01u64
            .checked_shl(self.refcount_order)
            .ok_or(Error::UnsupportedRefcountOrder)?;
        if refcount_bits != 16 {
            return Err(Error::UnsupportedRefcountOrder);
        }

        // Need at least one refcount cluster.
        if self.refcount_table_clusters == 0 {
            return Err(Error::NoRefcountClusters);
        }

        offset_is_cluster_boundary(self.l1_table_offset, self.cluster_bits)?;
        offset_is_cluster_boundary(self.refcount_table_offset, self.cluster_bits)?;
        offset_is_cluster_boundary(self.snapshots_offset, self.cluster_bits)?;

        // Every guest offset up to size - 1 must map to a valid L1 slot.
        let l2_entries = cluster_size / 8;
        let num_clusters = div_round_up_u64(self.size, cluster_size);
        let required_l1 = div_round_up_u64(num_clusters, l2_entries);
        if u64::from(self.l1_size) < required_l1 {
            return Err(Error::InvalidL1TableSize(self.l1_size));
        }

        // The tables must fit in a 64 bit address space.
        self.l1_table_offset
            .checked_add(u64::from(self.l1_size) * 8)
            .ok_or(Error::InvalidL1TableOffset)?;
        self.refcount_table_offset
            .checked_add(u64::from(self.refcount_table_clusters) * cluster_size)
            .ok_or(Error::InvalidRefcountTableOffset)?;

        // Unknown incompatible features make the image unsafe to interpret
        // at all; the dirty/corrupt bits are checked before mutation.
        if self.incompatible_features & !INCOMPATIBLE_FEATURES_KNOWN != 0 {
            return Err(Error::UnknownIncompatibleFeatures(
                self.incompatible_features & !INCOMPATIBLE_FEATURES_KNOWN,
            ));
        }

        Ok(())
    }

    /// Create header fields for a fresh image of the given virtual `size`.
    fn create_for_size(version: u32, size: u64) -> Fields {
        let cluster_bits = DEFAULT_CLUSTER_BITS;
        let cluster_size = 0x01u64 << cluster_bits;
        // L2 tables are always one cluster long, holding cluster_size / 8
        // entries each.
        let l2_entries = cluster_size / 8;
        let num_clusters = div_round_up_u64(size, cluster_size);
        let num_l2_clusters = div_round_up_u64(num_clusters, l2_entries);
        let l1_clusters = div_round_up_u64(num_l2_clusters * 8, cluster_size);
        // The header and its extensions always fit in the first cluster.
        let header_clusters = 1;
        Fields {
            magic: QCOW_MAGIC,
            version,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: num_l2_clusters as u32,
            l1_table_offset: cluster_size,
            // The refcount table follows the header and L1 clusters.
            refcount_table_offset: cluster_size * (l1_clusters + 1),
            refcount_table_clusters: {
                // Pre-allocate enough contiguous table clusters to refcount
                // every cluster the image can grow to, including the
                // refcount structures themselves.
                let max_refcount_clusters = max_refcount_clusters(
                    cluster_size,
                    num_clusters + l1_clusters + num_l2_clusters + header_clusters,
                );
                div_round_up_u64(max_refcount_clusters * 8, cluster_size) as u32
            },
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size: if version == 2 {
                V2_BARE_HEADER_SIZE
            } else {
                V3_BARE_HEADER_SIZE
            },
        }
    }
}

impl Header {
    /// Reads and validates the header of an existing image, binding the
    /// file for cluster-granular access.
    pub fn open(file: File) -> Result<Header> {
        let fields = Fields::parse(&file)?;
        fields.validate()?;
        let cluster_size = 0x01u64 << fields.cluster_bits;
        let io = RawIo::new(file, cluster_size).ok_or(Error::InvalidClusterSize)?;
        Ok(Header::bind(fields, io))
    }

    /// Lays out the header for a fresh image of the given virtual size and
    /// writes it to `file`. The caller still has to initialize the L1 and
    /// refcount structures the new header points at.
    pub(crate) fn create(file: File, version: u32, virtual_size: u64) -> Result<Header> {
        let fields = Fields::create_for_size(version, virtual_size);
        fields.validate()?;
        let cluster_size = 0x01u64 << fields.cluster_bits;
        let io = RawIo::new(file, cluster_size).ok_or(Error::InvalidClusterSize)?;
        let header = Header::bind(fields, io);
        header.write_to()?;
        Ok(header)
    }

    fn bind(fields: Fields, io: RawIo) -> Header {
        Header {
            io,
            autocleared: false,
            magic: fields.magic,
            version: fields.version,
            backing_file_offset: fields.backing_file_offset,
            backing_file_size: fields.backing_file_size,
            cluster_bits: fields.cluster_bits,
            size: fields.size,
            crypt_method: fields.crypt_method,
            l1_size: fields.l1_size,
            l1_table_offset: fields.l1_table_offset,
            refcount_table_offset: fields.refcount_table_offset,
            refcount_table_clusters: fields.refcount_table_clusters,
            nb_snapshots: fields.nb_snapshots,
            snapshots_offset: fields.snapshots_offset,
            incompatible_features: fields.incompatible_features,
            compatible_features: fields.compatible_features,
            autoclear_features: fields.autoclear_features,
            refcount_order: fields.refcount_order,
            header_size: fields.header_size,
        }
    }

    pub fn cluster_size(&self) -> u64 {
        0x01u64 << self.cluster_bits
    }

    /// The positioned I/O handle shared by every component operating on
    /// this image.
    pub fn raw_io(&self) -> &RawIo {
        &self.io
    }

    /// Format-level bookkeeping before the first mutating operation: clears
    /// the autoclear feature bitmap on disk and refuses images whose
    /// incompatible features rule out in-place modification. A no-op after
    /// the first successful call.
    pub fn autoclear(&mut self) -> Result<()> {
        if self.autocleared {
            return Ok(());
        }
        if self.incompatible_features & INCOMPATIBLE_FEATURES_CORRUPT != 0 {
            return Err(Error::ImageCorrupt);
        }
        if self.incompatible_features & INCOMPATIBLE_FEATURES_DIRTY != 0 {
            return Err(Error::ImageDirty);
        }
        if self.autoclear_features != 0 {
            self.autoclear_features = 0;
            self.write_to()?;
        }
        self.autocleared = true;
        Ok(())
    }

    /// Writes the header back to the image file.
    fn write_to(&self) -> Result<()> {
        let mut buf = [0u8; V3_BARE_HEADER_SIZE as usize];
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.version);
        BigEndian::write_u64(&mut buf[8..16], self.backing_file_offset);
        BigEndian::write_u32(&mut buf[16..20], self.backing_file_size);
        BigEndian::write_u32(&mut buf[20..24], self.cluster_bits);
        BigEndian::write_u64(&mut buf[24..32], self.size);
        BigEndian::write_u32(&mut buf[32..36], self.crypt_method);
        BigEndian::write_u32(&mut buf[36..40], self.l1_size);
        BigEndian::write_u64(&mut buf[40..48], self.l1_table_offset);
        BigEndian::write_u64(&mut buf[48..56], self.refcount_table_offset);
        BigEndian::write_u32(&mut buf[56..60], self.refcount_table_clusters);
        BigEndian::write_u32(&mut buf[60..64], self.nb_snapshots);
        BigEndian::write_u64(&mut buf[64..72], self.snapshots_offset);
        let len = if self.version == 2 {
            V2_BARE_HEADER_SIZE as usize
        } else {
            BigEndian::write_u64(&mut buf[72..80], self.incompatible_features);
            BigEndian::write_u64(&mut buf[80..88], self.compatible_features);
            BigEndian::write_u64(&mut buf[88..96], self.autoclear_features);
            BigEndian::write_u32(&mut buf[96..100], self.refcount_order);
            BigEndian::write_u32(&mut buf[100..104], self.header_size);
            V3_BARE_HEADER_SIZE as usize
        };
        self.io
            .write_at(&buf[..len], 0)
            .map_err(Error::WritingHeader)?;
        Ok(())
    }
}

// Returns an error if the given offset doesn't align to a cluster boundary.
fn offset_is_cluster_boundary(offset: u64, cluster_bits: u32) -> Result<()> {
    if offset & ((0x01 << cluster_bits) - 1) != 0 {
        return Err(Error::InvalidOffset(offset));
    }
    Ok(())
}

fn max_refcount_clusters(cluster_size: u64, num_clusters: u64) -> u64 {
    // Two bytes per refcount.
    let for_data = div_round_up_u64(num_clusters * 2, cluster_size);
    let for_refcounts = div_round_up_u64(for_data * 2, cluster_size);
    for_data + for_refcounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    fn valid_header_v3() -> Vec<u8> {
        vec![
            0x51u8, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x03, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x10, // cluster_bits
            0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, // size
            0x00, 0x00, 0x00, 0x00, // crypt method
            0x00, 0x00, 0x01, 0x00, // L1 size
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // L1 table offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, // refcount table offset
            0x00, 0x00, 0x00, 0x03, // refcount table clusters
            0x00, 0x00, 0x00, 0x00, // nb snapshots
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // snapshots offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // incompatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // compatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // autoclear_features
            0x00, 0x00, 0x00, 0x04, // refcount_order
            0x00, 0x00, 0x00, 0x68, // header_length
        ]
    }

    fn valid_header_v2() -> Vec<u8> {
        vec![
            0x51u8, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x02, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x10, // cluster_bits
            0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, // size
            0x00, 0x00, 0x00, 0x00, // crypt method
            0x00, 0x00, 0x01, 0x00, // L1 size
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // L1 table offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, // refcount table offset
            0x00, 0x00, 0x00, 0x03, // refcount table clusters
            0x00, 0x00, 0x00, 0x00, // nb snapshots
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // snapshots offset
        ]
    }

    fn with_header_file<F>(header: &[u8], testfn: F)
    where
        F: FnOnce(File),
    {
        let file = TempFile::new().unwrap().into_file();
        file.write_all_at(header, 0).unwrap();
        testfn(file);
    }

    #[test]
    fn header_read() {
        with_header_file(&valid_header_v2(), |file| {
            let header = Header::open(file).expect("failed to read header");
            assert_eq!(header.version, 2);
            assert_eq!(header.refcount_order, DEFAULT_REFCOUNT_ORDER);
            assert_eq!(header.header_size, V2_BARE_HEADER_SIZE);
            assert_eq!(header.cluster_size(), 65536);
        });
        with_header_file(&valid_header_v3(), |file| {
            let header = Header::open(file).expect("failed to read header");
            assert_eq!(header.version, 3);
            assert_eq!(header.size, 0x20_0000_0000);
            assert_eq!(header.header_size, V3_BARE_HEADER_SIZE);
        });
    }

    #[test]
    fn invalid_magic() {
        let mut header = valid_header_v3();
        header[2] = 0x4a;
        with_header_file(&header, |file| {
            Header::open(file).expect_err("invalid magic worked");
        });
    }

    #[test]
    fn invalid_cluster_bits() {
        let mut header = valid_header_v3();
        header[23] = 3;
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::InvalidClusterSize) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn unsupported_version() {
        let mut header = valid_header_v3();
        header[7] = 4;
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::UnsupportedVersion(4)) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn backing_file_rejected() {
        let mut header = valid_header_v3();
        header[15] = 0x68;
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::BackingFilesNotSupported) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn encryption_rejected() {
        let mut header = valid_header_v3();
        header[35] = 1;
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::EncryptedImagesNotSupported) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn undersized_l1_rejected() {
        let mut header = valid_header_v3();
        // 128 GB disk needs 256 L1 entries at 64k clusters.
        header[36..40].copy_from_slice(&[0x00, 0x00, 0x00, 0xff]);
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::InvalidL1TableSize(0xff)) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn unknown_incompatible_features_rejected() {
        let mut header = valid_header_v3();
        header[79] = 0x04;
        with_header_file(&header, |file| {
            match Header::open(file) {
                Err(Error::UnknownIncompatibleFeatures(0x04)) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn corrupt_image_blocks_autoclear() {
        let mut header = valid_header_v3();
        header[79] = 0x02;
        with_header_file(&header, |file| {
            let mut h = Header::open(file).expect("corrupt image should still open");
            match h.autoclear() {
                Err(Error::ImageCorrupt) => (),
                r => panic!("unexpected result {r:?}"),
            };
        });
    }

    #[test]
    fn autoclear_rewrites_features() {
        let mut header = valid_header_v3();
        header[95] = 0x01; // autoclear feature bit 0
        with_header_file(&header, |file| {
            let reread = file.try_clone().unwrap();
            let mut h = Header::open(file).unwrap();
            assert_eq!(h.autoclear_features, 1);
            h.autoclear().expect("autoclear failed");
            // A second call is a no-op.
            h.autoclear().expect("autoclear failed");
            let h2 = Header::open(reread).unwrap();
            assert_eq!(h2.autoclear_features, 0);
        });
    }

    #[test]
    fn create_then_reopen() {
        let file = TempFile::new().unwrap().into_file();
        let reread = file.try_clone().unwrap();
        let created = Header::create(file, 3, 0x200_0000).expect("failed to create header");
        let reopened = Header::open(reread).expect("failed to reopen");
        assert_eq!(reopened.version, 3);
        assert_eq!(reopened.size, created.size);
        assert_eq!(reopened.l1_table_offset, created.l1_table_offset);
        assert_eq!(reopened.refcount_table_offset, created.refcount_table_offset);
        assert_ne!(reopened.refcount_table_clusters, 0);
    }
}
