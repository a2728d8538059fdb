// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 header parsing and validation.

use std::fmt::{Display, Formatter, Result as FmtResult};
#[cfg(test)]
use std::io::Write;
use std::io::{self, Cursor};

use bitflags::bitflags;
#[cfg(test)]
use byteorder::WriteBytesExt;
use byteorder::{BigEndian, ReadBytesExt};

use super::util::div_round_up_u64;
use super::{Error, Result};

// QCOW magic constant that starts the header.
pub const QCOW_MAGIC: u32 = 0x5146_49fb;
// Limit clusters to reasonable sizes. Choose the same limits as qemu. Making the clusters smaller
// increases the amount of overhead for book keeping.
pub(super) const MIN_CLUSTER_BITS: u32 = 9;
pub(super) const MAX_CLUSTER_BITS: u32 = 21;
// The L1 table is kept in RAM, only handle files that require less than 35M entries.
// This easily covers 1 TB files.
pub(super) const MAX_RAM_POINTER_TABLE_SIZE: u64 = 35_000_000;
// 16-bit refcounts.
pub(super) const DEFAULT_REFCOUNT_ORDER: u32 = 4;

pub(super) const V2_BARE_HEADER_SIZE: u32 = 72;
pub(super) const V3_BARE_HEADER_SIZE: u32 = 104;

/// Number of bytes read from the start of an image to parse its header and
/// header extensions.
pub(super) const HEADER_READ_SIZE: u64 = 4096;

// Header extension types
const HEADER_EXT_END: u32 = 0x00000000;
// Feature name table
pub(super) const HEADER_EXT_FEATURE_NAME_TABLE: u32 = 0x6803f857;
pub(super) const FEATURE_NAME_ENTRY_SIZE: usize = 1 + 1 + 46; // type + bit + name

// Feature name table entry type incompatible
pub(super) const FEAT_TYPE_INCOMPATIBLE: u8 = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const DATA_FILE = 1 << 2;
        const COMPRESSION = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

impl IncompatFeatures {
    /// Get the fallback name for a known feature bit.
    fn flag_name(bit: u8) -> Option<&'static str> {
        Some(match Self::from_bits_truncate(1u64 << bit) {
            Self::DIRTY => "dirty bit",
            Self::CORRUPT => "corrupt bit",
            Self::DATA_FILE => "external data file",
            Self::COMPRESSION => "compression type",
            Self::EXTENDED_L2 => "extended L2 entries",
            _ => return None,
        })
    }
}

/// Error type for unsupported incompatible features.
#[derive(Debug, Clone, thiserror::Error)]
pub struct MissingFeatureError {
    /// Unsupported feature bits.
    features: IncompatFeatures,
    /// Feature name table from the qcow2 image.
    feature_names: Vec<(u8, String)>,
}

impl MissingFeatureError {
    pub(super) fn new(features: IncompatFeatures, feature_names: Vec<(u8, String)>) -> Self {
        Self {
            features,
            feature_names,
        }
    }

    pub fn features(&self) -> IncompatFeatures {
        self.features
    }
}

impl Display for MissingFeatureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let names: Vec<String> = (0u8..64)
            .filter(|&bit| self.features.bits() & (1u64 << bit) != 0)
            .map(|bit| {
                // First try the image's feature name table
                self.feature_names
                    .iter()
                    .find(|(b, _)| *b == bit)
                    .map(|(_, name)| name.clone())
                    // Then try hardcoded fallback names
                    .or_else(|| IncompatFeatures::flag_name(bit).map(|s| s.to_string()))
                    // Finally, use generic description
                    .unwrap_or_else(|| format!("unknown feature bit {bit}"))
            })
            .collect();
        write!(f, "Missing features: {}", names.join(", "))
    }
}

/// Contains the information from the header of a qcow file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QcowHeader {
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

impl QcowHeader {
    /// Parses a header from the first bytes of an image.
    ///
    /// Only the layout is checked here: the magic, the version and that
    /// `bytes` holds the whole header. Use [`QcowHeader::validate`] to check
    /// the image can be served.
    pub fn new(bytes: &[u8]) -> Result<QcowHeader> {
        let mut f = Cursor::new(bytes);
        let truncated = |_: io::Error| Error::HeaderTruncated(bytes.len());

        // Reads the next u32 from the header.
        fn read_u32_be(f: &mut Cursor<&[u8]>) -> io::Result<u32> {
            f.read_u32::<BigEndian>()
        }

        // Reads the next u64 from the header.
        fn read_u64_be(f: &mut Cursor<&[u8]>) -> io::Result<u64> {
            f.read_u64::<BigEndian>()
        }

        let magic = read_u32_be(&mut f).map_err(truncated)?;
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let version = read_u32_be(&mut f).map_err(truncated)?;
        if version != 2 && version != 3 {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut header = QcowHeader {
            magic,
            version,
            backing_file_offset: read_u64_be(&mut f).map_err(truncated)?,
            backing_file_size: read_u32_be(&mut f).map_err(truncated)?,
            cluster_bits: read_u32_be(&mut f).map_err(truncated)?,
            size: read_u64_be(&mut f).map_err(truncated)?,
            crypt_method: read_u32_be(&mut f).map_err(truncated)?,
            l1_size: read_u32_be(&mut f).map_err(truncated)?,
            l1_table_offset: read_u64_be(&mut f).map_err(truncated)?,
            refcount_table_offset: read_u64_be(&mut f).map_err(truncated)?,
            refcount_table_clusters: read_u32_be(&mut f).map_err(truncated)?,
            nb_snapshots: read_u32_be(&mut f).map_err(truncated)?,
            snapshots_offset: read_u64_be(&mut f).map_err(truncated)?,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size: V2_BARE_HEADER_SIZE,
        };

        if version == 3 {
            header.incompatible_features = read_u64_be(&mut f).map_err(truncated)?;
            header.compatible_features = read_u64_be(&mut f).map_err(truncated)?;
            header.autoclear_features = read_u64_be(&mut f).map_err(truncated)?;
            header.refcount_order = read_u32_be(&mut f).map_err(truncated)?;
            header.header_size = read_u32_be(&mut f).map_err(truncated)?;
        }

        Ok(header)
    }

    /// Checks that the image described by this header can be served.
    ///
    /// `bytes` are the first bytes of the image, used to look up the names
    /// of unsupported features in the header extensions.
    pub fn validate(&self, bytes: &[u8]) -> Result<()> {
        if self.version == 3 && self.header_size < V3_BARE_HEADER_SIZE {
            return Err(Error::InvalidHeaderLength(self.header_size));
        }

        let features = IncompatFeatures::from_bits_retain(self.incompatible_features);
        if !features.is_empty() {
            let feature_names = self.feature_names(bytes);
            return Err(Error::UnsupportedFeatures(MissingFeatureError::new(
                features,
                feature_names,
            )));
        }

        if self.crypt_method != 0 {
            return Err(Error::EncryptionUnsupported(self.crypt_method));
        }
        if self.backing_file_offset != 0 {
            return Err(Error::BackingFileUnsupported);
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterBits(self.cluster_bits));
        }
        offset_is_cluster_boundary(self.l1_table_offset, self.cluster_bits)
            .map_err(|_| Error::InvalidL1TableOffset(self.l1_table_offset))?;

        if self.nb_snapshots != 0 {
            debug!(
                "Ignoring {} internal snapshots, serving the active image",
                self.nb_snapshots
            );
        }
        Ok(())
    }

    /// Collects the incompatible feature names declared in the header
    /// extensions found in `bytes`. Extensions past the end of `bytes` are
    /// ignored.
    fn feature_names(&self, bytes: &[u8]) -> Vec<(u8, String)> {
        let mut names = Vec::new();
        if self.version != 3 {
            return names;
        }

        let mut f = Cursor::new(bytes);
        f.set_position(u64::from(self.header_size));
        loop {
            let Ok(ext_type) = f.read_u32::<BigEndian>() else {
                break;
            };
            if ext_type == HEADER_EXT_END {
                break;
            }
            let Ok(ext_length) = f.read_u32::<BigEndian>() else {
                break;
            };

            let start = f.position() as usize;
            let Some(data) = start
                .checked_add(ext_length as usize)
                .and_then(|end| bytes.get(start..end))
            else {
                break;
            };

            if ext_type == HEADER_EXT_FEATURE_NAME_TABLE {
                for entry in data.chunks_exact(FEATURE_NAME_ENTRY_SIZE) {
                    if entry[0] == FEAT_TYPE_INCOMPATIBLE {
                        let name_bytes = &entry[2..];
                        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(46);
                        let name = String::from_utf8_lossy(&name_bytes[..name_len]).to_string();
                        names.push((entry[1], name));
                    }
                }
            }

            // Skip to the next 8 byte boundary
            let padded = div_round_up_u64(u64::from(ext_length), 8) * 8;
            f.set_position(start as u64 + padded);
        }
        names
    }

    pub fn cluster_size(&self) -> u64 {
        0x01u64 << self.cluster_bits
    }

    /// Builds the header of an image of `size` bytes whose L1 table sits in
    /// the cluster following the header.
    #[cfg(test)]
    pub fn create_for_size(version: u32, cluster_bits: u32, size: u64) -> QcowHeader {
        let cluster_size = 0x01u64 << cluster_bits;
        // L2 blocks are always one cluster long. They contain cluster_size/sizeof(u64) addresses.
        let entries_per_cluster = cluster_size / 8;
        let num_clusters = div_round_up_u64(size, cluster_size);
        let num_l2_clusters = div_round_up_u64(num_clusters, entries_per_cluster);
        let l1_clusters = div_round_up_u64(num_l2_clusters, entries_per_cluster);
        QcowHeader {
            magic: QCOW_MAGIC,
            version,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: num_l2_clusters as u32,
            l1_table_offset: cluster_size,
            // The refcount table is after l1 + header.
            refcount_table_offset: cluster_size * (l1_clusters + 1),
            refcount_table_clusters: 1,
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

    /// Write the header to `file`, followed for v3 by an empty header
    /// extension area.
    #[cfg(test)]
    pub fn write_to<F: Write>(&self, file: &mut F) -> io::Result<()> {
        file.write_u32::<BigEndian>(self.magic)?;
        file.write_u32::<BigEndian>(self.version)?;
        file.write_u64::<BigEndian>(self.backing_file_offset)?;
        file.write_u32::<BigEndian>(self.backing_file_size)?;
        file.write_u32::<BigEndian>(self.cluster_bits)?;
        file.write_u64::<BigEndian>(self.size)?;
        file.write_u32::<BigEndian>(self.crypt_method)?;
        file.write_u32::<BigEndian>(self.l1_size)?;
        file.write_u64::<BigEndian>(self.l1_table_offset)?;
        file.write_u64::<BigEndian>(self.refcount_table_offset)?;
        file.write_u32::<BigEndian>(self.refcount_table_clusters)?;
        file.write_u32::<BigEndian>(self.nb_snapshots)?;
        file.write_u64::<BigEndian>(self.snapshots_offset)?;

        if self.version == 3 {
            file.write_u64::<BigEndian>(self.incompatible_features)?;
            file.write_u64::<BigEndian>(self.compatible_features)?;
            file.write_u64::<BigEndian>(self.autoclear_features)?;
            file.write_u32::<BigEndian>(self.refcount_order)?;
            file.write_u32::<BigEndian>(self.header_size)?;
            file.write_u32::<BigEndian>(HEADER_EXT_END)?; // header extension type: end of header extension area
            file.write_u32::<BigEndian>(0)?; // length of header extension data: 0
        }
        Ok(())
    }
}

/// Returns an Error if the given offset doesn't align to a cluster boundary.
pub(super) fn offset_is_cluster_boundary(offset: u64, cluster_bits: u32) -> Result<()> {
    if offset & ((0x01 << cluster_bits) - 1) != 0 {
        return Err(Error::UnalignedClusterOffset(offset));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;

    fn valid_header_v3() -> Vec<u8> {
        vec![
            0x51u8, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x03, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x10, // cluster_bits
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, // size
            0x00, 0x00, 0x00, 0x00, // crypt method
            0x00, 0x00, 0x01, 0x00, // L1 size
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // L1 table offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, // refcount table offset
            0x00, 0x00, 0x00, 0x03, // refcount table clusters
            0x00, 0x00, 0x00, 0x00, // nb snapshots
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // snapshots offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // incompatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // compatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // autoclear_features
            0x00, 0x00, 0x00, 0x04, // refcount_order
            0x00, 0x00, 0x00, 0x68, // header_length
        ]
    }

    fn valid_header_v2() -> Vec<u8> {
        let mut header = valid_header_v3();
        header[7] = 2;
        header.truncate(V2_BARE_HEADER_SIZE as usize);
        header
    }

    #[test]
    fn parse_v3() {
        let header = QcowHeader::new(&valid_header_v3()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.cluster_size(), 0x10000);
        assert_eq!(header.size, 0x10);
        assert_eq!(header.l1_size, 0x100);
        assert_eq!(header.l1_table_offset, 0x40000);
        assert_eq!(header.header_size, V3_BARE_HEADER_SIZE);
        header.validate(&valid_header_v3()).unwrap();
    }

    #[test]
    fn parse_v2_uses_defaults() {
        let bytes = valid_header_v2();
        let header = QcowHeader::new(&bytes).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.incompatible_features, 0);
        assert_eq!(header.refcount_order, DEFAULT_REFCOUNT_ORDER);
        assert_eq!(header.header_size, V2_BARE_HEADER_SIZE);
        header.validate(&bytes).unwrap();
    }

    #[test]
    fn invalid_magic() {
        let mut bytes = valid_header_v3();
        bytes[0] = 0x00;
        let err = QcowHeader::new(&bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic(_)));
        assert_eq!(err.status(), Status::WrongType);
    }

    #[test]
    fn unsupported_version() {
        let mut bytes = valid_header_v3();
        bytes[7] = 4;
        let err = QcowHeader::new(&bytes).unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
    }

    #[test]
    fn truncated() {
        let bytes = valid_header_v3();
        let err = QcowHeader::new(&bytes[..80]).unwrap_err();
        assert!(matches!(err, Error::HeaderTruncated(80)));
        // A v2 header does not need the v3 fields.
        QcowHeader::new(&valid_header_v2()).unwrap();
    }

    #[test]
    fn rejects_incompatible_features() {
        let mut bytes = valid_header_v3();
        bytes[79] = 0x05; // dirty | external data file
        let header = QcowHeader::new(&bytes).unwrap();
        let err = header.validate(&bytes).unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
        let Error::UnsupportedFeatures(missing) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(
            missing.features(),
            IncompatFeatures::DIRTY | IncompatFeatures::DATA_FILE
        );
        assert_eq!(
            missing.to_string(),
            "Missing features: dirty bit, external data file"
        );
    }

    #[test]
    fn feature_names_from_extension() {
        let mut bytes = valid_header_v3();
        bytes[79] = 0x20; // bit 5, unknown to us
        bytes.extend_from_slice(&HEADER_EXT_FEATURE_NAME_TABLE.to_be_bytes());
        bytes.extend_from_slice(&(FEATURE_NAME_ENTRY_SIZE as u32).to_be_bytes());
        let mut entry = vec![0u8; FEATURE_NAME_ENTRY_SIZE];
        entry[0] = FEAT_TYPE_INCOMPATIBLE;
        entry[1] = 5;
        entry[2..9].copy_from_slice(b"shiny42");
        bytes.extend_from_slice(&entry);
        bytes.extend_from_slice(&[0u8; 8]); // end of header extension area

        let header = QcowHeader::new(&bytes).unwrap();
        let err = header.validate(&bytes).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported incompatible features");
        let Error::UnsupportedFeatures(missing) = err else {
            panic!("unexpected error");
        };
        assert_eq!(missing.to_string(), "Missing features: shiny42");
    }

    #[test]
    fn rejects_unsupported_images() {
        let check = |offset: usize, value: u8, status: Status| {
            let mut bytes = valid_header_v3();
            bytes[offset] = value;
            let header = QcowHeader::new(&bytes).unwrap();
            assert_eq!(header.validate(&bytes).unwrap_err().status(), status);
        };
        // crypt_method
        check(35, 1, Status::NotSupported);
        // backing file offset
        check(15, 0x80, Status::NotSupported);
        // cluster_bits
        check(23, 8, Status::InvalidArgs);
        check(23, 22, Status::InvalidArgs);
        // L1 table offset not cluster aligned
        check(47, 0x02, Status::InvalidArgs);
        // v3 header_length shorter than the v3 header
        check(103, 0x48, Status::InvalidArgs);
    }

    #[test]
    fn create_and_write() {
        let header = QcowHeader::create_for_size(3, 16, 0x8000_0000);
        assert_eq!(header.l1_size, 4);
        assert_eq!(header.l1_table_offset, 0x10000);

        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), V3_BARE_HEADER_SIZE as usize + 8);
        let parsed = QcowHeader::new(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.validate(&bytes).unwrap();
    }
}
