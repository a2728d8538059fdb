// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! In-memory QCOW2 images for tests.

use super::header::QcowHeader;
use super::util::{l1_entry_make, l2_entry_make_std};

/// A QCOW2 image built cluster by cluster: the header in cluster 0 and the
/// L1 table starting at cluster 1.
pub struct TestImage {
    header: QcowHeader,
    data: Vec<u8>,
}

impl TestImage {
    pub fn new(cluster_bits: u32, size: u64) -> Self {
        let header = QcowHeader::create_for_size(3, cluster_bits, size);
        let mut image = TestImage {
            data: vec![0u8; 2 * header.cluster_size() as usize],
            header,
        };
        image.write_header();
        image
    }

    /// Image of 2 GiB with 64 KiB clusters, four L2 tables at clusters 3, 5,
    /// 7 and 9, and the first cluster of the disk mapped to data cluster 21
    /// filled with 0xab.
    pub fn end_to_end() -> Self {
        let mut image = TestImage::new(16, 2 << 30);
        for (l1_index, l2_cluster) in [3, 5, 7, 9].into_iter().enumerate() {
            image.set_l1_entry(l1_index as u64, l2_cluster);
        }
        image.map_cluster(3, 0, 21);
        image.fill_cluster(21, 0xab);
        image
    }

    pub fn header(&self) -> &QcowHeader {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn cluster_size(&self) -> u64 {
        self.header.cluster_size()
    }

    pub fn update_header(&mut self, f: impl FnOnce(&mut QcowHeader)) {
        f(&mut self.header);
        self.write_header();
    }

    fn write_header(&mut self) {
        let mut bytes = Vec::new();
        self.header.write_to(&mut bytes).unwrap();
        self.data[..bytes.len()].copy_from_slice(&bytes);
    }

    fn ensure_len(&mut self, len: u64) {
        if self.data.len() < len as usize {
            self.data.resize(len as usize, 0);
        }
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) {
        self.ensure_len(offset + 8);
        let offset = offset as usize;
        self.data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    /// Points L1 entry `l1_index` at an L2 table in cluster `l2_cluster`.
    pub fn set_l1_entry(&mut self, l1_index: u64, l2_cluster: u64) {
        let cluster_size = self.cluster_size();
        self.ensure_len((l2_cluster + 1) * cluster_size);
        let offset = self.header.l1_table_offset + 8 * l1_index;
        self.write_u64(offset, l1_entry_make(l2_cluster * cluster_size));
    }

    /// Stores a raw `entry` at `l2_index` of the L2 table in cluster `l2_cluster`.
    pub fn set_l2_entry(&mut self, l2_cluster: u64, l2_index: u64, entry: u64) {
        let offset = l2_cluster * self.cluster_size() + 8 * l2_index;
        self.write_u64(offset, entry);
    }

    /// Maps entry `l2_index` of the L2 table in cluster `l2_cluster` to data
    /// cluster `data_cluster`.
    pub fn map_cluster(&mut self, l2_cluster: u64, l2_index: u64, data_cluster: u64) {
        let cluster_size = self.cluster_size();
        self.set_l2_entry(
            l2_cluster,
            l2_index,
            l2_entry_make_std(data_cluster * cluster_size),
        );
        self.ensure_len((data_cluster + 1) * cluster_size);
    }

    pub fn fill_cluster(&mut self, cluster: u64, value: u8) {
        let cluster_size = self.cluster_size();
        self.ensure_len((cluster + 1) * cluster_size);
        let start = (cluster * cluster_size) as usize;
        self.data[start..start + cluster_size as usize].fill(value);
    }
}
