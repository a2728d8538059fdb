// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Two level cluster lookup table.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use super::header::MAX_RAM_POINTER_TABLE_SIZE;
use super::util::{
    div_round_up_u64, l1_entry_l2_table_addr, l2_entry_is_compressed, l2_entry_is_zero,
    l2_entry_std_cluster_addr, ENTRY_SIZE,
};
use super::{Error, Result};
use crate::buffer::IoBuffer;
use crate::io_guard::IoGuard;
use crate::{BlockDispatcher, Completion};

/// Maps linear offsets of a QCOW2 image to offsets in the image file.
///
/// The L1 table and every L2 table it references are read in memory by
/// [`LookupTable::load`]; lookups never issue I/O.
#[derive(Debug)]
pub struct LookupTable {
    cluster_bits: u32,
    l2_bits: u32,
    // Minimum number of L1 entries covering the disk.
    l1_size: u64,
    // One L2 table per L1 entry, empty when the L1 entry is unset.
    l1_table: Vec<Vec<u64>>,
    loaded: bool,
}

impl LookupTable {
    pub fn new(cluster_bits: u32, disk_size: u64) -> Self {
        // Each L2 table is one cluster of 8 byte entries.
        let l2_bits = cluster_bits - 3;
        let l1_size = div_round_up_u64(disk_size, 0x01u64 << (cluster_bits + l2_bits));
        LookupTable {
            cluster_bits,
            l2_bits,
            l1_size,
            l1_table: Vec::new(),
            loaded: false,
        }
    }

    /// Minimum number of L1 entries needed to address the disk.
    pub fn l1_size(&self) -> u64 {
        self.l1_size
    }

    pub fn cluster_size(&self) -> u64 {
        0x01u64 << self.cluster_bits
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Reads the L1 table of `l1_size` entries at `l1_table_offset` of
    /// `base`, then every L2 table it references, and hands the loaded table
    /// to `completion`.
    pub fn load(
        self,
        l1_size: u32,
        l1_table_offset: u64,
        base: Arc<dyn BlockDispatcher>,
        completion: Completion<LookupTable>,
    ) {
        if self.loaded {
            return completion(Err(crate::Error::AlreadyLoaded));
        }
        if u64::from(l1_size) < self.l1_size {
            return completion(Err(crate::Error::Qcow(Error::L1TableTooSmall {
                declared: l1_size,
                required: self.l1_size,
            })));
        }
        if u64::from(l1_size) > MAX_RAM_POINTER_TABLE_SIZE {
            let e = Error::TooManyL1Entries(u64::from(l1_size));
            return completion(Err(crate::Error::Qcow(e)));
        }

        debug!("Reading {} L1 entries at {:#x}", l1_size, l1_table_offset);
        let l1_buf = IoBuffer::new(l1_size as usize * ENTRY_SIZE as usize);
        let reader = base.clone();
        base.read_at(
            l1_buf.clone(),
            l1_table_offset,
            Box::new(move |result| {
                if let Err(e) = result {
                    let e = Error::ReadingL1Table(Box::new(e));
                    return completion(Err(crate::Error::Qcow(e)));
                }
                let mut l1_entries = vec![0u64; l1_size as usize];
                l1_buf.with(|data| BigEndian::read_u64_into(data, &mut l1_entries));
                self.load_l2_tables(l1_entries, reader, completion)
            }),
        );
    }

    fn load_l2_tables(
        mut self,
        l1_entries: Vec<u64>,
        base: Arc<dyn BlockDispatcher>,
        completion: Completion<LookupTable>,
    ) {
        let cluster_size = self.cluster_size();
        let mut pending = Vec::new();
        for (index, &entry) in l1_entries.iter().enumerate() {
            let l2_addr = l1_entry_l2_table_addr(entry);
            if l2_addr == 0 {
                continue;
            }
            if l2_addr & (cluster_size - 1) != 0 {
                let e = Error::InvalidL2TableOffset(l2_addr);
                return completion(Err(crate::Error::Qcow(e)));
            }
            pending.push((index, l2_addr, IoBuffer::new(cluster_size as usize)));
        }
        debug!("Reading {} L2 tables", pending.len());

        let buffers: Vec<(usize, IoBuffer)> = pending
            .iter()
            .map(|(index, _, buf)| (*index, buf.clone()))
            .collect();
        let l1_len = l1_entries.len();
        let l2_entries = (cluster_size / ENTRY_SIZE) as usize;
        let guard = IoGuard::new(
            pending.len(),
            Box::new(move |result| {
                if let Err(e) = result {
                    let e = Error::ReadingL2Table(Box::new(e));
                    return completion(Err(crate::Error::Qcow(e)));
                }
                self.l1_table = vec![Vec::new(); l1_len];
                for (index, buf) in buffers {
                    let mut table = vec![0u64; l2_entries];
                    buf.with(|data| BigEndian::read_u64_into(data, &mut table));
                    self.l1_table[index] = table;
                }
                self.loaded = true;
                completion(Ok(self))
            }),
        );

        for (_, l2_addr, buf) in pending {
            if guard.has_failed() {
                guard.skip();
                continue;
            }
            base.read_at(buf, l2_addr, guard.part());
        }
    }

    /// Translates `linear_offset` into an offset in the image file.
    ///
    /// Returns `None` when the cluster holding `linear_offset` is not
    /// allocated, or is flagged as reading zeros.
    pub fn walk(&self, linear_offset: u64) -> Result<Option<u64>> {
        let cluster_size = self.cluster_size();
        let l1_index = linear_offset >> (self.cluster_bits + self.l2_bits);
        let l2_index = ((linear_offset >> self.cluster_bits) & ((0x01u64 << self.l2_bits) - 1))
            as usize;
        let cluster_offset = linear_offset & (cluster_size - 1);

        let l2_table = usize::try_from(l1_index)
            .ok()
            .and_then(|index| self.l1_table.get(index))
            .ok_or(Error::L1IndexOutOfRange(l1_index))?;
        if l2_table.is_empty() {
            return Ok(None);
        }

        let entry = l2_table[l2_index];
        if l2_entry_is_compressed(entry) {
            return Err(Error::CompressedCluster(linear_offset));
        }
        if l2_entry_is_zero(entry) {
            return Ok(None);
        }
        let cluster_addr = l2_entry_std_cluster_addr(entry);
        if cluster_addr == 0 {
            return Ok(None);
        }
        if cluster_addr & (cluster_size - 1) != 0 {
            return Err(Error::UnalignedClusterOffset(cluster_addr));
        }
        Ok(Some(cluster_addr | cluster_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qcow::test_image::TestImage;
    use crate::qcow::util::{l2_entry_make_std, COMPRESSED_FLAG, ZERO_FLAG};
    use crate::test_util::MemDispatcher;
    use crate::{wait_for, Status};

    const CLUSTER_BITS: u32 = 16;
    const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;

    fn load(image: &TestImage) -> (Arc<MemDispatcher>, crate::Result<LookupTable>) {
        let base = Arc::new(MemDispatcher::from_vec(image.bytes().to_vec()));
        let header = image.header();
        let table = LookupTable::new(header.cluster_bits, header.size);
        let result = wait_for(|c| table.load(header.l1_size, header.l1_table_offset, base.clone(), c));
        (base, result)
    }

    #[test]
    fn minimum_l1_size() {
        // One L2 table of 64 KiB clusters maps 512 MiB.
        assert_eq!(LookupTable::new(16, 0).l1_size(), 0);
        assert_eq!(LookupTable::new(16, 1).l1_size(), 1);
        assert_eq!(LookupTable::new(16, 512 << 20).l1_size(), 1);
        assert_eq!(LookupTable::new(16, (512 << 20) + 1).l1_size(), 2);
        // 512 byte clusters, 64 entries per L2 table.
        assert_eq!(LookupTable::new(9, 64 * 512 * 3).l1_size(), 3);
    }

    #[test]
    fn walk_returns_mapped_offsets() {
        let mut image = TestImage::new(CLUSTER_BITS, 2 << 30);
        image.set_l1_entry(1, 3);
        image.set_l2_entry(3, 5, l2_entry_make_std(7 * CLUSTER_SIZE));
        let (base, table) = load(&image);
        let table = table.unwrap();
        assert!(table.is_loaded());
        // The L1 table, then the single L2 table.
        assert_eq!(base.reads(), 2);

        let linear = (512 << 20) + 5 * CLUSTER_SIZE;
        for cluster_offset in [0, 1, 0x200, CLUSTER_SIZE - 1] {
            assert_eq!(
                table.walk(linear + cluster_offset).unwrap(),
                Some(7 * CLUSTER_SIZE + cluster_offset)
            );
        }
        assert_eq!(table.walk(linear + CLUSTER_SIZE).unwrap(), None);
        // No L2 table behind L1 entry 0.
        assert_eq!(table.walk(0).unwrap(), None);
    }

    #[test]
    fn walk_covers_table_edges() {
        let mut image = TestImage::new(CLUSTER_BITS, 2 << 30);
        let last_l2 = CLUSTER_SIZE / ENTRY_SIZE - 1;
        image.set_l1_entry(0, 3);
        image.set_l1_entry(3, 5);
        image.map_cluster(3, 0, 7);
        image.map_cluster(3, last_l2, 8);
        image.map_cluster(5, last_l2, 9);
        let table = load(&image).1.unwrap();

        // One L2 table of 64 KiB clusters maps 512 MiB.
        let l1_span = CLUSTER_SIZE * (CLUSTER_SIZE / ENTRY_SIZE);
        let cases = [
            (0, 7 * CLUSTER_SIZE),
            (last_l2 * CLUSTER_SIZE, 8 * CLUSTER_SIZE),
            (3 * l1_span + last_l2 * CLUSTER_SIZE, 9 * CLUSTER_SIZE),
        ];
        for (linear, physical) in cases {
            for cluster_offset in [0, 0x1ff, CLUSTER_SIZE - 1] {
                assert_eq!(
                    table.walk(linear + cluster_offset).unwrap(),
                    Some(physical + cluster_offset)
                );
            }
        }
        assert_eq!(
            table.walk((2 << 30) - 1).unwrap(),
            Some(10 * CLUSTER_SIZE - 1)
        );
        assert_eq!(table.walk(l1_span).unwrap(), None);
    }

    #[test]
    fn walk_small_clusters() {
        const SMALL_CLUSTER: u64 = 512;
        // 64 entries per L2 table, eight L1 entries for 256 KiB.
        let mut image = TestImage::new(9, 256 << 10);
        assert_eq!(image.header().l1_size, 8);
        image.set_l1_entry(0, 2);
        image.set_l1_entry(7, 3);
        image.map_cluster(2, 0, 10);
        image.map_cluster(3, 63, 11);
        let (base, table) = load(&image);
        let table = table.unwrap();
        assert_eq!(base.reads(), 3);

        let l1_span = 64 * SMALL_CLUSTER;
        for cluster_offset in [0, 1, SMALL_CLUSTER - 1] {
            assert_eq!(
                table.walk(cluster_offset).unwrap(),
                Some(10 * SMALL_CLUSTER + cluster_offset)
            );
            assert_eq!(
                table
                    .walk(7 * l1_span + 63 * SMALL_CLUSTER + cluster_offset)
                    .unwrap(),
                Some(11 * SMALL_CLUSTER + cluster_offset)
            );
        }
        assert_eq!(table.walk(SMALL_CLUSTER).unwrap(), None);
        assert!(matches!(
            table.walk(8 * l1_span),
            Err(Error::L1IndexOutOfRange(8))
        ));
    }

    #[test]
    fn walk_rejects_unusable_entries() {
        let mut image = TestImage::new(CLUSTER_BITS, 1 << 20);
        image.set_l1_entry(0, 2);
        image.set_l2_entry(2, 0, l2_entry_make_std(5 * CLUSTER_SIZE) | COMPRESSED_FLAG);
        image.set_l2_entry(2, 1, l2_entry_make_std(5 * CLUSTER_SIZE) | ZERO_FLAG);
        image.set_l2_entry(2, 2, l2_entry_make_std(5 * CLUSTER_SIZE + 0x200));
        let table = load(&image).1.unwrap();

        let err = table.walk(0).unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
        assert_eq!(table.walk(CLUSTER_SIZE).unwrap(), None);
        let err = table.walk(2 * CLUSTER_SIZE).unwrap_err();
        assert_eq!(err.status(), Status::Io);
        let err = table.walk(1 << 29).unwrap_err();
        assert!(matches!(err, Error::L1IndexOutOfRange(1)));
        assert_eq!(err.status(), Status::OutOfRange);
    }

    #[test]
    fn rejects_short_l1_table_without_io() {
        let mut image = TestImage::new(CLUSTER_BITS, 2 << 30);
        image.update_header(|header| header.l1_size = 3);
        let (base, result) = load(&image);
        assert_eq!(result.unwrap_err().status(), Status::InvalidArgs);
        assert_eq!(base.reads(), 0);
    }

    #[test]
    fn rejects_unaligned_l2_table() {
        let mut image = TestImage::new(CLUSTER_BITS, 1 << 20);
        image.write_u64(image.header().l1_table_offset, 3 * CLUSTER_SIZE + 0x200);
        let (base, result) = load(&image);
        assert_eq!(result.unwrap_err().status(), Status::InvalidArgs);
        assert_eq!(base.reads(), 1);
    }

    #[test]
    fn l2_read_failure_fails_load() {
        let mut image = TestImage::new(CLUSTER_BITS, 1 << 20);
        // L2 table past the end of the image.
        image.write_u64(image.header().l1_table_offset, 100 * CLUSTER_SIZE);
        let err = load(&image).1.unwrap_err();
        assert!(matches!(err, crate::Error::Qcow(Error::ReadingL2Table(_))));
        assert_eq!(err.status(), Status::OutOfRange);
    }

    #[test]
    fn reload_is_rejected() {
        let image = TestImage::end_to_end();
        let table = load(&image).1.unwrap();
        let base = Arc::new(MemDispatcher::from_vec(image.bytes().to_vec()));
        let header = image.header();
        let err = wait_for(|c| table.load(header.l1_size, header.l1_table_offset, base, c))
            .unwrap_err();
        assert_eq!(err.status(), Status::BadState);
    }
}
