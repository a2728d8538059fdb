// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Constants and helpers for QCOW2 L1/L2 table entries.

// bits 0-8 and 56-63 are reserved.
pub(super) const L1_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub(super) const L2_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
// Flags
pub(super) const ZERO_FLAG: u64 = 1 << 0;
pub(super) const COMPRESSED_FLAG: u64 = 1 << 62;
pub(super) const CLUSTER_USED_FLAG: u64 = 1 << 63;

/// Size in bytes of one L1 or L2 table entry.
pub(super) const ENTRY_SIZE: u64 = 8;

/// Check bit 0 - only valid for standard clusters.
pub(super) fn l2_entry_is_zero(l2_entry: u64) -> bool {
    l2_entry & ZERO_FLAG != 0
}

/// Check if L2 entry refers to a compressed cluster.
pub(super) fn l2_entry_is_compressed(l2_entry: u64) -> bool {
    l2_entry & COMPRESSED_FLAG != 0
}

/// Get file offset of standard (non-compressed) cluster.
pub(super) fn l2_entry_std_cluster_addr(l2_entry: u64) -> u64 {
    l2_entry & L2_TABLE_OFFSET_MASK
}

/// Get file offset of the L2 table an L1 entry points to.
pub(super) fn l1_entry_l2_table_addr(l1_entry: u64) -> u64 {
    l1_entry & L1_TABLE_OFFSET_MASK
}

/// Make L2 entry for standard (non-compressed) cluster.
#[cfg(test)]
pub(super) fn l2_entry_make_std(cluster_addr: u64) -> u64 {
    (cluster_addr & L2_TABLE_OFFSET_MASK) | CLUSTER_USED_FLAG
}

/// Make L1 entry pointing to an L2 table.
#[cfg(test)]
pub(super) fn l1_entry_make(cluster_addr: u64) -> u64 {
    (cluster_addr & L1_TABLE_OFFSET_MASK) | CLUSTER_USED_FLAG
}

/// Ceiling of the division of `dividend`/`divisor`.
pub(super) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor != 0)
}
