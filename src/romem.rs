//! Process-wide registry of read-only remote regions with local snapshots.
//!
//! A registered region asserts that the attacker knows the exact current content of a
//! remote span. The write path exploits that knowledge: bytes that already match the
//! snapshot are skipped entirely, so rewriting mostly-unchanged structures costs a
//! handful of in-thread `memset` calls instead of one per run. The registry owns only
//! the snapshot buffers, never the remote memory itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Stable identity of a registered read-only region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

struct RoRegion {
    id: RegionId,
    remote: u64,
    local: Vec<u8>,
}

static REGIONS: Mutex<Vec<RoRegion>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Intersection of a pending write with a registered region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapInfo {
    /// Offset into the write buffer where the overlap begins.
    pub write_offset: usize,
    /// Length of the overlapping span.
    pub overlap_len: usize,
    /// Snapshot bytes for the overlapping span.
    pub snapshot: Vec<u8>,
}

/// Registers a `(remote, snapshot)` pair. The caller asserts the buffers match.
pub fn register_read_only_memory(remote: u64, local: Vec<u8>) -> RegionId {
    let id = RegionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    REGIONS.lock().unwrap().push(RoRegion { id, remote, local });
    id
}

/// Allocates a zeroed region inside the target via in-thread `calloc(1, size)` and
/// registers it with a matching all-zero snapshot. Returns the id and remote address.
#[cfg(all(windows, target_arch = "x86_64"))]
pub fn create_read_only_memory(
    proxy: &crate::proxy::ProxyThread,
    size: usize,
) -> crate::error::Result<(RegionId, u64)> {
    use crate::crt::Crt;
    use crate::error::NThreadError;

    let crt = Crt::get()?;
    let remote = proxy.call(crt.calloc, &[1, size as u64])?;
    if remote == 0 {
        return Err(NThreadError::AllocFailed { size });
    }
    Ok((register_read_only_memory(remote, vec![0u8; size]), remote))
}

/// Removes a region. Returns whether it was present. Remote memory is not freed.
pub fn unregister_read_only_memory(id: RegionId) -> bool {
    let mut regions = REGIONS.lock().unwrap();
    let before = regions.len();
    regions.retain(|r| r.id != id);
    regions.len() != before
}

/// Finds the first registered region whose span intersects `[dest, dest + len)`.
pub fn find_overlapping_region(dest: u64, len: usize) -> Option<RegionId> {
    let end = dest + len as u64;
    let regions = REGIONS.lock().unwrap();
    regions
        .iter()
        .find(|r| {
            let r_end = r.remote + r.local.len() as u64;
            end > r.remote && dest < r_end
        })
        .map(|r| r.id)
}

/// Computes the intersection of `[dest, dest + len)` with a region, including the
/// snapshot bytes covering it. Returns `None` when the region is gone or disjoint.
pub fn overlap_info(dest: u64, len: usize, id: RegionId) -> Option<OverlapInfo> {
    let end = dest + len as u64;
    let regions = REGIONS.lock().unwrap();
    let region = regions.iter().find(|r| r.id == id)?;

    let r_start = region.remote;
    let r_end = r_start + region.local.len() as u64;
    if end <= r_start || dest >= r_end {
        return None;
    }

    let overlap_start = dest.max(r_start);
    let overlap_end = end.min(r_end);
    let overlap_len = (overlap_end - overlap_start) as usize;
    let region_offset = (overlap_start - r_start) as usize;

    Some(OverlapInfo {
        write_offset: (overlap_start - dest) as usize,
        overlap_len,
        snapshot: region.local[region_offset..region_offset + overlap_len].to_vec(),
    })
}

/// Copies bytes just written at `dest` into the region's snapshot at the matching
/// offset, clipping partial overlap on either side. Returns whether anything matched.
pub fn update_snapshot(id: RegionId, source: &[u8], dest: u64) -> bool {
    let end = dest + source.len() as u64;
    let mut regions = REGIONS.lock().unwrap();
    let Some(region) = regions.iter_mut().find(|r| r.id == id) else {
        return false;
    };

    let r_start = region.remote;
    let r_end = r_start + region.local.len() as u64;
    if end <= r_start || dest >= r_end {
        return false;
    }

    let overlap_start = dest.max(r_start);
    let overlap_end = end.min(r_end);
    let overlap_len = (overlap_end - overlap_start) as usize;
    let source_offset = (overlap_start - dest) as usize;
    let region_offset = (overlap_start - r_start) as usize;

    region.local[region_offset..region_offset + overlap_len]
        .copy_from_slice(&source[source_offset..source_offset + overlap_len]);
    true
}

/// Overwrites a region's entire snapshot with zeros. Remote memory is untouched.
pub fn zero_snapshot(id: RegionId) -> bool {
    let mut regions = REGIONS.lock().unwrap();
    let Some(region) = regions.iter_mut().find(|r| r.id == id) else {
        return false;
    };
    region.local.fill(0);
    true
}

/// Returns a copy of a region's snapshot, mainly for diagnostics and tests.
pub fn snapshot_of(id: RegionId) -> Option<Vec<u8>> {
    let regions = REGIONS.lock().unwrap();
    regions.iter().find(|r| r.id == id).map(|r| r.local.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses a distinct fake remote base so the process-wide registry keeps the
    // tests independent of one another.

    #[test]
    fn overlap_is_half_open() {
        let id = register_read_only_memory(0x10_0000, vec![0u8; 16]);

        assert_eq!(find_overlapping_region(0x10_0000, 16), Some(id));
        assert_eq!(find_overlapping_region(0x10_0008, 8), Some(id));
        // Adjacent on either side: no overlap.
        assert_eq!(find_overlapping_region(0x0F_FFF0, 16), None);
        assert_eq!(find_overlapping_region(0x10_0010, 16), None);
        // One byte in on either side.
        assert_eq!(find_overlapping_region(0x0F_FFF1, 16), Some(id));
        assert_eq!(find_overlapping_region(0x10_000F, 16), Some(id));

        assert!(unregister_read_only_memory(id));
    }

    #[test]
    fn unregister_is_single_shot() {
        let id = register_read_only_memory(0x11_0000, vec![0u8; 4]);
        assert!(unregister_read_only_memory(id));
        assert!(!unregister_read_only_memory(id));
        assert_eq!(find_overlapping_region(0x11_0000, 4), None);
    }

    #[test]
    fn overlap_info_clips_both_sides() {
        let id = register_read_only_memory(0x12_0010, (0..16).collect());

        // Write starts 8 bytes before the region and ends 8 bytes inside it.
        let info = overlap_info(0x12_0008, 16, id).unwrap();
        assert_eq!(info.write_offset, 8);
        assert_eq!(info.overlap_len, 8);
        assert_eq!(info.snapshot, (0..8).collect::<Vec<u8>>());

        // Write fully inside the region.
        let info = overlap_info(0x12_0014, 4, id).unwrap();
        assert_eq!(info.write_offset, 0);
        assert_eq!(info.overlap_len, 4);
        assert_eq!(info.snapshot, vec![4, 5, 6, 7]);

        // Write straddles the tail end.
        let info = overlap_info(0x12_001C, 16, id).unwrap();
        assert_eq!(info.write_offset, 0);
        assert_eq!(info.overlap_len, 4);
        assert_eq!(info.snapshot, vec![12, 13, 14, 15]);

        assert!(unregister_read_only_memory(id));
    }

    #[test]
    fn snapshot_updates_track_written_bytes() {
        let id = register_read_only_memory(0x13_0000, vec![0u8; 8]);

        // Source straddles the region start: only the tail lands in the snapshot.
        assert!(update_snapshot(id, &[1, 2, 3, 4], 0x12_FFFE));
        assert_eq!(snapshot_of(id).unwrap(), vec![3, 4, 0, 0, 0, 0, 0, 0]);

        assert!(update_snapshot(id, &[9, 9], 0x13_0006));
        assert_eq!(snapshot_of(id).unwrap(), vec![3, 4, 0, 0, 0, 0, 9, 9]);

        // Disjoint writes change nothing.
        assert!(!update_snapshot(id, &[7, 7], 0x13_0010));

        assert!(zero_snapshot(id));
        assert_eq!(snapshot_of(id).unwrap(), vec![0u8; 8]);

        assert!(unregister_read_only_memory(id));
    }
}
