//! A zone-partitioned heap carved out of a single target-side block.
//!
//! One `calloc` in the target yields a contiguous span that is split at a caller-chosen
//! boundary: the read-only zone is mirrored by a snapshot in the read-only registry (so
//! writes into it skip unchanged bytes), the read-write zone is plain memory. Each zone
//! hands out memory first-fit from a sorted, coalescing free list and falls back to
//! bumping into untouched space.

use crate::error::{NThreadError, Result};
use crate::romem::{self, RegionId};

/// Default block size of [`Heap::create_default`].
pub const DEFAULT_TOTAL_SIZE: usize = 16_384;

/// One allocation handed out by a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAlloc {
    /// Absolute target-side address.
    pub address: u64,
    /// Requested size in bytes.
    pub size: usize,
    /// Whether the allocation lives in the read-only zone.
    pub readonly: bool,
}

/// A span returned to a zone's free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    address: u64,
    size: usize,
}

/// One half of the heap block: bump area plus sorted free list.
#[derive(Debug)]
struct Zone {
    start: u64,
    end: u64,
    bump: u64,
    free_list: Vec<FreeBlock>,
}

impl Zone {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            bump: start,
            free_list: Vec::new(),
        }
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// First fit on the free list, falling back to bumping.
    fn alloc(&mut self, size: usize) -> Option<u64> {
        for i in 0..self.free_list.len() {
            if self.free_list[i].size >= size {
                let address = self.free_list[i].address;
                if self.free_list[i].size == size {
                    self.free_list.remove(i);
                } else {
                    self.free_list[i].address += size as u64;
                    self.free_list[i].size -= size;
                }
                return Some(address);
            }
        }

        if self.bump + size as u64 <= self.end {
            let address = self.bump;
            self.bump += size as u64;
            return Some(address);
        }

        None
    }

    /// Inserts a span into the sorted free list and coalesces with both neighbours.
    fn free(&mut self, address: u64, size: usize) {
        let pos = self.free_list.partition_point(|b| b.address < address);
        self.free_list.insert(pos, FreeBlock { address, size });

        // Merge with the next block first so the index of `pos` stays valid.
        if pos + 1 < self.free_list.len() {
            let next = self.free_list[pos + 1];
            let current = self.free_list[pos];
            if current.address + current.size as u64 == next.address {
                self.free_list[pos].size += next.size;
                self.free_list.remove(pos + 1);
            }
        }
        if pos > 0 {
            let current = self.free_list[pos];
            let prev = self.free_list[pos - 1];
            if prev.address + prev.size as u64 == current.address {
                self.free_list[pos - 1].size += current.size;
                self.free_list.remove(pos);
            }
        }
    }

    fn reset(&mut self) {
        self.bump = self.start;
        self.free_list.clear();
    }
}

/// The zone-partitioned heap block.
pub struct Heap {
    base: u64,
    total_size: usize,
    ro_size: usize,
    ro_zone: Zone,
    rw_zone: Zone,
    region: Option<RegionId>,
}

impl Heap {
    /// Wraps caller-supplied target memory as a heap.
    ///
    /// The caller asserts the span is zero-filled (a `calloc` result); the read-only
    /// zone is registered with an all-zero snapshot to match.
    pub fn new(base: u64, total_size: usize, ro_size: usize) -> Result<Self> {
        if total_size == 0 {
            return Err(NThreadError::InvalidAllocSize(total_size));
        }
        if ro_size > total_size {
            return Err(NThreadError::InvalidAllocSize(ro_size));
        }

        let ro_end = base + ro_size as u64;
        let region =
            (ro_size > 0).then(|| romem::register_read_only_memory(base, vec![0u8; ro_size]));

        Ok(Self {
            base,
            total_size,
            ro_size,
            ro_zone: Zone::new(base, ro_end),
            rw_zone: Zone::new(ro_end, base + total_size as u64),
            region,
        })
    }

    /// Allocates the block in the target via in-thread `calloc(1, total_size)` and wraps
    /// it as a heap.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub fn create(
        proxy: &crate::proxy::ProxyThread,
        total_size: usize,
        ro_size: usize,
    ) -> Result<Self> {
        let base = proxy.calloc(1, total_size)?;
        if base == 0 {
            return Err(NThreadError::AllocFailed { size: total_size });
        }
        crate::debug!("heap: {total_size} byte block at {base:#x}, ro split {ro_size}");
        Self::new(base, total_size, ro_size)
    }

    /// [`create`](Self::create) with the default block size, split half and half.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub fn create_default(proxy: &crate::proxy::ProxyThread) -> Result<Self> {
        Self::create(proxy, DEFAULT_TOTAL_SIZE, DEFAULT_TOTAL_SIZE / 2)
    }

    /// Base address of the block.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the whole block.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Size of the read-only zone.
    pub fn ro_size(&self) -> usize {
        self.ro_size
    }

    /// The read-only registry entry mirroring the RO zone.
    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    /// Whether an address lies anywhere inside the block.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.total_size as u64
    }

    /// Whether an address lies inside the read-only zone.
    pub fn is_ro_address(&self, address: u64) -> bool {
        self.ro_zone.contains(address)
    }

    /// Allocates from the requested zone. `Ok(None)` means the zone is exhausted,
    /// which the layered allocator treats as a growth/fallback trigger, not an error.
    pub fn alloc(&mut self, size: usize, readonly: bool) -> Result<Option<HeapAlloc>> {
        if size == 0 {
            return Err(NThreadError::InvalidAllocSize(size));
        }
        let zone = if readonly {
            &mut self.ro_zone
        } else {
            &mut self.rw_zone
        };
        Ok(zone.alloc(size).map(|address| HeapAlloc {
            address,
            size,
            readonly,
        }))
    }

    /// Returns an allocation to its zone's free list, coalescing neighbours.
    pub fn free(&mut self, alloc: &HeapAlloc) -> Result<()> {
        let zone = if self.ro_zone.contains(alloc.address) {
            &mut self.ro_zone
        } else if self.rw_zone.contains(alloc.address) {
            &mut self.rw_zone
        } else {
            return Err(NThreadError::ForeignFree {
                address: alloc.address,
            });
        };
        zone.free(alloc.address, alloc.size);
        Ok(())
    }

    /// Clears both bump pointers and free lists and zero-fills the local RO snapshot.
    /// Remote memory is untouched; the caller clears it if needed.
    pub fn reset(&mut self) {
        self.ro_zone.reset();
        self.rw_zone.reset();
        if let Some(region) = self.region {
            romem::zero_snapshot(region);
        }
    }

    /// Unregisters the RO region and frees the block via in-thread `free(base)`.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub fn destroy(mut self, proxy: &crate::proxy::ProxyThread) -> Result<()> {
        if let Some(region) = self.region.take() {
            romem::unregister_read_only_memory(region);
        }
        let crt = crate::crt::Crt::get()?;
        proxy.call(crt.free, &[self.base])?;
        Ok(())
    }

    #[cfg(test)]
    fn free_list_of(&self, readonly: bool) -> &[FreeBlock] {
        if readonly {
            &self.ro_zone.free_list
        } else {
            &self.rw_zone.free_list
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // The snapshot must not outlive the heap's bookkeeping; remote memory is the
        // owner's problem (destroy() frees it explicitly).
        if let Some(region) = self.region.take() {
            romem::unregister_read_only_memory(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x0040_0000;

    fn heap() -> Heap {
        // 256-byte block, 128-byte RO zone, like a miniature of the real default.
        Heap::new(BASE, 256, 128).unwrap()
    }

    #[test]
    fn zones_bump_from_their_own_starts() {
        let mut h = heap();
        let a = h.alloc(32, true).unwrap().unwrap();
        let b = h.alloc(32, true).unwrap().unwrap();
        let c = h.alloc(48, false).unwrap().unwrap();
        let d = h.alloc(32, false).unwrap().unwrap();

        assert_eq!(a.address, BASE);
        assert_eq!(b.address, BASE + 32);
        assert_eq!(c.address, BASE + 128);
        assert_eq!(d.address, BASE + 176);

        // Zone containment: RO allocations never cross the split.
        assert!(a.address + a.size as u64 <= BASE + 128);
        assert!(b.address + b.size as u64 <= BASE + 128);
    }

    #[test]
    fn freed_blocks_are_reused_first_fit() {
        let mut h = heap();
        let a = h.alloc(32, true).unwrap().unwrap();
        let _b = h.alloc(32, true).unwrap().unwrap();

        h.free(&a).unwrap();
        let c = h.alloc(16, true).unwrap().unwrap();
        let d = h.alloc(16, true).unwrap().unwrap();
        assert_eq!(c.address, BASE);
        assert_eq!(d.address, BASE + 16);

        h.free(&c).unwrap();
        h.free(&d).unwrap();
        let e = h.alloc(32, true).unwrap().unwrap();
        assert_eq!(e.address, BASE, "coalesced block serves the full size again");
    }

    #[test]
    fn free_list_never_keeps_adjacent_blocks() {
        let mut h = heap();
        let allocs: Vec<_> = (0..4)
            .map(|_| h.alloc(16, false).unwrap().unwrap())
            .collect();

        // Free in an order that exercises both next- and prev-coalescing.
        h.free(&allocs[2]).unwrap();
        h.free(&allocs[0]).unwrap();
        h.free(&allocs[1]).unwrap();
        h.free(&allocs[3]).unwrap();

        let list = h.free_list_of(false);
        assert_eq!(list.len(), 1);
        for pair in list.windows(2) {
            assert_ne!(pair[0].address + pair[0].size as u64, pair[1].address);
        }
    }

    #[test]
    fn exhausted_bump_recovers_after_free() {
        let mut h = heap();
        let a = h.alloc(96, true).unwrap().unwrap();
        let b = h.alloc(32, true).unwrap().unwrap();
        assert!(h.alloc(16, true).unwrap().is_none(), "RO zone exhausted");

        h.free(&b).unwrap();
        let c = h.alloc(32, true).unwrap().unwrap();
        assert_eq!(c.address, a.address + 96);
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let mut h = heap();
        let bogus = HeapAlloc {
            address: 0xDEAD,
            size: 16,
            readonly: false,
        };
        assert!(matches!(
            h.free(&bogus),
            Err(NThreadError::ForeignFree { address: 0xDEAD })
        ));
    }

    #[test]
    fn zero_sized_requests_are_invalid() {
        let mut h = heap();
        assert!(matches!(
            h.alloc(0, false),
            Err(NThreadError::InvalidAllocSize(0))
        ));
    }

    #[test]
    fn reset_restores_both_bumps_and_the_snapshot() {
        let mut h = heap();
        let region = h.region().unwrap();
        h.alloc(64, true).unwrap().unwrap();
        h.alloc(64, false).unwrap().unwrap();
        romem::update_snapshot(region, &[0xAB; 8], BASE);

        h.reset();
        let a = h.alloc(16, true).unwrap().unwrap();
        let b = h.alloc(16, false).unwrap().unwrap();
        assert_eq!(a.address, BASE);
        assert_eq!(b.address, BASE + 128);
        assert_eq!(romem::snapshot_of(region).unwrap(), vec![0u8; 128]);
    }

    #[test]
    fn dropping_the_heap_unregisters_the_region() {
        let region = {
            let h = Heap::new(0x0080_0000, 64, 32).unwrap();
            h.region().unwrap()
        };
        assert!(!romem::unregister_read_only_memory(region));
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert!(Heap::new(BASE, 0, 0).is_err());
        assert!(Heap::new(BASE, 64, 128).is_err());
    }
}
