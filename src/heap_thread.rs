//! The heap-layered orchestrator: [`NThreadHeap`].
//!
//! Wraps the base inject sequence with per-proxy allocator state. Allocations are
//! served from a growing zone heap; when the heap cannot serve (ceiling reached, or the
//! request is larger than any heap would be), the request falls through to the base CRT
//! hooks and is recorded as CRT-backed so `free` and `realloc` route it correctly later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{NThreadError, Result};
use crate::heap::{Heap, HeapAlloc};
use crate::nthread::{
    default_thread_alloc, default_thread_close, default_thread_free, Dispatch, NThread,
    SharedCaptured, ThreadTarget,
};
use crate::proxy::{AllocOptions, ProxyThread};

/// Default size of the first heap block.
pub const DEFAULT_HEAP_SIZE: usize = 65_536;

/// Default ceiling a heap block may grow to.
pub const DEFAULT_MAX_SIZE: usize = 524_288;

/// The base orchestrator plus a growing zone-heap allocation policy.
pub struct NThreadHeap {
    base: NThread,
    heap_size: usize,
    max_size: usize,
}

impl NThreadHeap {
    /// Creates a heap-layered orchestrator with the given initial block size and growth
    /// ceiling, over a default-configured [`NThread`].
    pub fn new(heap_size: usize, max_size: usize) -> Self {
        Self::with_nthread(NThread::new(), heap_size, max_size)
    }

    /// Layers the heap policy over an explicitly configured base orchestrator.
    pub fn with_nthread(base: NThread, heap_size: usize, max_size: usize) -> Self {
        Self {
            base,
            heap_size,
            max_size,
        }
    }

    /// Initial heap block size.
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Heap growth ceiling.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Hijacks a thread exactly like [`NThread::inject`], but binds the proxy's alloc,
    /// free and close hooks to a fresh per-proxy heap state.
    pub fn inject(
        &self,
        target: impl Into<ThreadTarget>,
    ) -> Result<(ProxyThread, SharedCaptured)> {
        let dispatch = Arc::new(HeapDispatch {
            heap_size: self.heap_size,
            max_size: self.max_size,
            state: Mutex::new(HeapState::default()),
        });
        self.base.inject_with(target.into(), dispatch)
    }
}

impl Default for NThreadHeap {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_SIZE, DEFAULT_MAX_SIZE)
    }
}

/// Which allocator owns a pointer handed out by the proxy.
#[derive(Debug, Clone, Copy)]
enum Backing {
    Heap(HeapAlloc),
    Crt,
}

/// Per-proxy allocator state.
#[derive(Default)]
struct HeapState {
    active: Option<Heap>,
    /// Older blocks kept alive only so existing allocations can still be freed.
    previous: Vec<Heap>,
    allocations: HashMap<u64, Backing>,
}

/// The heap's owning heap lookup: active first, then retained predecessors.
fn owning_heap_mut(state: &mut HeapState, address: u64) -> Option<&mut Heap> {
    if state
        .active
        .as_ref()
        .is_some_and(|heap| heap.contains(address))
    {
        return state.active.as_mut();
    }
    state
        .previous
        .iter_mut()
        .find(|heap| heap.contains(address))
}

/// Dispatcher overriding the allocation hooks with heap policy.
struct HeapDispatch {
    heap_size: usize,
    max_size: usize,
    state: Mutex<HeapState>,
}

impl HeapDispatch {
    /// Zone split for a fresh heap: the zone serving the triggering request gets the
    /// larger share.
    fn ro_share(total: usize, readonly: bool) -> usize {
        if readonly {
            total / 4 * 3
        } else {
            total / 4
        }
    }

    /// Tries to serve a request from the active heap, growing it within the ceiling.
    /// `Ok(None)` means the heap layer cannot serve and the CRT must take over.
    fn alloc_from_heap(
        &self,
        state: &mut HeapState,
        proxy: &ProxyThread,
        size: usize,
        readonly: bool,
    ) -> Result<Option<u64>> {
        if state.active.is_some() {
            if let Some(active) = state.active.as_mut() {
                if let Some(alloc) = active.alloc(size, readonly)? {
                    state.allocations.insert(alloc.address, Backing::Heap(alloc));
                    return Ok(Some(alloc.address));
                }
            }

            let total = state.active.as_ref().map(Heap::total_size).unwrap_or(0);
            if total >= self.max_size || size > self.max_size {
                return Ok(None);
            }
            let new_size = (total * 2).min(self.max_size);
            if size > new_size {
                return Ok(None);
            }

            crate::info!("heap: growing {total} -> {new_size}");
            let fresh = Heap::create(proxy, new_size, Self::ro_share(new_size, readonly))?;
            if let Some(old) = state.active.replace(fresh) {
                state.previous.push(old);
            }
        } else {
            if size > self.heap_size {
                return Ok(None);
            }
            let fresh =
                Heap::create(proxy, self.heap_size, Self::ro_share(self.heap_size, readonly))?;
            state.active = Some(fresh);
        }

        let Some(active) = state.active.as_mut() else {
            return Ok(None);
        };
        match active.alloc(size, readonly)? {
            Some(alloc) => {
                state.allocations.insert(alloc.address, Backing::Heap(alloc));
                Ok(Some(alloc.address))
            }
            // Even a fresh block cannot fit the request in its zone share.
            None => Ok(None),
        }
    }

    /// Reallocation with zone preservation and CRT interop.
    fn realloc_internal(
        &self,
        proxy: &ProxyThread,
        address: u64,
        new_size: usize,
        opts: &AllocOptions,
    ) -> Result<u64> {
        let backing = self.state.lock().unwrap().allocations.get(&address).copied();

        let Some(Backing::Heap(old)) = backing else {
            // Unknown or CRT-backed: a genuine CRT realloc through the base hook.
            let ptr = default_thread_alloc(proxy, new_size, opts)?;
            let mut state = self.state.lock().unwrap();
            state.allocations.remove(&address);
            state.allocations.insert(ptr, Backing::Crt);
            return Ok(ptr);
        };

        // Keep the allocation in its current zone unless the caller overrides it.
        let readonly = opts.readonly.unwrap_or(old.readonly);

        let heap_ptr = {
            let mut state = self.state.lock().unwrap();
            self.alloc_from_heap(&mut state, proxy, new_size, readonly)?
        };
        let new_ptr = match heap_ptr {
            Some(ptr) => ptr,
            None => {
                // CRT fallback with the address cleared: the CRT must never be asked to
                // realloc a pointer that belongs to one of our heaps. The copy and the
                // tail fill below handle initialisation.
                let mut fallback = *opts;
                fallback.address = None;
                fallback.fill = None;
                let ptr = default_thread_alloc(proxy, new_size, &fallback)?;
                self.state
                    .lock()
                    .unwrap()
                    .allocations
                    .insert(ptr, Backing::Crt);
                ptr
            }
        };

        let preserved = old.size.min(new_size);
        if preserved > 0 {
            let bytes = proxy.read(address, preserved)?;
            proxy.write(new_ptr, &bytes)?;
        }
        if new_size > old.size {
            if let Some(fill) = opts.fill {
                let tail = vec![fill; new_size - old.size];
                proxy.write(new_ptr + old.size as u64, &tail)?;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.allocations.remove(&address);
        if let Some(heap) = owning_heap_mut(&mut state, address) {
            heap.free(&old)?;
        }
        Ok(new_ptr)
    }
}

impl Dispatch for HeapDispatch {
    fn thread_alloc(&self, proxy: &ProxyThread, size: usize, opts: &AllocOptions) -> Result<u64> {
        if let Some(address) = opts.address {
            return self.realloc_internal(proxy, address, size, opts);
        }

        let readonly = opts.readonly.unwrap_or(false);
        let heap_ptr = {
            let mut state = self.state.lock().unwrap();
            self.alloc_from_heap(&mut state, proxy, size, readonly)?
        };

        match heap_ptr {
            Some(ptr) => {
                if let Some(fill) = opts.fill {
                    proxy.write(ptr, &vec![fill; size])?;
                }
                Ok(ptr)
            }
            None => {
                // The base hook applies the fill semantics itself on this path.
                let ptr = default_thread_alloc(proxy, size, opts)?;
                self.state
                    .lock()
                    .unwrap()
                    .allocations
                    .insert(ptr, Backing::Crt);
                crate::debug!("heap: {size} bytes fell back to the CRT at {ptr:#x}");
                Ok(ptr)
            }
        }
    }

    fn thread_free(&self, proxy: &ProxyThread, ptr: u64) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.allocations.remove(&ptr)
        };

        match removed {
            Some(Backing::Heap(alloc)) => {
                let mut state = self.state.lock().unwrap();
                match owning_heap_mut(&mut state, ptr) {
                    Some(heap) => heap.free(&alloc),
                    None => Err(NThreadError::ForeignFree { address: ptr }),
                }
            }
            // CRT-backed or unknown pointers go to the base hook.
            Some(Backing::Crt) | None => default_thread_free(proxy, ptr),
        }
    }

    fn thread_close(&self, proxy: &ProxyThread, suicide: Option<u32>) -> Result<()> {
        let heaps: Vec<Heap> = {
            let mut state = self.state.lock().unwrap();
            state.allocations.clear();
            let mut heaps: Vec<Heap> = state.previous.drain(..).collect();
            heaps.extend(state.active.take());
            heaps
        };
        for heap in heaps {
            // Best effort: the blocks die with the target anyway if this fails.
            let _ = heap.destroy(proxy);
        }
        default_thread_close(proxy, suicide)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_sizes() {
        let heap = NThreadHeap::default();
        assert_eq!(heap.heap_size(), 65_536);
        assert_eq!(heap.max_size(), 524_288);
    }

    #[test]
    fn zone_share_favours_the_requesting_zone() {
        assert_eq!(HeapDispatch::ro_share(64, true), 48);
        assert_eq!(HeapDispatch::ro_share(64, false), 16);
        assert_eq!(HeapDispatch::ro_share(256, true), 192);
        assert_eq!(HeapDispatch::ro_share(256, false), 64);
    }
}
