//! # NThread
//!
//! **NThread** is a library for non-invasive hijacking of an existing x64 Windows thread
//! in another (or the current) process. It never calls `CreateRemoteThread`, never calls
//! `WriteProcessMemory` against the target, and never allocates executable memory in the
//! target. Instead, it chains two tiny pre-existing instruction sequences ("gadgets")
//! already present in loaded system modules:
//!
//! 1. A **sleep gadget** (`jmp .`) that parks the thread in a controlled infinite loop.
//! 2. A **pivot gadget** (`push <reg>; ret`) that steers the thread onto the sleep gadget.
//!
//! Once a thread is parked, the library performs arbitrary function calls *from inside
//! that thread* by rewriting its register state, and builds memory writes out of
//! in-thread `memset` calls resolved from `msvcrt`.
//!
//! ## Core Architecture
//!
//! The library is built around a unidirectional flow:
//! **Gadget discovery** -> **Inject (park)** -> **Dispatch (call/write/alloc/free)** -> **Release**.
//!
//! Users can choose between two primary interfaces:
//! 1. **[`NThread`]:** the base orchestrator; allocations go straight to the target CRT.
//! 2. **[`NThreadHeap`]:** a layered orchestrator that carves allocations out of a
//!    growing pre-allocated heap block, falling back to the CRT when the heap cannot serve.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! # #[cfg(all(windows, target_arch = "x86_64"))]
//! fn hijack() -> nthread::Result<()> {
//!     use nthread::NThread;
//!
//!     // Park an existing thread of the current process on a sleep gadget.
//!     let (proxy, _captured) = NThread::new().inject(1234u32)?;
//!
//!     // Allocate 16 bytes in the target through the hijacked thread and write to them.
//!     let ptr = proxy.alloc(16, &Default::default())?;
//!     proxy.write(ptr, &[0xDE, 0xAD, 0xBE, 0xEF])?;
//!
//!     // Call an arbitrary function from inside the hijacked thread.
//!     let _rax = proxy.call(0x7FF6_0000_1000, &[ptr])?;
//!
//!     // Restore the thread to exactly where it was and close the handle.
//!     proxy.close(None)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! ```toml
//! [features]
//! default = []
//! tracing = [] # Enable structured logging via the `tracing` crate
//! ```
//!
//! The crate only performs live thread manipulation on x64 Windows. The
//! platform-independent building blocks (gadget selection policy, run decomposition,
//! read-only snapshots, the zone allocator) compile and test everywhere.

pub mod asm;
pub mod error;
pub mod gadget;
pub mod heap;
pub mod native;
pub mod romem;
pub mod writer;

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod captured;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod crt;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod heap_thread;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod nthread;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod proxy;

// Core API (Root Namespace)
pub use asm::Register;
pub use error::NThreadError as Error;
pub use error::{NThreadError, Result};
pub use heap::{Heap, HeapAlloc};
pub use native::WaitStatus;
pub use romem::{
    find_overlapping_region, register_read_only_memory, unregister_read_only_memory, RegionId,
};

#[cfg(all(windows, target_arch = "x86_64"))]
pub use captured::CapturedThread;
#[cfg(all(windows, target_arch = "x86_64"))]
pub use heap_thread::NThreadHeap;
#[cfg(all(windows, target_arch = "x86_64"))]
pub use nthread::{thread_call, Dispatch, NThread, NThreadBuilder, SharedCaptured, ThreadTarget};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use proxy::{AllocOptions, ProxyThread, StringEncoding};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use romem::create_read_only_memory;

#[cfg(feature = "tracing")]
#[allow(unused_imports)]
pub(crate) use tracing::{debug, error, info, warn};

// Stub macros to allow compiling without the 'tracing' feature
#[cfg(not(feature = "tracing"))]
mod stealth {
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
}
