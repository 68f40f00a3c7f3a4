//! Unified error handling for the library.

use thiserror::Error;

use crate::native::WaitStatus;

/// Enumeration of all possible errors that can occur across the hijack lifecycle.
#[derive(Error)]
pub enum NThreadError {
    /// Gadget discovery produced no `jmp .` sleep gadget in any scanned module.
    #[error("no sleep gadget found in executable pages of the scanned modules")]
    NoSleepGadget,

    /// Gadget discovery produced no `push <reg>; ret` pivot gadget for any candidate register.
    #[error("no pivot gadget found for any candidate register")]
    NoPivotGadget,

    /// The target thread failed to reach the sleep gadget during injection.
    #[error("thread failed to park on the sleep gadget (wait result: {wait_result:?})")]
    InjectTimeout {
        /// Result of the park wait that did not come back as signalled.
        wait_result: WaitStatus,
    },

    /// More than four arguments were supplied to an in-thread call.
    #[error("in-thread calls support at most 4 arguments, got {0}")]
    TooManyArgs(usize),

    /// Pre-call verification failed: the thread escaped the park.
    ///
    /// The thread is left running; no attempt is made to re-park it.
    #[error("refusing to call {target:#x}: RIP is {current:#x}, expected sleep gadget {expected:#x}")]
    RipMismatch {
        /// The function that was about to be called.
        target: u64,
        /// The RIP observed on the suspended thread.
        current: u64,
        /// The sleep gadget the thread was expected to be parked at.
        expected: u64,
    },

    /// An in-thread call did not return within its budget.
    #[error("call to {target:#x} timed out (wait result: {wait_result:?})")]
    CallTimeout {
        /// The function that was called.
        target: u64,
        /// Result of the wait that did not come back as signalled.
        wait_result: WaitStatus,
    },

    /// The called function never returned and the thread exited (e.g. `ExitThread`).
    #[error("thread died during call to {target:#x}")]
    ThreadDied {
        /// The function that was called.
        target: u64,
    },

    /// An in-thread `memset` returned null mid-write.
    #[error("in-thread memset returned null after writing {written} bytes")]
    WriteFailed {
        /// Bytes successfully written before the failing run.
        written: usize,
    },

    /// The underlying CRT primitive returned null, or the heap cannot grow any further.
    #[error("allocation of {size} bytes failed")]
    AllocFailed {
        /// The requested size.
        size: usize,
    },

    /// The gadget scanner rejected a byte pattern.
    #[error("gadget scanner rejected pattern '{0}'")]
    GadgetScanFailed(String),

    /// An address handed to [`Heap::free`](crate::Heap::free) belongs to no zone of that heap.
    #[error("address {address:#x} does not belong to any zone of this heap")]
    ForeignFree {
        /// The offending address.
        address: u64,
    },

    /// A zero-sized or otherwise malformed allocation request.
    #[error("invalid allocation size: {0}")]
    InvalidAllocSize(usize),

    /// A proxy operation was invoked before a delegate was bound to it.
    #[error("proxy operation '{0}' has no bound delegate")]
    NotBound(&'static str),

    /// The C runtime could not be resolved from `msvcrt.dll`.
    #[error("failed to resolve msvcrt: {0}")]
    CrtResolveFailed(String),

    /// Builder construction errors.
    #[error("{0}")]
    Builder(String),

    /// Returned when a Win32 API call fails.
    /// Contains the function name and the error code (GetLastError).
    #[error("Win32 API '{0}' failed with error code: {1}")]
    Win32(&'static str, u32),
}

impl std::fmt::Debug for NThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Convenient crate-wide result alias.
pub type Result<T> = std::result::Result<T, NThreadError>;
