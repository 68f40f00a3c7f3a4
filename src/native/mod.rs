//! Raw OS bindings for thread control, module scanning and attacker-side memory.
//!
//! All `unsafe` FFI is confined to this module tree; the rest of the crate goes through
//! the safe wrappers defined here. Live bindings exist only on x64 Windows - the
//! platform-independent [`WaitStatus`] type is shared with error diagnostics and the
//! polling wait.

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod memory;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod module;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod thread;

#[cfg(all(windows, target_arch = "x86_64"))]
pub use module::Module;
#[cfg(all(windows, target_arch = "x86_64"))]
pub use thread::Thread;

/// Outcome of an OS-level wait or of the park-polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The waited condition was signalled (the thread parked, or exited).
    Object0,
    /// The wait budget elapsed before the condition was signalled.
    Timeout,
    /// The wait itself failed; for a parked thread this commonly means it is gone.
    Failed,
}
