//! Exclusive ownership of a native thread handle and its context primitives.

use std::ffi::c_void;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, FALSE, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_CONTROL_AMD64, CONTEXT_INTEGER_AMD64,
};
use windows_sys::Win32::System::Threading::{
    CreateThread, GetExitCodeThread, GetThreadId, OpenThread, ResumeThread, SuspendThread,
    TerminateThread, WaitForSingleObject, THREAD_ALL_ACCESS,
};

use crate::error::{NThreadError, Result};
use crate::native::WaitStatus;

/// Context flags selecting the integer and control register classes.
///
/// Everything the hijack manipulates (RIP, RSP, the GP registers and EFLAGS) lives in
/// these two classes; debug and extended-state registers are left alone.
pub const CONTEXT_INTEGER_CONTROL: u32 = CONTEXT_INTEGER_AMD64 | CONTEXT_CONTROL_AMD64;

/// An exclusively owned native thread handle.
///
/// The handle is closed when the value is dropped (or earlier, via [`Thread::close`]).
pub struct Thread {
    handle: HANDLE,
}

// SAFETY: the handle is an opaque kernel object reference; ownership is exclusive and
// every operation goes through &self FFI calls that are thread-safe on the OS side.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Opens an existing thread by its TID with full access rights.
    pub fn open(thread_id: u32) -> Result<Self> {
        let handle = unsafe { OpenThread(THREAD_ALL_ACCESS, FALSE, thread_id) };
        if handle.is_null() {
            Err(NThreadError::Win32("OpenThread", unsafe { GetLastError() }))
        } else {
            Ok(Self { handle })
        }
    }

    /// Adopts an already-opened handle, transferring ownership to the returned value.
    ///
    /// # Safety
    /// `handle` must be a valid thread handle with suspend/resume, context, query,
    /// terminate and synchronize rights, and must not be closed by anyone else.
    pub unsafe fn from_raw(handle: HANDLE) -> Self {
        Self { handle }
    }

    /// Spawns a thread in the current process starting at an arbitrary code address.
    pub fn create(entry: u64, arg: u64) -> Result<Self> {
        let mut thread_id: u32 = 0;
        // SAFETY: the caller vouches that `entry` points at executable code with thread
        // start routine semantics.
        let handle = unsafe {
            let start: unsafe extern "system" fn(*mut c_void) -> u32 =
                std::mem::transmute(entry as usize);
            CreateThread(
                std::ptr::null(),
                0,
                Some(start),
                arg as *const c_void,
                0,
                &mut thread_id,
            )
        };
        if handle.is_null() {
            Err(NThreadError::Win32("CreateThread", unsafe {
                GetLastError()
            }))
        } else {
            Ok(Self { handle })
        }
    }

    /// Whether the handle is still open.
    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }

    /// The thread's TID.
    pub fn id(&self) -> Result<u32> {
        let tid = unsafe { GetThreadId(self.handle) };
        if tid == 0 {
            Err(NThreadError::Win32("GetThreadId", unsafe { GetLastError() }))
        } else {
            Ok(tid)
        }
    }

    /// Increments the thread's suspend count. Returns the previous count.
    pub fn suspend(&self) -> Result<u32> {
        let count = unsafe { SuspendThread(self.handle) };
        if count == u32::MAX {
            Err(NThreadError::Win32("SuspendThread", unsafe {
                GetLastError()
            }))
        } else {
            Ok(count)
        }
    }

    /// Decrements the thread's suspend count. Returns the previous count.
    pub fn resume(&self) -> Result<u32> {
        let count = unsafe { ResumeThread(self.handle) };
        if count == u32::MAX {
            Err(NThreadError::Win32("ResumeThread", unsafe {
                GetLastError()
            }))
        } else {
            Ok(count)
        }
    }

    /// Reads the thread's architectural context for the given register classes.
    pub fn get_context(&self, flags: u32) -> Result<CONTEXT> {
        // SAFETY: CONTEXT is a plain data struct; the OS fills the selected classes.
        let mut context: CONTEXT = unsafe { std::mem::zeroed() };
        context.ContextFlags = flags;

        let success = unsafe { GetThreadContext(self.handle, &mut context) };
        if success == 0 {
            Err(NThreadError::Win32("GetThreadContext", unsafe {
                GetLastError()
            }))
        } else {
            Ok(context)
        }
    }

    /// Applies the register classes selected by `context.ContextFlags` to the thread.
    pub fn set_context(&self, context: &CONTEXT) -> Result<()> {
        let success = unsafe { SetThreadContext(self.handle, context) };
        if success == 0 {
            Err(NThreadError::Win32("SetThreadContext", unsafe {
                GetLastError()
            }))
        } else {
            Ok(())
        }
    }

    /// Waits for the thread object to become signalled (i.e. for the thread to exit).
    pub fn wait(&self, timeout_ms: u32) -> WaitStatus {
        match unsafe { WaitForSingleObject(self.handle, timeout_ms) } {
            WAIT_OBJECT_0 => WaitStatus::Object0,
            WAIT_TIMEOUT => WaitStatus::Timeout,
            _ => WaitStatus::Failed,
        }
    }

    /// Forcibly terminates the thread with the given exit code.
    pub fn terminate(&self, exit_code: u32) -> Result<()> {
        let success = unsafe { TerminateThread(self.handle, exit_code) };
        if success == 0 {
            Err(NThreadError::Win32("TerminateThread", unsafe {
                GetLastError()
            }))
        } else {
            Ok(())
        }
    }

    /// Reads the thread's exit code (`STILL_ACTIVE` while it runs).
    pub fn exit_code(&self) -> Result<u32> {
        let mut code: u32 = 0;
        let success = unsafe { GetExitCodeThread(self.handle, &mut code) };
        if success == 0 {
            Err(NThreadError::Win32("GetExitCodeThread", unsafe {
                GetLastError()
            }))
        } else {
            Ok(code)
        }
    }

    /// Closes the handle early. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.close();
    }
}
