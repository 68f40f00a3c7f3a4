//! Attacker-side (current process) memory primitives.
//!
//! These never touch the hijacked thread; they exist for staging buffers, for the proxy's
//! default reader, and for hosting manually registered gadgets.

use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    PAGE_READWRITE,
};

use crate::error::{NThreadError, Result};

/// Reads `buf.len()` bytes from an address in the current process.
pub fn read_into(address: u64, buf: &mut [u8]) -> Result<()> {
    if address == 0 {
        return Err(NThreadError::Win32("memory::read", 0));
    }
    // SAFETY: the caller asserts the address is readable for `buf.len()` bytes; this is
    // the same-process fast path the proxy binds as its default reader.
    unsafe {
        std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
    }
    Ok(())
}

/// Reads `len` bytes from an address in the current process.
pub fn read(address: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_into(address, &mut buf)?;
    Ok(buf)
}

/// Writes a buffer to an address in the current process. Returns the byte count.
pub fn write(address: u64, data: &[u8]) -> Result<usize> {
    if address == 0 {
        return Err(NThreadError::Win32("memory::write", 0));
    }
    // SAFETY: the caller asserts the destination is writable for `data.len()` bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
    }
    Ok(data.len())
}

/// Copies `size` bytes between two raw addresses in the current process.
pub fn write_with_pointer(dest: u64, src: u64, size: usize) -> Result<usize> {
    if dest == 0 || src == 0 {
        return Err(NThreadError::Win32("memory::write_with_pointer", 0));
    }
    // SAFETY: the caller asserts both spans are valid and non-overlapping.
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, size);
    }
    Ok(size)
}

/// Allocates zero-initialised read-write memory in the current process.
pub fn alloc(size: usize) -> Result<u64> {
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if ptr.is_null() {
        Err(NThreadError::Win32("VirtualAlloc", unsafe { GetLastError() }))
    } else {
        Ok(ptr as u64)
    }
}

/// Allocates executable memory in the current process and copies `code` into it.
///
/// Used to host hand-planted gadgets (and the parked entry point of test threads);
/// the target process is never touched through this path.
pub fn alloc_code(code: &[u8]) -> Result<u64> {
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            code.len().max(1),
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        return Err(NThreadError::Win32("VirtualAlloc", unsafe {
            GetLastError()
        }));
    }
    // SAFETY: the fresh allocation is at least `code.len()` bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
    }
    Ok(ptr as u64)
}

/// Releases memory obtained from [`alloc`] or [`alloc_code`].
pub fn free(address: u64) -> Result<()> {
    let success = unsafe { VirtualFree(address as *mut _, 0, MEM_RELEASE) };
    if success == 0 {
        Err(NThreadError::Win32("VirtualFree", unsafe { GetLastError() }))
    } else {
        Ok(())
    }
}
