//! Loaded-module lookup, export resolution and executable-page byte scanning.

use std::ffi::CString;

use windows_sys::Win32::Foundation::{GetLastError, HMODULE};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress, LoadLibraryA};
use windows_sys::Win32::System::Memory::{
    VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD,
};
use windows_sys::Win32::System::ProcessStatus::{K32GetModuleInformation, MODULEINFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::error::{NThreadError, Result};

/// A module loaded into the current process.
pub struct Module {
    base: usize,
    size: usize,
}

impl Module {
    /// Looks up a loaded module by name, loading it if it is not yet present.
    ///
    /// The load path matters only for `msvcrt.dll`, which some processes do not map by
    /// default; the system modules the scanner cares about are always resident.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| NThreadError::Win32("GetModuleHandleA", 0))?;

        let mut handle: HMODULE = unsafe { GetModuleHandleA(c_name.as_ptr().cast()) };
        if handle.is_null() {
            handle = unsafe { LoadLibraryA(c_name.as_ptr().cast()) };
        }
        if handle.is_null() {
            return Err(NThreadError::Win32("LoadLibraryA", unsafe {
                GetLastError()
            }));
        }

        // SAFETY: MODULEINFO is plain data filled by the OS.
        let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
        let success = unsafe {
            K32GetModuleInformation(
                GetCurrentProcess(),
                handle,
                &mut info,
                size_of::<MODULEINFO>() as u32,
            )
        };
        if success == 0 {
            return Err(NThreadError::Win32("K32GetModuleInformation", unsafe {
                GetLastError()
            }));
        }

        Ok(Self {
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
        })
    }

    /// Base address of the mapped image.
    pub fn base(&self) -> u64 {
        self.base as u64
    }

    /// Size of the mapped image in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolves an exported symbol to its absolute address.
    pub fn proc_address(&self, name: &str) -> Result<u64> {
        let c_name = CString::new(name)
            .map_err(|_| NThreadError::Win32("GetProcAddress", 0))?;

        let proc = unsafe { GetProcAddress(self.base as HMODULE, c_name.as_ptr().cast()) };
        match proc {
            Some(f) => Ok(f as usize as u64),
            None => Err(NThreadError::Win32("GetProcAddress", unsafe {
                GetLastError()
            })),
        }
    }

    /// Scans the module's executable pages for every occurrence of an exact byte pattern.
    ///
    /// Only committed regions with an execute protection (and without `PAGE_GUARD`) are
    /// searched, so every hit is a usable gadget address.
    pub fn scan(&self, pattern: &[u8]) -> Vec<u64> {
        let mut hits = Vec::new();
        if pattern.is_empty() {
            return hits;
        }

        for (region_base, region_size) in self.executable_regions() {
            // SAFETY: the region was just reported committed and executable for
            // `region_size` bytes; image pages of system modules stay mapped.
            let data =
                unsafe { std::slice::from_raw_parts(region_base as *const u8, region_size) };

            let first = pattern[0];
            let mut offset = 0;
            while offset + pattern.len() <= data.len() {
                if data[offset] == first && data[offset..].starts_with(pattern) {
                    hits.push((region_base + offset) as u64);
                }
                offset += 1;
            }
        }

        hits
    }

    /// Walks `VirtualQuery` over the image and collects `(base, size)` of every
    /// committed, executable, non-guard region.
    fn executable_regions(&self) -> Vec<(usize, usize)> {
        const EXECUTE_MASK: u32 =
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

        let mut regions = Vec::new();
        let end = self.base + self.size;
        let mut cursor = self.base;

        while cursor < end {
            // SAFETY: MEMORY_BASIC_INFORMATION is plain data filled by the OS.
            let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let written = unsafe {
                VirtualQuery(
                    cursor as *const _,
                    &mut mbi,
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                break;
            }

            let region_base = mbi.BaseAddress as usize;
            let region_size = mbi.RegionSize;
            if region_size == 0 {
                break;
            }

            let executable = mbi.State == MEM_COMMIT
                && (mbi.Protect & EXECUTE_MASK) != 0
                && (mbi.Protect & PAGE_GUARD) == 0;
            if executable {
                let clipped = region_size.min(end - region_base);
                regions.push((region_base, clipped));
            }

            cursor = region_base + region_size;
        }

        regions
    }
}
