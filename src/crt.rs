//! Resolution of the `msvcrt.dll` exports the hijack drives, once per process.
//!
//! Every memory operation the library performs inside the target ultimately lands on one
//! of these routines; `memset` alone carries the whole write path.

use std::sync::OnceLock;

use crate::error::{NThreadError, Result};
use crate::native::Module;

/// The resolved addresses of the CRT routines used through in-thread calls.
#[derive(Debug, Clone, Copy)]
pub struct Crt {
    pub fopen: u64,
    pub memset: u64,
    pub malloc: u64,
    pub calloc: u64,
    pub realloc: u64,
    pub fwrite: u64,
    pub fflush: u64,
    pub fclose: u64,
    pub fread: u64,
    pub free: u64,
}

static CRT: OnceLock<std::result::Result<Crt, String>> = OnceLock::new();

impl Crt {
    /// Returns the process-wide CRT table, resolving it on first use.
    pub fn get() -> Result<&'static Crt> {
        match CRT.get_or_init(|| Crt::resolve().map_err(|e| e.to_string())) {
            Ok(crt) => Ok(crt),
            Err(reason) => Err(NThreadError::CrtResolveFailed(reason.clone())),
        }
    }

    fn resolve() -> Result<Crt> {
        let msvcrt = Module::open("msvcrt.dll")?;
        Ok(Crt {
            fopen: msvcrt.proc_address("fopen")?,
            memset: msvcrt.proc_address("memset")?,
            malloc: msvcrt.proc_address("malloc")?,
            calloc: msvcrt.proc_address("calloc")?,
            realloc: msvcrt.proc_address("realloc")?,
            fwrite: msvcrt.proc_address("fwrite")?,
            fflush: msvcrt.proc_address("fflush")?,
            fclose: msvcrt.proc_address("fclose")?,
            fread: msvcrt.proc_address("fread")?,
            free: msvcrt.proc_address("free")?,
        })
    }

    /// Looks an export up by name.
    pub fn by_name(&self, name: &str) -> Option<u64> {
        match name {
            "fopen" => Some(self.fopen),
            "memset" => Some(self.memset),
            "malloc" => Some(self.malloc),
            "calloc" => Some(self.calloc),
            "realloc" => Some(self.realloc),
            "fwrite" => Some(self.fwrite),
            "fflush" => Some(self.fflush),
            "fclose" => Some(self.fclose),
            "fread" => Some(self.fread),
            "free" => Some(self.free),
            _ => None,
        }
    }

    /// The exports exposed through the proxy's generic CRT entry point.
    ///
    /// `free` is deliberately absent: it participates in allocator policy and is a
    /// first-class proxy method instead.
    pub fn bindable(&self) -> [(&'static str, u64); 9] {
        [
            ("fopen", self.fopen),
            ("memset", self.memset),
            ("malloc", self.malloc),
            ("calloc", self.calloc),
            ("realloc", self.realloc),
            ("fwrite", self.fwrite),
            ("fflush", self.fflush),
            ("fclose", self.fclose),
            ("fread", self.fread),
        ]
    }
}
