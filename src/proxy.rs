//! The user-facing handle to a captured thread.
//!
//! Every operation on a [`ProxyThread`] goes through a replaceable delegate slot, so
//! memory policy can be customised without touching the hijack core: the public wrapper
//! hands the proxy itself to the delegate, which lets user-supplied delegates re-enter
//! other proxy methods. At construction the orchestrator binds call, write, alloc, free
//! and close to its dispatch hooks for the specific captured thread; reads default to
//! direct current-process memory access.

use std::sync::{Arc, Mutex};

use crate::crt::Crt;
use crate::error::{NThreadError, Result};
use crate::native::memory;
use crate::nthread::{Dispatch, SharedCaptured};

type ReadDelegate = dyn Fn(&ProxyThread, u64, &mut [u8]) -> Result<()> + Send + Sync;
type WriteDelegate = dyn Fn(&ProxyThread, u64, &[u8]) -> Result<usize> + Send + Sync;
type CallDelegate = dyn Fn(&ProxyThread, u64, &[u64]) -> Result<u64> + Send + Sync;
type AllocDelegate = dyn Fn(&ProxyThread, usize, &AllocOptions) -> Result<u64> + Send + Sync;
type FreeDelegate = dyn Fn(&ProxyThread, u64) -> Result<()> + Send + Sync;
type CloseDelegate = dyn Fn(&ProxyThread, Option<u32>) -> Result<()> + Send + Sync;

/// Options steering [`ProxyThread::alloc`] and the heap layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// Reallocate this existing allocation instead of making a fresh one.
    pub address: Option<u64>,
    /// Initial fill byte. `None` leaves the memory uninitialised (`malloc`); `0` maps
    /// to `calloc`; any other value is applied with an in-thread `memset`.
    pub fill: Option<u8>,
    /// Place the allocation in the snapshot-tracked read-only zone of the heap layer.
    /// `None` means read-write for fresh allocations and zone-preserving for reallocs.
    pub readonly: Option<bool>,
}

/// Supported encodings for [`ProxyThread::alloc_string`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StringEncoding {
    /// UTF-16 little-endian, two-byte null terminator.
    #[default]
    Utf16Le,
    /// Alias of UTF-16LE kept for callers speaking in UCS-2 terms.
    Ucs2,
    /// UTF-8, single-byte null terminator.
    Utf8,
    /// Bytes as-is (the caller vouches for 7-bit content), single-byte null terminator.
    Ascii,
}

impl StringEncoding {
    /// Encodes a string and appends the encoding's null terminator.
    pub fn encode_with_terminator(self, s: &str) -> Vec<u8> {
        match self {
            Self::Utf16Le | Self::Ucs2 => {
                let mut bytes: Vec<u8> =
                    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
            Self::Utf8 | Self::Ascii => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
        }
    }

    /// Terminator width in bytes.
    pub fn terminator_len(self) -> usize {
        match self {
            Self::Utf16Le | Self::Ucs2 => 2,
            Self::Utf8 | Self::Ascii => 1,
        }
    }
}

/// The stable facade over one captured thread.
pub struct ProxyThread {
    captured: SharedCaptured,
    dispatch: Arc<dyn Dispatch>,
    reader: Mutex<Arc<ReadDelegate>>,
    writer: Mutex<Arc<WriteDelegate>>,
    caller: Mutex<Arc<CallDelegate>>,
    allocer: Mutex<Arc<AllocDelegate>>,
    freer: Mutex<Arc<FreeDelegate>>,
    closer: Mutex<Arc<CloseDelegate>>,
}

impl ProxyThread {
    /// Binds a proxy to a captured thread and a dispatcher. Reads default to direct
    /// current-process access; everything else routes to the dispatch hooks.
    pub(crate) fn new(captured: SharedCaptured, dispatch: Arc<dyn Dispatch>) -> Self {
        let writer = {
            let d = Arc::clone(&dispatch);
            Arc::new(move |proxy: &ProxyThread, dest: u64, data: &[u8]| {
                d.thread_write(proxy, dest, data)
            }) as Arc<WriteDelegate>
        };
        let caller = {
            let d = Arc::clone(&dispatch);
            Arc::new(move |proxy: &ProxyThread, target: u64, args: &[u64]| {
                d.thread_call(proxy, target, args)
            }) as Arc<CallDelegate>
        };
        let allocer = {
            let d = Arc::clone(&dispatch);
            Arc::new(move |proxy: &ProxyThread, size: usize, opts: &AllocOptions| {
                d.thread_alloc(proxy, size, opts)
            }) as Arc<AllocDelegate>
        };
        let freer = {
            let d = Arc::clone(&dispatch);
            Arc::new(move |proxy: &ProxyThread, ptr: u64| d.thread_free(proxy, ptr))
                as Arc<FreeDelegate>
        };
        let closer = {
            let d = Arc::clone(&dispatch);
            Arc::new(move |proxy: &ProxyThread, suicide: Option<u32>| {
                d.thread_close(proxy, suicide)
            }) as Arc<CloseDelegate>
        };

        fn direct_reader(_proxy: &ProxyThread, address: u64, buf: &mut [u8]) -> Result<()> {
            memory::read_into(address, buf)
        }

        Self {
            captured,
            dispatch,
            reader: Mutex::new(Arc::new(direct_reader)),
            writer: Mutex::new(writer),
            caller: Mutex::new(caller),
            allocer: Mutex::new(allocer),
            freer: Mutex::new(freer),
            closer: Mutex::new(closer),
        }
    }

    /// The captured thread this proxy drives.
    pub fn captured(&self) -> &SharedCaptured {
        &self.captured
    }

    /// Reads `len` bytes from the target.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    /// Reads into a caller-provided buffer.
    pub fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let delegate = Arc::clone(&*self.reader.lock().unwrap());
        delegate(self, address, buf)
    }

    /// Writes a buffer into the target through memset decomposition.
    pub fn write(&self, dest: u64, data: &[u8]) -> Result<usize> {
        let delegate = Arc::clone(&*self.writer.lock().unwrap());
        delegate(self, dest, data)
    }

    /// Writes `size` bytes from an attacker-side pointer into the target.
    ///
    /// Always takes the plain decomposition path; the read-only registry is not
    /// consulted, so no snapshot-skipping happens here.
    pub fn write_from_pointer(&self, dest: u64, src: u64, size: usize) -> Result<usize> {
        self.dispatch.thread_write_with_pointer(self, dest, src, size)
    }

    /// Calls `target(args...)` inside the captured thread and returns RAX.
    pub fn call(&self, target: u64, args: &[u64]) -> Result<u64> {
        let delegate = Arc::clone(&*self.caller.lock().unwrap());
        delegate(self, target, args)
    }

    /// Allocates `size` bytes in the target.
    pub fn alloc(&self, size: usize, opts: &AllocOptions) -> Result<u64> {
        let delegate = Arc::clone(&*self.allocer.lock().unwrap());
        delegate(self, size, opts)
    }

    /// Frees an allocation obtained through [`alloc`](Self::alloc).
    pub fn free(&self, ptr: u64) -> Result<()> {
        let delegate = Arc::clone(&*self.freer.lock().unwrap());
        delegate(self, ptr)
    }

    /// Releases the captured thread (optionally terminating it with `suicide` as the
    /// exit code) and closes the handle.
    pub fn close(&self, suicide: Option<u32>) -> Result<()> {
        let delegate = Arc::clone(&*self.closer.lock().unwrap());
        delegate(self, suicide)
    }

    /// Encodes a string, appends the null terminator, allocates and writes it.
    /// Returns the target-side pointer.
    pub fn alloc_string(
        &self,
        s: &str,
        encoding: StringEncoding,
        opts: &AllocOptions,
    ) -> Result<u64> {
        let bytes = encoding.encode_with_terminator(s);
        let ptr = self.alloc(bytes.len(), opts)?;
        self.write(ptr, &bytes)?;
        Ok(ptr)
    }

    // === CRT surface ===

    /// Calls a bindable `msvcrt` export by name inside the captured thread.
    ///
    /// `free` is not bindable here: it participates in allocator policy and lives as
    /// the first-class [`free`](Self::free) method instead.
    pub fn crt_call(&self, name: &str, args: &[u64]) -> Result<u64> {
        let crt = Crt::get()?;
        let address = crt
            .bindable()
            .iter()
            .find(|(export, _)| *export == name)
            .map(|(_, address)| *address)
            .ok_or_else(|| {
                NThreadError::CrtResolveFailed(format!("'{name}' is not a bindable export"))
            })?;
        self.call(address, args)
    }

    /// In-thread `malloc(size)`.
    pub fn malloc(&self, size: usize) -> Result<u64> {
        let crt = Crt::get()?;
        self.call(crt.malloc, &[size as u64])
    }

    /// In-thread `calloc(count, size)`.
    pub fn calloc(&self, count: usize, size: usize) -> Result<u64> {
        let crt = Crt::get()?;
        self.call(crt.calloc, &[count as u64, size as u64])
    }

    /// In-thread `realloc(ptr, size)`.
    pub fn realloc(&self, ptr: u64, size: usize) -> Result<u64> {
        let crt = Crt::get()?;
        self.call(crt.realloc, &[ptr, size as u64])
    }

    /// In-thread `memset(dest, value, len)`.
    pub fn memset(&self, dest: u64, value: u8, len: usize) -> Result<u64> {
        let crt = Crt::get()?;
        self.call(crt.memset, &[dest, value as u64, len as u64])
    }

    // === Delegate setters ===

    /// Replaces the read delegate.
    pub fn set_reader(
        &self,
        f: impl Fn(&ProxyThread, u64, &mut [u8]) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.reader.lock().unwrap() = Arc::new(f);
    }

    /// Replaces the write delegate.
    pub fn set_writer(
        &self,
        f: impl Fn(&ProxyThread, u64, &[u8]) -> Result<usize> + Send + Sync + 'static,
    ) {
        *self.writer.lock().unwrap() = Arc::new(f);
    }

    /// Replaces the call delegate.
    pub fn set_caller(
        &self,
        f: impl Fn(&ProxyThread, u64, &[u64]) -> Result<u64> + Send + Sync + 'static,
    ) {
        *self.caller.lock().unwrap() = Arc::new(f);
    }

    /// Replaces the alloc delegate.
    pub fn set_allocer(
        &self,
        f: impl Fn(&ProxyThread, usize, &AllocOptions) -> Result<u64> + Send + Sync + 'static,
    ) {
        *self.allocer.lock().unwrap() = Arc::new(f);
    }

    /// Replaces the free delegate.
    pub fn set_freer(
        &self,
        f: impl Fn(&ProxyThread, u64) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.freer.lock().unwrap() = Arc::new(f);
    }

    /// Replaces the close delegate.
    pub fn set_closer(
        &self,
        f: impl Fn(&ProxyThread, Option<u32>) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.closer.lock().unwrap() = Arc::new(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_encoding_appends_wide_terminator() {
        let bytes = StringEncoding::Utf16Le.encode_with_terminator("Hi");
        assert_eq!(bytes, vec![b'H', 0, b'i', 0, 0, 0]);
    }

    #[test]
    fn utf8_encoding_appends_single_terminator() {
        let bytes = StringEncoding::Utf8.encode_with_terminator("Hi");
        assert_eq!(bytes, vec![b'H', b'i', 0]);
    }

    #[test]
    fn string_sizes_match_the_wire_format() {
        let s = "Hello, NThread!";
        let bytes = StringEncoding::Utf16Le.encode_with_terminator(s);
        assert_eq!(bytes.len(), (s.len() + 1) * 2);
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
    }
}
