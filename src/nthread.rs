//! The hijack orchestrator: inject sequence, in-thread calls and the dispatch hooks.
//!
//! Injection parks a victim thread by chaining the pivot onto the sleep gadget:
//! the pivot executes `push reg; ret`, and since the pivot register was preloaded with
//! the sleep address, the `ret` lands the thread in the infinite loop. The stack pointer
//! handed to every subsequent in-thread call is positioned so the callee's own `ret`
//! pops the sleep address again and the thread re-parks by itself.

use std::sync::{Arc, Mutex};

use crate::asm::Register;
use crate::captured::CapturedThread;
use crate::crt::Crt;
use crate::error::{NThreadError, Result};
use crate::gadget;
use crate::native::{memory, Thread, WaitStatus};
use crate::proxy::{AllocOptions, ProxyThread, StringEncoding};
use crate::romem;
use crate::writer::{self, Run};

/// Budget for the thread to reach the park during injection.
pub const INJECT_TIMEOUT_MS: u64 = 5000;

/// Default budget for an in-thread call to return.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;

/// The Microsoft x64 calling convention passes at most four arguments in registers.
pub const MAX_CALL_ARGS: usize = 4;

/// Argument registers of the Microsoft x64 calling convention, in order.
const ARG_REGISTERS: [Register; 4] =
    [Register::Rcx, Register::Rdx, Register::R8, Register::R9];

/// A captured thread shared between the proxy and the caller.
///
/// The mutex is the per-thread serialisation the call protocol requires: two outstanding
/// calls on one captured thread are undefined, so every dispatch path locks it for the
/// full duration of the operation.
pub type SharedCaptured = Arc<Mutex<CapturedThread>>;

/// What to hijack: an existing TID, or an already-opened handle whose ownership is
/// transferred (adoption).
pub enum ThreadTarget {
    Tid(u32),
    Thread(Thread),
}

impl From<u32> for ThreadTarget {
    fn from(tid: u32) -> Self {
        Self::Tid(tid)
    }
}

impl From<Thread> for ThreadTarget {
    fn from(thread: Thread) -> Self {
        Self::Thread(thread)
    }
}

/// The base hijack orchestrator.
///
/// Gadgets are taken from the process-wide registry unless pinned explicitly; the
/// allocation hooks go straight to the target CRT. [`NThreadHeap`](crate::NThreadHeap)
/// layers a zone allocator on top of the same inject sequence.
#[derive(Default)]
pub struct NThread {
    process_id: Option<u32>,
    sleep_address: Option<u64>,
    pushret_address: Option<u64>,
    reg_key: Option<Register>,
}

/// A fluent builder for [`NThread`], validating the gadget configuration.
#[derive(Default)]
pub struct NThreadBuilder {
    process_id: Option<u32>,
    sleep_address: Option<u64>,
    pushret_address: Option<u64>,
    reg_key: Option<Register>,
}

impl NThreadBuilder {
    /// Creates a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the PID the victim threads belong to.
    ///
    /// Thread handles are opened by TID alone; the PID is carried as metadata for
    /// callers juggling several targets, and to signal that the default direct-memory
    /// reader does not apply.
    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    /// Pins the sleep gadget instead of consulting the registry.
    pub fn sleep_address(mut self, address: u64) -> Self {
        self.sleep_address = Some(address);
        self
    }

    /// Pins the pivot gadget instead of consulting the registry.
    ///
    /// Requires [`reg_key`](Self::reg_key): the library cannot know which register a
    /// hand-picked `push <reg>; ret` sequence pushes.
    pub fn pushret_address(mut self, address: u64) -> Self {
        self.pushret_address = Some(address);
        self
    }

    /// Selects (or, with a pinned pivot, declares) the pivot register.
    pub fn reg_key(mut self, reg: Register) -> Self {
        self.reg_key = Some(reg);
        self
    }

    /// Consumes the builder, validates the configuration and returns the orchestrator.
    ///
    /// # Errors
    /// Returns [`NThreadError::Builder`] when a pivot address is pinned without its
    /// register.
    pub fn build(self) -> Result<NThread> {
        if self.pushret_address.is_some() && self.reg_key.is_none() {
            return Err(NThreadError::Builder(
                "a pinned pushret address requires reg_key".into(),
            ));
        }
        Ok(NThread {
            process_id: self.process_id,
            sleep_address: self.sleep_address,
            pushret_address: self.pushret_address,
            reg_key: self.reg_key,
        })
    }
}

impl NThread {
    /// Creates an orchestrator with registry-chosen gadgets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fluent configuration.
    pub fn builder() -> NThreadBuilder {
        NThreadBuilder::new()
    }

    /// The configured target PID, if any.
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    /// Hijacks a thread and parks it on a sleep gadget.
    ///
    /// On success the returned proxy's call/write/alloc/free/close operations are bound
    /// to this orchestrator's hooks for the captured thread, and the thread's hardware
    /// RIP equals the sleep address. On failure the thread is restored to its original
    /// state as far as possible.
    pub fn inject(
        &self,
        target: impl Into<ThreadTarget>,
    ) -> Result<(ProxyThread, SharedCaptured)> {
        self.inject_with(target.into(), Arc::new(BaseDispatch))
    }

    /// Convenience forwarding of [`ProxyThread::alloc_string`].
    pub fn alloc_string(
        proxy: &ProxyThread,
        s: &str,
        encoding: StringEncoding,
        opts: &AllocOptions,
    ) -> Result<u64> {
        proxy.alloc_string(s, encoding, opts)
    }

    pub(crate) fn inject_with(
        &self,
        target: ThreadTarget,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<(ProxyThread, SharedCaptured)> {
        let thread = match target {
            ThreadTarget::Tid(tid) => Thread::open(tid)?,
            ThreadTarget::Thread(thread) => thread,
        };

        let (pivot_address, reg_key) = match self.pushret_address {
            Some(address) => {
                let reg = self.reg_key.ok_or_else(|| {
                    NThreadError::Builder("a pinned pushret address requires reg_key".into())
                })?;
                (address, reg)
            }
            None => gadget::pick_pivot(self.reg_key)?,
        };
        let sleep_address = match self.sleep_address {
            Some(address) => address,
            None => gadget::pick_sleep()?,
        };
        crate::info!(
            "inject: sleep gadget {:#x}, pivot {:#x} via {}",
            sleep_address,
            pivot_address,
            reg_key.name()
        );

        let mut captured = CapturedThread::new(thread, sleep_address, reg_key);
        captured.suspend()?;
        if let Err(e) = Self::park(&mut captured, pivot_address) {
            // Put the thread back where it was; the park never took hold.
            captured.release();
            return Err(e);
        }

        let shared: SharedCaptured = Arc::new(Mutex::new(captured));
        let proxy = ProxyThread::new(Arc::clone(&shared), dispatch);
        Ok((proxy, shared))
    }

    /// Runs the pivot chain on a suspended thread and waits for the park.
    fn park(captured: &mut CapturedThread, pivot_address: u64) -> Result<()> {
        captured.fetch_context()?;
        captured.save_snapshot();

        let orig_rip = captured.rip();
        let orig_rsp = captured.rsp();
        let orig_reg = captured.target_reg();

        // The pivot executes `push reg; ret`: after the push, `stack_begin - 8` holds
        // the sleep address and the ret consumes it. Re-using `stack_begin - 8` as RSP
        // for later calls means every callee's final ret pops the sleep address again.
        let stack_begin = CapturedThread::calc_stack_begin(orig_rsp);
        captured.set_call_rsp(stack_begin - 8);

        captured.set_rip(pivot_address);
        captured.set_rsp(stack_begin);
        captured.set_target_reg(captured.sleep_address());
        captured.apply_context()?;
        captured.resume()?;

        match captured.wait(INJECT_TIMEOUT_MS) {
            WaitStatus::Object0 => {}
            other => return Err(NThreadError::InjectTimeout { wait_result: other }),
        }

        // The wait left the parked register state in the cache. Patch the saved
        // snapshot so release() restores the thread to exactly where it was.
        captured.fetch_context()?;
        captured.set_saved_rip_rsp(orig_rip, orig_rsp);
        captured.set_saved_reg(captured.reg_key(), orig_reg);
        crate::debug!("inject: thread parked at {:#x}", captured.sleep_address());
        Ok(())
    }
}

/// Performs one call inside the captured thread and returns RAX.
///
/// Not re-entrant for a single captured thread; the dispatch layer serialises callers
/// through the shared mutex.
pub fn thread_call(
    captured: &mut CapturedThread,
    target: u64,
    args: &[u64],
    timeout_ms: u64,
) -> Result<u64> {
    if args.len() > MAX_CALL_ARGS {
        return Err(NThreadError::TooManyArgs(args.len()));
    }

    captured.suspend()?;
    if let Err(e) = captured.fetch_context() {
        let _ = captured.resume();
        return Err(e);
    }

    // The thread must still be parked; a foreign RIP means it escaped and a second
    // hijack attempt would corrupt whatever it is doing now.
    let current = captured.rip();
    if current != captured.sleep_address() {
        let _ = captured.resume();
        return Err(NThreadError::RipMismatch {
            target,
            current,
            expected: captured.sleep_address(),
        });
    }

    for (reg, value) in ARG_REGISTERS.iter().zip(args) {
        captured.set_reg(*reg, *value);
    }
    captured.set_rip(target);
    captured.set_rsp(captured.call_rsp());
    captured.apply_context()?;
    captured.resume()?;

    match captured.wait(timeout_ms) {
        WaitStatus::Object0 => {
            let rax = captured.reg(Register::Rax);
            crate::debug!("call {:#x} returned {:#x}", target, rax);
            Ok(rax)
        }
        WaitStatus::Failed => Err(NThreadError::ThreadDied { target }),
        other => Err(NThreadError::CallTimeout {
            target,
            wait_result: other,
        }),
    }
}

// ==============================================================================================

/// The overridable dispatch hooks behind every proxy operation.
///
/// The default methods implement the base orchestrator behaviour; implementers override
/// individual hooks to layer policy (the heap allocator overrides alloc/free/close) and
/// reach the base behaviour through the `default_*` functions.
pub trait Dispatch: Send + Sync {
    /// Runs `target(args...)` inside the captured thread and returns RAX.
    fn thread_call(&self, proxy: &ProxyThread, target: u64, args: &[u64]) -> Result<u64> {
        default_thread_call(proxy, target, args)
    }

    /// Writes a buffer into the target via memset decomposition, consulting the
    /// read-only registry for snapshot-skipping.
    fn thread_write(&self, proxy: &ProxyThread, dest: u64, data: &[u8]) -> Result<usize> {
        default_thread_write(proxy, dest, data)
    }

    /// Writes `size` bytes from an attacker-side pointer; always the plain path.
    fn thread_write_with_pointer(
        &self,
        proxy: &ProxyThread,
        dest: u64,
        src: u64,
        size: usize,
    ) -> Result<usize> {
        default_thread_write_with_pointer(proxy, dest, src, size)
    }

    /// Allocates in the target through the CRT.
    fn thread_alloc(&self, proxy: &ProxyThread, size: usize, opts: &AllocOptions) -> Result<u64> {
        default_thread_alloc(proxy, size, opts)
    }

    /// Frees a CRT allocation in the target.
    fn thread_free(&self, proxy: &ProxyThread, ptr: u64) -> Result<()> {
        default_thread_free(proxy, ptr)
    }

    /// Optionally terminates the thread, then releases and closes it.
    fn thread_close(&self, proxy: &ProxyThread, suicide: Option<u32>) -> Result<()> {
        default_thread_close(proxy, suicide)
    }
}

/// The stateless base dispatcher: every hook keeps its default behaviour.
pub(crate) struct BaseDispatch;

impl Dispatch for BaseDispatch {}

pub(crate) fn default_thread_call(
    proxy: &ProxyThread,
    target: u64,
    args: &[u64],
) -> Result<u64> {
    let mut captured = proxy.captured().lock().unwrap();
    thread_call(&mut captured, target, args, DEFAULT_CALL_TIMEOUT_MS)
}

pub(crate) fn default_thread_write(
    proxy: &ProxyThread,
    dest: u64,
    data: &[u8],
) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    if let Some(region) = romem::find_overlapping_region(dest, data.len()) {
        if let Some(info) = romem::overlap_info(dest, data.len(), region) {
            return write_with_snapshot(proxy, dest, data, region, &info);
        }
    }
    write_plain(proxy, dest, data)
}

pub(crate) fn default_thread_write_with_pointer(
    proxy: &ProxyThread,
    dest: u64,
    src: u64,
    size: usize,
) -> Result<usize> {
    // The read-only registry is deliberately not consulted on this path: callers use it
    // precisely when the source contents are unknown at design time.
    let data = memory::read(src, size)?;
    write_plain(proxy, dest, &data)
}

pub(crate) fn default_thread_alloc(
    proxy: &ProxyThread,
    size: usize,
    opts: &AllocOptions,
) -> Result<u64> {
    let crt = Crt::get()?;

    if let Some(address) = opts.address {
        let ptr = proxy.call(crt.realloc, &[address, size as u64])?;
        if ptr == 0 {
            return Err(NThreadError::AllocFailed { size });
        }
        return Ok(ptr);
    }

    match opts.fill {
        None => {
            let ptr = proxy.call(crt.malloc, &[size as u64])?;
            if ptr == 0 {
                return Err(NThreadError::AllocFailed { size });
            }
            Ok(ptr)
        }
        Some(0) => {
            let ptr = proxy.call(crt.calloc, &[1, size as u64])?;
            if ptr == 0 {
                return Err(NThreadError::AllocFailed { size });
            }
            Ok(ptr)
        }
        Some(fill) => {
            let ptr = proxy.call(crt.malloc, &[size as u64])?;
            if ptr == 0 {
                return Err(NThreadError::AllocFailed { size });
            }
            proxy.call(crt.memset, &[ptr, fill as u64, size as u64])?;
            Ok(ptr)
        }
    }
}

pub(crate) fn default_thread_free(proxy: &ProxyThread, ptr: u64) -> Result<()> {
    let crt = Crt::get()?;
    proxy.call(crt.free, &[ptr])?;
    Ok(())
}

pub(crate) fn default_thread_close(proxy: &ProxyThread, suicide: Option<u32>) -> Result<()> {
    if let Some(exit_code) = suicide {
        let captured = proxy.captured().lock().unwrap();
        // The thread may already be gone; closing still has to proceed.
        let _ = captured.terminate(exit_code);
    }
    let mut captured = proxy.captured().lock().unwrap();
    captured.close();
    Ok(())
}

// ==============================================================================================

/// Issues one in-thread `memset` per run of the buffer. Returns bytes written.
fn write_plain(proxy: &ProxyThread, dest: u64, data: &[u8]) -> Result<usize> {
    let mut written = 0usize;
    for run in writer::runs(data) {
        let ret = memset_run(proxy, dest, &run)?;
        if ret == 0 {
            return Err(NThreadError::WriteFailed { written });
        }
        written += run.len;
    }
    Ok(written)
}

/// Splits a write overlapping a read-only region into up to three spans and skips every
/// overlap byte that already matches the snapshot.
fn write_with_snapshot(
    proxy: &ProxyThread,
    dest: u64,
    data: &[u8],
    region: romem::RegionId,
    info: &romem::OverlapInfo,
) -> Result<usize> {
    let mut written = 0usize;

    let before = &data[..info.write_offset];
    if !before.is_empty() {
        written += default_thread_write(proxy, dest, before)?;
    }

    let overlap = &data[info.write_offset..info.write_offset + info.overlap_len];
    let overlap_dest = dest + info.write_offset as u64;
    let mut overlap_written = 0usize;
    for run in writer::snapshot_runs(overlap, &info.snapshot) {
        let ret = memset_run(proxy, overlap_dest, &run)?;
        if ret == 0 {
            return Err(NThreadError::WriteFailed {
                written: written + overlap_written,
            });
        }
        overlap_written += run.len;
    }
    romem::update_snapshot(region, overlap, overlap_dest);
    // Snapshot-skipped bytes already hold the right value; the whole span is done.
    written += info.overlap_len;

    let after_offset = info.write_offset + info.overlap_len;
    let after = &data[after_offset..];
    if !after.is_empty() {
        let base = written;
        written += default_thread_write(proxy, dest + after_offset as u64, after)
            .map_err(|e| add_partial(e, base))?;
    }

    Ok(written)
}

/// Folds previously written bytes into a partial-write error from a later span.
fn add_partial(error: NThreadError, base: usize) -> NThreadError {
    match error {
        NThreadError::WriteFailed { written } => NThreadError::WriteFailed {
            written: base + written,
        },
        other => other,
    }
}

fn memset_run(proxy: &ProxyThread, dest: u64, run: &Run) -> Result<u64> {
    let crt = Crt::get()?;
    proxy.call(
        crt.memset,
        &[dest + run.offset as u64, run.value as u64, run.len as u64],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_pivot_requires_its_register() {
        let result = NThread::builder().pushret_address(0x1000).build();
        assert!(matches!(result, Err(NThreadError::Builder(_))));

        let built = NThread::builder()
            .pushret_address(0x1000)
            .reg_key(Register::Rbx)
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn builder_carries_the_process_id() {
        let nthread = NThread::builder().process_id(4242).build().unwrap();
        assert_eq!(nthread.process_id(), Some(4242));
    }
}
