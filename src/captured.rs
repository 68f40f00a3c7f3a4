//! Ownership and context cache of a hijacked thread.
//!
//! A [`CapturedThread`] owns the native handle, the register snapshot taken at park time
//! (used for restoration), and a working context cache that the orchestrator mutates
//! between hardware reads/writes. The polling [`wait`](CapturedThread::wait) is the only
//! way to observe the park: the OS offers no primitive for "wake me when this thread's
//! RIP equals X", so the cache is refreshed every millisecond until it does.

use std::time::{Duration, Instant};

use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT;

use crate::asm::Register;
use crate::error::Result;
use crate::native::thread::{Thread, CONTEXT_INTEGER_CONTROL};
use crate::native::WaitStatus;

/// Scratch distance below the thread's original RSP used for in-thread calls.
///
/// Far enough down that nothing on the thread's live stack is clobbered by callees.
const STACK_SCRATCH_BYTES: u64 = 8192;

/// Poll interval of the park wait.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reads a general-purpose register out of a context by name.
pub(crate) fn context_reg(context: &CONTEXT, reg: Register) -> u64 {
    match reg {
        Register::Rax => context.Rax,
        Register::Rcx => context.Rcx,
        Register::Rdx => context.Rdx,
        Register::Rbx => context.Rbx,
        Register::Rsp => context.Rsp,
        Register::Rbp => context.Rbp,
        Register::Rsi => context.Rsi,
        Register::Rdi => context.Rdi,
        Register::R8 => context.R8,
        Register::R9 => context.R9,
        Register::R10 => context.R10,
        Register::R11 => context.R11,
        Register::R12 => context.R12,
        Register::R13 => context.R13,
        Register::R14 => context.R14,
        Register::R15 => context.R15,
    }
}

/// Writes a general-purpose register in a context by name.
pub(crate) fn set_context_reg(context: &mut CONTEXT, reg: Register, value: u64) {
    match reg {
        Register::Rax => context.Rax = value,
        Register::Rcx => context.Rcx = value,
        Register::Rdx => context.Rdx = value,
        Register::Rbx => context.Rbx = value,
        Register::Rsp => context.Rsp = value,
        Register::Rbp => context.Rbp = value,
        Register::Rsi => context.Rsi = value,
        Register::Rdi => context.Rdi = value,
        Register::R8 => context.R8 = value,
        Register::R9 => context.R9 = value,
        Register::R10 => context.R10 = value,
        Register::R11 => context.R11 = value,
        Register::R12 => context.R12 = value,
        Register::R13 => context.R13 = value,
        Register::R14 => context.R14 = value,
        Register::R15 => context.R15 = value,
    }
}

/// A hijacked thread: native handle, saved state for restoration, working context cache.
pub struct CapturedThread {
    thread: Thread,
    saved_context: CONTEXT,
    latest_context: CONTEXT,
    suspend_count: u32,
    sleep_address: u64,
    reg_key: Register,
    call_rsp: u64,
}

impl CapturedThread {
    /// Wraps a thread handle for hijacking at `sleep_address` with the given pivot
    /// register. The context caches start zeroed; `inject` populates them.
    pub fn new(thread: Thread, sleep_address: u64, reg_key: Register) -> Self {
        Self {
            thread,
            // SAFETY: CONTEXT is a plain data struct; an all-zero value is inert until
            // a fetched context overwrites it.
            saved_context: unsafe { std::mem::zeroed() },
            latest_context: unsafe { std::mem::zeroed() },
            suspend_count: 0,
            sleep_address,
            reg_key,
            call_rsp: 0,
        }
    }

    /// The sleep gadget this thread parks at.
    pub fn sleep_address(&self) -> u64 {
        self.sleep_address
    }

    /// The register the pivot gadget pushes.
    pub fn reg_key(&self) -> Register {
        self.reg_key
    }

    /// The precomputed stack pointer used for every in-thread call.
    pub fn call_rsp(&self) -> u64 {
        self.call_rsp
    }

    pub(crate) fn set_call_rsp(&mut self, call_rsp: u64) {
        self.call_rsp = call_rsp;
    }

    /// Current balanced suspend depth.
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count
    }

    /// The owned native thread.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Suspends the thread. Failed suspends do not change the balance.
    pub fn suspend(&mut self) -> Result<()> {
        self.thread.suspend()?;
        self.suspend_count += 1;
        Ok(())
    }

    /// Resumes the thread, balancing one prior suspend.
    pub fn resume(&mut self) -> Result<()> {
        self.thread.resume()?;
        self.suspend_count = self.suspend_count.saturating_sub(1);
        Ok(())
    }

    /// Hardware -> cache: refreshes the working context (integer + control classes).
    pub fn fetch_context(&mut self) -> Result<()> {
        self.latest_context = self.thread.get_context(CONTEXT_INTEGER_CONTROL)?;
        Ok(())
    }

    /// Cache -> hardware: applies the working context to the thread.
    pub fn apply_context(&mut self) -> Result<()> {
        self.latest_context.ContextFlags = CONTEXT_INTEGER_CONTROL;
        self.thread.set_context(&self.latest_context)
    }

    /// Cached RIP.
    pub fn rip(&self) -> u64 {
        self.latest_context.Rip
    }

    /// Sets RIP in the cache only.
    pub fn set_rip(&mut self, rip: u64) {
        self.latest_context.Rip = rip;
    }

    /// Cached RSP.
    pub fn rsp(&self) -> u64 {
        self.latest_context.Rsp
    }

    /// Sets RSP in the cache only.
    pub fn set_rsp(&mut self, rsp: u64) {
        self.latest_context.Rsp = rsp;
    }

    /// Cached value of an arbitrary register.
    pub fn reg(&self, reg: Register) -> u64 {
        context_reg(&self.latest_context, reg)
    }

    /// Sets an arbitrary register in the cache only.
    pub fn set_reg(&mut self, reg: Register, value: u64) {
        set_context_reg(&mut self.latest_context, reg, value);
    }

    /// Cached value of the pivot register.
    pub fn target_reg(&self) -> u64 {
        self.reg(self.reg_key)
    }

    /// Sets the pivot register in the cache only.
    pub fn set_target_reg(&mut self, value: u64) {
        self.set_reg(self.reg_key, value);
    }

    /// Snapshots the working context as the restoration state.
    pub(crate) fn save_snapshot(&mut self) {
        self.saved_context = self.latest_context;
    }

    /// Patches one register of the restoration state.
    pub(crate) fn set_saved_reg(&mut self, reg: Register, value: u64) {
        set_context_reg(&mut self.saved_context, reg, value);
    }

    /// Patches RIP/RSP of the restoration state.
    pub(crate) fn set_saved_rip_rsp(&mut self, rip: u64, rsp: u64) {
        self.saved_context.Rip = rip;
        self.saved_context.Rsp = rsp;
    }

    /// Scratch stack base for in-thread calls: well below the thread's own stack and
    /// 16-byte aligned so SSE-using callees are happy.
    pub fn calc_stack_begin(base_rsp: u64) -> u64 {
        (base_rsp - STACK_SCRATCH_BYTES) & !0xF
    }

    /// Restores the thread to the state saved at park time and lets it run.
    ///
    /// Idempotent while the thread is alive. Errors are swallowed: the thread may
    /// legitimately be dead by the time restoration is attempted.
    pub fn release(&mut self) {
        if !self.thread.is_valid() {
            return;
        }
        let _ = self.suspend();
        self.latest_context = self.saved_context;
        let _ = self.apply_context();
        let _ = self.resume();
    }

    /// Best-effort release, then drains any residual suspend count and closes the
    /// handle. A still-alive thread is always left running.
    pub fn close(&mut self) {
        self.release();
        while self.suspend_count > 0 {
            if self.resume().is_err() {
                break;
            }
        }
        self.thread.close();
    }

    /// Forcibly terminates the thread.
    pub fn terminate(&self, exit_code: u32) -> Result<()> {
        self.thread.terminate(exit_code)
    }

    /// The thread's exit code (`STILL_ACTIVE` while it runs).
    pub fn exit_code(&self) -> Result<u32> {
        self.thread.exit_code()
    }

    /// Polls until the thread's hardware RIP equals the sleep gadget.
    ///
    /// Every iteration refreshes the context cache, so a successful wait leaves the
    /// post-park (or post-call) register state in the cache. When the context cannot be
    /// fetched, the OS thread-exit wait is probed with a zero timeout: an exited thread
    /// yields [`WaitStatus::Failed`], anything else surfaces the probe result. The
    /// outer budget runs on a monotonic clock.
    pub fn wait(&mut self, timeout_ms: u64) -> WaitStatus {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match self.fetch_context() {
                Ok(()) => {
                    if self.rip() == self.sleep_address {
                        return WaitStatus::Object0;
                    }
                    // Some systems report a frozen context for an exited thread instead
                    // of failing the fetch; the zero-timeout probe catches that too.
                    if self.thread.wait(0) == WaitStatus::Object0 {
                        return WaitStatus::Failed;
                    }
                }
                Err(_) => {
                    return match self.thread.wait(0) {
                        WaitStatus::Object0 => WaitStatus::Failed,
                        other => other,
                    };
                }
            }

            if Instant::now() >= deadline {
                return WaitStatus::Timeout;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_begin_is_aligned_and_below_rsp() {
        for rsp in [0x7FF6_0000_F000u64, 0x7FF6_0000_F008, 0x7FF6_0000_F00F] {
            let begin = CapturedThread::calc_stack_begin(rsp);
            assert_eq!(begin % 16, 0);
            assert!(begin <= rsp - STACK_SCRATCH_BYTES);
            // The call RSP derived from it lands 8 past a 16-byte boundary, mimicking
            // the stack shape immediately after a `call` instruction.
            assert_eq!((begin - 8) % 16, 8);
        }
    }
}
