//! Live end-to-end scenarios against real parked threads.
//!
//! Each test plants a `jmp .` gadget in executable memory, spawns a thread straight into
//! it and hijacks that thread. Everything runs inside the test process, so the in-thread
//! CRT calls operate on memory the assertions can read back directly.

#![cfg(all(windows, target_arch = "x86_64"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nthread::native::{memory, Module, Thread};
use nthread::romem;
use nthread::{
    asm, create_read_only_memory, thread_call, unregister_read_only_memory, AllocOptions, Error,
    NThread, NThreadHeap, ProxyThread, SharedCaptured, StringEncoding, WaitStatus,
};

/// Spawns a thread of this process that immediately parks itself on a planted gadget.
fn spawn_looping_thread() -> Thread {
    let gadget = memory::alloc_code(&asm::jmp_self()).expect("planting a loop gadget");
    let thread = Thread::create(gadget, 0).expect("spawning the victim thread");
    // Give the thread a moment to reach the loop; injection suspends it wherever it is.
    std::thread::sleep(Duration::from_millis(50));
    thread
}

/// Replaces the proxy's caller with a counting wrapper around the default call path.
fn count_calls(proxy: &ProxyThread, captured: &SharedCaptured) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let captured = Arc::clone(captured);
    proxy.set_caller(move |_proxy, target, args| {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut captured = captured.lock().unwrap();
        thread_call(&mut captured, target, args, 5000)
    });
    calls
}

#[test]
fn attach_write_read_exit() {
    let thread = spawn_looping_thread();
    let (proxy, captured) = NThread::new().inject(thread).expect("inject");

    // Park invariant: the hardware RIP sits on the sleep gadget.
    {
        let mut captured = captured.lock().unwrap();
        assert_eq!(captured.wait(100), WaitStatus::Object0);
        assert_eq!(captured.rip(), captured.sleep_address());
    }

    // Write through the hijacked thread, read back directly.
    let dest = memory::alloc(4).expect("staging buffer");
    let written = proxy.write(dest, &0xDEAD_BEEFu32.to_le_bytes()).expect("write");
    assert_eq!(written, 4);
    let bytes = memory::read(dest, 4).unwrap();
    assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0xDEAD_BEEF);
    assert_eq!(proxy.read(dest, 4).unwrap(), 0xDEAD_BEEFu32.to_le_bytes());

    // ExitThread never returns; the call must report the thread as dead.
    let exit_thread = Module::open("kernel32.dll")
        .and_then(|m| m.proc_address("ExitThread"))
        .expect("resolving ExitThread");
    let err = proxy.call(exit_thread, &[42]).unwrap_err();
    assert!(matches!(err, Error::ThreadDied { .. }), "got: {err}");

    assert_eq!(captured.lock().unwrap().exit_code().unwrap(), 42);

    proxy.close(None).expect("close");
    let captured = captured.lock().unwrap();
    assert_eq!(captured.suspend_count(), 0, "suspends and resumes balance out");
    assert!(!captured.thread().is_valid(), "handle released");
}

#[test]
fn read_only_regions_skip_known_bytes() {
    let thread = spawn_looping_thread();
    let (proxy, captured) = NThread::new().inject(thread).expect("inject");
    let calls = count_calls(&proxy, &captured);

    let (region, remote) = create_read_only_memory(&proxy, 16).expect("romem create");

    // All zeros against the calloc'd snapshot: nothing to do at all.
    calls.store(0, Ordering::SeqCst);
    assert_eq!(proxy.write(remote, &[0u8; 16]).unwrap(), 16);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut buffer = [0u8; 16];
    buffer[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    buffer[8..12].copy_from_slice(&0xCAFE_BABEu32.to_le_bytes());

    // Only the eight non-zero bytes need memsets (at most one call each).
    calls.store(0, Ordering::SeqCst);
    assert_eq!(proxy.write(remote, &buffer).unwrap(), 16);
    let first_pass = calls.load(Ordering::SeqCst);
    assert!(first_pass > 0 && first_pass <= 8, "got {first_pass} calls");

    assert_eq!(proxy.read(remote, 16).unwrap(), buffer);
    assert_eq!(romem::snapshot_of(region).unwrap(), buffer);

    // The snapshot now matches, so rewriting the same bytes is free.
    calls.store(0, Ordering::SeqCst);
    assert_eq!(proxy.write(remote, &buffer).unwrap(), 16);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(unregister_read_only_memory(region));
    assert!(!unregister_read_only_memory(region));

    // Terminate the spinner so it does not burn a core for the rest of the test run.
    proxy.close(Some(0)).expect("close");
}

#[test]
fn utf16_string_allocation_round_trips() {
    let thread = spawn_looping_thread();
    let (proxy, _captured) = NThread::new().inject(thread).expect("inject");

    let text = "Hello, NThread!";
    let ptr = proxy
        .alloc_string(text, StringEncoding::Utf16Le, &AllocOptions::default())
        .expect("alloc_string");

    let bytes = proxy.read(ptr, (text.len() + 1) * 2).unwrap();
    assert_eq!(bytes[30..], [0u8, 0], "wide null terminator");

    let units: Vec<u16> = bytes[..30]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    assert_eq!(String::from_utf16(&units).unwrap(), text);

    proxy.free(ptr).expect("free");
    proxy.close(Some(0)).expect("close");
}

#[test]
fn heap_layer_grows_and_falls_back_to_the_crt() {
    let thread = spawn_looping_thread();
    let (proxy, _captured) = NThreadHeap::new(64, 256).inject(thread).expect("inject");

    // Repeated 48-byte read-write chunks force the heap through 64 -> 128 -> 256.
    let mut chunks = Vec::new();
    for i in 0u8..6 {
        let ptr = proxy.alloc(48, &AllocOptions::default()).expect("heap alloc");
        assert!(!chunks.contains(&ptr), "distinct allocations");
        proxy.write(ptr, &[i; 48]).expect("fill chunk");
        chunks.push(ptr);
    }
    for (i, ptr) in chunks.iter().enumerate() {
        assert_eq!(proxy.read(*ptr, 48).unwrap(), vec![i as u8; 48]);
    }

    // Larger than the ceiling: served by the CRT, still freeable through the proxy.
    let big = proxy.alloc(400, &AllocOptions::default()).expect("crt fallback");
    proxy.write(big, &[0x5A; 400]).expect("fill fallback");
    assert_eq!(proxy.read(big, 400).unwrap(), vec![0x5A; 400]);
    proxy.free(big).expect("free fallback");

    for ptr in chunks {
        proxy.free(ptr).expect("free chunk");
    }
    proxy.close(Some(0)).expect("close destroys every heap");
}

#[test]
fn heap_read_only_zone_uses_the_snapshot() {
    let thread = spawn_looping_thread();
    let (proxy, captured) = NThreadHeap::default().inject(thread).expect("inject");

    let opts = AllocOptions {
        readonly: Some(true),
        ..Default::default()
    };
    let ptr = proxy.alloc(32, &opts).expect("ro alloc");

    let calls = count_calls(&proxy, &captured);
    let payload = [0xA5u8; 32];
    proxy.write(ptr, &payload).expect("first write");
    assert!(calls.load(Ordering::SeqCst) > 0);

    // Identical second write: every byte matches the snapshot.
    calls.store(0, Ordering::SeqCst);
    proxy.write(ptr, &payload).expect("second write");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.read(ptr, 32).unwrap(), payload);

    proxy.free(ptr).expect("free");
    proxy.close(Some(0)).expect("close");
}

#[test]
fn release_restores_and_suicide_reports_its_exit_code() {
    let thread = spawn_looping_thread();
    let tid = thread.id().expect("tid");
    let (proxy, _captured) = NThread::new().inject(thread).expect("inject");

    let scratch = proxy.malloc(8).expect("in-thread malloc");
    assert_ne!(scratch, 0);
    proxy.free(scratch).expect("in-thread free");

    // A second handle opened before the close keeps the thread object (and its TID)
    // alive for the exit-code check.
    let keeper = Thread::open(tid).expect("second handle");
    proxy.close(Some(7)).expect("close with suicide");

    assert_eq!(keeper.wait(1000), WaitStatus::Object0);
    assert_eq!(keeper.exit_code().unwrap(), 7);
}
