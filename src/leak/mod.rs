//! The leak detector: allocator interposition, live-allocation
//! bookkeeping, and signal-driven delta reports.
//!
//! Lifecycle: the library constructor reads the environment, installs the
//! signal handlers and (optionally) the tick timer. The first signal
//! (or `LIBERO_START`) switches profiling on; every further signal asks
//! for a report. With `LIBERO_START` a final report is written when the
//! process winds down.

pub mod alloc;
pub mod arbiter;
pub mod record;
pub mod report;
pub mod signal;

use crate::config::LeakEnv;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Do account for memory allocations (except our own).
static PROFILING: AtomicBool = AtomicBool::new(false);
/// Account for the program's whole lifecycle and report at teardown.
static END_TO_END: AtomicBool = AtomicBool::new(false);
/// When profiling started, written into the first report.
static PROFILING_SINCE_SEC: AtomicI64 = AtomicI64::new(0);
static PROFILING_SINCE_USEC: AtomicI64 = AtomicI64::new(0);

pub(crate) fn profiling() -> bool {
    PROFILING.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn set_profiling(on: bool) {
    PROFILING.store(on, Ordering::SeqCst);
}

/// Record the start timestamp and switch accounting on. Called from the
/// signal handler or from the constructor.
pub(crate) fn start_profiling() {
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    PROFILING_SINCE_SEC.store(tv.tv_sec as i64, Ordering::Relaxed);
    PROFILING_SINCE_USEC.store(tv.tv_usec as i64, Ordering::Relaxed);
    PROFILING.store(true, Ordering::SeqCst);
}

pub(crate) fn profiling_since() -> (i64, i64) {
    (
        PROFILING_SINCE_SEC.load(Ordering::Relaxed),
        PROFILING_SINCE_USEC.load(Ordering::Relaxed),
    )
}

/// Library constructor body: configuration, signal handlers, and the
/// late-binding address broadcast for preloaded hosts.
fn init() {
    let _ = env_logger::try_init();

    let env = LeakEnv::from_env();
    arbiter::with_engine(|engine| {
        engine.leak.depth = env.depth;
        engine.leak.karma_min_depth = env.karma_min_depth;
        engine.leak.terse = env.terse;
    });

    // The poor man's very-late-binding linker: hosts that never linked us
    // pick barf() up from the environment.
    let barf: unsafe extern "C" fn(*const libc::c_char) = crate::trace::barf_c;
    std::env::set_var("THE_REAL_BARF", format!("0x{:x}", barf as usize));

    signal::install(env.extra_signal, env.tick);

    if env.start {
        END_TO_END.store(true, Ordering::Relaxed);
        start_profiling();
    }
}

/// Library destructor body: the end-to-end final report.
fn finish() {
    if END_TO_END.load(Ordering::Relaxed) {
        PROFILING.store(false, Ordering::SeqCst);
        arbiter::with_engine(report::write_report);
    }
}

extern "C" fn init_entry() {
    init();
}

extern "C" fn finish_entry() {
    finish();
}

#[used]
#[link_section = ".init_array"]
static LEAKBARK_INIT: extern "C" fn() = init_entry;

#[used]
#[link_section = ".fini_array"]
static LEAKBARK_FINI: extern "C" fn() = finish_entry;
