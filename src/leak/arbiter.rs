//! The concurrency arbiter.
//!
//! One mutex, one three-state spinlock word and one executor register
//! coordinate every mutator of the engine state: allocator wrappers on any
//! thread, `barf` callers, and the asynchronous signal handler. The mutex
//! is a courtesy for non-signal contention (it may block); the spinlock is
//! the primitive a signal handler can actually use. `2` in the spinlock
//! means a handler asked whoever is inside the critical section to run the
//! report on their way out.

use crate::leak::record::LeakState;
use crate::leak::report;
use crate::trace::TraceState;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

const FREE: u8 = 0;
const HELD: u8 = 1;
const PENDING_REPORT: u8 = 2;

/// The single process-lifetime state object: everything both libraries
/// mutate, collected in one place and serialized by the arbiter.
pub struct Engine {
    pub trace: TraceState,
    pub leak: LeakState,
}

impl Engine {
    pub const fn new() -> Self {
        Engine { trace: TraceState::new(), leak: LeakState::new() }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

struct EngineCell(UnsafeCell<Engine>);

// Safety: all access goes through the critical-section protocol below;
// at most one thread dereferences the cell at any instant.
unsafe impl Sync for EngineCell {}

static ENGINE: EngineCell = EngineCell(UnsafeCell::new(Engine::new()));
static MUTEX: Mutex<()> = Mutex::new(());
static SPINLOCK: AtomicU8 = AtomicU8::new(FREE);
static EXECUTOR: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn tid() -> usize {
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}

/// Is the calling thread the one currently inside the critical section?
/// Allocator wrappers use this to short-circuit: an allocation made by our
/// own bookkeeping must not be tracked recursively.
pub fn current_is_executor() -> bool {
    EXECUTOR.load(Ordering::Relaxed) == tid()
}

/// Safety: caller must hold the critical section (or otherwise be the only
/// thread able to reach the state).
unsafe fn engine_mut() -> &'static mut Engine {
    &mut *ENGINE.0.get()
}

/// Run `f` with exclusive access to the engine state.
///
/// Re-entrant calls from the executor thread are served directly, they
/// are already serialized. On the way out, a pending report request left
/// by a signal handler is honored while the region is still locked.
pub fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    if current_is_executor() {
        return f(unsafe { engine_mut() });
    }

    let _guard = MUTEX.lock().unwrap_or_else(|poison| poison.into_inner());
    while SPINLOCK
        .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        // A signal handler is accounting.
        unsafe { libc::sched_yield() };
    }
    EXECUTOR.store(tid(), Ordering::Relaxed);

    let result = f(unsafe { engine_mut() });

    EXECUTOR.store(0, Ordering::Relaxed);
    if SPINLOCK
        .compare_exchange(HELD, FREE, Ordering::Release, Ordering::Acquire)
        .is_err()
    {
        // A signal handler interrupted us and queued a report; it is ours
        // to run, still inside the locked region.
        EXECUTOR.store(tid(), Ordering::Relaxed);
        report::write_report(unsafe { engine_mut() });
        EXECUTOR.store(0, Ordering::Relaxed);
        SPINLOCK.store(FREE, Ordering::Release);
    }

    result
}

/// The signal-handler side of the protocol: run the report now if the
/// section is free, otherwise ask the current executor to run it. At most
/// one report is ever in flight.
pub fn signal_report() {
    if SPINLOCK.load(Ordering::Acquire) == PENDING_REPORT {
        // A report is already queued, ignore this request.
        return;
    }
    loop {
        if SPINLOCK
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            EXECUTOR.store(tid(), Ordering::Relaxed);
            report::write_report(unsafe { engine_mut() });
            EXECUTOR.store(0, Ordering::Relaxed);
            SPINLOCK.store(FREE, Ordering::Release);
            return;
        }
        if SPINLOCK
            .compare_exchange(HELD, PENDING_REPORT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            // Whoever holds the section will report for us. If that is
            // another signal handler the request is silently dropped,
            // which is the right thing.
            return;
        }
        unsafe { libc::sched_yield() };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_executor_is_set_inside_section() {
        assert!(!current_is_executor());
        with_engine(|_| {
            assert!(current_is_executor());
        });
        assert!(!current_is_executor());
    }

    #[test]
    #[serial]
    fn test_reentrant_access_does_not_deadlock() {
        with_engine(|_| {
            // A nested entry from the executor thread is served directly.
            with_engine(|_| {});
        });
    }

    #[test]
    #[serial]
    fn test_concurrent_sections_serialize() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let inside = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let inside = Arc::clone(&inside);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    with_engine(|_| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
