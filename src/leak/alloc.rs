//! The allocator interposition layer.
//!
//! Exported with the exact glibc names so that `LD_PRELOAD` (or plain
//! linking, thanks to `--export-dynamic`) routes the host program's
//! allocations through here. Every wrapper calls the real allocator via
//! its `__libc_*` strong alias first (the program must get its memory
//! even if every diagnostic fails) and only then, when profiling is on
//! and the caller is not our own bookkeeping, takes the critical section
//! and updates the records. No logging, no formatting, nothing fancy on
//! this path.

use crate::leak::arbiter;
use crate::leak::record;
use libc::{c_void, size_t};

extern "C" {
    fn __libc_malloc(size: size_t) -> *mut c_void;
    fn __libc_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
    fn __libc_memalign(alignment: size_t, size: size_t) -> *mut c_void;
    fn __libc_valloc(size: size_t) -> *mut c_void;
    fn __libc_pvalloc(size: size_t) -> *mut c_void;
}

/// Raw allocation for the engine's own bookkeeping pages.
pub(crate) unsafe fn raw_malloc(size: usize) -> *mut c_void {
    __libc_malloc(size)
}

/// Should this call be tracked at all? False while profiling is off and
/// for re-entrant calls made by the executor from inside the critical
/// section (tracking those would recurse forever).
#[inline]
fn tracked() -> bool {
    crate::leak::profiling() && !arbiter::current_is_executor()
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if !tracked() {
        return __libc_malloc(size);
    }
    arbiter::with_engine(|engine| {
        let ptr = __libc_malloc(size);
        record::track(engine, ptr as usize, size, false);
        ptr
    })
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    if !tracked() {
        return __libc_calloc(nmemb, size);
    }
    arbiter::with_engine(|engine| {
        let ptr = __libc_calloc(nmemb, size);
        record::track(engine, ptr as usize, nmemb * size, false);
        ptr
    })
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `memalign(3)`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    if !tracked() {
        return __libc_memalign(alignment, size);
    }
    arbiter::with_engine(|engine| {
        let ptr = __libc_memalign(alignment, size);
        record::track(engine, ptr as usize, size, false);
        ptr
    })
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `valloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    if !tracked() {
        return __libc_valloc(size);
    }
    arbiter::with_engine(|engine| {
        let ptr = __libc_valloc(size);
        record::track(engine, ptr as usize, size, false);
        ptr
    })
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `pvalloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    if !tracked() {
        return __libc_pvalloc(size);
    }
    arbiter::with_engine(|engine| {
        let ptr = __libc_pvalloc(size);
        record::track(engine, ptr as usize, size, false);
        ptr
    })
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if !ptr.is_null() && size != 0 {
        if !tracked() {
            return __libc_realloc(ptr, size);
        }
        return arbiter::with_engine(|engine| {
            let new = __libc_realloc(ptr, size);
            record::retrack(engine, ptr as usize, new as usize, size);
            new
        });
    }
    if ptr.is_null() {
        // Routing through malloc() here would charge the allocation to an
        // intermediate frame in the captured backtrace.
        if !tracked() {
            return __libc_malloc(size);
        }
        return arbiter::with_engine(|engine| {
            let new = __libc_malloc(size);
            record::track(engine, new as usize, size, false);
            new
        });
    }
    // realloc(p, 0) is a free.
    free(ptr);
    std::ptr::null_mut()
}

/// # Safety
///
/// C ABI allocator entry point; same contract as `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if !tracked() {
        __libc_free(ptr);
        return;
    }
    arbiter::with_engine(|engine| {
        __libc_free(ptr);
        record::untrack(engine, ptr as usize);
    });
}

/// # Safety
///
/// C ABI allocator entry point. Nobody has called `cfree` this century,
/// but glibc still exports it, so we cover it.
#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    free(ptr);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leak::arbiter;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_reentrant_allocation_is_not_tracked() {
        // An allocation made from inside the critical section (as the
        // report engine does) must short-circuit to the raw allocator.
        arbiter::with_engine(|engine| {
            crate::leak::set_profiling(true);
            let before = engine.leak.n_memories;
            let ptr = unsafe { malloc(64) };
            assert!(!ptr.is_null());
            unsafe { free(ptr) };
            crate::leak::set_profiling(false);
            assert_eq!(engine.leak.n_memories, before);
        });
    }

    #[test]
    #[serial]
    fn test_untracked_calls_reach_the_real_allocator() {
        let ptr = unsafe { malloc(32) };
        assert!(!ptr.is_null());
        let ptr = unsafe { realloc(ptr, 64) };
        assert!(!ptr.is_null());
        unsafe { free(ptr) };

        // realloc(p, 0) behaves as free and yields NULL.
        let ptr = unsafe { malloc(16) };
        assert!(unsafe { realloc(ptr, 0) }.is_null());
    }
}
