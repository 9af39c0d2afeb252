//! In-process diagnostics for Linux/glibc programs: a backtrace engine
//! ([`trace`]) that prints symbolic stack traces on demand (with the live
//! values of in-scope variables when debug information allows) and a heap
//! leak detector ([`leak`]) that interposes on the allocator and writes
//! signal-driven delta reports.
//!
//! The crate builds as a `cdylib` so it can be `LD_PRELOAD`-ed under
//! unmodified binaries; Rust programs can also link it and call [`barf!`]
//! directly.

pub mod buffer;
pub mod config;
pub mod error;
pub mod leak;
pub mod trace;

pub use trace::barf;

/// Print a backtrace to stderr, optionally headed by a formatted message.
///
/// `barf!()` prints the default `backtrace:` headline; `barf!("load {}", n)`
/// prints the formatted message colon-suffixed, then the frames.
#[macro_export]
macro_rules! barf {
    () => {
        $crate::trace::barf(None)
    };
    ($($arg:tt)*) => {
        $crate::trace::barf_fmt(::core::format_args!($($arg)*))
    };
}
