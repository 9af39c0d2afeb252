//! The backtrace engine: call [`barf`] (or the `barf!` macro, or the
//! exported C `barf` symbol) and the current stack is printed to stderr
//! with one aligned line per frame, optionally followed by the values of
//! the variables visible in each frame.

pub mod classify;
pub mod dso;
pub mod printer;
pub mod symbolize;
pub mod unit;
pub mod unwind;
pub mod vars;

use crate::buffer::LineBuf;
use crate::leak::arbiter;
use crate::trace::classify::SegmentCache;
use crate::trace::dso::DsoRegistry;
use crate::trace::printer::{FramePrinter, Printer};
use crate::trace::unwind::Frame;
use crate::weak_error;
use std::ffi::CStr;
use std::fmt;
use std::io::{self, Write};

/// All backtrace-engine state: module and segment caches, the printed-
/// variable set, column widths, and the buffers reused across frames.
/// Owned by the arbiter together with the leak bookkeeping; mutated only
/// inside its critical section.
pub struct TraceState {
    pub dsos: DsoRegistry,
    pub segments: SegmentCache,
    pub printer: Printer,
    pub seen: Vec<usize>,
    pub frames: Vec<Frame>,
    pub name_buf: LineBuf,
    pub line_buf: LineBuf,
}

impl TraceState {
    pub const fn new() -> Self {
        TraceState {
            dsos: DsoRegistry::new(),
            segments: SegmentCache::new(),
            printer: Printer::new(),
            seen: Vec::new(),
            frames: Vec::new(),
            name_buf: LineBuf::new(),
            line_buf: LineBuf::new(),
        }
    }
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Print the current backtrace to stderr, headed by `why` (or the default
/// `backtrace:` headline).
pub fn barf(why: Option<&str>) {
    arbiter::with_engine(|engine| {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        let _ = weak_error!(print_backtrace(&mut engine.trace, &mut out, why));
    });
}

/// [`barf`] for the `barf!` macro: the formatted headline, colon-suffixed.
pub fn barf_fmt(args: fmt::Arguments) {
    let headline = format!("{args}:");
    barf(Some(&headline));
}

/// The C ABI entry point. The headline, when non-NULL, must be a
/// NUL-terminated pre-formatted string. The library constructor publishes
/// this function's address in `$THE_REAL_BARF` so even programs that were
/// never linked against us can call it once preloaded.
///
/// # Safety
///
/// `why` must be NULL or point to a valid NUL-terminated string.
#[export_name = "barf"]
pub unsafe extern "C" fn barf_c(why: *const libc::c_char) {
    if why.is_null() {
        barf(None);
    } else {
        let headline = CStr::from_ptr(why).to_string_lossy();
        barf(Some(&headline));
    }
}

/// Unwind, symbolize and print, one frame per line; then forget the
/// printed-variable set so the next backtrace prints everything again.
pub(crate) fn print_backtrace(
    state: &mut TraceState,
    out: &mut dyn Write,
    why: Option<&str>,
) -> io::Result<()> {
    match why {
        Some(why) => writeln!(out, "{why}")?,
        None => writeln!(out, "backtrace:")?,
    }

    let mut frames = std::mem::take(&mut state.frames);
    unwind::capture(&mut frames, &mut state.segments);
    for (i, frame) in frames.iter().enumerate() {
        let mut printer = FramePrinter {
            dsos: &mut state.dsos,
            segments: &mut state.segments,
            printer: &mut state.printer,
            seen: &mut state.seen,
            name_buf: &mut state.name_buf,
            line_buf: &mut state.line_buf,
        };
        printer.print(out, i + 1, frame.pc, frame.fp)?;
    }
    state.frames = frames;
    state.seen.clear();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_barf_prints_headline_and_frames() {
        let mut state = TraceState::new();
        let mut out = Vec::new();
        print_backtrace(&mut state, &mut out, Some("hi")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("hi\n"), "got: {text}");
        assert!(text.contains("   1. "), "got: {text}");
    }

    #[test]
    #[serial]
    fn test_barf_default_headline() {
        let mut state = TraceState::new();
        let mut out = Vec::new();
        print_backtrace(&mut state, &mut out, None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("backtrace:\n"));
    }

    #[test]
    #[serial]
    fn test_seen_set_reset_between_backtraces() {
        let mut state = TraceState::new();
        state.seen.push(0xdead);
        let mut out = Vec::new();
        print_backtrace(&mut state, &mut out, None).unwrap();
        assert!(state.seen.is_empty());
    }
}
