//! The report engine.
//!
//! Appends to `<argv0-basename>.<pid>.leaks`: a delta summary of the
//! counters since the previous report, then (unless terse) every live
//! allocation, sorted and grouped by backtrace, each group followed by its
//! backtrace once enough distinct karmas justify it. `errno` is preserved
//! across the whole affair and an unopenable file skips the report
//! silently: this can run deep inside somebody else's error path.

use crate::leak::arbiter::Engine;
use crate::leak::record::{self, compare_backtraces, SEGMENT_PCS};
use crate::trace::printer::FramePrinter;
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::mem;

extern "C" {
    static program_invocation_short_name: *const libc::c_char;
}

const RULE: &str = "---------------------------------------------------------------------------";

/// Write one report, honoring `errno` preservation and terse mode.
/// Runs inside the critical section, on whichever thread ended up with
/// the job (a wrapper on its way out, a signal handler, or the process
/// destructor).
pub fn write_report(engine: &mut Engine) {
    let saved_errno = unsafe { *libc::__errno_location() };

    if let Some(file) = open_report_file() {
        let mut out = BufWriter::new(file);
        let _ = render(engine, &mut out, now_timeval());
        let _ = out.flush();
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

fn open_report_file() -> Option<std::fs::File> {
    // program_invocation_short_name stays correct even after a fork.
    let program = unsafe {
        if program_invocation_short_name.is_null() {
            "unknown".to_string()
        } else {
            CStr::from_ptr(program_invocation_short_name)
                .to_string_lossy()
                .into_owned()
        }
    };
    let name = format!("{program}.{}.leaks", nix::unistd::getpid());
    OpenOptions::new().append(true).create(true).open(name).ok()
}

fn now_timeval() -> (i64, i64) {
    let mut tv: libc::timeval = unsafe { mem::zeroed() };
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    (tv.tv_sec as i64, tv.tv_usec as i64)
}

/// `hh:mm:ss.uuuuuu dd/mm/yy` in local time, like the rest of the world
/// writes dates.
fn format_stamp(sec: i64, usec: i64) -> String {
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    let time = sec as libc::time_t;
    unsafe { libc::localtime_r(&time, &mut tm) };
    format!(
        "{:02}:{:02}:{:02}.{:06} {:02}/{:02}/{:02}",
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        usec,
        tm.tm_mday,
        tm.tm_mon + 1,
        tm.tm_year % 100
    )
}

/// The body of a report, testable against any sink.
pub(crate) fn render(engine: &mut Engine, out: &mut dyn Write, now: (i64, i64)) -> io::Result<()> {
    let leak = &mut engine.leak;

    if leak.reports == 0 {
        let (sec, usec) = crate::leak::profiling_since();
        writeln!(out, "started profiling on:\t{}", format_stamp(sec, usec))?;
    }
    leak.reports += 1;
    writeln!(out, "report {} created on:\t{}", leak.reports, format_stamp(now.0, now.1))?;
    writeln!(
        out,
        "number of allocations:\t{} (currently {})",
        leak.n_allocations, leak.n_memories
    )?;
    writeln!(
        out,
        "current allocation:\t{} (delta={:+} bytes)",
        leak.allocated,
        leak.allocated - leak.previous
    )?;
    writeln!(
        out,
        "peak allocation:\t{} ({} bytes since the start of period)",
        leak.peak,
        leak.peak - leak.previous
    )?;
    writeln!(out)?;

    leak.n_allocations = 0;
    leak.peak = leak.allocated;
    leak.previous = leak.allocated;

    if !leak.terse {
        // Without backtraces there is nothing meaningful to sort by.
        if leak.depth != 0 {
            leak.memories = record::sort(leak.memories, leak.n_memories);
        }
        dump_records(engine, out)?;
    }

    writeln!(out, "{RULE}")?;
    Ok(())
}

/// Walk the (sorted) live list, printing one line per record and chaining
/// up groups with identical backtraces. A group's backtrace is printed
/// once at its end, provided it showed up with enough distinct karmas;
/// same-karma churn is usually not a leak.
fn dump_records(engine: &mut Engine, out: &mut dyn Write) -> io::Result<()> {
    let Engine { trace, leak } = engine;
    let karma_min = leak.karma_min_depth;

    let mut record = leak.memories;
    while !record.is_null() {
        let mut karmas = 0u32;
        let mut last_karma = None;
        let group_backtrace;
        unsafe {
            loop {
                writeln!(
                    out,
                    "ptr=0x{:x} (tid={}), size={}, karma={}",
                    (*record).ptr,
                    (*record).tid,
                    (*record).size,
                    (*record).karma
                )?;
                let printed = (*record).karma;
                (*record).karma += 1;
                if last_karma != Some(printed) {
                    karmas += 1;
                }
                last_karma = Some(printed);

                let next = (*record).next;
                if next.is_null()
                    || compare_backtraces((*record).backtrace, (*next).backtrace)
                        != std::cmp::Ordering::Equal
                {
                    group_backtrace = (*record).backtrace;
                    record = next;
                    break;
                }
                record = next;
            }
        }

        if karmas >= karma_min && !group_backtrace.is_null() {
            let mut frame = 1usize;
            let mut segment = group_backtrace;
            'chain: while !segment.is_null() {
                for slot in 0..SEGMENT_PCS {
                    let pc = unsafe { (*segment).pcs[slot] };
                    if pc == 0 {
                        break 'chain;
                    }
                    let mut printer = FramePrinter {
                        dsos: &mut trace.dsos,
                        segments: &mut trace.segments,
                        printer: &mut trace.printer,
                        seen: &mut trace.seen,
                        name_buf: &mut trace.name_buf,
                        line_buf: &mut trace.line_buf,
                    };
                    printer.print(out, frame, pc, None)?;
                    frame += 1;
                }
                segment = unsafe { (*segment).next };
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leak::arbiter::Engine;
    use crate::leak::record::{track, untrack};

    fn render_to_string(engine: &mut Engine) -> String {
        let mut out = Vec::new();
        render(engine, &mut out, (0, 0)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_summary_counters_and_reset() {
        let mut engine = Engine::new();
        engine.leak.depth = 0;
        track(&mut engine, 0x1000, 100, false);
        track(&mut engine, 0x2000, 200, false);
        untrack(&mut engine, 0x1000);

        let text = render_to_string(&mut engine);
        assert!(text.contains("number of allocations:\t2 (currently 1)"), "got: {text}");
        assert!(text.contains("current allocation:\t200 (delta=+200 bytes)"), "got: {text}");
        assert!(text.contains("peak allocation:\t300 (300 bytes since the start of period)"));
        assert!(text.ends_with(&format!("{RULE}\n")));

        // Deltas reset for the next period.
        assert_eq!(engine.leak.n_allocations, 0);
        assert_eq!(engine.leak.peak, 200);
        assert_eq!(engine.leak.previous, 200);

        let text = render_to_string(&mut engine);
        assert!(text.contains("report 2 created on:"));
        assert!(text.contains("number of allocations:\t0 (currently 1)"));
        assert!(text.contains("current allocation:\t200 (delta=+0 bytes)"));
    }

    #[test]
    fn test_karma_increments_per_report() {
        let mut engine = Engine::new();
        engine.leak.depth = 0;
        // The same call site frees one block and allocates a bigger one.
        track(&mut engine, 0x1000, 100, false);
        untrack(&mut engine, 0x1000);
        track(&mut engine, 0x2000, 200, false);

        let text = render_to_string(&mut engine);
        assert!(text.contains("ptr=0x2000"), "got: {text}");
        assert!(text.contains("size=200, karma=0"));

        let text = render_to_string(&mut engine);
        assert!(text.contains("size=200, karma=1"));
    }

    #[test]
    fn test_freed_pointer_not_listed() {
        let mut engine = Engine::new();
        engine.leak.depth = 0;
        track(&mut engine, 0x1000, 100, false);
        track(&mut engine, 0x2000, 50, false);
        untrack(&mut engine, 0x1000);

        let text = render_to_string(&mut engine);
        assert!(!text.contains("ptr=0x1000"));
        assert!(text.contains("ptr=0x2000"));
        assert_eq!(engine.leak.allocated, 50);
    }

    #[test]
    fn test_terse_mode_prints_summary_only() {
        let mut engine = Engine::new();
        engine.leak.depth = 0;
        engine.leak.terse = true;
        track(&mut engine, 0x1000, 100, false);

        let text = render_to_string(&mut engine);
        assert!(text.contains("number of allocations:"));
        assert!(!text.contains("ptr=0x1000"));
    }

    #[test]
    fn test_karma_survivors_age() {
        let mut engine = Engine::new();
        engine.leak.depth = 0;
        track(&mut engine, 0x1000, 10, false);
        for _ in 0..5 {
            render_to_string(&mut engine);
        }
        // A record surviving N reports has karma >= N-1 at the end of
        // report N.
        unsafe {
            assert!((*engine.leak.memories).karma >= 4);
        }
    }
}
