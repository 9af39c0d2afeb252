//! Signal plumbing: the report-request handler and the optional interval
//! timer that raises it periodically.

use crate::leak::arbiter;
use log::warn;

/// The profiling/report signal. `LIBERO_SIGNAL` may add a second one.
pub const REPORT_SIGNAL: libc::c_int = libc::SIGPROF;

/// The handler proper. The first signal starts profiling; the program
/// may be in any state, so nothing tricky happens; every later one
/// requests a report through the arbiter protocol.
fn on_signal() {
    if !crate::leak::profiling() {
        crate::leak::start_profiling();
        return;
    }
    arbiter::signal_report();
}

/// Install the handler on the default signal and on `extra` when
/// configured; arm the interval timer when `tick` is set.
pub fn install(extra: Option<i32>, tick: Option<u32>) {
    if let Err(e) = unsafe { signal_hook::low_level::register(REPORT_SIGNAL, on_signal) } {
        warn!(target: "leak", "registering signal {REPORT_SIGNAL}: {e}");
    }
    if let Some(signal) = extra {
        if signal != REPORT_SIGNAL {
            if let Err(e) = unsafe { signal_hook::low_level::register(signal, on_signal) } {
                warn!(target: "leak", "registering signal {signal}: {e}");
            }
        }
    }

    if let Some(seconds) = tick {
        // setitimer(ITIMER_PROF) raises SIGPROF by itself: profiling
        // starts in `seconds` and a report follows every tick after.
        let timer = libc::itimerval {
            it_interval: libc::timeval { tv_sec: seconds as libc::time_t, tv_usec: 0 },
            it_value: libc::timeval { tv_sec: seconds as libc::time_t, tv_usec: 0 },
        };
        let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
        if rc != 0 {
            warn!(target: "leak", "setitimer: {}", std::io::Error::last_os_error());
        }
    }
}
