//! Environment-driven configuration.
//!
//! Every knob has a default; a malformed value earns one warning on the
//! `config` log target and the default is used. Nothing here can fail the
//! host program.

use log::warn;
use once_cell::sync::Lazy;
use std::str::FromStr;

/// Defaults for `ARF_MAXARRAY` / `ARF_MAXSTRING`.
pub const DFLT_MAXARRAY: usize = 8;
pub const DFLT_MAXSTRING: usize = 64;

/// Backtrace-engine knobs, read once on first use.
pub struct TraceConfig {
    /// How many trailing path components to keep when printing source files
    /// (`ARF_MAXPATH`, positive, default 1).
    pub max_path: usize,
    /// Max array elements printed per variable (`ARF_MAXARRAY`).
    pub max_array: usize,
    /// Max string characters printed per variable (`ARF_MAXSTRING`).
    pub max_string: usize,
    /// Emit raw linkage names instead of demangled `class::method`
    /// (`ARF_MANGLED`).
    pub mangled: bool,
    /// Decode and print in-scope variables (`ARF_PRINTVARS`). Takes effect
    /// only for frames whose unwinder supplied a frame pointer.
    pub print_vars: bool,
}

pub static TRACE: Lazy<TraceConfig> = Lazy::new(|| TraceConfig {
    max_path: match positive("ARF_MAXPATH") {
        Some(n) => n,
        None => 1,
    },
    max_array: parsed("ARF_MAXARRAY").unwrap_or(DFLT_MAXARRAY),
    max_string: parsed("ARF_MAXSTRING").unwrap_or(DFLT_MAXSTRING),
    mangled: flag("ARF_MANGLED"),
    print_vars: flag("ARF_PRINTVARS"),
});

/// Leak-detector knobs, read once by the library constructor.
pub struct LeakEnv {
    /// Begin profiling at load time and report once more at process exit
    /// (`LIBERO_START`, `1`/`y`/`Y`).
    pub start: bool,
    /// Extra report-request signal besides SIGPROF (`LIBERO_SIGNAL`).
    pub extra_signal: Option<i32>,
    /// Interval timer period in seconds (`LIBERO_TICK`).
    pub tick: Option<u32>,
    /// Minimum count of distinct karmas in a group before its backtrace is
    /// printed (`LIBERO_KARMA_DEPTH`). Deliberately distinct-karma based:
    /// a group where every record has the same karma may be churn, not a
    /// leak.
    pub karma_min_depth: u32,
    /// Max frames captured per allocation (`LIBERO_DEPTH`), -1 = unlimited,
    /// 0 = none.
    pub depth: i32,
    /// Summary-only reports (`LIBERO_TERSE`). Implies `depth = 0`.
    pub terse: bool,
}

impl LeakEnv {
    pub fn from_env() -> Self {
        let terse = flag("LIBERO_TERSE");
        let mut depth = parsed::<i32>("LIBERO_DEPTH").unwrap_or(-1);
        if terse {
            // No per-allocation records will be printed, capturing
            // backtraces would only burn pages.
            depth = 0;
        }
        LeakEnv {
            start: std::env::var("LIBERO_START")
                .map(|v| matches!(v.as_bytes().first(), Some(b'1' | b'y' | b'Y')))
                .unwrap_or(false),
            extra_signal: parsed("LIBERO_SIGNAL"),
            tick: parsed("LIBERO_TICK"),
            karma_min_depth: parsed("LIBERO_KARMA_DEPTH").unwrap_or(0),
            depth,
            terse,
        }
    }
}

/// Parse `$name`, warning once when it is set but malformed.
fn parsed<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target: "config", "${name} is invalid, ignoring");
            None
        }
    }
}

/// Like [`parsed`] but zero counts as invalid too.
fn positive(name: &str) -> Option<usize> {
    match parsed::<usize>(name) {
        Some(0) => {
            warn!(target: "config", "${name} is invalid, ignoring");
            None
        }
        other => other,
    }
}

/// Boolean knobs follow the original convention: any positive integer is on.
fn flag(name: &str) -> bool {
    parsed::<i64>(name).map(|v| v > 0).unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_leak_env_defaults() {
        for var in [
            "LIBERO_START",
            "LIBERO_SIGNAL",
            "LIBERO_TICK",
            "LIBERO_KARMA_DEPTH",
            "LIBERO_DEPTH",
            "LIBERO_TERSE",
        ] {
            std::env::remove_var(var);
        }
        let env = LeakEnv::from_env();
        assert!(!env.start);
        assert_eq!(env.extra_signal, None);
        assert_eq!(env.tick, None);
        assert_eq!(env.karma_min_depth, 0);
        assert_eq!(env.depth, -1);
        assert!(!env.terse);
    }

    #[test]
    #[serial]
    fn test_terse_disables_capture() {
        std::env::set_var("LIBERO_TERSE", "1");
        std::env::set_var("LIBERO_DEPTH", "10");
        let env = LeakEnv::from_env();
        assert!(env.terse);
        assert_eq!(env.depth, 0);
        std::env::remove_var("LIBERO_TERSE");
        std::env::remove_var("LIBERO_DEPTH");
    }

    #[test]
    #[serial]
    fn test_start_spelling() {
        for (value, expected) in [("1", true), ("y", true), ("Yes", true), ("0", false), ("no", false)] {
            std::env::set_var("LIBERO_START", value);
            assert_eq!(LeakEnv::from_env().start, expected, "LIBERO_START={value}");
        }
        std::env::remove_var("LIBERO_START");
    }

    #[test]
    #[serial]
    fn test_malformed_falls_back() {
        std::env::set_var("LIBERO_DEPTH", "bogus");
        assert_eq!(LeakEnv::from_env().depth, -1);
        std::env::remove_var("LIBERO_DEPTH");
    }
}
