//! Address classification.
//!
//! "Segment" means "mapped region" here; each cached segment corresponds to
//! a line of `/proc/self/maps`. Classification prefers the owning module's
//! ELF section headers and falls back to heuristics over the maps, which is
//! good enough both for validating candidate frame pointers during a manual
//! unwind and for deciding whether a decoded pointer may be dereferenced.

use crate::muted_error;
use crate::trace::dso::Dso;
use log::debug;

/// What an address points at, as far as heuristics can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Stack,
    Heap,
    Data,
    Other,
}

#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    kind: SegmentKind,
}

/// Sorted, non-overlapping cache of classified address ranges. Rebuilt
/// wholesale from `/proc/self/maps` when a lookup misses.
#[derive(Default)]
pub struct SegmentCache {
    segments: Vec<Segment>,
}

impl SegmentCache {
    pub const fn new() -> Self {
        SegmentCache { segments: Vec::new() }
    }

    /// Classify `addr`, returning its kind and the end of the containing
    /// segment (so callers can bound array and string decoding). Unknown
    /// addresses come back as `(Other, 0)`.
    pub fn classify(&mut self, dso: Option<&Dso>, addr: usize) -> (SegmentKind, usize) {
        if addr < 4096 {
            // Nothing is supposed to be mapped this low; treat it as a
            // corruption guard rather than consulting the maps.
            return (SegmentKind::Other, 0);
        }

        if let Some(dso) = dso {
            match dso.section_kind(addr) {
                SectionHit::Kind(kind, end) => return (kind, end),
                SectionHit::Opaque => {} // containing section not understood
                SectionHit::Miss => {}
            }
        }

        if let Some(seg) = self.find(addr) {
            return (seg.kind, seg.end);
        }

        debug!(target: "classify", "cache miss at {addr:#x}, reloading maps");
        self.reload();
        self.find(addr)
            .map(|seg| (seg.kind, seg.end))
            .unwrap_or((SegmentKind::Other, 0))
    }

    fn find(&self, addr: usize) -> Option<&Segment> {
        let idx = self
            .segments
            .binary_search_by(|seg| {
                if addr < seg.start {
                    std::cmp::Ordering::Greater
                } else if addr >= seg.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        Some(&self.segments[idx])
    }

    fn reload(&mut self) {
        self.segments.clear();
        let maps = muted_error!(proc_maps::get_process_maps(std::process::id() as proc_maps::Pid)
            .map_err(crate::error::Error::MapsUnavailable));
        let Some(maps) = maps else {
            return;
        };
        for map in &maps {
            let label = map.filename().and_then(|p| p.to_str());
            self.segments.push(Segment {
                start: map.start(),
                end: map.start() + map.size(),
                kind: kind_of(map.is_read(), map.is_write(), map.is_exec(), label),
            });
        }
        self.segments.sort_unstable_by_key(|seg| seg.start);
    }
}

/// The maps heuristic. `label` is the mapping's backing path, `[stack]`-like
/// pseudo label, or `None` for anonymous mappings (inode 0).
fn kind_of(read: bool, write: bool, exec: bool, label: Option<&str>) -> SegmentKind {
    if read && write && !exec {
        return match label {
            // Threads use anonymous rw mappings as their stacks.
            None | Some("") | Some("[stack]") => SegmentKind::Stack,
            Some("[heap]") => SegmentKind::Heap,
            Some(label) if label.starts_with("[stack") => SegmentKind::Stack,
            _ => SegmentKind::Other,
        };
    }
    if exec {
        let file_backed = matches!(label, Some(l) if !l.starts_with('['));
        if file_backed || label == Some("[vdso]") {
            return SegmentKind::Code;
        }
    }
    SegmentKind::Other
}

/// Where a module's section headers placed an address.
pub enum SectionHit {
    /// No section covers the address.
    Miss,
    /// A section covers it but is not one we understand; the caller should
    /// fall back to the maps.
    Opaque,
    Kind(SegmentKind, usize),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_anonymous_rw_is_stack() {
        assert_eq!(kind_of(true, true, false, None), SegmentKind::Stack);
        assert_eq!(kind_of(true, true, false, Some("")), SegmentKind::Stack);
    }

    #[test]
    fn test_labeled_mappings() {
        assert_eq!(kind_of(true, true, false, Some("[stack]")), SegmentKind::Stack);
        assert_eq!(kind_of(true, true, false, Some("[stack:1234]")), SegmentKind::Stack);
        assert_eq!(kind_of(true, true, false, Some("[heap]")), SegmentKind::Heap);
        assert_eq!(kind_of(true, true, false, Some("/usr/lib/libc.so.6")), SegmentKind::Other);
    }

    #[test]
    fn test_executable_mappings() {
        assert_eq!(kind_of(true, false, true, Some("/usr/lib/libc.so.6")), SegmentKind::Code);
        assert_eq!(kind_of(true, false, true, Some("[vdso]")), SegmentKind::Code);
        assert_eq!(kind_of(true, false, true, None), SegmentKind::Other);
    }

    #[test]
    fn test_low_addresses_rejected() {
        let mut cache = SegmentCache::new();
        assert_eq!(cache.classify(None, 0), (SegmentKind::Other, 0));
        assert_eq!(cache.classify(None, 4095), (SegmentKind::Other, 0));
    }

    #[test]
    fn test_own_code_classifies_as_code() {
        let mut cache = SegmentCache::new();
        let pc = test_own_code_classifies_as_code as usize;
        let (kind, end) = cache.classify(None, pc);
        assert_eq!(kind, SegmentKind::Code);
        assert!(end > pc);
    }

    #[test]
    fn test_own_stack_classifies_as_stack() {
        let mut cache = SegmentCache::new();
        let local = 0u64;
        let (kind, _) = cache.classify(None, &local as *const u64 as usize);
        assert_eq!(kind, SegmentKind::Stack);
    }
}
