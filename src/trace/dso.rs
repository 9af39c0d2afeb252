//! Resolution of addresses to the dynamic shared object that owns them,
//! with cached ELF and DWARF views.
//!
//! Records are created on first sight of a module and leaked: a DSO never
//! goes away for the lifetime of the process, so every other component can
//! hold `&'static` borrows. The registry itself takes no lock; it is only
//! mutated inside the arbiter's critical section (or by a single-threaded
//! backtrace caller), which is the synchronization story for all of the
//! engine's state.

use crate::error::Error;
use crate::muted_error;
use crate::trace::classify::{SectionHit, SegmentKind};
use crate::trace::unit::{DieRef, Entry, Unit, UnitParser};
use fallible_iterator::FallibleIterator;
use gimli::{DebugInfoOffset, RunTimeEndian, UnitOffset};
use log::{debug, info};
use memmap2::Mmap;
use object::{Object, ObjectSection, SectionFlags, SectionKind};
use std::borrow::Cow;
use std::ffi::CStr;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Address span of one ELF section, pre-chewed for the classifier.
struct SectionSpan {
    addr: usize,
    size: usize,
    /// PROGBITS/NOBITS + ALLOC; anything else makes the span opaque.
    understood: bool,
    exec: bool,
}

/// Parsed DWARF of one module: the gimli sections plus eagerly parsed units
/// sorted by their `.debug_info` offset.
pub struct DwarfView {
    pub inner: gimli::Dwarf<EndianArcSlice>,
    pub units: Vec<Unit>,
}

impl DwarfView {
    /// Searches for a unit by occurrence of the (un-relocated) pc in its
    /// ranges.
    pub fn find_unit_by_pc(&self, pc: u64) -> Option<&Unit> {
        self.units.iter().find(|unit| unit.covers(pc))
    }

    /// Follow a DIE reference, possibly into another unit.
    pub fn deref_die<'a>(&'a self, default_unit: &'a Unit, reference: DieRef) -> Option<(&'a Unit, &'a Entry)> {
        match reference {
            DieRef::Unit(offset) => default_unit.find_entry(offset).map(|e| (default_unit, e)),
            DieRef::Global(offset) => {
                let pos = match self
                    .units
                    .binary_search_by_key(&Some(offset), |u| u.offset())
                {
                    Ok(pos) => pos,
                    Err(0) => return None,
                    Err(pos) => pos - 1,
                };
                let unit = &self.units[pos];
                let local = UnitOffset(offset.0 - unit.offset().unwrap_or(DebugInfoOffset(0)).0);
                unit.find_entry(local).map(|e| (unit, e))
            }
        }
    }
}

/// One dynamic shared object (shared library or the main executable) as the
/// runtime linker sees it.
pub struct Dso {
    /// The `dli_fname` pointer; identity key within the registry.
    id: usize,
    /// Basename of the module, as printed in backtrace columns.
    pub fname: String,
    /// Relocation base: the load address for shared objects, zero for the
    /// main executable.
    pub base: usize,
    sections: Vec<SectionSpan>,
    pub dwarf: Option<DwarfView>,
}

impl Dso {
    /// Locate `addr` within this module's section headers.
    pub fn section_kind(&self, addr: usize) -> SectionHit {
        // The ELF spec doesn't mandate that section headers are ordered by
        // address, so no shortcuts here.
        for span in &self.sections {
            let start = self.base.wrapping_add(span.addr);
            let end = start.wrapping_add(span.size);
            if !(start <= addr && addr < end) {
                continue;
            }
            if !span.understood {
                return SectionHit::Opaque;
            }
            let kind = if span.exec { SegmentKind::Code } else { SegmentKind::Data };
            return SectionHit::Kind(kind, end);
        }
        SectionHit::Miss
    }
}

#[repr(C)]
#[allow(dead_code)]
struct LinkMap {
    l_addr: usize,
    l_name: *const libc::c_char,
    l_ld: *mut libc::c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

const RTLD_DL_LINKMAP: libc::c_int = 2;

extern "C" {
    fn dladdr1(
        addr: *const libc::c_void,
        info: *mut libc::Dl_info,
        extra: *mut *mut libc::c_void,
        flags: libc::c_int,
    ) -> libc::c_int;
}

/// Append-only cache of every module seen so far.
pub struct DsoRegistry {
    seen: Vec<&'static Dso>,
}

impl DsoRegistry {
    pub const fn new() -> Self {
        DsoRegistry { seen: Vec::new() }
    }

    /// Resolve the module owning `addr`, loading and caching it on first
    /// sight. `None` when the address belongs to no mapped module or the
    /// module's file cannot be opened.
    pub fn lookup(&mut self, addr: usize) -> Option<&'static Dso> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let mut link_map: *mut LinkMap = std::ptr::null_mut();
        let found = unsafe {
            dladdr1(
                addr as *const libc::c_void,
                &mut info,
                &mut link_map as *mut *mut LinkMap as *mut *mut libc::c_void,
                RTLD_DL_LINKMAP,
            )
        };
        if found == 0 || info.dli_fname.is_null() {
            return None;
        }

        let id = info.dli_fname as usize;
        if let Some(&dso) = self.seen.iter().find(|dso| dso.id == id) {
            return Some(dso);
        }

        // The link map tells the main executable apart from shared objects:
        // its l_name is empty, and its symbols are not relocated.
        let is_main = unsafe {
            link_map.is_null() || (*link_map).l_name.is_null() || *(*link_map).l_name == 0
        };
        let pathname = unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned();

        let file = match fs::File::open(&pathname) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound && is_main => {
                // dli_fname follows argv[0], which may not be a real path;
                // for our own executable the kernel knows better.
                fs::File::open("/proc/self/exe").ok()?
            }
            Err(_) => return None,
        };

        let fname = Path::new(&pathname)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| pathname.clone());
        let base = if is_main { 0 } else { info.dli_fbase as usize };

        let mut dso = Dso { id, fname, base, sections: vec![], dwarf: None };
        match load_module(&file, Path::new(&pathname)) {
            Ok((sections, dwarf)) => {
                dso.sections = sections;
                dso.dwarf = dwarf;
            }
            Err(e) => {
                // The record is still useful for column output; section
                // classification and symbolization simply stay unavailable.
                debug!(target: "dso-loader", "loading {pathname}: {e:#}");
            }
        }

        let dso: &'static Dso = Box::leak(Box::new(dso));
        self.seen.push(dso);
        Some(dso)
    }
}

fn load_module(
    file: &fs::File,
    path: &Path,
) -> crate::error::Result<(Vec<SectionSpan>, Option<DwarfView>)> {
    let mmap = unsafe { Mmap::map(file)? };
    let obj = object::File::parse(&*mmap)?;

    let mut sections = Vec::new();
    for section in obj.sections() {
        let (alloc, exec) = match section.flags() {
            SectionFlags::Elf { sh_flags } => (
                sh_flags & u64::from(object::elf::SHF_ALLOC) != 0,
                sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0,
            ),
            _ => (false, false),
        };
        let progbits_or_nobits = matches!(
            section.kind(),
            SectionKind::Text
                | SectionKind::Data
                | SectionKind::ReadOnlyData
                | SectionKind::ReadOnlyString
                | SectionKind::UninitializedData
                | SectionKind::Tls
                | SectionKind::UninitializedTls
        );
        sections.push(SectionSpan {
            addr: section.address() as usize,
            size: section.size() as usize,
            understood: alloc && progbits_or_nobits,
            exec,
        });
    }

    let dwarf = muted_error!(load_dwarf(file, path, &obj));
    Ok((sections, dwarf))
}

fn load_dwarf(file: &fs::File, path: &Path, obj: &object::File) -> crate::error::Result<DwarfView> {
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let debug_mmap;
    let debug_obj;
    let dwarf_source = if obj.section_by_name(".debug_info").is_some() {
        obj
    } else if let Some((debug_path, mapped)) = find_detached_debug(file, path, obj) {
        debug!(target: "dso-loader", "{path:?} has a separate debug information file");
        debug!(target: "dso-loader", "loading debug information from {debug_path:?}");
        debug_mmap = mapped;
        debug_obj = object::File::parse(&*debug_mmap)?;
        &debug_obj
    } else {
        info!(target: "dso-loader", "no debug information for {path:?}");
        return Err(Error::NoDebugInformation(path.to_path_buf()));
    };

    let dwarf = gimli::Dwarf::load(|id| -> gimli::Result<EndianArcSlice> {
        let data = dwarf_source
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[]));
        Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
    })?;

    let parser = UnitParser::new(&dwarf);
    let headers = dwarf.units().collect::<Vec<_>>()?;
    let mut units = headers
        .into_iter()
        .map(|header| parser.parse(header))
        .collect::<gimli::Result<Vec<_>>>()?;
    units.sort_unstable_by_key(|u| u.offset());
    units.iter_mut().enumerate().for_each(|(i, u)| u.idx = i);

    Ok(DwarfView { inner: dwarf, units })
}

/// Search for a `.gnu_debuglink` companion the way gdb does: next to the
/// module, in its `.debug/` subdirectory, then under the system debug
/// roots. Candidates that are the module itself (same device and inode)
/// are skipped. Checksums are deliberately not verified: this runs on a
/// diagnostic path, not in a full-blown debugger.
fn find_detached_debug(file: &fs::File, path: &Path, obj: &object::File) -> Option<(PathBuf, Mmap)> {
    let link_section = obj.section_by_name(".gnu_debuglink")?;
    let data = link_section.uncompressed_data().ok()?;
    let name_bytes: Vec<u8> = data.iter().take_while(|&&b| b != 0).copied().collect();
    let link_name = String::from_utf8(name_bytes).ok()?;

    let this = file.metadata().ok()?;
    let dir = path.parent().unwrap_or(Path::new("."));
    let dir_under = |root: &str| -> PathBuf {
        let relative = dir.strip_prefix("/").unwrap_or(dir);
        Path::new(root).join(relative)
    };

    let candidates = [
        dir.join(&link_name),
        dir.join(".debug").join(&link_name),
        dir_under("/usr/lib/debug").join(&link_name),
        dir_under("/usr/local/lib/debug").join(&link_name),
    ];
    for candidate in candidates {
        let Ok(cand_file) = fs::File::open(&candidate) else {
            continue;
        };
        let Ok(meta) = cand_file.metadata() else {
            continue;
        };
        if meta.dev() == this.dev() && meta.ino() == this.ino() {
            continue;
        }
        let Ok(mapped) = (unsafe { Mmap::map(&cand_file) }) else {
            continue;
        };
        let parses = object::File::parse(&*mapped)
            .map(|o| o.section_by_name(".debug_info").is_some())
            .unwrap_or(false);
        if parses {
            return Some((candidate, mapped));
        }
    }
    None
}

impl Default for DsoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup_own_code() {
        let mut registry = DsoRegistry::new();
        let addr = test_lookup_own_code as usize;
        let dso = registry.lookup(addr).expect("own code must resolve");
        assert!(!dso.fname.is_empty());

        // Second lookup hits the cache and returns the same record.
        let again = registry.lookup(addr).unwrap();
        assert!(std::ptr::eq(dso, again));
    }

    #[test]
    fn test_lookup_libc_code() {
        let mut registry = DsoRegistry::new();
        let dso = registry.lookup(libc::strlen as usize).expect("libc must resolve");
        assert!(dso.base != 0, "shared objects are relocated");
        assert!(dso.fname.contains("libc"));
    }

    #[test]
    fn test_unknown_address() {
        let mut registry = DsoRegistry::new();
        assert!(registry.lookup(8192).is_none());
    }
}
