//! Decoding the live values of in-scope variables.
//!
//! For every subprogram scope of a frame (and recursively through lexical
//! blocks, plus the CU scope for globals), each variable or formal
//! parameter is located, dereferenced through its typedef/pointer/array
//! type chain, and printed. Only frame-base-relative and absolute
//! locations are interpreted; registers are not tracked. Anything that
//! fails along the way silently skips the variable; a backtrace must
//! never hurt the host.

use crate::buffer::LineBuf;
use crate::config;
use crate::trace::classify::{SegmentCache, SegmentKind};
use crate::trace::dso::Dso;
use crate::trace::symbolize::Callsite;
use crate::trace::unit::{DieVariant, Entry, Unit, VariableDie};
use gimli::{
    DwAte, Operation, DW_ATE_address, DW_ATE_boolean, DW_ATE_float, DW_ATE_signed,
    DW_ATE_signed_char, DW_ATE_unsigned, DW_ATE_unsigned_char,
};
use std::io::{self, Write};
use std::mem;
use std::ptr;

/// Frame-base fixup: the saved return address and frame pointer sit between
/// the frame base the compiler means and the frame pointer we walked.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const FBREG_FIXUP: i64 = 8;
#[cfg(target_arch = "arm")]
const FBREG_FIXUP: i64 = 4;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "arm")))]
const FBREG_FIXUP: i64 = 0;

const WORD: u64 = mem::size_of::<usize>() as u64;

/// Decoder state borrowed from the engine for the duration of one frame.
pub struct VarPrinter<'a> {
    pub segments: &'a mut SegmentCache,
    /// Addresses already printed during this backtrace, insertion-sorted.
    /// Keeps a global visible from several frames from repeating.
    pub seen: &'a mut Vec<usize>,
    pub name: &'a mut LineBuf,
    pub line: &'a mut LineBuf,
}

impl VarPrinter<'_> {
    /// Decode and print all variables visible in the frame's scopes.
    pub fn print_frame_vars(
        &mut self,
        out: &mut dyn Write,
        cs: &Callsite,
        pc: usize,
        fp: usize,
    ) -> io::Result<()> {
        let (Some(dso), Some(unit)) = (cs.dso, cs.unit) else {
            return Ok(());
        };
        for &scope in &cs.scopes {
            self.visit(out, dso, unit, scope, pc, fp)?;
        }
        Ok(())
    }

    fn visit(
        &mut self,
        out: &mut dyn Write,
        dso: &'static Dso,
        unit: &'static Unit,
        scope: usize,
        pc: usize,
        fp: usize,
    ) -> io::Result<()> {
        // Children are walked by index; the list is cloned so the decoder
        // may borrow the engine state mutably.
        let children = unit.entries[scope].node.children.clone();
        for child in children {
            match &unit.entries[child].die {
                DieVariant::Variable(var) | DieVariant::Parameter(var) => {
                    self.print_var(out, dso, unit, var, pc, fp)?;
                }
                DieVariant::LexicalBlock(_) => {
                    self.visit(out, dso, unit, child, pc, fp)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn print_var(
        &mut self,
        out: &mut dyn Write,
        dso: &'static Dso,
        unit: &'static Unit,
        var: &VariableDie,
        pc: usize,
        fp: usize,
    ) -> io::Result<()> {
        let Some(id) = var.base.name.as_deref() else {
            return Ok(());
        };
        let Some(view) = dso.dwarf.as_ref() else {
            return Ok(());
        };

        // Resolve the variable's address. Only a single fbreg or addr
        // operation is understood; registers are not tracked.
        let Some(attr) = var.location.as_ref() else {
            return Ok(());
        };
        let rel_pc = (pc - dso.base) as u64;
        let Some(expr) = unit.location_expr(&view.inner, attr, rel_pc) else {
            return Ok(());
        };
        let mut ops = expr.operations(unit.encoding());
        let Ok(Some(first)) = ops.next() else {
            return Ok(());
        };
        if !matches!(ops.next(), Ok(None)) {
            return Ok(());
        }
        let addr = match first {
            Operation::FrameOffset { offset } => (fp as i64 + FBREG_FIXUP + offset) as usize,
            Operation::Address { address } => dso.base.wrapping_add(address as usize),
            _ => return Ok(()),
        };

        match self.seen.binary_search(&addr) {
            Ok(_) => return Ok(()),
            Err(pos) => self.seen.insert(pos, addr),
        }

        self.name.clear();
        self.line.clear();
        self.name.push_str(id);
        self.decode(dso, unit, var, addr);
        if !self.line.is_empty() {
            writeln!(out, "      {}", self.line.as_str())?;
        }
        Ok(())
    }

    /// Dereference `addr` through the variable's type chain until something
    /// basic can be decoded, accumulating output in `self.line`. Partial
    /// chains (e.g. a pointer to a type we do not understand) keep whatever
    /// was already printed.
    fn decode(&mut self, dso: &'static Dso, unit: &'static Unit, var: &VariableDie, mut addr: usize) {
        let view = dso.dwarf.as_ref().expect("checked by caller");
        let cfg = &*config::TRACE;

        let Some(mut tref) = var.type_ref else {
            return;
        };
        let mut cur_unit = unit;
        let mut waspointer = false;
        let mut isarray = false;
        let mut nelems: u64 = 1;
        let mut seg_end = 0usize;

        let (encoding, size) = loop {
            let Some((tunit, tentry)) = view.deref_die(cur_unit, tref) else {
                return;
            };
            cur_unit = tunit;

            match &tentry.die {
                // Qualifiers and aliases are transparent.
                DieVariant::TypeDef(chain)
                | DieVariant::ConstType(chain)
                | DieVariant::VolatileType(chain) => {
                    let Some(next) = chain.type_ref else {
                        return;
                    };
                    tref = next;
                }
                DieVariant::ArrayType(chain) => {
                    if isarray {
                        // An array of arrays; only the first element of the
                        // outer one will be printed, say so in the name.
                        if waspointer {
                            self.name.prepend("(");
                            self.name.push_str(")");
                        }
                        self.name.push_str("[0]");
                    }
                    isarray = true;
                    nelems = array_len(tunit, tentry).unwrap_or(1);
                    let Some(next) = chain.type_ref else {
                        return;
                    };
                    tref = next;
                }
                DieVariant::PointerType(p) => {
                    let size = p.byte_size.unwrap_or(WORD);
                    if self
                        .validate(dso, addr, size, &mut nelems, &mut seg_end, waspointer)
                        .is_none()
                    {
                        return;
                    }
                    if size != WORD {
                        // A non-word-sized pointer is just an integer.
                        break (DW_ATE_address, size);
                    }
                    self.print_pointer(addr, waspointer, isarray, nelems, cfg.max_array);
                    if !isarray || !waspointer {
                        self.name.prepend("*");
                        if isarray {
                            self.name.push_str("[0]");
                        }
                    } else {
                        self.name.prepend("*(");
                        self.name.push_str(")[0]");
                    }
                    addr = unsafe { ptr::read_unaligned(addr as *const usize) };
                    waspointer = true;
                    isarray = false;
                    nelems = 1;
                    let Some(next) = p.type_ref else {
                        return;
                    };
                    tref = next;
                }
                DieVariant::BaseType(base) => {
                    let Some(size) = base.byte_size else {
                        return;
                    };
                    if self
                        .validate(dso, addr, size, &mut nelems, &mut seg_end, waspointer)
                        .is_none()
                    {
                        return;
                    }
                    let Some(encoding) = base.encoding else {
                        return;
                    };
                    break (encoding, size);
                }
                _ => return, // unrecognized type
            }
        };

        self.print_value(addr, encoding, size, waspointer, isarray, nelems, seg_end, cfg);
    }

    /// Validate a pointer-derived address against the address map, clamping
    /// the element count to the containing segment. Compiler-placed data
    /// (not reached through a pointer) is trusted.
    fn validate(
        &mut self,
        dso: &'static Dso,
        addr: usize,
        size: u64,
        nelems: &mut u64,
        seg_end: &mut usize,
        waspointer: bool,
    ) -> Option<()> {
        if !waspointer {
            return Some(());
        }
        let (kind, seg) = self.segments.classify(Some(dso), addr);
        match kind {
            SegmentKind::Stack | SegmentKind::Heap | SegmentKind::Data => {
                *seg_end = seg;
                if addr + ((size * *nelems) as usize) < seg {
                    return Some(());
                }
                *nelems = (seg.saturating_sub(addr) / size as usize) as u64;
                if *nelems > 0 {
                    Some(())
                } else {
                    // Not even one element of this size fits in the segment.
                    None
                }
            }
            _ => None,
        }
    }

    /// Append `addr`'s pointer value (or up to `max_array` of them for
    /// pointer arrays) to the line.
    fn print_pointer(
        &mut self,
        addr: usize,
        waspointer: bool,
        isarray: bool,
        nelems: u64,
        max_array: usize,
    ) {
        let prefix = if waspointer { ", " } else { "" };
        if isarray {
            self.line
                .append_fmt(format_args!("{prefix}{}={}={{", self.name.as_str(), fmt_ptr(addr)));
        } else {
            self.line.append_fmt(format_args!("{prefix}{}=", self.name.as_str()));
        }

        let first = unsafe { ptr::read_unaligned(addr as *const usize) };
        self.line.append_fmt(format_args!("{}", fmt_ptr(first)));

        let mut i: u64 = 1;
        while i < nelems && i < max_array as u64 {
            let elem = addr + (i as usize) * WORD as usize;
            let value = unsafe { ptr::read_unaligned(elem as *const usize) };
            self.line.append_fmt(format_args!(", {}", fmt_ptr(value)));
            i += 1;
        }
        if isarray {
            self.line.push_str(if i < nelems { ", ...}" } else { "}" });
        }
    }

    /// The basic-type tail of the decoder: strings and byte arrays for
    /// character types behind a pointer or in an array, scalars and scalar
    /// arrays for everything else.
    #[allow(clippy::too_many_arguments)]
    fn print_value(
        &mut self,
        addr: usize,
        encoding: DwAte,
        size: u64,
        waspointer: bool,
        isarray: bool,
        nelems: u64,
        seg_end: usize,
        cfg: &config::TraceConfig,
    ) {
        let prefix = if waspointer { ", " } else { "" };
        let char_like = encoding == DW_ATE_signed_char || encoding == DW_ATE_unsigned_char;

        if char_like && size == 1 && (waspointer || isarray) {
            // A string ("susu") or a byte array (0x1020efff).
            if isarray {
                self.line
                    .append_fmt(format_args!("{prefix}{}={}=", self.name.as_str(), fmt_ptr(addr)));
            } else {
                self.line.append_fmt(format_args!("{prefix}{}=", self.name.as_str()));
            }

            let mut isbinary = false;
            let mut len: u64 = 0;
            loop {
                if waspointer && addr + len as usize >= seg_end {
                    break;
                }
                if isarray && len >= nelems {
                    break;
                }
                if len >= cfg.max_string as u64 {
                    break;
                }
                let byte = unsafe { *(addr as *const u8).add(len as usize) };
                if byte == 0 {
                    break;
                }
                if !printable(byte) {
                    if len >= cfg.max_array as u64 {
                        // Long enough already, show it as a string.
                        break;
                    }
                    isbinary = true;
                    if !isarray {
                        break;
                    }
                    len = nelems.min(cfg.max_array as u64);
                    break;
                }
                len += 1;
            }

            if isbinary {
                self.line.push_str("0x");
                for i in 0..len {
                    let byte = unsafe { *(addr as *const u8).add(i as usize) };
                    self.line.append_fmt(format_args!("{byte:02x}"));
                }
                if isarray && nelems > len {
                    self.line.push_str("...");
                }
            } else {
                let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
                let text = String::from_utf8_lossy(bytes);
                if isarray && nelems > len {
                    self.line.append_fmt(format_args!("\"{text}\"..."));
                } else {
                    self.line.append_fmt(format_args!("\"{text}\""));
                }
            }
            return;
        }

        // (Arrays of) integers or floats, or single characters or bytes.
        let checkpoint = self.line.checkpoint();
        if isarray {
            self.line
                .append_fmt(format_args!("{prefix}{}={}={{", self.name.as_str(), fmt_ptr(addr)));
        } else {
            self.line.append_fmt(format_args!("{prefix}{}=", self.name.as_str()));
        }
        if !print_basic(self.line, addr, encoding, size) {
            // Either we don't know how to print this encoding/size pair or
            // the read made no sense; drop the half-line.
            self.line.rollback(checkpoint);
            return;
        }

        let mut i: u64 = 1;
        let mut elem_addr = addr;
        while i < nelems && i < cfg.max_array as u64 {
            elem_addr += size as usize;
            let cp = self.line.checkpoint();
            self.line.push_str(", ");
            if !print_basic(self.line, elem_addr, encoding, size) {
                self.line.rollback(cp);
                break;
            }
            i += 1;
        }
        if isarray {
            self.line.push_str(if i < nelems { ", ...}" } else { "}" });
        }
    }
}

/// Element count of an array type, from its subrange child.
fn array_len(unit: &Unit, entry: &Entry) -> Option<u64> {
    for &child in &entry.node.children {
        if let DieVariant::ArraySubrange(sub) = &unit.entries[child].die {
            if let Some(upper) = sub.upper_bound {
                return Some(upper + 1);
            }
            return sub.count;
        }
    }
    None
}

/// Decode the integer, float or character at `addr` and append its textual
/// representation. Returns false when the encoding/size pair is not
/// understood, leaving the line untouched.
#[allow(non_upper_case_globals)]
fn print_basic(line: &mut LineBuf, addr: usize, encoding: DwAte, size: u64) -> bool {
    unsafe {
        match encoding {
            DW_ATE_float => match size {
                4 => line.append_fmt(format_args!("{:.6}", ptr::read_unaligned(addr as *const f32))),
                8 => line.append_fmt(format_args!("{:.6}", ptr::read_unaligned(addr as *const f64))),
                // On arm long double is plain double and never this wide.
                #[cfg(not(target_arch = "arm"))]
                10 | 12 | 16 => {
                    line.append_fmt(format_args!("{:.6}", extended_float_to_f64(addr)))
                }
                _ => return false,
            },
            DW_ATE_address => match size {
                1 => line.append_fmt(format_args!("0x{:08x}", ptr::read_unaligned(addr as *const u8))),
                2 => line.append_fmt(format_args!("0x{:08x}", ptr::read_unaligned(addr as *const u16))),
                4 => line.append_fmt(format_args!("0x{:08x}", ptr::read_unaligned(addr as *const u32))),
                8 => line.append_fmt(format_args!("0x{:016x}", ptr::read_unaligned(addr as *const u64))),
                _ => return false,
            },
            DW_ATE_boolean => {
                let truth = match size {
                    1 => ptr::read_unaligned(addr as *const i8) != 0,
                    2 => ptr::read_unaligned(addr as *const i16) != 0,
                    4 => ptr::read_unaligned(addr as *const i32) != 0,
                    8 => ptr::read_unaligned(addr as *const i64) != 0,
                    _ => return false,
                };
                line.push_str(if truth { "true" } else { "false" });
            }
            DW_ATE_signed => match size {
                1 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const i8))),
                2 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const i16))),
                4 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const i32))),
                8 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const i64))),
                _ => return false,
            },
            DW_ATE_unsigned => match size {
                1 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const u8))),
                2 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const u16))),
                4 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const u32))),
                8 => line.append_fmt(format_args!("{}", ptr::read_unaligned(addr as *const u64))),
                _ => return false,
            },
            DW_ATE_signed_char if size == 1 => {
                let byte = ptr::read_unaligned(addr as *const u8);
                line.append_fmt(format_args!("'{}'", byte as char));
            }
            DW_ATE_unsigned_char if size == 1 => {
                let byte = ptr::read_unaligned(addr as *const u8);
                line.append_fmt(format_args!("0x{byte:02x}"));
            }
            _ => return false,
        }
    }
    true
}

/// Decode an x87 80-bit extended float (stored in 10, 12 or 16 bytes,
/// padding last) to the nearest f64. Rust has no native type for it, so
/// the significand and the sign/exponent word are picked apart by hand.
/// The integer bit is explicit: the significand is fixed-point, scaled
/// by 2^63.
#[cfg(not(target_arch = "arm"))]
unsafe fn extended_float_to_f64(addr: usize) -> f64 {
    let significand = ptr::read_unaligned(addr as *const u64);
    let sign_exponent = ptr::read_unaligned((addr + 8) as *const u16);
    let sign = if sign_exponent & 0x8000 != 0 { -1.0f64 } else { 1.0 };
    let exponent = (sign_exponent & 0x7fff) as i32;
    if exponent == 0x7fff {
        return if significand << 1 == 0 { sign * f64::INFINITY } else { f64::NAN };
    }
    // Denormals read like exponent 1; they underflow f64 to zero anyway.
    let exponent = if exponent == 0 { 1 } else { exponent };
    sign * significand as f64 * 2f64.powi(exponent - 16383 - 63)
}

/// glibc's `%p`: hex with `0x`, `(nil)` for null.
fn fmt_ptr(value: usize) -> String {
    if value == 0 {
        "(nil)".to_string()
    } else {
        format!("0x{value:x}")
    }
}

fn printable(byte: u8) -> bool {
    byte.is_ascii_graphic() || byte == b' '
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config(max_array: usize, max_string: usize) -> config::TraceConfig {
        config::TraceConfig {
            max_path: 1,
            max_array,
            max_string,
            mangled: false,
            print_vars: true,
        }
    }

    fn printer_output(
        run: impl FnOnce(&mut VarPrinter),
    ) -> String {
        let mut segments = SegmentCache::new();
        let mut seen = Vec::new();
        let mut name = LineBuf::new();
        let mut line = LineBuf::new();
        let mut printer = VarPrinter {
            segments: &mut segments,
            seen: &mut seen,
            name: &mut name,
            line: &mut line,
        };
        run(&mut printer);
        printer.line.as_str().to_string()
    }

    #[test]
    fn test_array_output_respects_max_array() {
        let values: [i32; 6] = [10, 20, 30, 40, 50, 60];
        let addr = values.as_ptr() as usize;
        let text = printer_output(|printer| {
            printer.name.push_str("akarmi");
            printer.print_value(addr, DW_ATE_signed, 4, false, true, 6, 0, &test_config(2, 64));
        });
        assert_eq!(text, format!("akarmi=0x{addr:x}={{10, 20, ...}}"));
    }

    #[test]
    fn test_array_output_complete_when_it_fits() {
        let values: [i32; 3] = [10, 20, 30];
        let addr = values.as_ptr() as usize;
        let text = printer_output(|printer| {
            printer.name.push_str("a");
            printer.print_value(addr, DW_ATE_signed, 4, false, true, 3, 0, &test_config(8, 64));
        });
        assert_eq!(text, format!("a=0x{addr:x}={{10, 20, 30}}"));
    }

    #[test]
    fn test_byte_array_dumps_hex() {
        let bytes: [u8; 4] = [0x10, 0x20, 0xef, 0xff];
        let addr = bytes.as_ptr() as usize;
        let text = printer_output(|printer| {
            printer.name.push_str("b");
            printer.print_value(addr, DW_ATE_signed_char, 1, false, true, 4, 0, &test_config(8, 64));
        });
        assert_eq!(text, format!("b=0x{addr:x}=0x1020efff"));
    }

    #[test]
    fn test_char_array_prints_as_string() {
        let bytes = *b"susu\0xxx";
        let addr = bytes.as_ptr() as usize;
        let text = printer_output(|printer| {
            printer.name.push_str("s");
            printer.print_value(addr, DW_ATE_signed_char, 1, false, true, 8, 0, &test_config(8, 64));
        });
        assert_eq!(text, format!("s=0x{addr:x}=\"susu\"..."));
    }

    #[test]
    fn test_long_string_truncated() {
        let bytes = *b"0123456789\0";
        let addr = bytes.as_ptr() as usize;
        let text = printer_output(|printer| {
            printer.name.push_str("s");
            printer.print_value(addr, DW_ATE_signed_char, 1, false, true, 11, 0, &test_config(8, 4));
        });
        assert_eq!(text, format!("s=0x{addr:x}=\"0123\"..."));
    }

    #[test]
    fn test_print_basic_scalars() {
        let mut line = LineBuf::new();
        let value: i32 = 42;
        assert!(print_basic(&mut line, &value as *const i32 as usize, DW_ATE_signed, 4));
        assert_eq!(line.as_str(), "42");

        line.clear();
        let value: u16 = 7;
        assert!(print_basic(&mut line, &value as *const u16 as usize, DW_ATE_unsigned, 2));
        assert_eq!(line.as_str(), "7");

        line.clear();
        let value: f64 = 0.5;
        assert!(print_basic(&mut line, &value as *const f64 as usize, DW_ATE_float, 8));
        assert_eq!(line.as_str(), "0.500000");
    }

    #[test]
    fn test_print_basic_bool_and_char() {
        let mut line = LineBuf::new();
        let yes: u8 = 3;
        assert!(print_basic(&mut line, &yes as *const u8 as usize, DW_ATE_boolean, 1));
        assert_eq!(line.as_str(), "true");

        line.clear();
        let ch = b'k';
        assert!(print_basic(&mut line, &ch as *const u8 as usize, DW_ATE_signed_char, 1));
        assert_eq!(line.as_str(), "'k'");

        line.clear();
        let byte: u8 = 0xef;
        assert!(print_basic(&mut line, &byte as *const u8 as usize, DW_ATE_unsigned_char, 1));
        assert_eq!(line.as_str(), "0xef");
    }

    #[test]
    fn test_print_basic_rejects_odd_widths() {
        let mut line = LineBuf::new();
        let value: u64 = 1;
        let addr = &value as *const u64 as usize;
        assert!(!print_basic(&mut line, addr, DW_ATE_boolean, 3));
        assert!(!print_basic(&mut line, addr, DW_ATE_float, 6));
        assert!(!print_basic(&mut line, addr, DW_ATE_signed, 5));
        assert!(line.as_str().is_empty());
    }

    #[test]
    #[cfg(not(target_arch = "arm"))]
    fn test_print_basic_long_double() {
        // 2.5 in x87 extended: significand 1.25 scaled by 2^63, biased
        // exponent 16384, stored in 16 bytes with the tail as padding.
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&0xA000_0000_0000_0000u64.to_le_bytes());
        bytes[8..10].copy_from_slice(&0x4000u16.to_le_bytes());

        let mut line = LineBuf::new();
        assert!(print_basic(&mut line, bytes.as_ptr() as usize, DW_ATE_float, 16));
        assert_eq!(line.as_str(), "2.500000");

        // The sign bit flips it.
        bytes[9] |= 0x80;
        line.clear();
        assert!(print_basic(&mut line, bytes.as_ptr() as usize, DW_ATE_float, 10));
        assert_eq!(line.as_str(), "-2.500000");
    }

    #[test]
    fn test_fmt_ptr() {
        assert_eq!(fmt_ptr(0), "(nil)");
        assert_eq!(fmt_ptr(0x1234), "0x1234");
    }
}
