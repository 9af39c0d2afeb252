//! Frame line composition.
//!
//! Lines carry a 1-based index, the owning module's basename, the source
//! location and the function decoration, in columns whose widths only ever
//! grow so subsequent lines stay aligned for the rest of the process.

use crate::buffer::LineBuf;
use crate::config;
use crate::trace::classify::SegmentCache;
use crate::trace::dso::DsoRegistry;
use crate::trace::symbolize::{self, Callsite};
use crate::trace::vars::VarPrinter;
use std::io::{self, Write};

/// Column alignment state, monotonically widening.
pub struct Printer {
    wcol1: usize,
    wcol2: usize,
}

impl Printer {
    pub const fn new() -> Self {
        Printer { wcol1: 0, wcol2: 0 }
    }

    /// Print the `idx`:th frame executing `pc`.
    pub fn print_frame(
        &mut self,
        out: &mut dyn Write,
        idx: usize,
        pc: usize,
        cs: &Callsite,
    ) -> io::Result<()> {
        let fname = cs.dso.map(|dso| dso.fname.as_str()).unwrap_or("");
        let location = cs.location.as_deref().unwrap_or("");

        write!(
            out,
            "{idx:4}. {fname:<w1$} {location:<w2$} ",
            w1 = self.wcol1,
            w2 = self.wcol2
        )?;
        match (cs.cls.as_deref(), cs.funame.as_deref()) {
            (None, None) => writeln!(out, "[0x{pc:x}]")?,
            (None, Some(funame)) => writeln!(out, "{funame}()")?,
            // A bare cls is a mangled identifier; an external demangle
            // filter adds the "()" itself.
            (Some(cls), None) => writeln!(out, "{cls}")?,
            (Some(cls), Some(funame)) => writeln!(out, "{cls}::{funame}()")?,
        }

        self.wcol1 = self.wcol1.max(fname.len());
        self.wcol2 = self.wcol2.max(location.len());
        Ok(())
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one frame needs: symbolize, print the line, then decode
/// variables when enabled and the unwinder supplied a frame pointer.
pub struct FramePrinter<'a> {
    pub dsos: &'a mut DsoRegistry,
    pub segments: &'a mut SegmentCache,
    pub printer: &'a mut Printer,
    pub seen: &'a mut Vec<usize>,
    pub name_buf: &'a mut LineBuf,
    pub line_buf: &'a mut LineBuf,
}

impl FramePrinter<'_> {
    pub fn print(
        &mut self,
        out: &mut dyn Write,
        idx: usize,
        pc: usize,
        fp: Option<usize>,
    ) -> io::Result<()> {
        let cs = symbolize::resolve(self.dsos, pc);
        self.printer.print_frame(out, idx, pc, &cs)?;

        if config::TRACE.print_vars && !cs.scopes.is_empty() {
            if let Some(fp) = fp {
                let mut vars = VarPrinter {
                    segments: self.segments,
                    seen: self.seen,
                    name: self.name_buf,
                    line: self.line_buf,
                };
                vars.print_frame_vars(out, &cs, pc, fp)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::symbolize::Callsite;

    fn frame_line(printer: &mut Printer, idx: usize, pc: usize, cs: &Callsite) -> String {
        let mut out = Vec::new();
        printer.print_frame(&mut out, idx, pc, cs).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_bare_pc_brackets() {
        let mut printer = Printer::new();
        let line = frame_line(&mut printer, 9, 0x40044450, &Callsite::default());
        assert_eq!(line, "   9.   [0x40044450]\n");
    }

    #[test]
    fn test_function_decorations() {
        let mut printer = Printer::new();

        let mut cs = Callsite::default();
        cs.funame = Some("main_baz".into());
        assert!(frame_line(&mut printer, 1, 0, &cs).ends_with("main_baz()\n"));

        let mut cs = Callsite::default();
        cs.cls = Some("_ZN3Foo3barEv".into());
        assert!(frame_line(&mut printer, 2, 0, &cs).ends_with("_ZN3Foo3barEv\n"));

        let mut cs = Callsite::default();
        cs.cls = Some("Foo".into());
        cs.funame = Some("bar".into());
        assert!(frame_line(&mut printer, 3, 0, &cs).ends_with("Foo::bar()\n"));
    }

    #[test]
    fn test_columns_grow_monotonically() {
        let mut printer = Printer::new();
        let mut cs = Callsite::default();
        cs.location = Some("test_obj.c:10".into());
        cs.funame = Some("main".into());
        frame_line(&mut printer, 1, 0, &cs);

        // The next line pads the location column to the previous width.
        let line = frame_line(&mut printer, 2, 0, &Callsite::default());
        assert!(line.contains(&" ".repeat("test_obj.c:10".len())));
    }
}
