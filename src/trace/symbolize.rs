//! From a program counter to a callsite: owning module, scope chain,
//! source location and function (or class::method) name.

use crate::config;
use crate::trace::dso::{Dso, DsoRegistry};
use crate::trace::unit::{DieVariant, Unit};
use smallvec::SmallVec;

/// Symbolic context of one frame. Fields that could not be resolved stay
/// empty; the frame is still printable with whatever succeeded.
#[derive(Default)]
pub struct Callsite {
    pub dso: Option<&'static Dso>,
    pub unit: Option<&'static Unit>,
    /// Scope entry indexes within `unit`, outermost to innermost.
    pub scopes: SmallVec<[usize; 8]>,
    /// `"<cu-file> <header-file>:<lineno>"`, in whichever of its reduced
    /// shapes applies.
    pub location: Option<String>,
    /// Class name, or the raw linkage name when mangled output was
    /// requested (then `funame` is left empty).
    pub cls: Option<String>,
    pub funame: Option<String>,
}

/// Build the callsite for a (relocated) pc.
pub fn resolve(dsos: &mut DsoRegistry, pc: usize) -> Callsite {
    let mut cs = Callsite::default();
    let Some(dso) = dsos.lookup(pc) else {
        return cs;
    };
    cs.dso = Some(dso);
    let Some(view) = dso.dwarf.as_ref() else {
        return cs;
    };

    let rel_pc = (pc - dso.base) as u64;
    let Some(unit) = view.find_unit_by_pc(rel_pc) else {
        return cs;
    };
    cs.unit = Some(unit);
    cs.scopes = unit.scope_chain(rel_pc);

    let cfg = &*config::TRACE;
    let mut cufile: Option<String> = None;
    for &idx in &cs.scopes {
        match &unit.entries[idx].die {
            DieVariant::CompileUnit(attrs) => {
                cufile = attrs.name.as_deref().map(|n| trim(n, cfg.max_path).to_string());
            }
            DieVariant::Function(func) => {
                if let Some(name) = &func.base.name {
                    cs.funame = Some(name.clone());
                    cs.cls = None;
                } else if let Some(spec) = func.specification {
                    // An object method defined out of line; its name (and
                    // the class, one scope up) live at the declaration.
                    let Some((spec_unit, spec_entry)) = view.deref_die(unit, spec) else {
                        continue;
                    };
                    let DieVariant::Function(decl) = &spec_entry.die else {
                        continue;
                    };
                    if cfg.mangled && decl.linkage_name.is_some() {
                        // Empty funame marks the cls field as mangled for
                        // the printer.
                        cs.cls = decl.linkage_name.clone();
                        cs.funame = None;
                    } else if let Some(name) = &decl.base.name {
                        cs.funame = Some(name.clone());
                        cs.cls = spec_entry
                            .node
                            .parent
                            .and_then(|p| spec_unit.entries[p].die.name())
                            .map(|n| n.to_string());
                    }
                } else if let Some(linkage) = &func.linkage_name {
                    if cfg.mangled {
                        cs.cls = Some(linkage.clone());
                        cs.funame = None;
                    } else {
                        cs.funame = Some(format!("{:#}", rustc_demangle::demangle(linkage)));
                    }
                }
            }
            _ => {}
        }
    }

    // The line row is looked up one byte before the return address so it
    // lands inside the call instruction.
    let mut header = None;
    let mut lineno = 0;
    if let Some((file, line)) = unit.find_place(rel_pc.wrapping_sub(1)) {
        header = file.to_str().map(|f| trim(f, cfg.max_path).to_string());
        lineno = line;
    }
    if cufile.is_some() && cufile == header {
        // The call was made in the CU's own file, name it once.
        cufile = None;
    }
    cs.location = compose_location(cufile.as_deref(), header.as_deref(), lineno);

    cs
}

/// The five reduced shapes of the location string, depending on which of
/// cu-file, header-file and line number resolved.
fn compose_location(cufile: Option<&str>, header: Option<&str>, lineno: u64) -> Option<String> {
    match (cufile, header) {
        (Some(cu), Some(h)) if lineno > 0 => Some(format!("{cu} {h}:{lineno}")),
        (Some(cu), Some(h)) => Some(format!("{cu} {h}")),
        (Some(cu), None) => Some(cu.to_string()),
        (None, Some(h)) if lineno > 0 => Some(format!("{h}:{lineno}")),
        (None, Some(h)) => Some(h.to_string()),
        (None, None) => None,
    }
}

/// Keep the last `keep` path components of `path`.
pub fn trim(path: &str, keep: usize) -> &str {
    let bytes = path.as_bytes();
    let mut kept = 0;
    let mut at = 0;
    let mut slash = true;
    let mut i = bytes.len();
    while kept < keep {
        if i == 0 {
            return path;
        }
        if bytes[i - 1] != b'/' {
            slash = false;
        } else if !slash {
            kept += 1;
            at = i;
            slash = true;
        }
        i -= 1;
    }
    &path[at..]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trim_keeps_last_components() {
        assert_eq!(trim("/usr/src/app/main.c", 1), "main.c");
        assert_eq!(trim("/usr/src/app/main.c", 2), "app/main.c");
        assert_eq!(trim("main.c", 1), "main.c");
        assert_eq!(trim("", 1), "");
    }

    #[test]
    fn test_trim_handles_repeated_slashes() {
        assert_eq!(trim("/usr//src///main.c", 1), "main.c");
        assert_eq!(trim("/usr//src///main.c", 2), "src///main.c");
    }

    #[test]
    fn test_trim_idempotent() {
        for path in ["/usr/src/app/main.c", "a/b", "main.c", "/x/"] {
            for keep in 1..4 {
                let once = trim(path, keep);
                assert_eq!(trim(once, keep), once, "path={path} keep={keep}");
            }
        }
    }

    #[test]
    fn test_location_shapes() {
        assert_eq!(
            compose_location(Some("a.c"), Some("b.h"), 7).as_deref(),
            Some("a.c b.h:7")
        );
        assert_eq!(
            compose_location(Some("a.c"), Some("b.h"), 0).as_deref(),
            Some("a.c b.h")
        );
        assert_eq!(compose_location(Some("a.c"), None, 0).as_deref(), Some("a.c"));
        assert_eq!(compose_location(None, Some("b.h"), 7).as_deref(), Some("b.h:7"));
        assert_eq!(compose_location(None, Some("b.h"), 0).as_deref(), Some("b.h"));
        assert_eq!(compose_location(None, None, 9), None);
    }
}
