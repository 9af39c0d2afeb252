//! Parsed compilation units.
//!
//! Units are materialized eagerly per module: a flat entry list forming a
//! tree (parent/child indexes), the unit's address ranges, and the line
//! rows. Only the DIE shapes the engine actually reads are kept as typed
//! variants; everything else lands in [`DieVariant::Default`] so tree
//! structure (and names along specification chains) survives.

use crate::trace::dso::EndianArcSlice;
use fallible_iterator::FallibleIterator;
use gimli::{
    Attribute, AttributeValue, DebugAddrBase, DebugInfoOffset, DebugLocListsBase, DwAte, Encoding,
    Expression, Range, Reader, UnitHeader, UnitOffset,
};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};

/// A row in the line number program's resulting matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRow {
    pub address: u64,
    pub file_index: u64,
    pub line: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DieAttributes {
    pub name: Option<String>,
    pub ranges: Box<[Range]>,
}

#[derive(Debug, Clone)]
pub struct FunctionDie {
    pub base: DieAttributes,
    pub linkage_name: Option<String>,
    pub specification: Option<DieRef>,
}

#[derive(Debug, Clone)]
pub struct VariableDie {
    pub base: DieAttributes,
    pub type_ref: Option<DieRef>,
    pub location: Option<Attribute<EndianArcSlice>>,
}

#[derive(Debug, Clone)]
pub struct BaseTypeDie {
    pub base: DieAttributes,
    pub encoding: Option<DwAte>,
    pub byte_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PointerTypeDie {
    pub base: DieAttributes,
    pub type_ref: Option<DieRef>,
    pub byte_size: Option<u64>,
}

/// Array, typedef, const and volatile DIEs all reduce to "a name and the
/// next link of the type chain".
#[derive(Debug, Clone)]
pub struct TypeChainDie {
    pub base: DieAttributes,
    pub type_ref: Option<DieRef>,
}

#[derive(Debug, Clone)]
pub struct SubrangeDie {
    pub base: DieAttributes,
    pub upper_bound: Option<u64>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum DieVariant {
    CompileUnit(DieAttributes),
    Function(FunctionDie),
    LexicalBlock(DieAttributes),
    Variable(VariableDie),
    Parameter(VariableDie),
    BaseType(BaseTypeDie),
    PointerType(PointerTypeDie),
    ArrayType(TypeChainDie),
    ArraySubrange(SubrangeDie),
    TypeDef(TypeChainDie),
    ConstType(TypeChainDie),
    VolatileType(TypeChainDie),
    Default(DieAttributes),
}

impl DieVariant {
    /// Name attribute, whatever the variant.
    pub fn name(&self) -> Option<&str> {
        let base = match self {
            DieVariant::CompileUnit(base)
            | DieVariant::LexicalBlock(base)
            | DieVariant::Default(base) => base,
            DieVariant::Function(f) => &f.base,
            DieVariant::Variable(v) | DieVariant::Parameter(v) => &v.base,
            DieVariant::BaseType(t) => &t.base,
            DieVariant::PointerType(t) => &t.base,
            DieVariant::ArrayType(t) | DieVariant::TypeDef(t) | DieVariant::ConstType(t)
            | DieVariant::VolatileType(t) => &t.base,
            DieVariant::ArraySubrange(s) => &s.base,
        };
        base.name.as_deref()
    }

    pub fn ranges(&self) -> &[Range] {
        match self {
            DieVariant::CompileUnit(base)
            | DieVariant::LexicalBlock(base)
            | DieVariant::Default(base) => &base.ranges,
            DieVariant::Function(f) => &f.base.ranges,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl Node {
    const fn new_leaf(parent: Option<usize>) -> Node {
        Node { parent, children: vec![] }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub offset: UnitOffset,
    pub die: DieVariant,
    pub node: Node,
}

/// Reference to another DIE, either unit-local or global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DieRef {
    Unit(UnitOffset),
    Global(DebugInfoOffset),
}

impl DieRef {
    fn from_attr(attr: &Attribute<EndianArcSlice>) -> Option<DieRef> {
        match attr.value() {
            AttributeValue::DebugInfoRef(offset) => Some(DieRef::Global(offset)),
            AttributeValue::UnitRef(offset) => Some(DieRef::Unit(offset)),
            _ => None,
        }
    }
}

/// One parsed compilation unit.
pub struct Unit {
    pub idx: usize,
    offset: Option<DebugInfoOffset>,
    /// The CU source file (`DW_AT_name`).
    pub name: Option<String>,
    ranges: Vec<Range>,
    files: Vec<PathBuf>,
    lines: Vec<LineRow>,
    pub entries: Vec<Entry>,
    encoding: Encoding,
    low_pc: u64,
    addr_base: DebugAddrBase,
    loclists_base: DebugLocListsBase,
}

impl Unit {
    pub fn offset(&self) -> Option<DebugInfoOffset> {
        self.offset
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn covers(&self, pc: u64) -> bool {
        match self.ranges.binary_search_by_key(&pc, |r| r.begin) {
            Ok(_) => true,
            Err(pos) => self.ranges[..pos].iter().rev().any(|r| r.begin <= pc && pc < r.end),
        }
    }

    /// Entry lookup by unit-local offset. Entries are stored in DFS order,
    /// which is offset order, so this is a binary search.
    pub fn find_entry(&self, offset: UnitOffset) -> Option<&Entry> {
        let idx = self.entries.binary_search_by_key(&offset, |e| e.offset).ok()?;
        Some(&self.entries[idx])
    }

    /// The best line row at or before `pc`, resolved to its file.
    pub fn find_place(&self, pc: u64) -> Option<(&Path, u64)> {
        let pos = self.lines.partition_point(|row| row.address <= pc);
        let row = &self.lines[pos.checked_sub(1)?];
        let file = self.files.get(row.file_index as usize)?;
        Some((file.as_path(), row.line))
    }

    /// Scope chain covering `pc`, outermost first: the CU entry, then every
    /// subprogram and lexical block whose ranges contain the pc. When the
    /// range-driven walk finds no subprogram (a subprogram lexically nested
    /// in another but not spatially within its ranges), fall back to a
    /// recursive search over subprogram children.
    pub fn scope_chain(&self, pc: u64) -> SmallVec<[usize; 8]> {
        let mut chain: SmallVec<[usize; 8]> = SmallVec::new();
        if self.entries.is_empty() {
            return chain;
        }
        chain.push(0);

        let mut cur = 0;
        'descend: loop {
            for &child in &self.entries[cur].node.children {
                let die = &self.entries[child].die;
                let scope = matches!(die, DieVariant::Function(_) | DieVariant::LexicalBlock(_));
                if scope && die.ranges().iter().any(|r| r.begin <= pc && pc < r.end) {
                    chain.push(child);
                    cur = child;
                    continue 'descend;
                }
            }
            break;
        }

        let has_function = chain
            .iter()
            .any(|&idx| matches!(self.entries[idx].die, DieVariant::Function(_)));
        if !has_function {
            let mut found = Vec::new();
            if self.search_scopes(0, pc, &mut found) {
                chain.truncate(1);
                chain.extend(found);
            }
        }

        chain
    }

    fn search_scopes(&self, parent: usize, pc: u64, out: &mut Vec<usize>) -> bool {
        for &child in &self.entries[parent].node.children {
            let DieVariant::Function(_) = self.entries[child].die else {
                continue;
            };
            if self.search_scopes(child, pc, out) {
                out.insert(0, child);
                return true;
            }
            let covers = self.entries[child]
                .die
                .ranges()
                .iter()
                .any(|r| r.begin <= pc && pc <= r.end);
            if covers {
                out.push(child);
                return true;
            }
        }
        false
    }

    /// Converts a location attribute into a dwarf expression: `exprloc`
    /// directly, location lists through the list covering `pc`.
    pub fn location_expr(
        &self,
        dwarf: &gimli::Dwarf<EndianArcSlice>,
        attr: &Attribute<EndianArcSlice>,
        pc: u64,
    ) -> Option<Expression<EndianArcSlice>> {
        if let Some(expr) = attr.exprloc_value() {
            return Some(expr);
        }

        let offset = match attr.value() {
            AttributeValue::LocationListsRef(offset) => offset,
            AttributeValue::DebugLocListsIndex(index) => dwarf
                .locations
                .get_offset(self.encoding, self.loclists_base, index)
                .ok()?,
            _ => return None,
        };

        let mut iter = dwarf
            .locations
            .locations(offset, self.encoding, self.low_pc, &dwarf.debug_addr, self.addr_base)
            .ok()?;
        let entry = iter
            .find(|e| Ok(e.range.begin <= pc && pc < e.range.end))
            .ok()
            .flatten()?;
        Some(entry.data)
    }
}

/// Parser of a dwarf unit into a [`Unit`].
pub struct UnitParser<'a> {
    dwarf: &'a gimli::Dwarf<EndianArcSlice>,
}

impl<'a> UnitParser<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<EndianArcSlice>) -> Self {
        Self { dwarf }
    }

    pub fn parse(&self, header: UnitHeader<EndianArcSlice>) -> gimli::Result<Unit> {
        let offset = header.offset().as_debug_info_offset();
        let unit = self.dwarf.unit(header)?;

        let name = unit
            .name
            .as_ref()
            .and_then(|n| n.to_string_lossy().ok().map(|c| c.into_owned()));

        let mut ranges = self.dwarf.unit_ranges(&unit)?.collect::<Vec<_>>()?;
        ranges.sort_unstable_by_key(|r| r.begin);

        let (files, lines) = self.parse_lines(&unit, name.as_deref())?;

        let mut entries: Vec<Entry> = Vec::new();
        let mut parents: Vec<usize> = Vec::new();
        let mut depth = 0isize;
        let mut cursor = unit.entries();
        while let Some((delta, die)) = cursor.next_dfs()? {
            depth += delta;
            let depth = depth.max(0) as usize;
            parents.truncate(depth);

            let base = DieAttributes {
                name: self.attr_string(&unit, die.attr(gimli::DW_AT_name)?),
                ranges: self
                    .dwarf
                    .die_ranges(&unit, die)?
                    .collect::<Vec<_>>()?
                    .into_boxed_slice(),
            };
            let variant = match die.tag() {
                gimli::DW_TAG_compile_unit => DieVariant::CompileUnit(base),
                gimli::DW_TAG_subprogram => DieVariant::Function(FunctionDie {
                    base,
                    linkage_name: self.attr_string(
                        &unit,
                        die.attr(gimli::DW_AT_linkage_name)?
                            .or(die.attr(gimli::DW_AT_MIPS_linkage_name)?),
                    ),
                    specification: die
                        .attr(gimli::DW_AT_specification)?
                        .as_ref()
                        .and_then(DieRef::from_attr),
                }),
                gimli::DW_TAG_lexical_block => DieVariant::LexicalBlock(base),
                gimli::DW_TAG_variable => DieVariant::Variable(VariableDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                    location: die.attr(gimli::DW_AT_location)?,
                }),
                gimli::DW_TAG_formal_parameter => DieVariant::Parameter(VariableDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                    location: die.attr(gimli::DW_AT_location)?,
                }),
                gimli::DW_TAG_base_type => DieVariant::BaseType(BaseTypeDie {
                    base,
                    encoding: die.attr(gimli::DW_AT_encoding)?.and_then(|attr| match attr.value() {
                        AttributeValue::Encoding(enc) => Some(enc),
                        _ => None,
                    }),
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                }),
                gimli::DW_TAG_pointer_type => DieVariant::PointerType(PointerTypeDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                    byte_size: die.attr(gimli::DW_AT_byte_size)?.and_then(|a| a.udata_value()),
                }),
                gimli::DW_TAG_array_type => DieVariant::ArrayType(TypeChainDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                }),
                gimli::DW_TAG_subrange_type => DieVariant::ArraySubrange(SubrangeDie {
                    base,
                    upper_bound: die.attr(gimli::DW_AT_upper_bound)?.and_then(|a| a.udata_value()),
                    count: die.attr(gimli::DW_AT_count)?.and_then(|a| a.udata_value()),
                }),
                gimli::DW_TAG_typedef => DieVariant::TypeDef(TypeChainDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                }),
                gimli::DW_TAG_const_type => DieVariant::ConstType(TypeChainDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                }),
                gimli::DW_TAG_volatile_type => DieVariant::VolatileType(TypeChainDie {
                    base,
                    type_ref: die.attr(gimli::DW_AT_type)?.as_ref().and_then(DieRef::from_attr),
                }),
                _ => DieVariant::Default(base),
            };

            let parent_idx = parents.last().copied();
            let entry_idx = entries.len();
            entries.push(Entry {
                offset: die.offset(),
                die: variant,
                node: Node::new_leaf(parent_idx),
            });
            if let Some(p) = parent_idx {
                entries[p].node.children.push(entry_idx);
            }
            parents.push(entry_idx);
        }

        Ok(Unit {
            idx: 0,
            offset,
            name,
            ranges,
            files,
            lines,
            entries,
            encoding: unit.encoding(),
            low_pc: unit.low_pc,
            addr_base: unit.addr_base,
            loclists_base: unit.loclists_base,
        })
    }

    fn parse_lines(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        unit_name: Option<&str>,
    ) -> gimli::Result<(Vec<PathBuf>, Vec<LineRow>)> {
        let Some(program) = unit.line_program.clone() else {
            return Ok((vec![], vec![]));
        };

        let mut files = Vec::new();
        {
            let header = program.header();
            if header.encoding().version < 5 {
                // DWARF <= 4 numbers files from 1; slot 0 stands for the
                // unit's primary source file.
                files.push(PathBuf::from(unit_name.unwrap_or_default()));
            }
            for file in header.file_names() {
                let mut path = PathBuf::new();
                if let Some(dir) = unit.comp_dir.as_ref().and_then(|d| d.to_string_lossy().ok()) {
                    path.push(dir.as_ref());
                }
                if let Some(dir) = file
                    .directory(header)
                    .and_then(|av| self.dwarf.attr_string(unit, av).ok())
                    .and_then(|r| r.to_string_lossy().ok().map(|c| c.into_owned()))
                {
                    path.push(dir);
                }
                if let Some(name) = self
                    .dwarf
                    .attr_string(unit, file.path_name())
                    .ok()
                    .and_then(|r| r.to_string_lossy().ok().map(|c| c.into_owned()))
                {
                    path.push(name);
                }
                files.push(path);
            }
        }

        let mut lines = Vec::new();
        let mut rows = program.rows();
        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }
            lines.push(LineRow {
                address: row.address(),
                file_index: row.file_index(),
                line: row.line().map(|l| l.get()).unwrap_or(0),
            });
        }
        lines.sort_unstable_by_key(|row| row.address);

        Ok((files, lines))
    }

    fn attr_string(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        attr: Option<Attribute<EndianArcSlice>>,
    ) -> Option<String> {
        let attr = attr?;
        self.dwarf
            .attr_string(unit, attr.value())
            .ok()
            .and_then(|r| r.to_string_lossy().ok().map(|c| c.into_owned()))
    }
}
