//! Code-unit tree plus a compact binary container.
//!
//! Container layout (little-endian):
//!
//! ```text
//! "TRUT" | version u16 | flags u8 | reserved u8 | unit | crc32 u32
//! unit  := name str | first_line u32 | code bytes | line_table bytes | count u32 | const*
//! const := tag u8 | payload         (tag CODE nests a full `unit`)
//! ```

use std::{
    hash::{Hash, Hasher},
    io::{Read, Write},
    mem, slice,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    isa::{Instruction, InstructionSet},
    lnotab::{LineStart, LineTableCodec},
    CoreError, CoreResult,
};

/// Container magic.
pub const MAGIC: &[u8; 4] = b"TRUT";
/// Current container version.
pub const UNIT_VERSION: u16 = 1;

const CONST_TAG_NONE: u8 = 0x00;
const CONST_TAG_STR: u8 = 0x01;
const CONST_TAG_INT: u8 = 0x02;
const CONST_TAG_FLOAT: u8 = 0x03;
const CONST_TAG_BOOL: u8 = 0x04;
const CONST_TAG_BYTES: u8 = 0x05;
const CONST_TAG_CODE: u8 = 0x06;

/// Values that can live in a constant pool.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Const {
    /// Null literal.
    None,
    /// Boolean literal.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// UTF-8 string constant.
    Str(String),
    /// Raw byte blob.
    Bytes(Vec<u8>),
    /// Nested code unit, owned by this slot only.
    Code(Box<CodeUnit>),
}

impl Const {
    /// Nested unit held by this slot, if any.
    pub fn as_unit(&self) -> Option<&CodeUnit> {
        match self {
            Const::Code(unit) => Some(unit),
            _ => None,
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::None, Const::None) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Bytes(a), Const::Bytes(b)) => a == b,
            (Const::Code(a), Const::Code(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Const::None => {}
            Const::Bool(b) => b.hash(state),
            Const::Int(v) => v.hash(state),
            Const::Float(v) => v.to_bits().hash(state),
            Const::Str(s) => s.hash(state),
            Const::Bytes(bytes) => bytes.hash(state),
            Const::Code(unit) => unit.hash(state),
        }
    }
}

/// Constant pool with stable indices (0-based).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ConstPool {
    values: Vec<Const>,
}

impl ConstPool {
    /// Create an empty pool.
    pub const fn new() -> Self { Self { values: Vec::new() } }

    /// Number of stored constants.
    pub fn len(&self) -> usize { self.values.len() }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Iterate over the slots in order.
    pub fn iter(&self) -> slice::Iter<'_, Const> { self.values.iter() }

    /// Pushes a value and returns its index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add(&mut self, value: Const) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    /// Lookup a constant by index.
    pub fn get(&self, idx: u32) -> Option<&Const> { self.values.get(idx as usize) }

    /// Nested units in pool order.
    pub fn units(&self) -> impl Iterator<Item = &CodeUnit> + '_ { self.values.iter().filter_map(Const::as_unit) }

    /// Copy of the pool where every nested unit is replaced by `f(unit)`, in
    /// pool order. Other slots are cloned verbatim.
    pub fn map_units<E, F>(&self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&CodeUnit) -> Result<CodeUnit, E>,
    {
        self.values
            .iter()
            .map(|value| match value {
                Const::Code(unit) => f(unit).map(|new| Const::Code(Box::new(new))),
                other => Ok(other.clone()),
            })
            .collect()
    }

    /// Number of slots that do not hold a nested unit.
    pub fn plain_len(&self) -> usize { self.values.iter().filter(|c| c.as_unit().is_none()).count() }
}

impl FromIterator<Const> for ConstPool {
    fn from_iter<T: IntoIterator<Item = Const>>(iter: T) -> Self { Self { values: iter.into_iter().collect() } }
}

impl<'a> IntoIterator for &'a ConstPool {
    type Item = &'a Const;
    type IntoIter = slice::Iter<'a, Const>;

    fn into_iter(self) -> Self::IntoIter { self.iter() }
}

/// One compiled routine: instruction stream, constants and line table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CodeUnit {
    /// Diagnostic name (`<module>`, function name, `<lambda>`…).
    pub name: String,
    /// Line the line table is relative to.
    pub first_line: u32,
    /// Encoded instruction stream.
    pub code: Vec<u8>,
    /// Constant pool; some slots may hold nested units.
    pub consts: ConstPool,
    /// Encoded line table.
    pub line_table: Vec<u8>,
}

impl CodeUnit {
    /// Empty unit.
    pub fn new(name: impl Into<String>, first_line: u32) -> Self {
        Self { name: name.into(), first_line, ..Self::default() }
    }

    /// Units of the tree in post-order: children depth-first in pool order,
    /// then the parent; the root comes last.
    pub fn post_order(&self) -> PostOrder<'_> { PostOrder { stack: vec![(self, 0)] } }

    /// Total number of units in the tree, root included.
    pub fn tree_len(&self) -> usize { self.post_order().count() }

    /// Decoded line table.
    pub fn line_starts(&self, codec: &LineTableCodec) -> CoreResult<Vec<LineStart>> {
        codec.decode(&self.line_table, self.first_line)
    }

    /// Decoded instruction stream, each instruction tagged with its source line.
    pub fn instructions<I: InstructionSet>(&self, isa: &I, codec: &LineTableCodec) -> CoreResult<Vec<Instruction>> {
        let mut insns = isa.decode(&self.code)?;
        let starts = self.line_starts(codec)?;
        annotate_lines(&mut insns, &starts);
        Ok(insns)
    }

    /// Encode the tree to the binary container.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(UNIT_VERSION)?;
        out.write_u8(0)?; // flags
        out.write_u8(0)?; // reserved
        write_unit(&mut out, self)?;
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        tracing::trace!(unit = %self.name, bytes = out.len(), crc, "unit tree encoded");
        Ok(out)
    }

    /// Decode a tree from [`CodeUnit::to_bytes`] output.
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        if data.len() < MAGIC.len() + 2 + 2 + 4 {
            return Err(CoreError::UnexpectedEof { needed: (MAGIC.len() + 8) as u64, at: 0 });
        }
        let (payload, mut crc_bytes) = data.split_at(data.len() - 4);
        let found = crc_bytes.read_u32::<LittleEndian>()?;
        let expected = crc32fast::hash(payload);
        if expected != found {
            return Err(CoreError::HashMismatch { expected, found });
        }
        if &payload[..MAGIC.len()] != MAGIC {
            return Err(CoreError::InvalidMagic);
        }

        let mut rd = &payload[MAGIC.len()..];
        let version = rd.read_u16::<LittleEndian>()?;
        if version != UNIT_VERSION {
            return Err(CoreError::corrupted(format!("unsupported container version {version}")));
        }
        let _flags = rd.read_u8()?;
        let _reserved = rd.read_u8()?;
        let unit = read_unit(&mut rd)?;
        if !rd.is_empty() {
            return Err(CoreError::corrupted("trailing bytes"));
        }
        tracing::trace!(unit = %unit.name, bytes = data.len(), "unit tree decoded");
        Ok(unit)
    }
}

/// Iterator returned by [`CodeUnit::post_order`].
pub struct PostOrder<'a> {
    stack: Vec<(&'a CodeUnit, usize)>,
}

impl<'a> Iterator for PostOrder<'a> {
    type Item = &'a CodeUnit;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (unit, slot) = self.stack.last_mut()?;
            let unit: &'a CodeUnit = *unit;
            let child = unit.consts.values[*slot..]
                .iter()
                .position(|c| c.as_unit().is_some())
                .map(|rel| *slot + rel);
            match child {
                Some(idx) => {
                    *slot = idx + 1;
                    if let Some(nested) = unit.consts.values[idx].as_unit() {
                        self.stack.push((nested, 0));
                    }
                }
                None => {
                    self.stack.pop();
                    return Some(unit);
                }
            }
        }
    }
}

/// Sets `line` on every instruction from the run it falls in. `starts` must
/// be sorted by offset.
pub fn annotate_lines(insns: &mut [Instruction], starts: &[LineStart]) {
    let mut idx = 0;
    for insn in insns {
        while idx + 1 < starts.len() && starts[idx + 1].offset <= insn.offset {
            idx += 1;
        }
        insn.line = starts.get(idx).map_or(0, |s| s.line);
    }
}

fn write_unit(out: &mut Vec<u8>, unit: &CodeUnit) -> CoreResult<()> {
    write_bytes(out, unit.name.as_bytes())?;
    out.write_u32::<LittleEndian>(unit.first_line)?;
    write_bytes(out, &unit.code)?;
    write_bytes(out, &unit.line_table)?;
    write_len(out, unit.consts.len())?;
    for value in &unit.consts {
        match value {
            Const::None => out.write_u8(CONST_TAG_NONE)?,
            Const::Str(s) => {
                out.write_u8(CONST_TAG_STR)?;
                write_bytes(out, s.as_bytes())?;
            }
            Const::Int(v) => {
                out.write_u8(CONST_TAG_INT)?;
                out.write_i64::<LittleEndian>(*v)?;
            }
            Const::Float(v) => {
                out.write_u8(CONST_TAG_FLOAT)?;
                out.write_f64::<LittleEndian>(*v)?;
            }
            Const::Bool(b) => {
                out.write_u8(CONST_TAG_BOOL)?;
                out.write_u8(u8::from(*b))?;
            }
            Const::Bytes(bytes) => {
                out.write_u8(CONST_TAG_BYTES)?;
                write_bytes(out, bytes)?;
            }
            Const::Code(nested) => {
                out.write_u8(CONST_TAG_CODE)?;
                write_unit(out, nested)?;
            }
        }
    }
    Ok(())
}

fn read_unit(rd: &mut &[u8]) -> CoreResult<CodeUnit> {
    let name = String::from_utf8(read_vec(rd)?).map_err(|_| CoreError::corrupted("utf8"))?;
    let first_line = rd.read_u32::<LittleEndian>()?;
    let code = read_vec(rd)?;
    let line_table = read_vec(rd)?;
    let count = rd.read_u32::<LittleEndian>()? as usize;
    let mut consts = ConstPool::new();
    for _ in 0..count {
        let value = match rd.read_u8()? {
            CONST_TAG_NONE => Const::None,
            CONST_TAG_STR => Const::Str(String::from_utf8(read_vec(rd)?).map_err(|_| CoreError::corrupted("utf8"))?),
            CONST_TAG_INT => Const::Int(rd.read_i64::<LittleEndian>()?),
            CONST_TAG_FLOAT => Const::Float(rd.read_f64::<LittleEndian>()?),
            CONST_TAG_BOOL => match rd.read_u8()? {
                0 => Const::Bool(false),
                1 => Const::Bool(true),
                _ => return Err(CoreError::corrupted("invalid bool")),
            },
            CONST_TAG_BYTES => Const::Bytes(read_vec(rd)?),
            CONST_TAG_CODE => Const::Code(Box::new(read_unit(rd)?)),
            tag => return Err(CoreError::corrupted(format!("unknown const tag 0x{tag:02X}"))),
        };
        consts.add(value);
    }
    Ok(CodeUnit { name, first_line, code, consts, line_table })
}

fn write_len(out: &mut Vec<u8>, len: usize) -> CoreResult<()> {
    let len = u32::try_from(len).map_err(|_| CoreError::overflow("length exceeds u32"))?;
    out.write_u32::<LittleEndian>(len)?;
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    write_len(out, bytes.len())?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_vec(rd: &mut &[u8]) -> CoreResult<Vec<u8>> {
    let len = rd.read_u32::<LittleEndian>()? as usize;
    if rd.len() < len {
        return Err(CoreError::UnexpectedEof { needed: len as u64, at: 0 });
    }
    let mut buf = vec![0; len];
    rd.read_exact(&mut buf)?;
    Ok(buf)
}
