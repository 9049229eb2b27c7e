//! Small assembler for code-unit trees.
//!
//! [`Assembler`] is the builder the text front-end sits on; tests and tools
//! can also drive it directly. Text syntax:
//!
//! ```text
//! .unit <module> 1
//! .const int 1
//! .unit inner 3          ; nested unit, takes the next const slot
//! 4: LOAD_CONST 0
//!    RETURN               ; no prefix: same line as the previous instruction
//! .end
//! 2: LOAD_CONST 0
//! loop:
//! 3: FOR_ITER @done
//!    JUMP @loop
//! done:
//! 5: RETURN
//! .end
//! ```
//!
//! - `.const none|true|false|int N|float F|str "…"|bytes HEX`
//! - `label:` on its own line (or before an instruction), `@label` as operand.
//! - `N:` prefix sets the source line. Lines beginning with `;` are comments.

use std::collections::HashMap;

use crate::{
    isa::{ChunkIsa, Instruction, InstructionSet, JumpKind, OpClass, Opcode},
    lnotab::{LineStart, LineTableCodec},
    unit::{CodeUnit, Const, ConstPool},
    CoreError, CoreResult,
};

#[derive(Debug, Clone)]
enum Operand {
    None,
    Imm(u32),
    Label(String),
}

#[derive(Debug, Clone)]
struct Item {
    opcode: u8,
    operand: Operand,
    line: u32,
}

/// Builder for one code unit.
#[derive(Debug, Clone)]
pub struct Assembler<I> {
    isa: I,
    name: String,
    first_line: u32,
    consts: ConstPool,
    items: Vec<Item>,
    labels: HashMap<String, usize>,
    codec: LineTableCodec,
}

impl<I: InstructionSet> Assembler<I> {
    /// Starts an empty unit.
    pub fn new(isa: I, name: impl Into<String>, first_line: u32) -> Self {
        Self {
            isa,
            name: name.into(),
            first_line,
            consts: ConstPool::new(),
            items: Vec::new(),
            labels: HashMap::new(),
            codec: LineTableCodec::default(),
        }
    }

    /// Uses `codec` for the produced line table.
    #[must_use]
    pub fn with_codec(mut self, codec: LineTableCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Appends a constant and returns its slot.
    pub fn add_const(&mut self, value: Const) -> u32 { self.consts.add(value) }

    /// Appends a nested unit and returns its slot.
    pub fn add_unit(&mut self, unit: CodeUnit) -> u32 { self.consts.add(Const::Code(Box::new(unit))) }

    /// Binds `name` to the next emitted instruction.
    pub fn label(&mut self, name: impl Into<String>) -> CoreResult<()> {
        let name = name.into();
        if self.labels.insert(name.clone(), self.items.len()).is_some() {
            return Err(CoreError::corrupted(format!("duplicate label `{name}`")));
        }
        Ok(())
    }

    /// Emits an instruction with an immediate operand.
    pub fn emit(&mut self, line: u32, opcode: u8, arg: Option<u32>) {
        let operand = arg.map_or(Operand::None, Operand::Imm);
        self.items.push(Item { opcode, operand, line });
    }

    /// Emits a jump whose operand is resolved from `label` at [`Assembler::finish`].
    pub fn emit_jump(&mut self, line: u32, opcode: u8, label: impl Into<String>) {
        self.items.push(Item { opcode, operand: Operand::Label(label.into()), line });
    }

    /// Lays out, resolves labels and encodes the unit.
    pub fn finish(self) -> CoreResult<CodeUnit> {
        let mut insns = Vec::with_capacity(self.items.len());
        let mut offset = 0u32;
        for item in &self.items {
            let arg = match item.operand {
                Operand::None => None,
                Operand::Imm(v) => Some(v),
                Operand::Label(_) => Some(0),
            };
            let insn = Instruction { opcode: item.opcode, arg, offset, line: item.line };
            offset = offset
                .checked_add(self.isa.width(&insn))
                .ok_or_else(|| CoreError::overflow("unit larger than u32"))?;
            insns.push(insn);
        }
        let end = offset;
        let offsets: Vec<u32> = insns.iter().map(|i| i.offset).collect();

        for (insn, item) in insns.iter_mut().zip(&self.items) {
            let Operand::Label(label) = &item.operand else { continue };
            let idx = *self
                .labels
                .get(label)
                .ok_or_else(|| CoreError::corrupted(format!("undefined label `{label}`")))?;
            let target = offsets.get(idx).copied().unwrap_or(end);
            let arg = match self.isa.class(insn) {
                OpClass::Jump(JumpKind::Absolute) => target,
                OpClass::Jump(JumpKind::Relative) => {
                    let from = insn.offset + self.isa.width(insn);
                    target
                        .checked_sub(from)
                        .ok_or_else(|| CoreError::corrupted(format!("backward relative jump to `{label}`")))?
                }
                _ => {
                    return Err(CoreError::corrupted(format!(
                        "{} cannot take a label operand",
                        self.isa.mnemonic(insn.opcode)
                    )))
                }
            };
            insn.arg = Some(arg);
        }

        let code = self.isa.encode_all(&insns)?;
        let mut starts: Vec<LineStart> = Vec::new();
        for insn in &insns {
            if starts.last().map_or(true, |s| s.line != insn.line) {
                starts.push(LineStart::new(insn.offset, insn.line));
            }
        }
        let line_table = self.codec.encode(&starts, self.first_line)?;

        Ok(CodeUnit { name: self.name, first_line: self.first_line, code, consts: self.consts, line_table })
    }
}

/// Assemble a text source into a [`CodeUnit`] tree for [`ChunkIsa`], line
/// tables in the default (signed) convention.
pub fn assemble(source: &str) -> CoreResult<CodeUnit> { assemble_with(source, LineTableCodec::default()) }

/// Same as [`assemble`], every line table encoded with `codec`. A backward
/// line step that `codec` cannot carry is an error, never a shifted line.
pub fn assemble_with(source: &str, codec: LineTableCodec) -> CoreResult<CodeUnit> {
    let mut stack: Vec<(Assembler<ChunkIsa>, u32)> = Vec::new();
    let mut root: Option<CodeUnit> = None;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let err = |msg: String| CoreError::Asm { line: line_no, msg };
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if root.is_some() {
            return Err(err("content after the root `.end`".into()));
        }

        if let Some(rest) = line.strip_prefix(".unit") {
            let mut parts = rest.split_whitespace();
            let name = parts.next().ok_or_else(|| err("`.unit` expects a name".into()))?;
            let first_line = parts
                .next()
                .ok_or_else(|| err("`.unit` expects a first line".into()))?
                .parse::<u32>()
                .map_err(|e| err(format!("first line: {e}")))?;
            stack.push((Assembler::new(ChunkIsa, name, first_line).with_codec(codec), first_line));
            continue;
        }

        if line == ".end" {
            let (asm, _) = stack.pop().ok_or_else(|| err("`.end` without `.unit`".into()))?;
            let unit = asm.finish().map_err(|e| err(e.to_string()))?;
            match stack.last_mut() {
                Some((parent, _)) => {
                    parent.add_unit(unit);
                }
                None => root = Some(unit),
            }
            continue;
        }

        let (asm, current_line) = stack.last_mut().ok_or_else(|| err("instruction outside `.unit`".into()))?;

        if let Some(rest) = line.strip_prefix(".const") {
            let value = parse_const(rest.trim()).map_err(err)?;
            asm.add_const(value);
            continue;
        }

        let mut body = line;
        if let Some((head, tail)) = line.split_once(':') {
            let head = head.trim();
            if !head.is_empty() && !head.contains(char::is_whitespace) {
                if head.bytes().all(|b| b.is_ascii_digit()) {
                    *current_line = head.parse::<u32>().map_err(|e| err(format!("line number: {e}")))?;
                } else {
                    asm.label(head).map_err(|e| err(e.to_string()))?;
                }
                body = tail.trim();
                if let Some((head2, tail2)) = body.split_once(':') {
                    let head2 = head2.trim();
                    if !head2.is_empty() && head2.bytes().all(|b| b.is_ascii_digit()) {
                        *current_line = head2.parse::<u32>().map_err(|e| err(format!("line number: {e}")))?;
                        body = tail2.trim();
                    }
                }
            }
        }
        if body.is_empty() {
            continue;
        }

        let mut parts = body.split_whitespace();
        let mnemonic = parts.next().unwrap_or_default();
        let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| err(format!("unsupported instruction `{mnemonic}`")))?;
        let operand = parts.next();
        if parts.next().is_some() {
            return Err(err(format!("{} takes at most one operand", op.mnemonic())));
        }
        match (op.has_arg(), operand) {
            (false, None) => asm.emit(*current_line, op.byte(), None),
            (false, Some(_)) => return Err(err(format!("{} takes no operand", op.mnemonic()))),
            (true, None) => return Err(err(format!("{} expects an operand", op.mnemonic()))),
            (true, Some(arg)) => {
                if let Some(label) = arg.strip_prefix('@') {
                    asm.emit_jump(*current_line, op.byte(), label);
                } else {
                    let v = arg.parse::<u32>().map_err(|e| err(format!("operand `{arg}`: {e}")))?;
                    asm.emit(*current_line, op.byte(), Some(v));
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(CoreError::Asm { line: source.lines().count(), msg: "missing `.end`".into() });
    }
    root.ok_or(CoreError::Asm { line: 0, msg: "no `.unit` found".into() })
}

fn strip_comment(line: &str) -> &str {
    let mut in_str = false;
    let mut escaping = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaping => escaping = false,
            '\\' if in_str => escaping = true,
            '"' => in_str = !in_str,
            ';' if !in_str => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_const(text: &str) -> Result<Const, String> {
    let (kind, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let rest = rest.trim();
    match kind {
        "none" => Ok(Const::None),
        "true" => Ok(Const::Bool(true)),
        "false" => Ok(Const::Bool(false)),
        "int" => rest.parse::<i64>().map(Const::Int).map_err(|e| format!("int constant: {e}")),
        "float" => rest.parse::<f64>().map(Const::Float).map_err(|e| format!("float constant: {e}")),
        "str" => parse_string_literal(rest).map(Const::Str),
        "bytes" => parse_hex(rest).map(Const::Bytes),
        other => Err(format!("unknown constant kind `{other}`")),
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits = input.as_bytes();
    if digits.len() % 2 != 0 {
        return Err("hex literal needs an even number of digits".into());
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

fn hex_digit(b: u8) -> Result<u8, String> {
    char::from(b)
        .to_digit(16)
        .and_then(|d| u8::try_from(d).ok())
        .ok_or_else(|| format!("hex literal: invalid digit {:?}", char::from(b)))
}

fn parse_string_literal(input: &str) -> Result<String, String> {
    let bytes = input.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return Err("string literal expected".into());
    }

    let mut out = String::new();
    let mut escaping = false;
    for c in input[1..input.len() - 1].chars() {
        if escaping {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaping = false;
            continue;
        }
        if c == '\\' {
            escaping = true;
        } else {
            out.push(c);
        }
    }

    if escaping {
        return Err("incomplete escape sequence".into());
    }

    Ok(out)
}
