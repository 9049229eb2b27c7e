//! Structured instructions, opcode classes and the instruction-set capability.
//!
//! The rewriter never looks at raw opcode bytes directly: everything it needs
//! (decoding, widths, encoding, probe shape, relocation class) goes through
//! [`InstructionSet`]. [`ChunkIsa`] is the reference implementation used by
//! the assembler, the CLI and the tests.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

const OPERAND_WIDTH: u32 = 4;

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Instruction {
    /// Raw opcode byte (meaning depends on the instruction set).
    pub opcode: u8,
    /// Optional operand.
    pub arg: Option<u32>,
    /// Byte offset of the instruction in its stream.
    pub offset: u32,
    /// Source line, filled from the unit's line table.
    pub line: u32,
}

impl Instruction {
    /// Instruction with no position yet (offset 0, line 0).
    pub const fn new(opcode: u8, arg: Option<u32>) -> Self { Self { opcode, arg, offset: 0, line: 0 } }

    /// Same instruction placed at `offset` on `line`.
    pub const fn at(self, offset: u32, line: u32) -> Self { Self { offset, line, ..self } }
}

/// How a jump operand designates its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JumpKind {
    /// Operand is the target byte offset.
    Absolute,
    /// Operand is a forward distance counted from the end of the instruction.
    Relative,
}

/// Relocation class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpClass {
    /// No offset-dependent operand.
    Plain,
    /// Jump whose operand must follow its target when offsets move.
    Jump(JumpKind),
    /// Must stay in the unit prologue (nothing may precede it).
    Pinned,
    /// Jumps through a runtime-computed offset; cannot be relocated.
    Indirect,
}

/// Constant-pool reference carried by an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstOperand {
    /// Pool slot.
    pub slot: u32,
    /// True when the slot must hold a nested code unit.
    pub expects_unit: bool,
}

/// Decoder/encoder capability over one bytecode dialect.
pub trait InstructionSet {
    /// Decode a raw stream; `line` is left at 0.
    fn decode(&self, code: &[u8]) -> CoreResult<Vec<Instruction>>;

    /// Append the encoding of `insn` to `out`.
    fn encode(&self, insn: &Instruction, out: &mut Vec<u8>) -> CoreResult<()>;

    /// Encoded width of `insn` in bytes.
    fn width(&self, insn: &Instruction) -> u32;

    /// Relocation class.
    fn class(&self, insn: &Instruction) -> OpClass;

    /// Probe instruction carrying `token`. Its width must not depend on the token.
    fn probe(&self, token: u32) -> Instruction;

    /// True for instructions produced by [`InstructionSet::probe`].
    fn is_probe(&self, insn: &Instruction) -> bool;

    /// Human readable opcode name.
    fn mnemonic(&self, opcode: u8) -> &'static str;

    /// Constant-pool slot referenced by the operand, if any.
    fn const_operand(&self, _insn: &Instruction) -> Option<ConstOperand> { None }

    /// Target byte offset of a jump, `None` for non-jumps.
    fn jump_target(&self, insn: &Instruction) -> Option<u64> {
        let arg = u64::from(insn.arg?);
        match self.class(insn) {
            OpClass::Jump(JumpKind::Absolute) => Some(arg),
            OpClass::Jump(JumpKind::Relative) => {
                Some(u64::from(insn.offset) + u64::from(self.width(insn)) + arg)
            }
            _ => None,
        }
    }

    /// Encode a whole sequence.
    fn encode_all(&self, insns: &[Instruction]) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(insns.len() * 2);
        for insn in insns {
            self.encode(insn, &mut out)?;
        }
        Ok(out)
    }
}

impl<T: InstructionSet + ?Sized> InstructionSet for &T {
    fn decode(&self, code: &[u8]) -> CoreResult<Vec<Instruction>> { (**self).decode(code) }
    fn encode(&self, insn: &Instruction, out: &mut Vec<u8>) -> CoreResult<()> { (**self).encode(insn, out) }
    fn width(&self, insn: &Instruction) -> u32 { (**self).width(insn) }
    fn class(&self, insn: &Instruction) -> OpClass { (**self).class(insn) }
    fn probe(&self, token: u32) -> Instruction { (**self).probe(token) }
    fn is_probe(&self, insn: &Instruction) -> bool { (**self).is_probe(insn) }
    fn mnemonic(&self, opcode: u8) -> &'static str { (**self).mnemonic(opcode) }
    fn const_operand(&self, insn: &Instruction) -> Option<ConstOperand> { (**self).const_operand(insn) }
    fn jump_target(&self, insn: &Instruction) -> Option<u64> { (**self).jump_target(insn) }
}

/* ─────────────────────────── Reference instruction set ─────────────────────────── */

/// Opcodes of the reference instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// Do nothing.
    Nop = 0x00,
    /// Generator prologue; must be the first instruction.
    GenStart = 0x01,
    /// Push constant `u32`.
    LoadConst = 0x10,
    /// Emit the top-of-stack value.
    Print = 0x11,
    /// Return top-of-stack.
    Return = 0x12,
    /// Drop top-of-stack.
    Pop = 0x13,
    /// Push the value bound to name `u32`.
    LoadName = 0x14,
    /// Bind top-of-stack to name `u32`.
    StoreName = 0x15,
    /// Replace top-of-stack by its attribute `u32`.
    LoadAttr = 0x16,
    /// Binary operator `u32` on the two topmost values.
    BinaryOp = 0x17,
    /// Comparison `u32` on the two topmost values.
    Compare = 0x18,
    /// Call with `u32` positional arguments.
    Call = 0x19,
    /// Build a closure from the nested unit in const slot `u32`.
    MakeClosure = 0x1A,
    /// Yield top-of-stack.
    Yield = 0x1B,
    /// Raise top-of-stack.
    Raise = 0x1C,
    /// Unconditional jump to absolute offset.
    Jump = 0x20,
    /// Pop, jump to absolute offset when falsy.
    JumpIfFalse = 0x21,
    /// Pop, jump to absolute offset when truthy.
    JumpIfTrue = 0x22,
    /// Advance iterator or jump forward by `u32` when exhausted.
    ForIter = 0x23,
    /// Push a handler block located `u32` bytes ahead.
    SetupFinally = 0x24,
    /// Pop the innermost handler block.
    PopBlock = 0x25,
    /// Pop an offset and jump to it.
    JumpIndirect = 0x2F,
    /// Invoke the coverage callback with token `u32`.
    Probe = 0x40,
}

const ALL_OPCODES: [Opcode; 23] = [
    Opcode::Nop,
    Opcode::GenStart,
    Opcode::LoadConst,
    Opcode::Print,
    Opcode::Return,
    Opcode::Pop,
    Opcode::LoadName,
    Opcode::StoreName,
    Opcode::LoadAttr,
    Opcode::BinaryOp,
    Opcode::Compare,
    Opcode::Call,
    Opcode::MakeClosure,
    Opcode::Yield,
    Opcode::Raise,
    Opcode::Jump,
    Opcode::JumpIfFalse,
    Opcode::JumpIfTrue,
    Opcode::ForIter,
    Opcode::SetupFinally,
    Opcode::PopBlock,
    Opcode::JumpIndirect,
    Opcode::Probe,
];

impl Opcode {
    /// Raw byte.
    pub const fn byte(self) -> u8 { self as u8 }

    /// Lookup by raw byte.
    pub fn from_byte(b: u8) -> Option<Self> { ALL_OPCODES.iter().copied().find(|op| op.byte() == b) }

    /// Lookup by mnemonic (case-insensitive).
    pub fn from_mnemonic(m: &str) -> Option<Self> {
        ALL_OPCODES.iter().copied().find(|op| op.mnemonic().eq_ignore_ascii_case(m))
    }

    /// Whether the opcode carries a `u32` operand.
    pub const fn has_arg(self) -> bool {
        matches!(
            self,
            Opcode::LoadConst
                | Opcode::LoadName
                | Opcode::StoreName
                | Opcode::LoadAttr
                | Opcode::BinaryOp
                | Opcode::Compare
                | Opcode::Call
                | Opcode::MakeClosure
                | Opcode::Jump
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::Probe
        )
    }

    /// Relocation class.
    pub const fn class(self) -> OpClass {
        match self {
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue => OpClass::Jump(JumpKind::Absolute),
            Opcode::ForIter | Opcode::SetupFinally => OpClass::Jump(JumpKind::Relative),
            Opcode::GenStart => OpClass::Pinned,
            Opcode::JumpIndirect => OpClass::Indirect,
            _ => OpClass::Plain,
        }
    }

    /// Assembly mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::GenStart => "GEN_START",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::Print => "PRINT",
            Opcode::Return => "RETURN",
            Opcode::Pop => "POP",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreName => "STORE_NAME",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::BinaryOp => "BINARY_OP",
            Opcode::Compare => "COMPARE",
            Opcode::Call => "CALL",
            Opcode::MakeClosure => "MAKE_CLOSURE",
            Opcode::Yield => "YIELD",
            Opcode::Raise => "RAISE",
            Opcode::Jump => "JUMP",
            Opcode::JumpIfFalse => "JUMP_IF_FALSE",
            Opcode::JumpIfTrue => "JUMP_IF_TRUE",
            Opcode::ForIter => "FOR_ITER",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::JumpIndirect => "JUMP_INDIRECT",
            Opcode::Probe => "PROBE",
        }
    }

    /// Unpositioned instruction with this opcode.
    pub const fn insn(self, arg: Option<u32>) -> Instruction { Instruction::new(self as u8, arg) }
}

/// Reference instruction set: one opcode byte, then a little-endian `u32`
/// operand for opcodes that take one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkIsa;

impl InstructionSet for ChunkIsa {
    fn decode(&self, code: &[u8]) -> CoreResult<Vec<Instruction>> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off < code.len() {
            let offset = u32::try_from(off).map_err(|_| CoreError::overflow("code stream longer than u32"))?;
            let op = Opcode::from_byte(code[off])
                .ok_or(CoreError::UnknownOpcode { opcode: code[off], offset })?;
            off += 1;
            let arg = if op.has_arg() {
                let end = off + OPERAND_WIDTH as usize;
                let bytes = code
                    .get(off..end)
                    .ok_or(CoreError::UnexpectedEof { needed: u64::from(OPERAND_WIDTH), at: off as u64 })?;
                off = end;
                Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            } else {
                None
            };
            out.push(Instruction { opcode: op.byte(), arg, offset, line: 0 });
        }
        Ok(out)
    }

    fn encode(&self, insn: &Instruction, out: &mut Vec<u8>) -> CoreResult<()> {
        let op = Opcode::from_byte(insn.opcode)
            .ok_or(CoreError::UnknownOpcode { opcode: insn.opcode, offset: insn.offset })?;
        out.push(op.byte());
        match (op.has_arg(), insn.arg) {
            (true, Some(arg)) => out.extend_from_slice(&arg.to_le_bytes()),
            (false, None) => {}
            (true, None) => return Err(CoreError::corrupted(format!("{} requires an operand", op.mnemonic()))),
            (false, Some(_)) => return Err(CoreError::corrupted(format!("{} takes no operand", op.mnemonic()))),
        }
        Ok(())
    }

    fn width(&self, insn: &Instruction) -> u32 {
        match Opcode::from_byte(insn.opcode) {
            Some(op) if op.has_arg() => 1 + OPERAND_WIDTH,
            _ => 1,
        }
    }

    fn class(&self, insn: &Instruction) -> OpClass {
        Opcode::from_byte(insn.opcode).map_or(OpClass::Plain, Opcode::class)
    }

    fn probe(&self, token: u32) -> Instruction { Opcode::Probe.insn(Some(token)) }

    fn is_probe(&self, insn: &Instruction) -> bool { insn.opcode == Opcode::Probe.byte() }

    fn mnemonic(&self, opcode: u8) -> &'static str { Opcode::from_byte(opcode).map_or("???", Opcode::mnemonic) }

    fn const_operand(&self, insn: &Instruction) -> Option<ConstOperand> {
        match Opcode::from_byte(insn.opcode)? {
            Opcode::LoadConst => Some(ConstOperand { slot: insn.arg?, expects_unit: false }),
            Opcode::MakeClosure => Some(ConstOperand { slot: insn.arg?, expects_unit: true }),
            _ => None,
        }
    }
}
