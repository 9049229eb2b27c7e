//! Human readable listings used by the CLI `dump` command and by test failures.

use core::fmt::Write;

use crate::{
    isa::{InstructionSet, OpClass},
    lnotab::LineTableCodec,
    unit::{CodeUnit, Const},
    CoreResult,
};

/// Listing of one unit: header, constants, instructions and line table.
/// Nested units are shown as `<code name>` slots only.
pub fn disassemble_unit<I: InstructionSet>(isa: &I, unit: &CodeUnit, codec: &LineTableCodec) -> CoreResult<String> {
    let insns = unit.instructions(isa, codec)?;
    let starts = unit.line_starts(codec)?;
    let probes = insns.iter().filter(|i| isa.is_probe(i)).count();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "== {} == (first_line={}, bytes={}, insns={}, probes={probes}, consts={})",
        unit.name,
        unit.first_line,
        unit.code.len(),
        insns.len(),
        unit.consts.len()
    );

    if !unit.consts.is_empty() {
        let _ = writeln!(out, ";; constants");
        for (idx, value) in unit.consts.iter().enumerate() {
            let _ = writeln!(out, "const[{idx:04}] = {}", show_const(value));
        }
    }

    let _ = writeln!(out, ";; code");
    let mut last_line = None;
    for insn in &insns {
        let line = if last_line == Some(insn.line) { String::new() } else { insn.line.to_string() };
        last_line = Some(insn.line);
        let marker = if isa.is_probe(insn) { '*' } else { ' ' };
        let mnemonic = isa.mnemonic(insn.opcode);
        let mut text = match insn.arg {
            Some(arg) if isa.is_probe(insn) => format!("{mnemonic} 0x{arg:08X}"),
            Some(arg) => format!("{mnemonic} {arg}"),
            None => mnemonic.to_string(),
        };
        if let OpClass::Jump(_) = isa.class(insn) {
            if let Some(target) = isa.jump_target(insn) {
                let _ = write!(text, " (to {target})");
            }
        } else if let Some(c) = isa.const_operand(insn) {
            if let Some(value) = unit.consts.get(c.slot) {
                let _ = write!(text, " ;; {}", show_const(value));
            }
        }
        let _ = writeln!(out, "{line:>5} {marker} {:06} {text}", insn.offset);
    }

    let _ = writeln!(out, ";; lines");
    let table = starts.iter().map(|s| format!("{}:{}", s.offset, s.line)).collect::<Vec<_>>().join(" ");
    let _ = writeln!(out, "{table}");
    Ok(out)
}

/// Listings of a whole tree, children before parents.
pub fn disassemble_tree<I: InstructionSet>(isa: &I, root: &CodeUnit, codec: &LineTableCodec) -> CoreResult<String> {
    let mut out = String::new();
    for (i, unit) in root.post_order().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&disassemble_unit(isa, unit, codec)?);
    }
    Ok(out)
}

fn show_const(value: &Const) -> String {
    match value {
        Const::None => "none".into(),
        Const::Bool(b) => b.to_string(),
        Const::Int(v) => v.to_string(),
        Const::Float(v) => format!("{v:?}"),
        Const::Str(s) => format!("{s:?}"),
        Const::Bytes(bytes) => format!("bytes[{}]", bytes.len()),
        Const::Code(unit) => format!("<code {}>", unit.name),
    }
}
