//! Structural checks reused by the CLI `verify` command and by the rewriter tests.

use std::collections::HashSet;

use crate::{
    isa::InstructionSet,
    lnotab::LineTableCodec,
    unit::CodeUnit,
    CoreError, CoreResult,
};

/// Validates one unit (nested units are not visited).
///
/// - the stream decodes and the line table decodes;
/// - every line start and every jump target lands on an instruction boundary
///   (a jump may also target the end of the stream);
/// - constant operands are in range, and closure operands name a nested unit.
pub fn validate_unit<I: InstructionSet>(isa: &I, unit: &CodeUnit, codec: &LineTableCodec) -> CoreResult<()> {
    let name = &unit.name;
    let insns = isa.decode(&unit.code)?;
    let starts = codec.decode(&unit.line_table, unit.first_line)?;

    let boundaries: HashSet<u64> = insns.iter().map(|i| u64::from(i.offset)).collect();
    let end = unit.code.len() as u64;

    for s in &starts {
        let off = u64::from(s.offset);
        if !boundaries.contains(&off) && !(insns.is_empty() && off == 0) {
            return Err(CoreError::corrupted(format!(
                "{name}: line {} starts at offset {off}, not an instruction boundary",
                s.line
            )));
        }
    }

    for insn in &insns {
        if let Some(target) = isa.jump_target(insn) {
            if target != end && !boundaries.contains(&target) {
                return Err(CoreError::corrupted(format!(
                    "{name}: {} at {} jumps to {target}, not an instruction boundary",
                    isa.mnemonic(insn.opcode),
                    insn.offset
                )));
            }
        }
        if let Some(c) = isa.const_operand(insn) {
            match unit.consts.get(c.slot) {
                None => {
                    return Err(CoreError::corrupted(format!(
                        "{name}: {} at {} references const {} but pool size is {}",
                        isa.mnemonic(insn.opcode),
                        insn.offset,
                        c.slot,
                        unit.consts.len()
                    )))
                }
                Some(value) if c.expects_unit && value.as_unit().is_none() => {
                    return Err(CoreError::corrupted(format!(
                        "{name}: {} at {} expects a code unit in const {}",
                        isa.mnemonic(insn.opcode),
                        insn.offset,
                        c.slot
                    )))
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

/// Validates every unit of the tree, children first.
pub fn validate_tree<I: InstructionSet>(isa: &I, root: &CodeUnit, codec: &LineTableCodec) -> CoreResult<()> {
    root.post_order().try_for_each(|unit| validate_unit(isa, unit, codec))
}
