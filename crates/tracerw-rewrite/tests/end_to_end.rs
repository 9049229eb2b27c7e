use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracerw_core::{
    asm::{assemble, Assembler},
    validate::validate_tree,
    ChunkIsa, CodeUnit, Const, InstructionSet, LineTableCodec, Opcode,
};
use tracerw_rewrite::{
    rewrite, rewrite_with_rng, CandidatePolicy, PolicySampler, RewriteErrorKind, Rewriter, TopLevelPolicy,
};

const SOURCE: &str = r"
.unit <module> 1
.const int 1

.unit baz 4
.const int 2

.unit qux 23
.unit <lambda> 26
26: LOAD_NAME 0
    JUMP_IF_TRUE @out
    LOAD_NAME 1
    BINARY_OP 6
out:
    RETURN
.end
24: LOAD_NAME 0
    LOAD_ATTR 1
    CALL 0
    STORE_NAME 0
25: SETUP_FINALLY @handler
26: LOAD_NAME 0
    MAKE_CLOSURE 0
    CALL 2
    POP
    POP_BLOCK
    JUMP @done
handler:
27: LOAD_NAME 2
28: PRINT
done:
29: LOAD_NAME 0
    RETURN
.end

.unit <listcomp> 33
33: LOAD_NAME 0
loop:
    FOR_ITER @end
    STORE_NAME 1
    LOAD_NAME 1
    CALL 1
    POP
    JUMP @loop
end:
    RETURN
.end

5:  LOAD_NAME 0          ; a -= b
    LOAD_NAME 1
    BINARY_OP 10
    STORE_NAME 0
6:  SETUP_FINALLY @finally
7:  LOAD_NAME 2          ; import d
    STORE_NAME 2
8:  LOAD_NAME 3          ; for c in e(1):
    LOAD_CONST 0
    CALL 1
for:
    FOR_ITER @forelse
    STORE_NAME 4
9:  LOAD_NAME 2
    CALL 1
    POP
10: LOAD_NAME 3          ; if not e:
    JUMP_IF_TRUE @noif
11: LOAD_NAME 2
    POP
12: JUMP @for
noif:
13: LOAD_NAME 3
    YIELD
    POP
    JUMP @for
forelse:
15: LOAD_NAME 2          ; else: if d[2]:
    JUMP_IF_FALSE @endtry
16: LOAD_NAME 5
    RAISE
endtry:
17: POP_BLOCK
finally:
18: LOAD_NAME 0          ; if a < 2: ... else: ...
    LOAD_CONST 0
    COMPARE 0
    JUMP_IF_FALSE @else
19: LOAD_NAME 0
    STORE_NAME 0
    JUMP @after
else:
20: LOAD_NAME 1
    POP
after:
23: MAKE_CLOSURE 1
    STORE_NAME 6
33: MAKE_CLOSURE 2
    LOAD_NAME 7
    CALL 1
    RETURN
.end

.unit zab 46
.unit <genexpr> 49
49: GEN_START
    LOAD_NAME 0
top:
    FOR_ITER @done
    STORE_NAME 1
    LOAD_NAME 1
    JUMP_IF_FALSE @top
    LOAD_NAME 1
    YIELD
    POP
    JUMP @top
done:
    RETURN
.end
47: LOAD_NAME 0
    LOAD_NAME 1
    CALL 1
    JUMP_IF_FALSE @alt
    LOAD_NAME 0
    JUMP @store
alt:
    LOAD_NAME 3
store:
    STORE_NAME 2
48: SETUP_FINALLY @except
49: MAKE_CLOSURE 0
    LOAD_NAME 3
    CALL 1
    POP_BLOCK
    RETURN
except:
50: LOAD_NAME 0
    CALL 0
    RETURN
.end

2:  LOAD_NAME 0
    LOAD_CONST 0
    BINARY_OP 0
    STORE_NAME 1
4:  MAKE_CLOSURE 1
    STORE_NAME 2
46: MAKE_CLOSURE 2
    STORE_NAME 3
    LOAD_CONST 0
    RETURN
.end
";

fn source_tree() -> CodeUnit { assemble(SOURCE).unwrap() }

fn seeded(seed: u64) -> impl FnOnce() -> ChaCha8Rng { move || ChaCha8Rng::seed_from_u64(seed) }

fn codec() -> LineTableCodec { LineTableCodec::default() }

fn lines_of(unit: &CodeUnit) -> BTreeSet<u32> {
    unit.line_starts(&codec()).unwrap().into_iter().map(|s| s.line).collect()
}

// (name, plain constants, which slots hold units) per unit, in post-order.
fn shape(root: &CodeUnit) -> Vec<(String, Vec<Const>, Vec<bool>)> {
    root.post_order()
        .map(|u| {
            let plain = u.consts.iter().filter(|c| c.as_unit().is_none()).cloned().collect();
            let slots = u.consts.iter().map(|c| c.as_unit().is_some()).collect();
            (u.name.clone(), plain, slots)
        })
        .collect()
}

#[test]
fn units_are_visited_children_first() {
    let out = rewrite(ChunkIsa, seeded(1), &source_tree(), true).unwrap();
    let names: Vec<&str> = out.post_order().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["<lambda>", "qux", "<listcomp>", "baz", "<genexpr>", "zab", "<module>"]);
}

#[test]
fn rewritten_tree_is_isomorphic() {
    let tree = source_tree();
    let out = rewrite(ChunkIsa, seeded(2), &tree, true).unwrap();
    assert_eq!(shape(&out), shape(&tree));
    assert_eq!(out.tree_len(), tree.tree_len());
}

#[test]
fn same_seed_same_bytes() {
    let tree = source_tree();
    let a = rewrite(ChunkIsa, seeded(1234), &tree, true).unwrap();
    let b = rewrite(ChunkIsa, seeded(1234), &tree, true).unwrap();
    assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());

    let distinct: BTreeSet<Vec<u8>> =
        (0..16).map(|seed| rewrite(ChunkIsa, seeded(seed), &tree, true).unwrap().to_bytes().unwrap()).collect();
    assert!(distinct.len() > 1, "density never varied across seeds");
}

#[test]
fn evolving_rng_is_replayable() {
    let tree = source_tree();
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let first = rewrite_with_rng(ChunkIsa, &mut rng, &tree, true).unwrap();
    let _second = rewrite_with_rng(ChunkIsa, &mut rng, &tree, true).unwrap();

    let replay = rewrite_with_rng(ChunkIsa, &mut ChaCha8Rng::seed_from_u64(99), &tree, true).unwrap();
    assert_eq!(first, replay);
}

#[test]
fn every_line_survives_and_tables_start_at_zero() {
    let tree = source_tree();
    let out = rewrite(ChunkIsa, seeded(5), &tree, true).unwrap();
    for (before, after) in tree.post_order().zip(out.post_order()) {
        let kept = lines_of(after);
        for line in lines_of(before) {
            assert!(kept.contains(&line), "{}: line {line} lost", after.name);
        }
        let starts = after.line_starts(&codec()).unwrap();
        assert_eq!(starts[0].offset, 0, "{}", after.name);

        let insns = after.instructions(&ChunkIsa, &codec()).unwrap();
        assert_eq!(insns[0].offset, 0);
        assert!(insns.windows(2).all(|w| w[0].offset < w[1].offset), "{}", after.name);
    }
}

#[test]
fn output_is_structurally_valid() {
    let out = rewrite(ChunkIsa, seeded(6), &source_tree(), true).unwrap();
    validate_tree(&ChunkIsa, &out, &codec()).unwrap();
    assert_eq!(CodeUnit::from_bytes(&out.to_bytes().unwrap()).unwrap(), out);
}

#[test]
fn probes_sit_on_the_line_they_precede() {
    let out = rewrite(ChunkIsa, seeded(7), &source_tree(), true).unwrap();
    for unit in out.post_order() {
        let insns = unit.instructions(&ChunkIsa, &codec()).unwrap();
        let probes = insns.iter().filter(|i| ChunkIsa.is_probe(i)).count();
        assert!(probes >= 1, "{} has no entry probe", unit.name);
        for w in insns.windows(2) {
            if ChunkIsa.is_probe(&w[0]) {
                assert_eq!(w[0].line, w[1].line);
                let token = w[0].arg.unwrap();
                let top = unit.name == "<module>";
                assert_eq!(token >> 31 == 1, top, "{}", unit.name);
            }
        }
    }
}

#[test]
fn generator_prologue_is_preserved() {
    let out = rewrite(ChunkIsa, seeded(8), &source_tree(), false).unwrap();
    let gen = out.post_order().find(|u| u.name == "<genexpr>").unwrap();
    let insns = gen.instructions(&ChunkIsa, &codec()).unwrap();
    assert_eq!(insns[0].opcode, Opcode::GenStart.byte());
    assert_eq!(insns[1].opcode, Opcode::Probe.byte());
}

#[test]
fn full_sampling_probes_every_block_leader() {
    let rewriter = Rewriter::new(ChunkIsa)
        .with_candidates(CandidatePolicy::BlockLeaders)
        .with_sampler(PolicySampler::all());
    let (out, report) = rewriter.rewrite_with_report(&mut ChaCha8Rng::seed_from_u64(0), &source_tree(), true).unwrap();
    assert_eq!(report.units.len(), 7);
    for u in &report.units {
        assert_eq!(u.probes, u.candidates, "{}", u.path);
        assert_eq!(u.bytes_after, u.bytes_before + 5 * u.probes);
    }
    assert_eq!(report.units[0].path, "<module>/baz/qux/<lambda>");
    // <lambda>: entry, the jump fall-through, and the RETURN target.
    assert_eq!(report.units[0].probes, 3);
    validate_tree(&ChunkIsa, &out, &codec()).unwrap();
}

#[test]
fn entry_only_module_leaves_nested_units_complete() {
    let rewriter = Rewriter::new(ChunkIsa)
        .with_candidates(CandidatePolicy::LineStarts)
        .with_sampler(PolicySampler::all())
        .with_top_level(TopLevelPolicy::EntryOnly);
    let tree = source_tree();
    let (out, top) = rewriter.rewrite_with_report(&mut ChaCha8Rng::seed_from_u64(4), &tree, true).unwrap();
    let (_, nested) = rewriter.rewrite_with_report(&mut ChaCha8Rng::seed_from_u64(4), &tree, false).unwrap();

    // <module> starts lines 2, 4 and 46; only the first one is kept.
    let (module, children) = top.units.split_last().unwrap();
    assert_eq!(module.path, "<module>");
    assert_eq!((module.candidates, module.probes), (1, 1));
    assert!(children.iter().all(|u| u.probes == u.candidates));
    assert_eq!(nested.units.last().unwrap().probes, 3);
    assert_eq!(&nested.units[..children.len()], children);

    assert_eq!(lines_of(&out), lines_of(&tree));
    validate_tree(&ChunkIsa, &out, &codec()).unwrap();
}

#[test]
fn indirect_jump_in_a_nested_unit_aborts_the_tree() {
    let tree = assemble(
        "
        .unit <module> 1
        .unit f 2
        3: LOAD_NAME 0
           JUMP_INDIRECT
        .end
        2: MAKE_CLOSURE 0
           RETURN
        .end
        ",
    )
    .unwrap();
    let err = rewrite(ChunkIsa, seeded(0), &tree, true).unwrap_err();
    assert_eq!(err.path.to_string(), "<module>/f");
    assert!(matches!(err.kind, RewriteErrorKind::UnsupportedInstruction { mnemonic: "JUMP_INDIRECT", offset: 5, .. }));
}

#[test]
fn corrupt_nested_table_is_malformed_input() {
    let mut tree = source_tree();
    let Some(Const::Code(baz)) = tree.consts.iter().nth(1).cloned() else { panic!("baz slot") };
    let mut baz = *baz;
    baz.line_table.push(7);
    let mut consts: Vec<Const> = tree.consts.iter().cloned().collect();
    consts[1] = Const::Code(Box::new(baz));
    tree.consts = consts.into_iter().collect();

    let err = rewrite(ChunkIsa, seeded(0), &tree, true).unwrap_err();
    assert_eq!(err.path.to_string(), "<module>/baz");
    assert!(matches!(err.kind, RewriteErrorKind::MalformedInput(_)));
}

fn straight_line() -> impl Strategy<Value = (u32, Vec<(u8, i64)>)> {
    let op = prop_oneof![Just(Opcode::Nop), Just(Opcode::Pop), Just(Opcode::LoadName), Just(Opcode::Print)];
    (1u32..500, prop::collection::vec((op.prop_map(Opcode::byte), -3i64..6), 1..120))
}

proptest! {
    #[test]
    fn arbitrary_units_stay_consistent((first, body) in straight_line(), seed in any::<u64>()) {
        let mut asm = Assembler::new(ChunkIsa, "p", first);
        let mut line = i64::from(first);
        for (opcode, delta) in body {
            line = (line + delta).max(1);
            let arg = Opcode::from_byte(opcode).filter(|op| op.has_arg()).map(|_| 0);
            asm.emit(u32::try_from(line).unwrap(), opcode, arg);
        }
        let unit = asm.finish().unwrap();

        let a = rewrite(ChunkIsa, seeded(seed), &unit, false).unwrap();
        let b = rewrite(ChunkIsa, seeded(seed), &unit, false).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(validate_tree(&ChunkIsa, &a, &codec()).is_ok());
        prop_assert!(lines_of(&unit).is_subset(&lines_of(&a)));
        prop_assert_eq!(codec().encode(&a.line_starts(&codec()).unwrap(), first).unwrap(), a.line_table);
    }
}
