//! Réécriture d'une unité : insertion des sondes, relocalisation des sauts,
//! table de lignes reconstruite depuis le nouveau flux.

use std::collections::HashMap;

use rand::RngCore;
use tracerw_core::{
    unit::annotate_lines, CodeUnit, Instruction, InstructionSet, JumpKind, LineStart, LineTableCodec, OpClass,
};

use crate::{
    config::RewriteConfig,
    error::{ConfigError, RewriteError, RewriteErrorKind, RewriteResult},
    select::{prologue_len, select_sites, CandidatePolicy, SiteSampler, TopLevelPolicy},
    token::{ProbeSite, TokenScheme},
};

/// Moteur de réécriture : jeu d'instructions, codec, politique de sélection
/// et schéma de jetons. Sans état entre deux appels.
pub struct Rewriter<I> {
    pub(crate) isa: I,
    pub(crate) codec: LineTableCodec,
    pub(crate) policy: CandidatePolicy,
    pub(crate) top_level: TopLevelPolicy,
    pub(crate) sampler: Box<dyn SiteSampler>,
    pub(crate) tokens: Box<dyn TokenScheme>,
}

/// Corps réécrit d'une unité (le pool de constantes est traité à part).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenBody {
    /// Nouveau flux encodé.
    pub code: Vec<u8>,
    /// Nouvelle table de lignes.
    pub line_table: Vec<u8>,
    /// Nombre de candidats proposés au sampler.
    pub candidates: usize,
    /// Nombre de sondes insérées.
    pub probes: usize,
}

impl<I: InstructionSet> Rewriter<I> {
    /// Moteur avec la configuration par défaut.
    pub fn new(isa: I) -> Self {
        let cfg = RewriteConfig::default();
        Self {
            isa,
            codec: cfg.codec(),
            policy: cfg.candidates,
            top_level: cfg.top_level,
            sampler: Box::new(cfg.sampler()),
            tokens: Box::new(cfg.token_scheme()),
        }
    }

    /// Moteur construit depuis une configuration validée.
    pub fn from_config(isa: I, cfg: &RewriteConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            isa,
            codec: cfg.codec(),
            policy: cfg.candidates,
            top_level: cfg.top_level,
            sampler: Box::new(cfg.sampler()),
            tokens: Box::new(cfg.token_scheme()),
        })
    }

    /// Remplace l'échantillonneur.
    #[must_use]
    pub fn with_sampler(mut self, sampler: impl SiteSampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Remplace le schéma de jetons.
    #[must_use]
    pub fn with_token_scheme(mut self, tokens: impl TokenScheme + 'static) -> Self {
        self.tokens = Box::new(tokens);
        self
    }

    /// Remplace la politique de candidats.
    #[must_use]
    pub fn with_candidates(mut self, policy: CandidatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Remplace l'instrumentation de l'unité de premier niveau.
    #[must_use]
    pub fn with_top_level(mut self, top_level: TopLevelPolicy) -> Self {
        self.top_level = top_level;
        self
    }

    /// Jeu d'instructions utilisé.
    pub const fn isa(&self) -> &I { &self.isa }

    /// Codec de table de lignes utilisé.
    pub const fn codec(&self) -> &LineTableCodec { &self.codec }

    /// Réécrit une seule unité. Le pool est recopié tel quel : les unités
    /// imbriquées ne sont pas réécrites (voir [`Rewriter::rewrite_with_rng`]).
    pub fn rewrite_unit(&self, unit: &CodeUnit, is_top_level: bool, rng: &mut dyn RngCore) -> RewriteResult<CodeUnit> {
        let body = self.rewrite_body(unit, 0, is_top_level, rng).map_err(|kind| RewriteError::new(&unit.name, kind))?;
        Ok(CodeUnit {
            name: unit.name.clone(),
            first_line: unit.first_line,
            code: body.code,
            consts: unit.consts.clone(),
            line_table: body.line_table,
        })
    }

    /// Cœur de l'algorithme, sur le flux et la table de lignes d'une unité.
    /// `unit_index` est le rang de l'unité dans l'arbre (ordre préfixe), mêlé
    /// aux jetons.
    #[tracing::instrument(level = "debug", name = "rewrite_unit", skip_all, fields(unit = %unit.name, unit_index = unit_index))]
    pub fn rewrite_body(
        &self,
        unit: &CodeUnit,
        unit_index: u32,
        is_top_level: bool,
        rng: &mut dyn RngCore,
    ) -> Result<RewrittenBody, RewriteErrorKind> {
        let isa = &self.isa;
        let malformed = |e: tracerw_core::CoreError| RewriteErrorKind::MalformedInput(e.to_string());

        // 1. décodage + lignes
        let mut insns = isa.decode(&unit.code).map_err(malformed)?;
        let starts = self.codec.decode(&unit.line_table, unit.first_line).map_err(malformed)?;
        check_line_starts(&insns, &starts)?;
        annotate_lines(&mut insns, &starts);
        if insns.is_empty() {
            // Rien à sonder : la table d'origine reste l'attribution de l'unité.
            return Ok(RewrittenBody { code: Vec::new(), line_table: unit.line_table.clone(), candidates: 0, probes: 0 });
        }

        let prologue = prologue_len(isa, &insns);
        if let Some(pinned) = insns[prologue..].iter().find(|i| isa.class(i) == OpClass::Pinned) {
            return Err(unsupported(isa, pinned, "must stay in the unit prologue"));
        }

        // 2. sélection
        let entry_only = is_top_level && self.top_level == TopLevelPolicy::EntryOnly;
        let (candidates, sites) = select_sites(isa, &insns, self.policy, entry_only, self.sampler.as_ref(), rng);
        let mut selected = vec![false; insns.len()];
        for &i in &sites {
            selected[i] = true;
        }
        if !sites.is_empty() {
            if let Some(indirect) = insns.iter().find(|i| isa.class(i) == OpClass::Indirect) {
                return Err(unsupported(isa, indirect, "jumps through a runtime offset that probes would shift"));
            }
        }

        // 3. placement
        let probe_width = u64::from(isa.width(&isa.probe(0)));
        let mut pos = 0u64;
        let mut probe_at: Vec<Option<u64>> = Vec::with_capacity(insns.len());
        let mut new_offset: Vec<u64> = Vec::with_capacity(insns.len());
        for (insn, &probed) in insns.iter().zip(&selected) {
            if probed {
                probe_at.push(Some(pos));
                pos += probe_width;
            } else {
                probe_at.push(None);
            }
            new_offset.push(pos);
            pos += u64::from(isa.width(insn));
        }
        let new_end = pos;
        let fit = |v: u64| {
            u32::try_from(v).map_err(|_| RewriteErrorKind::EncodingOverflow(format!("offset {v} does not fit u32")))
        };
        fit(new_end)?;

        // Une cible sondée devient la sonde : le bloc la déclenche à l'entrée.
        let old_end = unit.code.len() as u64;
        let relocated: HashMap<u64, u64> = insns
            .iter()
            .enumerate()
            .map(|(i, insn)| (u64::from(insn.offset), probe_at[i].unwrap_or(new_offset[i])))
            .chain([(old_end, new_end)])
            .collect();

        // 4. émission
        let mut out: Vec<Instruction> = Vec::with_capacity(insns.len() + sites.len());
        for (i, insn) in insns.iter().enumerate() {
            let line = insn.line;
            if let Some(at) = probe_at[i] {
                debug_assert_ne!(isa.class(insn), OpClass::Pinned, "pinned instructions are never candidates");
                let offset = fit(at)?;
                let token = self.tokens.token(&ProbeSite {
                    unit: &unit.name,
                    unit_index,
                    first_line: unit.first_line,
                    offset,
                    line,
                    is_top_level,
                });
                out.push(isa.probe(token).at(offset, line));
            }

            let offset = fit(new_offset[i])?;
            let mut moved = insn.at(offset, line);
            if let OpClass::Jump(kind) = isa.class(insn) {
                let target = isa.jump_target(insn).ok_or_else(|| {
                    RewriteErrorKind::MalformedInput(format!("{} at {} has no operand", isa.mnemonic(insn.opcode), insn.offset))
                })?;
                let new_target = *relocated.get(&target).ok_or_else(|| {
                    RewriteErrorKind::MalformedInput(format!(
                        "{} at {} jumps to {target}, not an instruction boundary",
                        isa.mnemonic(insn.opcode),
                        insn.offset
                    ))
                })?;
                let arg = match kind {
                    JumpKind::Absolute => new_target,
                    JumpKind::Relative => {
                        let from = new_offset[i] + u64::from(isa.width(insn));
                        new_target.checked_sub(from).ok_or_else(|| {
                            RewriteErrorKind::EncodingOverflow(format!(
                                "relative jump at {} would point backwards",
                                insn.offset
                            ))
                        })?
                    }
                };
                moved.arg = Some(fit(arg)?);
                if isa.width(&moved) != isa.width(insn) {
                    return Err(RewriteErrorKind::EncodingOverflow(format!(
                        "relocated operand of {} at {} changes its width",
                        isa.mnemonic(insn.opcode),
                        insn.offset
                    )));
                }
            }
            out.push(moved);
        }

        let code = isa.encode_all(&out).map_err(|e| RewriteErrorKind::from_core(&e))?;

        // 5. table de lignes dérivée du nouveau flux
        let mut new_starts: Vec<LineStart> = Vec::new();
        for insn in &out {
            if new_starts.last().map_or(true, |s| s.line != insn.line) {
                new_starts.push(LineStart::new(insn.offset, insn.line));
            }
        }
        let line_table =
            self.codec.encode(&new_starts, unit.first_line).map_err(|e| RewriteErrorKind::from_core(&e))?;

        tracing::debug!(candidates, probes = sites.len(), bytes = code.len(), "unit rewritten");
        Ok(RewrittenBody { code, line_table, candidates, probes: sites.len() })
    }
}

fn unsupported<I: InstructionSet>(isa: &I, insn: &Instruction, reason: &'static str) -> RewriteErrorKind {
    RewriteErrorKind::UnsupportedInstruction { mnemonic: isa.mnemonic(insn.opcode), offset: insn.offset, reason }
}

// Chaque début de ligne doit tomber sur une instruction (ou sur 0 pour un flux vide).
fn check_line_starts(insns: &[Instruction], starts: &[LineStart]) -> Result<(), RewriteErrorKind> {
    let mut idx = 0;
    for s in starts {
        if insns.is_empty() && s.offset == 0 {
            continue;
        }
        while idx < insns.len() && insns[idx].offset < s.offset {
            idx += 1;
        }
        if insns.get(idx).map_or(true, |i| i.offset != s.offset) {
            return Err(RewriteErrorKind::MalformedInput(format!(
                "line {} starts at offset {}, not an instruction boundary",
                s.line, s.offset
            )));
        }
    }
    Ok(())
}
