//! Sélection des sites de sonde.
//!
//! Deux étapes : une [`CandidatePolicy`] énumère les instructions éligibles,
//! puis un [`SiteSampler`] en garde une partie à l'aide du RNG injecté. Les
//! échantillonneurs fournis sont des fonctions pures de (candidats, tirages) :
//! un RNG dans le même état donne la même sélection.

use std::collections::{HashMap, HashSet};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracerw_core::{Instruction, InstructionSet, OpClass};

/* ─────────────────────────── Candidats ─────────────────────────── */

/// Quelles instructions peuvent recevoir une sonde.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidatePolicy {
    /// Première instruction de chaque ligne source distincte.
    #[default]
    DistinctLines,
    /// Première instruction de chaque suite de lignes ; une ligne réentrée
    /// après un saut redevient candidate.
    LineStarts,
    /// Têtes de blocs de base : entrée, cibles de saut, instruction suivant un saut.
    BlockLeaders,
}

/// Instrumentation de l'unité de premier niveau.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopLevelPolicy {
    /// Même traitement que les unités imbriquées.
    #[default]
    Full,
    /// Une seule sonde, à l'entrée ; le corps d'un module ne s'exécute qu'une fois.
    EntryOnly,
}

/// Instruction éligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Index dans le flux décodé.
    pub index: usize,
    /// Offset d'origine.
    pub offset: u32,
    /// Ligne source.
    pub line: u32,
    /// Première instruction après le prologue.
    pub entry: bool,
}

/// Nombre d'instructions `Pinned` en tête de flux.
pub fn prologue_len<I: InstructionSet>(isa: &I, insns: &[Instruction]) -> usize {
    insns.iter().take_while(|i| isa.class(i) == OpClass::Pinned).count()
}

/// Énumère les candidats, dans l'ordre du flux. Le prologue n'en fournit jamais.
pub fn candidates<I: InstructionSet>(isa: &I, insns: &[Instruction], policy: CandidatePolicy) -> Vec<Candidate> {
    let start = prologue_len(isa, insns);
    let candidate = |index: usize| {
        let insn = &insns[index];
        Candidate { index, offset: insn.offset, line: insn.line, entry: index == start }
    };

    match policy {
        CandidatePolicy::DistinctLines => {
            let mut seen = HashSet::new();
            (start..insns.len()).filter(|&i| seen.insert(insns[i].line)).map(candidate).collect()
        }
        CandidatePolicy::LineStarts => (start..insns.len())
            .filter(|&i| i == start || insns[i].line != insns[i - 1].line)
            .map(candidate)
            .collect(),
        CandidatePolicy::BlockLeaders => {
            let by_offset: HashMap<u64, usize> =
                insns.iter().enumerate().map(|(i, insn)| (u64::from(insn.offset), i)).collect();
            let mut leaders = vec![false; insns.len()];
            if let Some(first) = leaders.get_mut(start) {
                *first = true;
            }
            for (i, insn) in insns.iter().enumerate() {
                match isa.class(insn) {
                    OpClass::Jump(_) => {
                        if let Some(&t) = isa.jump_target(insn).and_then(|t| by_offset.get(&t)) {
                            leaders[t] = true;
                        }
                        if let Some(next) = leaders.get_mut(i + 1) {
                            *next = true;
                        }
                    }
                    OpClass::Indirect => {
                        if let Some(next) = leaders.get_mut(i + 1) {
                            *next = true;
                        }
                    }
                    OpClass::Plain | OpClass::Pinned => {}
                }
            }
            (start..insns.len()).filter(|&i| leaders[i]).map(candidate).collect()
        }
    }
}

/* ─────────────────────────── Échantillonnage ─────────────────────────── */

/// Stratégie d'échantillonnage : rend les positions (dans `candidates`) qui
/// reçoivent une sonde.
pub trait SiteSampler {
    /// Positions retenues. L'ordre et les doublons sont normalisés par l'appelant.
    fn sample(&self, candidates: &[Candidate], rng: &mut dyn RngCore) -> Vec<usize>;
}

impl<F> SiteSampler for F
where
    F: Fn(&[Candidate], &mut dyn RngCore) -> Vec<usize>,
{
    fn sample(&self, candidates: &[Candidate], rng: &mut dyn RngCore) -> Vec<usize> { self(candidates, rng) }
}

/// Densité des sondes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Sampling {
    /// Tous les candidats, sans tirage.
    All,
    /// Un tirage par candidat, gardé avec la probabilité `keep`.
    Bernoulli {
        /// Probabilité de garder un candidat.
        keep: f64,
    },
    /// Un tirage de densité par unité dans `min..=max`, puis un tirage par candidat.
    Density {
        /// Densité minimale.
        min: f64,
        /// Densité maximale.
        max: f64,
    },
}

impl Default for Sampling {
    fn default() -> Self { Sampling::Density { min: 0.5, max: 1.0 } }
}

/// Échantillonneur intégré, piloté par la configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySampler {
    /// Densité.
    pub sampling: Sampling,
    /// Le candidat d'entrée est toujours gardé, sans tirage.
    pub probe_entry: bool,
}

impl Default for PolicySampler {
    fn default() -> Self { Self { sampling: Sampling::default(), probe_entry: true } }
}

impl PolicySampler {
    /// Échantillonneur gardant tout.
    pub const fn all() -> Self { Self { sampling: Sampling::All, probe_entry: true } }
}

impl SiteSampler for PolicySampler {
    fn sample(&self, candidates: &[Candidate], rng: &mut dyn RngCore) -> Vec<usize> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let p = match self.sampling {
            Sampling::All => return (0..candidates.len()).collect(),
            Sampling::Bernoulli { keep } => probability(keep),
            Sampling::Density { min, max } => {
                let (lo, hi) = (probability(min.min(max)), probability(min.max(max)));
                rng.gen_range(lo..=hi)
            }
        };
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| (self.probe_entry && c.entry) || rng.gen_bool(p))
            .map(|(i, _)| i)
            .collect()
    }
}

fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Candidats puis échantillonnage ; rend des indices d'instruction triés, sans doublon.
/// Avec `entry_only`, seul le candidat d'entrée est proposé et gardé, sans tirage.
pub fn select_sites<I, S>(
    isa: &I,
    insns: &[Instruction],
    policy: CandidatePolicy,
    entry_only: bool,
    sampler: &S,
    rng: &mut dyn RngCore,
) -> (usize, Vec<usize>)
where
    I: InstructionSet,
    S: SiteSampler + ?Sized,
{
    let cands = candidates(isa, insns, policy);
    if entry_only {
        let entry: Vec<usize> = cands.iter().filter(|c| c.entry).map(|c| c.index).collect();
        return (entry.len(), entry);
    }
    let mut picked: Vec<usize> =
        sampler.sample(&cands, rng).into_iter().filter_map(|i| cands.get(i).map(|c| c.index)).collect();
    picked.sort_unstable();
    picked.dedup();
    (cands.len(), picked)
}
