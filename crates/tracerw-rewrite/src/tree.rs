//! Parcours récursif de l'arbre d'unités.
//!
//! Ordre : corps de l'unité, puis unités imbriquées en profondeur dans l'ordre
//! du pool. Les tirages du RNG suivent donc l'ordre préfixe (racine, A, A1, B)
//! et les unités réécrites sont assemblées en ordre suffixe (A1, A, B, racine).
//! La pile du parcours est explicite : aucune borne de profondeur n'est
//! supposée ici. La libération, la comparaison et le décodage binaire d'un
//! `CodeUnit` restent récursifs.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracerw_core::{CodeUnit, InstructionSet};

use crate::{
    error::{RewriteError, RewriteErrorKind, RewriteResult},
    unit::{RewrittenBody, Rewriter},
};

/// Bilan d'une unité réécrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Chemin `racine/…/unité`.
    pub path: String,
    /// Rang de l'unité en ordre préfixe (racine = 0), mêlé à ses jetons.
    pub index: u32,
    /// Candidats proposés.
    pub candidates: usize,
    /// Sondes insérées.
    pub probes: usize,
    /// Taille du flux avant réécriture.
    pub bytes_before: usize,
    /// Taille du flux après réécriture.
    pub bytes_after: usize,
}

/// Bilan d'une réécriture, unités en ordre suffixe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteReport {
    /// Une entrée par unité.
    pub units: Vec<UnitReport>,
}

impl RewriteReport {
    /// Total des sondes insérées.
    pub fn probes(&self) -> usize { self.units.iter().map(|u| u.probes).sum() }
}

struct Frame<'u> {
    original: &'u CodeUnit,
    index: u32,
    body: RewrittenBody,
    next_slot: u32,
    children: Vec<CodeUnit>,
}

impl<I: InstructionSet> Rewriter<I> {
    /// Réécrit tout l'arbre avec un RNG fourni et conservé par l'appelant.
    /// `is_top_level` ne vaut que pour la racine.
    pub fn rewrite_with_rng(&self, rng: &mut dyn RngCore, root: &CodeUnit, is_top_level: bool) -> RewriteResult<CodeUnit> {
        self.walk(rng, root, is_top_level, None)
    }

    /// Comme [`Rewriter::rewrite_with_rng`], avec le bilan par unité.
    pub fn rewrite_with_report(
        &self,
        rng: &mut dyn RngCore,
        root: &CodeUnit,
        is_top_level: bool,
    ) -> RewriteResult<(CodeUnit, RewriteReport)> {
        let mut report = RewriteReport::default();
        let unit = self.walk(rng, root, is_top_level, Some(&mut report))?;
        Ok((unit, report))
    }

    #[tracing::instrument(level = "debug", name = "rewrite_tree", skip_all, fields(root = %root.name, is_top_level = is_top_level))]
    fn walk(
        &self,
        rng: &mut dyn RngCore,
        root: &CodeUnit,
        is_top_level: bool,
        mut report: Option<&mut RewriteReport>,
    ) -> RewriteResult<CodeUnit> {
        let mut parents: Vec<Frame<'_>> = Vec::new();
        let mut next_index = 0u32;
        let mut current = self.enter(root, next_index, is_top_level, rng, &parents)?;

        loop {
            if let Some((slot, child)) = next_nested(current.original, current.next_slot) {
                current.next_slot = slot + 1;
                parents.push(current);
                next_index = next_index.wrapping_add(1);
                current = self.enter(child, next_index, false, rng, &parents)?;
                continue;
            }

            let Frame { original, index, body, children, .. } = current;
            let (candidates, probes, bytes_after) = (body.candidates, body.probes, body.code.len());
            let unit =
                rebuild(original, body, children).map_err(|kind| at_path(&path_of(&parents, original), kind))?;
            if let Some(report) = report.as_deref_mut() {
                report.units.push(UnitReport {
                    path: path_of(&parents, original).join("/"),
                    index,
                    candidates,
                    probes,
                    bytes_before: original.code.len(),
                    bytes_after,
                });
            }

            match parents.pop() {
                Some(parent) => {
                    current = parent;
                    current.children.push(unit);
                }
                None => {
                    tracing::debug!(units = root.tree_len(), "tree rewritten");
                    return Ok(unit);
                }
            }
        }
    }

    fn enter<'u>(
        &self,
        unit: &'u CodeUnit,
        index: u32,
        is_top_level: bool,
        rng: &mut dyn RngCore,
        parents: &[Frame<'u>],
    ) -> RewriteResult<Frame<'u>> {
        let body = self
            .rewrite_body(unit, index, is_top_level, rng)
            .map_err(|kind| at_path(&path_of(parents, unit), kind))?;
        Ok(Frame { original: unit, index, body, next_slot: 0, children: Vec::new() })
    }
}

// Prochaine unité imbriquée à partir de `from`, dans l'ordre du pool.
fn next_nested(unit: &CodeUnit, from: u32) -> Option<(u32, &CodeUnit)> {
    (from..)
        .map_while(|slot| unit.consts.get(slot).map(|c| (slot, c)))
        .find_map(|(slot, c)| c.as_unit().map(|u| (slot, u)))
}

fn path_of(parents: &[Frame<'_>], unit: &CodeUnit) -> Vec<String> {
    parents.iter().map(|f| f.original.name.clone()).chain([unit.name.clone()]).collect()
}

fn at_path(path: &[String], kind: RewriteErrorKind) -> RewriteError {
    let (last, parents) = path.split_last().map_or(("", &[][..]), |(l, p)| (l.as_str(), p));
    RewriteError::new(last, kind).within(parents.iter().cloned())
}

fn rebuild(original: &CodeUnit, body: RewrittenBody, children: Vec<CodeUnit>) -> Result<CodeUnit, RewriteErrorKind> {
    let mut done = children.into_iter();
    let consts = original.consts.map_units(|nested| {
        done.next().ok_or_else(|| {
            RewriteErrorKind::MalformedInput(format!("nested unit `{}` was not rewritten", nested.name))
        })
    })?;
    Ok(CodeUnit {
        name: original.name.clone(),
        first_line: original.first_line,
        code: body.code,
        consts,
        line_table: body.line_table,
    })
}

/// Réécrit l'arbre avec la configuration par défaut ; le RNG est créé une
/// fois par appel via `rng_factory`.
pub fn rewrite<I, R, F>(isa: I, rng_factory: F, root: &CodeUnit, is_top_level: bool) -> RewriteResult<CodeUnit>
where
    I: InstructionSet,
    R: RngCore,
    F: FnOnce() -> R,
{
    let mut rng = rng_factory();
    rewrite_with_rng(isa, &mut rng, root, is_top_level)
}

/// Réécrit l'arbre avec la configuration par défaut et un RNG fourni par
/// l'appelant, dont l'état évolue d'un appel à l'autre.
pub fn rewrite_with_rng<I, R>(isa: I, rng: &mut R, root: &CodeUnit, is_top_level: bool) -> RewriteResult<CodeUnit>
where
    I: InstructionSet,
    R: RngCore,
{
    Rewriter::new(isa).rewrite_with_rng(rng, root, is_top_level)
}
