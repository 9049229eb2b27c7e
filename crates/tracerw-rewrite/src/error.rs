//! Erreurs de réécriture.
//!
//! Toute erreur interrompt la réécriture de l'arbre entier ; aucune unité
//! partiellement instrumentée n'est jamais rendue.

use std::fmt;

use thiserror::Error;
use tracerw_core::CoreError;

/// Alias résultat de la réécriture.
pub type RewriteResult<T> = Result<T, RewriteError>;

/// Cause d'un échec, indépendante de l'unité concernée.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteErrorKind {
    /// Instruction devant laquelle aucune sonde ne peut être posée sans risque.
    #[error("unsupported instruction {mnemonic} at offset {offset}: {reason}")]
    UnsupportedInstruction {
        /// Mnémonique de l'instruction.
        mnemonic: &'static str,
        /// Offset d'origine.
        offset: u32,
        /// Pourquoi l'instruction bloque l'insertion.
        reason: &'static str,
    },

    /// Offset, opérande ou ligne non représentable, même après découpage.
    #[error("encoding overflow: {0}")]
    EncodingOverflow(String),

    /// Flux ou table de lignes d'origine incohérents.
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// Échec de réécriture, avec le chemin de l'unité fautive depuis la racine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {kind}")]
pub struct RewriteError {
    /// Noms des unités, de la racine à l'unité fautive.
    pub path: UnitPath,
    /// Cause.
    #[source]
    pub kind: RewriteErrorKind,
}

impl RewriteError {
    /// Erreur sur une unité isolée (chemin à un seul élément).
    pub fn new(unit: impl Into<String>, kind: RewriteErrorKind) -> Self {
        Self { path: UnitPath(vec![unit.into()]), kind }
    }

    /// Préfixe le chemin par les unités englobantes.
    #[must_use]
    pub fn within<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path: Vec<String> = parents.into_iter().map(Into::into).collect();
        path.append(&mut self.path.0);
        self.path = UnitPath(path);
        self
    }

    /// Nom de l'unité fautive.
    pub fn unit(&self) -> &str { self.path.0.last().map_or("", String::as_str) }
}

/// Chemin `racine/…/unité`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitPath(pub Vec<String>);

impl fmt::Display for UnitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0.join("/")) }
}

impl RewriteErrorKind {
    /// Classe une erreur du core : dépassement d'encodage ou entrée malformée.
    pub fn from_core(err: &CoreError) -> Self {
        if err.is_overflow() {
            RewriteErrorKind::EncodingOverflow(err.to_string())
        } else {
            RewriteErrorKind::MalformedInput(err.to_string())
        }
    }
}

/// Configuration rejetée.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Probabilité hors de `[0, 1]`.
    #[error("{field} = {value} is not a probability in [0, 1]")]
    Probability {
        /// Champ fautif.
        field: &'static str,
        /// Valeur lue.
        value: f64,
    },
    /// Intervalle de densité vide.
    #[error("density range is empty: min {min} > max {max}")]
    EmptyRange {
        /// Borne basse.
        min: f64,
        /// Borne haute.
        max: f64,
    },
}
