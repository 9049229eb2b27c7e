//! tracerw-core — primitives partagées du réécrivain de bytecode
//!
//! Fournit :
//! - `CodeUnit`, `Const`, `ConstPool` : l'arbre d'unités de code (module, fonctions,
//!   lambdas, compréhensions) et son conteneur binaire (`TRUT` + CRC32)
//! - `Instruction`, `OpClass`, `InstructionSet` : l'IR d'instructions et la capacité
//!   de décodage/encodage consommée par le réécrivain
//! - `ChunkIsa` : jeu d'instructions de référence (opcode u8 + opérande u32 LE optionnel)
//! - `lnotab` : codec de la table offset → ligne (paires d'octets delta)
//! - `asm` / `disasm` : assembleur textuel et listing lisible
//! - `validate` : contrôles structurels d'une unité ou d'un arbre
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Features :
//! - `serde` (par défaut) : derive (dé)sérialisation sur les types publics

#![deny(missing_docs)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::borrow::Cow;

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Assembleur textuel et builder d'unités.
pub mod asm;
/// Listing lisible d'une unité ou d'un arbre.
pub mod disasm;
/// IR d'instructions et jeu d'instructions de référence.
pub mod isa;
/// Codec de la table de lignes.
pub mod lnotab;
/// Arbre d'unités de code et conteneur binaire.
pub mod unit;
/// Validation structurelle.
pub mod validate;

pub use isa::{ChunkIsa, ConstOperand, Instruction, InstructionSet, JumpKind, OpClass, Opcode};
pub use lnotab::{LineStart, LineTableCodec, SignConvention, Transition};
pub use unit::{CodeUnit, Const, ConstPool};

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = core::result::Result<T, CoreError>;

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Fin de buffer inattendue.
    #[error("unexpected EOF: need {needed} bytes at {at}")]
    UnexpectedEof {
        /// Nombre d’octets manquants.
        needed: u64,
        /// Offset où l’erreur s’est produite.
        at: u64,
    },
    /// Opcode inconnu du jeu d'instructions.
    #[error("unknown opcode 0x{opcode:02X} at offset {offset}")]
    UnknownOpcode {
        /// Octet d'opcode brut.
        opcode: u8,
        /// Offset de l'instruction.
        offset: u32,
    },
    /// Table de lignes incohérente (paires tronquées, offsets non monotones…).
    #[error("malformed line table: {0}")]
    LineTable(Cow<'static, str>),
    /// Valeur non représentable dans l'encodage (même après découpage).
    #[error("value out of encodable range: {0}")]
    Overflow(Cow<'static, str>),
    /// Magic du conteneur invalide (attendu `b"TRUT"`).
    #[error("invalid unit container magic")]
    InvalidMagic,
    /// CRC32 du conteneur incorrect.
    #[error("hash mismatch (crc32): expected=0x{expected:08X}, found=0x{found:08X}")]
    HashMismatch {
        /// CRC32 recalculé depuis le payload.
        expected: u32,
        /// CRC32 lu dans le payload.
        found: u32,
    },
    /// Erreur de syntaxe de l'assembleur.
    #[error("asm line {line}: {msg}")]
    Asm {
        /// Ligne (1-based) du texte source.
        line: usize,
        /// Message.
        msg: String,
    },
    /// Données corrompues (format / cohérence).
    #[error("corrupted: {0}")]
    Corrupted(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Corrupted(msg.into()) }

    /// Construit une erreur de table de lignes.
    pub fn line_table(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::LineTable(msg.into()) }

    /// Construit une erreur de dépassement d'encodage.
    pub fn overflow(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Overflow(msg.into()) }

    /// Vrai si l'erreur signale une valeur non représentable.
    pub const fn is_overflow(&self) -> bool { matches!(self, CoreError::Overflow(_)) }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Corrupted(Cow::Owned(format!("i/o: {err}")))
    }
}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        asm::{assemble, assemble_with, Assembler},
        disasm::{disassemble_tree, disassemble_unit},
        validate::{validate_tree, validate_unit},
        ChunkIsa, CodeUnit, Const, ConstOperand, ConstPool, CoreError, CoreResult, Instruction,
        InstructionSet, JumpKind, LineStart, LineTableCodec, OpClass, Opcode, SignConvention,
        Transition,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
