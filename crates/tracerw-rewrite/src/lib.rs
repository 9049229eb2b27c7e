//! tracerw-rewrite — instrumentation de couverture d'arbres d'unités de code
//!
//! Fournit :
//! - `select` : candidats (lignes distinctes, débuts de ligne, têtes de blocs)
//!   et échantillonnage piloté par un RNG injecté
//! - `token` : jeton porté par chaque sonde (hachage multiplicatif du site)
//! - `unit` : réécriture d'une unité (sondes, relocalisation des sauts, table
//!   de lignes re-dérivée)
//! - `tree` : parcours en profondeur de l'arbre, ordre du pool
//! - `config` : `RewriteConfig` (serde)
//!
//! ```
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use tracerw_core::{asm::assemble, ChunkIsa};
//!
//! let tree = assemble(".unit <module> 1\n2: LOAD_NAME 0\n   RETURN\n.end\n")?;
//! let out = tracerw_rewrite::rewrite(ChunkIsa, || ChaCha8Rng::seed_from_u64(7), &tree, true)?;
//! assert!(out.code.len() > tree.code.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]

/// Configuration de la réécriture.
pub mod config;
/// Erreurs.
pub mod error;
/// Sélection des sites de sonde.
pub mod select;
/// Jetons des sondes.
pub mod token;
/// Parcours de l'arbre.
pub mod tree;
/// Réécriture d'une unité.
pub mod unit;

pub use config::RewriteConfig;
pub use error::{ConfigError, RewriteError, RewriteErrorKind, RewriteResult};
pub use select::{Candidate, CandidatePolicy, PolicySampler, Sampling, SiteSampler, TopLevelPolicy};
pub use token::{site_hash, unit_salt, HashedSites, ProbeSite, TokenScheme, HASH_PRIME};
pub use tree::{rewrite, rewrite_with_rng, RewriteReport, UnitReport};
pub use unit::{RewrittenBody, Rewriter};
