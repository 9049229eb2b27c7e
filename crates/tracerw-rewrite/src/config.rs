//! Configuration de la réécriture (`.tracerw.toml`).
//!
//! ```toml
//! candidates     = "distinct-lines"   # | "line-starts" | "block-leaders"
//! probe-entry    = true
//! mark-top-level = true
//! top-level      = "full"             # | "entry-only"
//! sign           = "signed"           # | "unsigned"
//!
//! [sampling]
//! mode = "density"                    # | "all" | "bernoulli" (keep = 0.5)
//! min  = 0.5
//! max  = 1.0
//! ```

use serde::{Deserialize, Serialize};
use tracerw_core::{LineTableCodec, SignConvention};

use crate::{
    error::ConfigError,
    select::{CandidatePolicy, PolicySampler, Sampling, TopLevelPolicy},
    token::HashedSites,
};

/// Réglages d'une réécriture ; chaque champ a une valeur par défaut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RewriteConfig {
    /// Instructions éligibles.
    pub candidates: CandidatePolicy,
    /// Densité des sondes.
    pub sampling: Sampling,
    /// Toujours sonder l'entrée de chaque unité.
    pub probe_entry: bool,
    /// Marquer les jetons de l'unité de premier niveau.
    pub mark_top_level: bool,
    /// Sondes de l'unité de premier niveau.
    pub top_level: TopLevelPolicy,
    /// Convention de signe de la table de lignes.
    pub sign: SignConvention,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            candidates: CandidatePolicy::default(),
            sampling: Sampling::default(),
            probe_entry: true,
            mark_top_level: true,
            top_level: TopLevelPolicy::default(),
            sign: SignConvention::default(),
        }
    }
}

impl RewriteConfig {
    /// Vérifie les probabilités et l'intervalle de densité.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |field: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Probability { field, value })
            }
        };
        match self.sampling {
            Sampling::All => Ok(()),
            Sampling::Bernoulli { keep } => check("keep", keep),
            Sampling::Density { min, max } => {
                check("min", min)?;
                check("max", max)?;
                if min > max {
                    return Err(ConfigError::EmptyRange { min, max });
                }
                Ok(())
            }
        }
    }

    /// Échantillonneur correspondant.
    pub const fn sampler(&self) -> PolicySampler {
        PolicySampler { sampling: self.sampling, probe_entry: self.probe_entry }
    }

    /// Schéma de jetons correspondant.
    pub const fn token_scheme(&self) -> HashedSites { HashedSites { mark_top_level: self.mark_top_level } }

    /// Codec de table de lignes correspondant.
    pub const fn codec(&self) -> LineTableCodec { LineTableCodec::new(self.sign) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: RewriteConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, RewriteConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn kebab_case_keys_parse() {
        let cfg: RewriteConfig = toml::from_str(
            r#"
            candidates = "block-leaders"
            probe-entry = false
            top-level = "entry-only"
            sign = "unsigned"

            [sampling]
            mode = "bernoulli"
            keep = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.candidates, CandidatePolicy::BlockLeaders);
        assert_eq!(cfg.sampling, Sampling::Bernoulli { keep: 0.25 });
        assert!(!cfg.probe_entry);
        assert!(cfg.mark_top_level);
        assert_eq!(cfg.top_level, TopLevelPolicy::EntryOnly);
        assert_eq!(cfg.codec(), LineTableCodec::new(SignConvention::Unsigned));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RewriteConfig>("density = 3").is_err());
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let cfg = RewriteConfig { sampling: Sampling::Density { min: 0.9, max: 0.2 }, ..RewriteConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyRange { min: 0.9, max: 0.2 }));
        let cfg = RewriteConfig { sampling: Sampling::Bernoulli { keep: 1.5 }, ..RewriteConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Probability { field: "keep", .. })));
    }
}
