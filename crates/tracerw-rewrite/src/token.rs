//! Jetons portés par les sondes.
//!
//! Le jeton identifie (unité, site) auprès du callback de couverture. Le
//! schéma par défaut reprend le hachage multiplicatif que le callback calcule
//! à l'exécution : graine première, multipliée par la ligne de base de l'unité
//! puis par l'offset de la sonde, les zéros étant remplacés par `u32::MAX`.
//! Le rang de l'unité dans l'arbre y est mêlé : deux unités définies sur la
//! même ligne ne partagent pas leurs jetons. La racine (rang 0) garde le
//! hachage brut.

use serde::{Deserialize, Serialize};

/// Graine du hachage multiplicatif.
pub const HASH_PRIME: u32 = 0xEDB6_417B;

const TOP_LEVEL_BIT: u32 = 1 << 31;

/// Site pour lequel un jeton est demandé.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSite<'a> {
    /// Nom de l'unité.
    pub unit: &'a str,
    /// Rang de l'unité dans l'arbre, en ordre préfixe (racine = 0).
    pub unit_index: u32,
    /// Ligne de base de l'unité.
    pub first_line: u32,
    /// Offset de la sonde dans le flux réécrit.
    pub offset: u32,
    /// Ligne source attribuée à la sonde.
    pub line: u32,
    /// Unité racine d'un module de premier niveau.
    pub is_top_level: bool,
}

/// Calcul du jeton d'une sonde.
pub trait TokenScheme {
    /// Jeton du site.
    fn token(&self, site: &ProbeSite<'_>) -> u32;
}

/// Hachage multiplicatif `HASH_PRIME · first_line · offset` (zéros remplacés).
pub const fn site_hash(first_line: u32, offset: u32) -> u32 {
    HASH_PRIME.wrapping_mul(non_zero(first_line)).wrapping_mul(non_zero(offset))
}

/// Sel propre à l'unité de rang `unit_index` : injectif sur les 31 bits bas,
/// nul pour la racine.
pub const fn unit_salt(unit_index: u32) -> u32 { unit_index.wrapping_mul(HASH_PRIME) & !TOP_LEVEL_BIT }

const fn non_zero(v: u32) -> u32 {
    if v == 0 {
        u32::MAX
    } else {
        v
    }
}

/// Schéma par défaut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashedSites {
    /// Bit de poids fort levé pour l'unité de premier niveau, effacé sinon.
    /// Désactivé, le jeton est le hachage brut.
    pub mark_top_level: bool,
}

impl Default for HashedSites {
    fn default() -> Self { Self { mark_top_level: true } }
}

impl TokenScheme for HashedSites {
    fn token(&self, site: &ProbeSite<'_>) -> u32 {
        let h = site_hash(site.first_line, site.offset) ^ unit_salt(site.unit_index);
        match (self.mark_top_level, site.is_top_level) {
            (false, _) => h,
            (true, true) => h | TOP_LEVEL_BIT,
            (true, false) => h & !TOP_LEVEL_BIT,
        }
    }
}

impl<F> TokenScheme for F
where
    F: Fn(&ProbeSite<'_>) -> u32,
{
    fn token(&self, site: &ProbeSite<'_>) -> u32 { self(site) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(first_line: u32, offset: u32, is_top_level: bool) -> ProbeSite<'static> {
        ProbeSite { unit: "u", unit_index: 0, first_line, offset, line: first_line, is_top_level }
    }

    #[test]
    fn zero_factors_are_replaced() {
        assert_eq!(site_hash(0, 1), HASH_PRIME.wrapping_mul(u32::MAX));
        assert_eq!(site_hash(1, 0), HASH_PRIME.wrapping_mul(u32::MAX));
        assert_ne!(site_hash(3, 0), 0);
        assert_eq!(site_hash(1, 1), HASH_PRIME);
    }

    #[test]
    fn top_level_only_changes_the_high_bit() {
        let scheme = HashedSites::default();
        let top = scheme.token(&site(4, 10, true));
        let nested = scheme.token(&site(4, 10, false));
        assert_eq!(top & !TOP_LEVEL_BIT, nested);
        assert_eq!(top & TOP_LEVEL_BIT, TOP_LEVEL_BIT);
        assert_eq!(nested & TOP_LEVEL_BIT, 0);

        let raw = HashedSites { mark_top_level: false };
        assert_eq!(raw.token(&site(4, 10, true)), site_hash(4, 10));
    }

    #[test]
    fn sites_are_distinguished() {
        let scheme = HashedSites::default();
        assert_ne!(scheme.token(&site(4, 10, false)), scheme.token(&site(4, 15, false)));
        assert_ne!(scheme.token(&site(4, 10, false)), scheme.token(&site(9, 10, false)));
    }

    #[test]
    fn units_on_the_same_line_are_distinguished() {
        let scheme = HashedSites::default();
        let at = |unit_index| scheme.token(&ProbeSite { unit_index, ..site(7, 0, false) });
        let tokens: std::collections::HashSet<u32> = (0..1_000).map(at).collect();
        assert_eq!(tokens.len(), 1_000);
        assert_eq!(at(0), site_hash(7, 0) & !TOP_LEVEL_BIT);
    }
}
