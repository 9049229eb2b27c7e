//! tracerw-cli — bibliothèque interne du binaire `tracerw`
//!
//! But : garder l'E/S et la logique des commandes testables, hors du parsing
//! d'arguments (laissé à `main.rs`).
//!
//! Points clés :
//! - Entrées : conteneur binaire `TRUT` ou source assembleur (détection par magic)
//! - Config : `.tracerw.toml` (recherche ascendante) ou `--config`, surchargée par les flags
//! - Traces `tracing` (feature `trace` : abonné `tracing-subscriber` + `EnvFilter`)
//! - Écriture atomique des sorties

#![deny(unused_must_use)]
#![forbid(unsafe_code)]

use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracerw_core::{
    asm::assemble_with,
    disasm::disassemble_tree,
    validate::validate_tree,
    unit::MAGIC,
    ChunkIsa, CodeUnit,
};
use tracerw_rewrite::{CandidatePolicy, RewriteConfig, Rewriter, Sampling};

/// Nom du fichier de configuration recherché.
pub const CONFIG_FILE: &str = ".tracerw.toml";

// ───────────────────────────── Types publics ─────────────────────────────

/// Commande haut-niveau (le parsing CLI reste dans main.rs).
#[derive(Clone, Debug)]
pub enum Command {
    /// Assemble une source texte vers un conteneur.
    Asm(AsmTask),
    /// Instrumente un arbre d'unités.
    Rewrite(RewriteTask),
    /// Affiche un arbre (listing ou JSON).
    Dump(DumpTask),
    /// Vérifie la cohérence structurelle d'un arbre.
    Verify(VerifyTask),
}

/// `tracerw asm`.
#[derive(Clone, Debug, Default)]
pub struct AsmTask {
    /// Source assembleur.
    pub input: Input,
    /// Conteneur produit.
    pub output: Output,
}

/// `tracerw rewrite`.
#[derive(Clone, Debug, Default)]
pub struct RewriteTask {
    /// Arbre d'entrée.
    pub input: Input,
    /// Arbre instrumenté.
    pub output: Output,
    /// Graine du RNG ; tirée de l'entropie système si absente.
    pub seed: Option<u64>,
    /// La racine n'est pas un module de premier niveau.
    pub nested: bool,
    /// Surcharge de `candidates`.
    pub candidates: Option<CandidatePolicy>,
    /// Surcharge de `sampling`.
    pub sampling: Option<Sampling>,
    /// Afficher le bilan par unité.
    pub report: bool,
}

/// `tracerw dump`.
#[derive(Clone, Debug, Default)]
pub struct DumpTask {
    /// Arbre à afficher.
    pub input: Input,
    /// Sortie JSON au lieu du listing.
    pub json: bool,
}

/// `tracerw verify`.
#[derive(Clone, Debug, Default)]
pub struct VerifyTask {
    /// Arbre à vérifier.
    pub input: Input,
}

/// Entrée : fichier ou `-` (=stdin).
#[derive(Clone, Debug, Default)]
pub enum Input {
    /// Fichier.
    Path(PathBuf),
    /// Entrée standard.
    #[default]
    Stdin,
}

/// Sortie : fichier ou stdout.
#[derive(Clone, Debug, Default)]
pub enum Output {
    /// Fichier (écrit atomiquement).
    Path(PathBuf),
    /// Sortie standard.
    #[default]
    Stdout,
}

// ───────────────────────────── Initialisation ─────────────────────────────

/// Installe l'abonné `tracing` (feature `trace`). `RUST_LOG` prime sur `default_level`.
pub fn init_logger(default_level: &str) {
    #[cfg(feature = "trace")]
    {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .try_init();
    }
    #[cfg(not(feature = "trace"))]
    let _ = default_level;
}

/// Niveau par défaut selon `-v`/`-q`.
pub const fn level_for(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

// ───────────────────────────── Configuration ─────────────────────────────

/// Charge `explicit`, sinon `.tracerw.toml` en remontant depuis le dossier
/// courant, sinon la configuration par défaut.
pub fn load_config(explicit: Option<&Path>) -> Result<RewriteConfig> {
    let cwd = std::env::current_dir().context("dossier courant")?;
    load_config_from(explicit, &cwd)
}

/// Comme [`load_config`], la recherche ascendante partant de `start`.
pub fn load_config_from(explicit: Option<&Path>, start: &Path) -> Result<RewriteConfig> {
    if let Some(p) = explicit {
        return read_config(p);
    }
    let mut cur = start.to_path_buf();
    loop {
        let cand = cur.join(CONFIG_FILE);
        if cand.is_file() {
            return read_config(&cand);
        }
        if !cur.pop() {
            break;
        }
    }
    tracing::debug!("no {CONFIG_FILE} found, using defaults");
    Ok(RewriteConfig::default())
}

fn read_config(path: &Path) -> Result<RewriteConfig> {
    let s = fs::read_to_string(path).with_context(|| format!("lecture config {}", path_str(path)))?;
    let cfg: RewriteConfig = toml::from_str(&s).with_context(|| format!("TOML invalide: {}", path_str(path)))?;
    cfg.validate().with_context(|| format!("config invalide: {}", path_str(path)))?;
    tracing::debug!(path = %path_str(path), "config loaded");
    Ok(cfg)
}

// ───────────────────────────── Exécution ─────────────────────────────

/// Exécute une commande. Retourne un code de sortie.
pub fn execute(cmd: Command, config: &RewriteConfig) -> Result<i32> {
    match cmd {
        Command::Asm(t) => asm_entry(&t, config),
        Command::Rewrite(t) => rewrite_entry(&t, config),
        Command::Dump(t) => dump_entry(&t, config),
        Command::Verify(t) => verify_entry(&t, config),
    }
}

fn asm_entry(task: &AsmTask, config: &RewriteConfig) -> Result<i32> {
    let src = String::from_utf8(read_input(&task.input)?).context("source assembleur non UTF-8")?;
    let tree = assemble_with(&src, config.codec()).context("échec d'assemblage")?;
    let bytes = tree.to_bytes()?;
    write_output(&task.output, &bytes)?;
    tracing::info!(units = tree.tree_len(), bytes = bytes.len(), "assembled");
    Ok(0)
}

fn rewrite_entry(task: &RewriteTask, config: &RewriteConfig) -> Result<i32> {
    let mut cfg = *config;
    if let Some(c) = task.candidates {
        cfg.candidates = c;
    }
    if let Some(s) = task.sampling {
        cfg.sampling = s;
    }
    let rewriter = Rewriter::from_config(ChunkIsa, &cfg).context("configuration rejetée")?;

    let tree = load_tree(&task.input, config)?;
    let mut rng = match task.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let start = Instant::now();
    let (out, report) = rewriter
        .rewrite_with_report(&mut rng, &tree, !task.nested)
        .context("échec de réécriture")?;
    let elapsed = start.elapsed();

    write_output(&task.output, &out.to_bytes()?)?;
    tracing::info!(
        units = report.units.len(),
        probes = report.probes(),
        millis = elapsed.as_millis(),
        "rewritten"
    );
    if task.report {
        for u in &report.units {
            eprintln!(
                "{:<40} {:>5} / {:<5} {:>7} -> {:<7}",
                u.path, u.probes, u.candidates, u.bytes_before, u.bytes_after
            );
        }
    }
    Ok(0)
}

fn dump_entry(task: &DumpTask, config: &RewriteConfig) -> Result<i32> {
    let tree = load_tree(&task.input, config)?;
    let text = if task.json {
        serde_json::to_string_pretty(&tree)?
    } else {
        disassemble_tree(&ChunkIsa, &tree, &config.codec())?
    };
    let mut w = BufWriter::new(io::stdout().lock());
    writeln!(w, "{text}")?;
    w.flush()?;
    Ok(0)
}

fn verify_entry(task: &VerifyTask, config: &RewriteConfig) -> Result<i32> {
    let tree = load_tree(&task.input, config)?;
    validate_tree(&ChunkIsa, &tree, &config.codec()).context("arbre invalide")?;
    println!("OK {} unit(s)", tree.tree_len());
    Ok(0)
}

// ───────────────────────────── Utilitaires E/S ─────────────────────────────

/// Lit un arbre : conteneur `TRUT` si le magic est présent, source assembleur
/// sinon (tables de lignes dans la convention de `config`).
pub fn load_tree(input: &Input, config: &RewriteConfig) -> Result<CodeUnit> {
    let bytes = read_input(input)?;
    if bytes.starts_with(MAGIC) {
        return CodeUnit::from_bytes(&bytes).context("conteneur illisible");
    }
    let src = String::from_utf8(bytes).map_err(|_| anyhow!("ni conteneur TRUT ni source UTF-8"))?;
    assemble_with(&src, config.codec()).context("échec d'assemblage")
}

fn read_input(input: &Input) -> Result<Vec<u8>> {
    match input {
        Input::Stdin => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
        Input::Path(p) => fs::read(p).with_context(|| format!("ouverture: {}", path_str(p))),
    }
}

fn write_output(output: &Output, bytes: &[u8]) -> Result<()> {
    match output {
        Output::Stdout => {
            let mut w = BufWriter::new(io::stdout().lock());
            w.write_all(bytes)?;
            w.flush()?;
        }
        Output::Path(p) => {
            write_bytes_atomic(p, bytes).with_context(|| format!("écriture de {}", path_str(p)))?;
            tracing::debug!(path = %path_str(p), bytes = bytes.len(), "written");
        }
    }
    Ok(())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = unique_tmp_path(parent, path.file_name().unwrap_or_default());
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(bytes)?;
        w.flush()?;
    }
    if path.exists() {
        // Windows : Rename sur cible existante peut échouer
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).or_else(|_| fs::copy(&tmp, path).and_then(|_| fs::remove_file(&tmp)))?;
    Ok(())
}

fn unique_tmp_path(dir: &Path, base: &std::ffi::OsStr) -> PathBuf {
    let mut i = 0u32;
    loop {
        let candidate = dir.join(format!("{}.tmp{}", base.to_string_lossy(), i));
        if !candidate.exists() {
            return candidate;
        }
        i = i.wrapping_add(1);
    }
}

fn path_str(p: &Path) -> String { p.to_string_lossy().to_string() }

// ───────────────────────────── Tests ─────────────────────────────
