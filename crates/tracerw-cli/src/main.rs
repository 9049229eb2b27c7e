//! `tracerw` — CLI d'instrumentation de couverture
//!
//! Ici on fait uniquement : parsing d'arguments, initialisation (traces,
//! configuration), et délégation à `tracerw_cli` (lib).

#![forbid(unsafe_code)]

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use tracerw_cli as cli;
use tracerw_rewrite::{CandidatePolicy, Sampling};

// ──────────────────────────── CLI (clap) ────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "tracerw", version, about = "tracerw — instrumenter des arbres d'unités de code pour le fuzzing", long_about = None)]
struct Opt {
    /// Augmente la verbosité (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Mode silencieux (casse la verbosité)
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, global = true)]
    quiet: bool,

    /// Fichier de configuration (sinon `.tracerw.toml` en remontant)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Sous-commandes
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Candidates {
    DistinctLines,
    LineStarts,
    BlockLeaders,
}

impl From<Candidates> for CandidatePolicy {
    fn from(c: Candidates) -> Self {
        match c {
            Candidates::DistinctLines => Self::DistinctLines,
            Candidates::LineStarts => Self::LineStarts,
            Candidates::BlockLeaders => Self::BlockLeaders,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assembler une source texte vers un conteneur TRUT
    Asm {
        /// Source (ou - pour stdin)
        input: Option<PathBuf>,
        /// Conteneur de sortie (stdout si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Insérer des sondes de couverture dans tout l'arbre
    Rewrite {
        /// Conteneur ou source (ou - pour stdin)
        input: Option<PathBuf>,
        /// Conteneur de sortie (stdout si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Graine du RNG (reproductible)
        #[arg(long)]
        seed: Option<u64>,
        /// La racine n'est pas un module de premier niveau
        #[arg(long)]
        nested: bool,
        /// Instructions éligibles
        #[arg(long, value_enum)]
        candidates: Option<Candidates>,
        /// Sonder tous les candidats
        #[arg(long, conflicts_with = "keep")]
        all: bool,
        /// Probabilité de garder chaque candidat
        #[arg(long)]
        keep: Option<f64>,
        /// Bilan par unité sur stderr
        #[arg(long)]
        report: bool,
    },

    /// Afficher un arbre (listing, ou JSON)
    Dump {
        /// Conteneur ou source (ou - pour stdin)
        input: Option<PathBuf>,
        /// Sortie JSON (pretty-printed)
        #[arg(long)]
        json: bool,
    },

    /// Vérifier la cohérence structurelle d'un arbre
    Verify {
        /// Conteneur ou source (ou - pour stdin)
        input: Option<PathBuf>,
    },
}

// ──────────────────────────── Entrée / Sortie ────────────────────────────

fn input_from_opt(p: Option<PathBuf>) -> cli::Input {
    match p {
        Some(path) if path.as_os_str() == "-" => cli::Input::Stdin,
        Some(path) => cli::Input::Path(path),
        None => cli::Input::Stdin,
    }
}

fn output_from_opt(p: Option<PathBuf>) -> cli::Output { p.map_or(cli::Output::Stdout, cli::Output::Path) }

fn sampling_from_opt(all: bool, keep: Option<f64>) -> Option<Sampling> {
    if all {
        return Some(Sampling::All);
    }
    keep.map(|keep| Sampling::Bernoulli { keep })
}

// ──────────────────────────── main ────────────────────────────

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn real_main() -> Result<()> {
    let opt = Opt::parse();

    cli::init_logger(cli::level_for(opt.verbose, opt.quiet));
    let config = cli::load_config(opt.config.as_deref())?;

    use cli::{AsmTask, Command as C, DumpTask, RewriteTask, VerifyTask};

    let command = match opt.cmd {
        Command::Asm { input, output } => {
            C::Asm(AsmTask { input: input_from_opt(input), output: output_from_opt(output) })
        }
        Command::Rewrite { input, output, seed, nested, candidates, all, keep, report } => C::Rewrite(RewriteTask {
            input: input_from_opt(input),
            output: output_from_opt(output),
            seed,
            nested,
            candidates: candidates.map(Into::into),
            sampling: sampling_from_opt(all, keep),
            report,
        }),
        Command::Dump { input, json } => C::Dump(DumpTask { input: input_from_opt(input), json }),
        Command::Verify { input } => C::Verify(VerifyTask { input: input_from_opt(input) }),
    };

    let code = cli::execute(command, &config).context("échec d'exécution de la commande")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
