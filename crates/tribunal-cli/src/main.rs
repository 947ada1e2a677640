//! `tribunal` command-line interface.
//!
//! Offline tooling around the deterministic core: rubric validation, verdict
//! synthesis from recorded evidence and opinions, and coercion of a single
//! raw evaluator output.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tribunal_core::coercion::ground;
use tribunal_core::{
    reconcile, Coercer, CriterionOutcome, ErrorRecord, Evidence, EvidencePartial, EvidenceStore,
    Opinion, RawOutput, Role, Rubric, RunState,
};

#[derive(Parser)]
#[command(name = "tribunal", author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a rubric file (YAML or JSON)
    Validate {
        rubric: PathBuf,
    },

    /// Synthesize verdicts from recorded evidence and opinions
    Synthesize {
        #[arg(long)]
        rubric: PathBuf,

        /// Evidence store, list of partials, or list of entries
        #[arg(long)]
        evidence: Option<PathBuf>,

        /// List of opinions
        #[arg(long)]
        opinions: PathBuf,

        /// Exit with status 2 when any criterion needs review or lacks data
        #[arg(long)]
        strict: bool,

        #[arg(long)]
        pretty: bool,
    },

    /// Coerce one raw evaluator output into an opinion
    Coerce {
        #[arg(long)]
        rubric: PathBuf,

        #[arg(long)]
        criterion: String,

        /// critical, supportive or pragmatic (persona names also accepted)
        #[arg(long)]
        role: Role,

        #[arg(long)]
        evidence: Option<PathBuf>,

        /// File holding the raw output; a `.json` file is read as structured output
        output: PathBuf,
    },
}

/// Accepted evidence file shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum EvidenceInput {
    Store(EvidenceStore),
    Partials(Vec<EvidencePartial>),
    Entries(Vec<Evidence>),
}

impl EvidenceInput {
    fn into_store(self) -> EvidenceStore {
        match self {
            EvidenceInput::Store(store) => store,
            EvidenceInput::Partials(partials) => EvidenceStore::from_partials(partials),
            EvidenceInput::Entries(entries) => {
                let mut store = EvidenceStore::new();
                for entry in entries {
                    store.insert(entry);
                }
                store
            }
        }
    }
}

#[derive(Serialize)]
struct SynthesisOutput<'a> {
    rubric: &'a str,
    outcomes: &'a [CriterionOutcome],
    errors: &'a [ErrorRecord],
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tribunal=debug" } else { "tribunal=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Validate { rubric } => cmd_validate(&rubric),
        Commands::Synthesize {
            rubric,
            evidence,
            opinions,
            strict,
            pretty,
        } => cmd_synthesize(&rubric, evidence.as_deref(), &opinions, strict, pretty),
        Commands::Coerce {
            rubric,
            criterion,
            role,
            evidence,
            output,
        } => cmd_coerce(&rubric, &criterion, role, evidence.as_deref(), &output),
    }
}

fn cmd_validate(path: &Path) -> Result<ExitCode> {
    let rubric = load_rubric(path)?;

    println!("{} (version {}): {} criteria", rubric.name, rubric.rubric_version, rubric.criteria.len());
    for criterion in &rubric.criteria {
        let weights: Vec<String> = criterion
            .role_weights
            .iter()
            .map(|(role, weight)| format!("{}={}", role, weight))
            .collect();
        println!("  {} [{}] {}", criterion.id, weights.join(", "), criterion.name);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_synthesize(
    rubric_path: &Path,
    evidence_path: Option<&Path>,
    opinions_path: &Path,
    strict: bool,
    pretty: bool,
) -> Result<ExitCode> {
    let rubric = load_rubric(rubric_path)?;
    let store = load_evidence(evidence_path)?;
    let opinions: Vec<Opinion> = read_structured(opinions_path)?;

    tracing::info!(
        rubric = %rubric.name,
        evidence = store.len(),
        opinions = opinions.len(),
        "Synthesizing"
    );

    let (opinions, violations) = ground_opinions(opinions, &store);
    for violation in &violations {
        tracing::warn!("{}", violation);
    }

    let mut state = RunState::new();
    state.merge_evidence(store_as_partials(store))?;
    state.merge_opinions(opinions)?;
    state.record_errors(violations)?;
    let outcomes = reconcile(&rubric, &mut state)?;

    let output = SynthesisOutput {
        rubric: &rubric.name,
        outcomes: &outcomes,
        errors: state.errors(),
    };
    print_json(&output, pretty)?;

    let flagged = outcomes
        .iter()
        .any(|o| o.verdict().map_or(true, |v| v.review_required));
    if strict && flagged {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_coerce(
    rubric_path: &Path,
    criterion_id: &str,
    role: Role,
    evidence_path: Option<&Path>,
    output_path: &Path,
) -> Result<ExitCode> {
    let rubric = load_rubric(rubric_path)?;
    let criterion = rubric
        .criterion(criterion_id)
        .with_context(|| format!("criterion '{}' is not in rubric '{}'", criterion_id, rubric.name))?;
    let store = load_evidence(evidence_path)?;
    let raw = read_raw_output(output_path)?;

    let coercer = Coercer::new(rubric.coercion.clone());
    match coercer.coerce(&raw, criterion, role, &store, 0) {
        Ok(coerced) => {
            for violation in &coerced.violations {
                tracing::warn!("{}", violation);
            }
            print_json(&coerced.opinion, true)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(rejection) => {
            eprintln!("rejected: {}", rejection);
            eprintln!("feedback for re-elicitation:\n{}", rejection.feedback());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn load_rubric(path: &Path) -> Result<Rubric> {
    Rubric::from_file(path).with_context(|| format!("invalid rubric {}", path.display()))
}

fn load_evidence(path: Option<&Path>) -> Result<EvidenceStore> {
    match path {
        Some(path) => Ok(read_structured::<EvidenceInput>(path)?.into_store()),
        None => Ok(EvidenceStore::new()),
    }
}

/// Prune recorded citations the store cannot back, as live coercion does.
fn ground_opinions(opinions: Vec<Opinion>, store: &EvidenceStore) -> (Vec<Opinion>, Vec<ErrorRecord>) {
    let mut violations = Vec::new();
    let grounded = opinions
        .into_iter()
        .map(|mut opinion| {
            let citations: Vec<String> = opinion.cited_evidence.iter().map(ToString::to_string).collect();
            let grounded = ground(citations.iter().map(String::as_str), store);
            if !grounded.removed.is_empty() {
                opinion.rationale = grounded.annotate(&opinion.rationale);
                violations.extend(grounded.violations(&opinion.criterion_id, opinion.role));
            }
            opinion.cited_evidence = grounded.kept;
            opinion
        })
        .collect();
    (grounded, violations)
}

/// Regroup a store into per-collector partials for the state barrier.
fn store_as_partials(store: EvidenceStore) -> Vec<EvidencePartial> {
    let mut partials: Vec<EvidencePartial> = Vec::new();
    for evidence in store.iter() {
        match partials.last_mut() {
            Some(partial) if partial.collector_id == evidence.collector_id => {
                partial.push(evidence.clone())
            }
            _ => {
                let mut partial = EvidencePartial::new(&evidence.collector_id);
                partial.push(evidence.clone());
                partials.push(partial);
            }
        }
    }
    partials
}

/// Read JSON, or YAML for `.yaml`/`.yml` files.
fn read_structured<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    parse_structured(&text, path)
}

fn parse_structured<T: DeserializeOwned>(text: &str, path: &Path) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(text)
            .with_context(|| format!("invalid YAML in {}", path.display())),
        _ => serde_json::from_str(text)
            .with_context(|| format!("invalid JSON in {}", path.display())),
    }
}

fn read_raw_output(path: &Path) -> Result<RawOutput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    if text.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        return Ok(RawOutput::Structured(value));
    }
    Ok(RawOutput::Text(text))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}
