//! Subcommand handlers.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use feddistill_core::config::{DistillConfig, load_config, load_config_file, workspace_config_path};
use feddistill_core::report::RoundSummary;
use feddistill_core::{JsonLinesSink, MemorySink, TracingSink, Trainer, TrainingOutcome};

use crate::simulation::build_federation;
use crate::{Commands, ConfigAction};

/// Overrides for a single `run`.
#[derive(Debug, Default, Clone)]
pub(crate) struct RunOptions {
    pub(crate) rounds: Option<usize>,
    pub(crate) metric: Option<String>,
    pub(crate) seed: Option<u64>,
    pub(crate) report: Option<PathBuf>,
}

pub(crate) fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            rounds,
            metric,
            seed,
            report,
        } => {
            let config = resolve_config(workspace, config_path)?;
            let options = RunOptions {
                rounds,
                metric,
                seed,
                report,
            };
            let (summaries, outcome) = run(config, &options)?;
            print_report(&summaries, &outcome);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn resolve_config(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<DistillConfig> {
    let config = match config_path {
        Some(path) => load_config_file(path),
        None => load_config(Some(workspace), None),
    };
    config.map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = workspace_config_path(workspace);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&DistillConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = resolve_config(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Build the synthetic federation and run the trainer.
pub(crate) fn run(
    mut config: DistillConfig,
    options: &RunOptions,
) -> anyhow::Result<(Vec<RoundSummary>, TrainingOutcome)> {
    if let Some(metric) = &options.metric {
        config.trainer.metric = metric.clone();
    }
    if let Some(seed) = options.seed {
        config.simulation.seed = seed;
    }
    let rounds = options.rounds.unwrap_or(config.trainer.global_epochs);
    let report_path = options.report.clone().or(config.report.jsonl_path.clone());

    let federation = build_federation(&config.simulation)?;
    let trainer = Trainer::new(
        federation.clients,
        federation.reference,
        federation.sample_sizes,
        &config.trainer,
    )?;
    tracing::info!(?trainer, rounds, "Trainer ready");

    let mut memory = MemorySink::new();
    let outcome = match report_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let sink = JsonLinesSink::new(file);
            tracing::info!(run_id = %sink.run_id(), path = %path.display(), "Writing round reports");
            trainer.train(rounds, (TracingSink, (&mut memory, sink)))?
        }
        None => trainer.train(rounds, (TracingSink, &mut memory))?,
    };
    Ok((memory.summaries, outcome))
}

fn report_header() -> String {
    format!(
        "{:>5}  {:>10}  {:>10}  {:>10}  {:>10}  {:>8}",
        "round", "test", "dtest", "ref", "dref", "trust"
    )
}

fn print_report(summaries: &[RoundSummary], outcome: &TrainingOutcome) {
    println!("{}", report_header());
    for summary in summaries {
        let trust = outcome
            .history()
            .trust_weights(summary.round)
            .map(|t| if t.is_collected() { "yes" } else { "-" })
            .unwrap_or("-");
        println!(
            "{:>5}  {:>10.5}  {:>+10.5}  {:>10.5}  {:>+10.5}  {:>8}",
            summary.round,
            summary.mean_test_accuracy,
            summary.mean_test_accuracy_delta,
            summary.mean_ref_accuracy,
            summary.mean_ref_accuracy_delta,
            trust
        );
    }

    let history = outcome.history();
    let Some(last) = history.rounds_completed().checked_sub(1) else {
        return;
    };
    println!();
    println!("final round per client:");
    let train = history.train_accuracies(last).unwrap_or_default();
    let test = history.test_accuracies(last).unwrap_or_default();
    let reference = history.ref_accuracies(last).unwrap_or_default();
    for (idx, ((tr, te), re)) in train.iter().zip(test).zip(reference).enumerate() {
        println!("  client {idx}: train {tr:.5}  test {te:.5}  ref {re:.5}");
    }
    if let Some(weights) = history.trust_weights(last).and_then(|t| t.as_matrix()) {
        println!();
        println!("final trust weights (row = client):");
        for row in weights.rows() {
            let cells: Vec<String> = row.iter().map(|w| format!("{w:.3}")).collect();
            println!("  [{}]", cells.join(", "));
        }
    }
}
