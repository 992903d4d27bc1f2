// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with clap and routes to Layer 2.
//
// Two commands are supported:
//   1. `train` — trains (or resumes) a retrieval run
//   2. `eval`  — recall@K of a run's best model
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvalArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "cgd-retrieval",
    version,
    about = "Train and evaluate a combination-of-global-descriptors image retrieval model."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Routes to the matching use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Eval(args)  => run_eval(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting training on dataset: {}", args.data);
    let results = TrainUseCase::new(args.into()).execute()?;

    if let Some(last) = results.records().last() {
        println!(
            "Training complete after {} epochs. Best recall@{}: {:.2}%",
            last.epoch,
            results.recall_ks()[results.primary_index()],
            results.best_primary_recall()
        );
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    use crate::application::eval_use_case::EvalUseCase;

    let report = EvalUseCase::new(args.into()).execute()?;
    println!("{} images of '{}'", report.images, report.split);
    for (k, r) in report.recall_ks.iter().zip(&report.recalls) {
        println!("  R@{k}: {r:.2}%");
    }
    Ok(())
}
