// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands: `train` and `eval`
// and all their configurable flags.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};

use crate::application::{eval_use_case::EvalConfig, train_use_case::TrainConfig};
use crate::ml::model::BackboneKind;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a retrieval model on <data>/train, evaluating on <data>/val
    Train(TrainArgs),

    /// Recall@K of a run's best model on a dataset split
    Eval(EvalArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Dataset root holding train/ and val/, one sub-directory per class
    #[arg(long)]
    pub data: String,

    /// Run name, first part of the results directory name
    #[arg(long, default_value = "run")]
    pub name: String,

    #[arg(long, value_enum, default_value_t = BackboneKind::Small)]
    pub backbone: BackboneKind,

    /// Global descriptors: one to three of S (average), M (max), G (GeM)
    #[arg(long, default_value = "SG")]
    pub gd_config: String,

    /// Embedding size, split evenly across the descriptors
    #[arg(long, default_value_t = 1536)]
    pub feature_dim: usize,

    /// Label smoothing for the classification loss
    #[arg(long, default_value_t = 0.1)]
    pub smoothing: f64,

    /// Logits are divided by this before the softmax
    #[arg(long, default_value_t = 0.5)]
    pub temperature: f64,

    /// Triplet loss margin
    #[arg(long, default_value_t = 0.1)]
    pub margin: f64,

    /// Comma-separated recall ranks; the smallest selects the best model
    #[arg(long, value_delimiter = ',', default_value = "1,2,4,8")]
    pub recalls: Vec<usize>,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Images drawn per class in every training batch
    #[arg(long, default_value_t = 4)]
    pub instances_per_class: usize,

    #[arg(long, default_value_t = 20)]
    pub num_epochs: usize,

    /// Checkpoint directory (or its checkpoint.json) to resume from
    #[arg(long)]
    pub checkpoint: Option<String>,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Images are resized to this square side
    #[arg(long, default_value_t = 224)]
    pub image_size: u32,

    /// Data loader worker threads
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    #[arg(long, default_value = "results")]
    pub results_dir: String,

    /// Seed for the class-balanced sampler
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            data_path:           a.data,
            name:                a.name,
            backbone:            a.backbone,
            gd_config:           a.gd_config,
            feature_dim:         a.feature_dim,
            smoothing:           a.smoothing,
            temperature:         a.temperature,
            margin:              a.margin,
            recalls:             a.recalls,
            batch_size:          a.batch_size,
            instances_per_class: a.instances_per_class,
            num_epochs:          a.num_epochs,
            lr:                  a.lr,
            image_size:          a.image_size,
            num_workers:         a.workers,
            results_dir:         a.results_dir,
            checkpoint:          a.checkpoint,
            seed:                a.seed,
        }
    }
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Run directory written by `train` (<results_dir>/<save_name>)
    #[arg(long)]
    pub run: String,

    /// Dataset root; defaults to the one the run was trained on
    #[arg(long)]
    pub data: Option<String>,

    /// Split directory under the dataset root
    #[arg(long, default_value = "val")]
    pub split: String,

    /// Comma-separated recall ranks; defaults to the run's
    #[arg(long, value_delimiter = ',')]
    pub recalls: Option<Vec<usize>>,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,
}

impl From<EvalArgs> for EvalConfig {
    fn from(a: EvalArgs) -> Self {
        EvalConfig {
            run_dir:    a.run,
            data_path:  a.data,
            split:      a.split,
            recalls:    a.recalls,
            batch_size: a.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_train_args_map_to_config() {
        let cli = Cli::parse_from([
            "cgd-retrieval", "train", "--data", "/data/cub", "--name", "cub",
            "--gd-config", "MG", "--recalls", "1,10", "--backbone", "base",
        ]);
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();

        assert_eq!(cfg.data_path, "/data/cub");
        assert_eq!(cfg.gd_config, "MG");
        assert_eq!(cfg.recalls, vec![1, 10]);
        assert_eq!(cfg.backbone, BackboneKind::Base);
        assert_eq!(cfg.instances_per_class, 4);
        assert!(cfg.checkpoint.is_none());
    }

    #[test]
    fn test_eval_defaults() {
        let cli = Cli::parse_from(["cgd-retrieval", "eval", "--run", "results/x"]);
        let Commands::Eval(args) = cli.command else { panic!("expected eval") };
        let cfg: EvalConfig = args.into();

        assert_eq!(cfg.split, "val");
        assert!(cfg.recalls.is_none());
        assert!(cfg.data_path.is_none());
    }
}
