//! Command-line entry point.
//!
//! Subcommands:
//!   run      -- train the ensemble, fit the booster, explain and predict
//!   predict  -- grade an unlabelled annotation table with a saved ensemble

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fundus_grade::{predict_with_ensemble, run_pipeline, ModelConfig, PipelineConfig};

#[derive(Parser)]
#[command(name = "fundus-grade", about = "Diabetic retinopathy grading pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full training pipeline.
    Run {
        /// Pipeline config JSON; defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Replace the configured model with a preset architecture.
        #[arg(long, value_enum)]
        architecture: Option<Architecture>,
    },

    /// Predict grades with a saved ensemble.
    Predict {
        /// Ensemble JSON written by `run`.
        #[arg(long)]
        model: PathBuf,

        /// Annotation CSV with an `img_path` column.
        #[arg(long)]
        annotations: PathBuf,

        /// Directory the image paths are relative to.
        #[arg(long)]
        images: PathBuf,

        /// Output CSV.
        #[arg(long, default_value = "test_predictions.csv")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Architecture {
    Vgg16,
    Resnet34,
}

impl Architecture {
    fn model(self) -> ModelConfig {
        match self {
            Architecture::Vgg16 => ModelConfig::vgg16_attention(),
            Architecture::Resnet34 => ModelConfig::resnet34_attention(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config, architecture } => config
            .map(|path| PipelineConfig::load_json(path))
            .unwrap_or_else(|| Ok(PipelineConfig::default()))
            .and_then(|mut config| {
                if let Some(architecture) = architecture {
                    config.model = architecture.model();
                    config.validate()?;
                }
                run_pipeline(&config)
            })
            .map(|report| {
                println!("\nValidation (boosting): {}", report.validation);
                if let Some(path) = report.predictions_path {
                    println!("Predictions written to {}", path.display());
                }
            }),

        Command::Predict { model, annotations, images, output } => {
            predict_with_ensemble(&model, &annotations, &images, &output)
                .map(|rows| println!("Wrote {} predictions to {}", rows, output.display()))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
