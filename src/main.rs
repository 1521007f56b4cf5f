//! CLI entry point for sure-ei-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sure_ei_rs::checkpoint::latest_checkpoint;
use sure_ei_rs::losses::CompositeLoss;
use sure_ei_rs::physics::PhysicsOperator;
use sure_ei_rs::{Result, RunConfig, Trainer};

#[derive(Parser)]
#[command(name = "sure-ei")]
#[command(about = "Self-supervised training for deblurring and super-resolution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint
        #[arg(long, conflicts_with = "resume_latest")]
        resume: Option<String>,
        /// Resume from the newest checkpoint in the output directory
        #[arg(long)]
        resume_latest: bool,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (deblur-sure, sr-proposed, sr-r2r)
        #[arg(long, default_value = "sr-proposed")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = RunConfig::from_file(&config)?;
            config.validate()?;
            let device = config.device()?;
            let physics = PhysicsOperator::from_config(&config.physics, config.seed, &device)?;
            let loss = CompositeLoss::from_config(&config.loss, &physics, config.seed)?;
            println!("✓ Configuration is valid");
            println!("  Task: {:?}", config.physics.task);
            println!("  Method: {:?}", config.loss.method);
            println!("  Loss terms: {}", loss.term_names().join(" + "));
            println!("  Model evaluations per batch: {}", loss.evaluations_per_batch());
            println!("  Dataset: {}", config.dataset.path);
        }
        Commands::Train {
            config,
            resume,
            resume_latest,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = RunConfig::from_file(&config)?;
            let output_dir = PathBuf::from(&config.output_dir);

            let mut trainer = Trainer::from_config(config)?;
            let checkpoint = match resume {
                Some(path) => Some(PathBuf::from(path)),
                None if resume_latest => latest_checkpoint(&output_dir)?,
                None => None,
            };
            if let Some(checkpoint) = checkpoint {
                trainer.resume_from(checkpoint)?;
            }
            trainer.train()?;
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = RunConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
