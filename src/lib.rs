//! # sure-ei-rs
//!
//! Self-supervised training of image restoration networks.
//!
//! Networks for deblurring and super-resolution are trained from noisy,
//! degraded measurements alone, combining Stein's Unbiased Risk Estimate
//! (SURE) with equivariant imaging (EI) losses. Supervised baselines are
//! available for comparison.
//!
//! ## Features
//!
//! - **Physics** - circular blur and anti-aliased downsampling with
//!   additive Gaussian noise, including adjoints
//! - **Losses** - supervised, SURE with a Monte-Carlo divergence, EI over
//!   rotations, shifts and rescalings, R2R-EI, and their weighted sums
//! - **Training** - Adam with multi-step decay, resumable checkpoints
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! sure-ei init config.yaml --preset sr-proposed
//!
//! # Validate configuration
//! sure-ei validate config.yaml
//!
//! # Start training
//! sure-ei train config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use sure_ei_rs::{RunConfig, Trainer};
//!
//! # fn main() -> sure_ei_rs::Result<()> {
//! let mut config = RunConfig::from_preset("sr-proposed")?;
//! config.training.epochs = 50;
//! config.dataset.path = "./data/div2k.safetensors".into();
//!
//! let mut trainer = Trainer::from_config(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod losses;
pub mod model;
pub mod optimizer;
pub mod physics;
pub mod scheduler;
pub mod trainer;

pub use config::{LossConfig, PhysicsConfig, RunConfig, TrainingConfig};
pub use error::{RestoreError, Result};
pub use losses::{CompositeLoss, EstimateMode, LossFunction};
pub use model::RestorationModel;
pub use physics::PhysicsOperator;
pub use trainer::{EpochRecord, Trainer};
