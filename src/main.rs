//! Mood Inference CLI
//!
//! Loads a trained artifact, predicts the mood on one image and prints the
//! canonical result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use moodcam::config::Config;
use moodcam::engine::{FaceLocator, ModelArtifact, Predictor};
use moodcam::utils::image::decode_image;

#[derive(Parser, Debug)]
#[command(version, about = "Predict the mood on a face image")]
struct Args {
    /// Image file to classify
    #[arg(long)]
    image: PathBuf,

    /// Explicit model artifact path (otherwise the models directory is probed)
    #[arg(long)]
    model: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args = Args::parse();

    info!("Starting mood inference v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(&path.to_string_lossy())
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load(Config::default_path()).unwrap_or_else(|e| {
            info!("Using default config ({})", e);
            Config::default()
        }),
    };

    // Load the model artifact
    let artifact = ModelArtifact::load(&config, args.model.as_deref())?;
    info!("Artifact kind: {}", artifact.kind().as_str());

    let locator = FaceLocator::new(&config.locator.cascade);
    let predictor = Predictor::new(locator, Some(Arc::new(artifact)));

    // Read and decode the input image
    let data = std::fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;
    let image = decode_image(&data)?;

    let result = predictor.predict(&image)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
