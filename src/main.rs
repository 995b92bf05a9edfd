//! Deepfake detection command line front end.

use anyhow::{Context, Result};
use clap::Parser;
use deepfake_detection::config::Config;
use deepfake_detection::explain::{explain_frame, Explanations};
use deepfake_detection::predictor::{Prediction, Predictor, Verdict};
use deepfake_detection::render;
use image::RgbImage;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video file, or directory of frame images
    #[arg(short, long)]
    video: PathBuf,

    /// Path to configuration file (YAML format)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Directory for the explanation images
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Override the number of sampled frames
    #[arg(short, long)]
    frames: Option<usize>,

    /// Skip the explainers
    #[arg(long)]
    no_explain: bool,

    /// Embed explanation images in the report as base64 PNG
    #[arg(long)]
    embed_images: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

#[derive(Serialize)]
struct Report {
    prediction: String,
    confidence: f32,
    frames: usize,
    degraded_frames: usize,
    scores: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gradcam: Option<ExplainerReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lime: Option<ExplainerReport>,
}

#[derive(Serialize)]
struct ExplainerReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExplainerReport {
    fn failed(error: impl ToString) -> Self {
        Self {
            path: None,
            image: None,
            error: Some(error.to_string()),
        }
    }
}

fn save_explanation(image: &RgbImage, path: &Path, embed: bool) -> ExplainerReport {
    let saved = render::save_png(image, path);
    let encoded = if embed { Some(render::to_base64_png(image)) } else { None };

    match (saved, encoded.transpose()) {
        (Ok(()), Ok(image)) => {
            info!("Wrote {}", path.display());
            ExplainerReport {
                path: Some(path.to_path_buf()),
                image,
                error: None,
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("Could not save {}: {}", path.display(), e);
            ExplainerReport::failed(e)
        }
    }
}

fn explanation_reports(explanations: Explanations, output_dir: &Path, embed: bool) -> (ExplainerReport, ExplainerReport) {
    let gradcam = match explanations.saliency.and_then(|heatmap| render::heatmap_to_rgb(&heatmap)) {
        Ok(image) => save_explanation(&image, &output_dir.join("saliency.png"), embed),
        Err(e) => ExplainerReport::failed(e),
    };

    let lime = match explanations
        .perturbation
        .and_then(|explanation| render::overlay_to_rgb(&explanation.overlay))
    {
        Ok(image) => save_explanation(&image, &output_dir.join("perturbation.png"), embed),
        Err(e) => ExplainerReport::failed(e),
    };

    (gradcam, lime)
}

fn build_report(verdict: &Verdict) -> Report {
    Report {
        prediction: verdict.label.to_string(),
        confidence: verdict.confidence,
        frames: verdict.frames(),
        degraded_frames: verdict.degraded_frames,
        scores: verdict.scores.clone(),
        gradcam: None,
        lime: None,
    }
}

/// Exit status when no frame contained a usable face
const EXIT_NO_SIGNAL: u8 = 2;
/// Exit status when the video could not be opened
const EXIT_SOURCE_UNAVAILABLE: u8 = 3;

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.debug {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("debug"));
    } else {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    }

    info!("Deepfake Detection");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(frames) = args.frames {
        config.sampling.frame_count = frames;
    }
    config.validate()?;

    let ensemble = Arc::new(config.load_ensemble().context("Failed to load ensemble")?);
    let predictor = Predictor::new(
        ensemble.clone(),
        config.create_sampler(),
        config.create_localizer(),
        config.create_normalizer(),
        config.predictor_settings(),
    );

    let verdict = match predictor.predict_video(&args.video)? {
        Prediction::Verdict(verdict) => verdict,
        Prediction::NoSignal => {
            eprintln!("No faces detected");
            return Ok(ExitCode::from(EXIT_NO_SIGNAL));
        }
        Prediction::SourceUnavailable(reason) => {
            eprintln!("Could not open video: {reason}");
            return Ok(ExitCode::from(EXIT_SOURCE_UNAVAILABLE));
        }
    };

    let mut report = build_report(&verdict);
    if !args.no_explain {
        if let Some(face) = verdict.representative_face() {
            std::fs::create_dir_all(&args.output_dir)
                .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
            let explanations = explain_frame(ensemble.as_ref(), face, &config.explain);
            let (gradcam, lime) = explanation_reports(explanations, &args.output_dir, args.embed_images);
            report.gradcam = Some(gradcam);
            report.lime = Some(lime);
        }
    }

    print!("{}", serde_yaml::to_string(&report)?);
    Ok(ExitCode::SUCCESS)
}
