//! Facemap CLI - animal facial keypoint tracking from video
//!
//! Command-line front end for the pose pipeline: full prediction runs with
//! persisted tables, and quick subset previews.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use facemap_common::BoundingBox;
use facemap_inference::Device;
use facemap_pose::{PipelineConfig, PosePipeline, ProgressReporter};
use facemap_video::VideoSet;

#[derive(Parser)]
#[command(
    name = "facemap",
    version,
    about = "Animal facial keypoint tracking from video",
    after_help = "EXAMPLES:\n  \
                  # Predict keypoints for every frame of one or more videos\n  \
                  facemap predict cam1.avi cam2.avi --output-dir ./results\n\n  \
                  # Restrict the model to a crop region (one --bbox per video)\n  \
                  facemap predict cam1.avi --bbox 100,356,50,306\n\n  \
                  # Quick preview on a random tenth of the frames\n  \
                  facemap preview cam1.avi"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict keypoints for every frame and persist tables + metadata
    Predict {
        /// Input video files, processed sequentially
        videos: Vec<PathBuf>,

        /// Directory the prediction tables are written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Crop region as x1,x2,y1,y2 (repeat once per video; defaults to
        /// the full frame)
        #[arg(long)]
        bbox: Vec<String>,

        /// Model directory (defaults to FACEMAP_MODEL_DIR or
        /// ~/.facemap/models)
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Frames per inference batch
        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// Compute device
        #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
        device: DeviceArg,
    },

    /// Predict a random subset of frames and print summary statistics
    Preview {
        /// Input video files
        videos: Vec<PathBuf>,

        /// Model directory (defaults to FACEMAP_MODEL_DIR or
        /// ~/.facemap/models)
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Compute device
        #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
        device: DeviceArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Auto,
    Cuda,
    Cpu,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => Device::Auto,
            DeviceArg::Cuda => Device::Cuda,
            DeviceArg::Cpu => Device::Cpu,
        }
    }
}

/// Progress reporter printing to stderr
struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn update_message(&self, text: &str, _hide_progress_bar: bool) {
        eprintln!("{text}");
    }

    fn update_progress_bar(&self, fraction: f64, label: &str) {
        eprintln!("{label}: {:.0}%", fraction * 100.0);
    }
}

/// Parse `x1,x2,y1,y2` into a bounding box
fn parse_bbox(spec: &str) -> Result<BoundingBox> {
    let parts: Vec<f64> = spec
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("invalid bbox '{spec}'"))?;
    if parts.len() != 4 {
        bail!("bbox '{spec}' must have exactly four values: x1,x2,y1,y2");
    }
    Ok(BoundingBox::new(parts[0], parts[1], parts[2], parts[3])?)
}

fn build_pipeline(
    videos: &[PathBuf],
    model_dir: Option<PathBuf>,
    batch_size: usize,
    device: DeviceArg,
) -> Result<PosePipeline> {
    if videos.is_empty() {
        bail!("no input videos given");
    }
    let source = VideoSet::open(videos)?;
    let config = PipelineConfig {
        batch_size,
        device: device.into(),
        model_dir,
    };
    Ok(PosePipeline::new(Box::new(source), config)
        .with_progress(Arc::new(StderrProgress)))
}

fn run_predict(
    videos: Vec<PathBuf>,
    output_dir: PathBuf,
    bbox_specs: Vec<String>,
    model_dir: Option<PathBuf>,
    batch_size: usize,
    device: DeviceArg,
) -> Result<()> {
    let mut pipeline = build_pipeline(&videos, model_dir, batch_size, device)?;

    if !bbox_specs.is_empty() {
        let bboxes = bbox_specs
            .iter()
            .map(|spec| parse_bbox(spec))
            .collect::<Result<Vec<_>>>()?;
        pipeline.set_bboxes(bboxes)?;
    }

    let saved = pipeline.run_all(&output_dir)?;
    for path in saved {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_preview(
    videos: Vec<PathBuf>,
    model_dir: Option<PathBuf>,
    device: DeviceArg,
) -> Result<()> {
    let mut pipeline = build_pipeline(&videos, model_dir, 1, device)?;
    let (predictions, indices, bboxes) = pipeline.run_subset(None)?;

    let (frames, keypoints, _) = predictions.dim();
    let mut likelihood_sum = 0.0f64;
    for frame in 0..frames {
        for keypoint in 0..keypoints {
            likelihood_sum += f64::from(predictions[[frame, keypoint, 2]]);
        }
    }
    let mean_likelihood = if frames * keypoints > 0 {
        likelihood_sum / (frames * keypoints) as f64
    } else {
        0.0
    };

    let summary = serde_json::json!({
        "frames_sampled": frames,
        "frame_indices": indices,
        "keypoints": pipeline.keypoint_names(),
        "bbox": bboxes.first(),
        "mean_likelihood": mean_likelihood,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to initialize logging")?;

    match cli.command {
        Commands::Predict {
            videos,
            output_dir,
            bbox,
            model_dir,
            batch_size,
            device,
        } => run_predict(videos, output_dir, bbox, model_dir, batch_size, device),
        Commands::Preview {
            videos,
            model_dir,
            device,
        } => run_preview(videos, model_dir, device),
    }
}
