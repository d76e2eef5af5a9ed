//! Pose estimation orchestration
//!
//! Ties the frame source, geometric transforms, and inference engine together
//! into per-video prediction runs with progress reporting and persisted
//! results. See [`PosePipeline`] for the run lifecycle.

pub mod pipeline;
pub mod progress;

pub use pipeline::{PipelineConfig, PosePipeline};
pub use progress::{NoopProgress, ProgressReporter};
