//! Model loading and keypoint inference
//!
//! Wraps the trained facial-keypoint network (an ONNX export) behind the
//! [`KeypointModel`] trait: a forward pass over a normalized `[batch, 1, 256,
//! 256]` input yields one `(x, y, likelihood)` triple per keypoint per frame.
//! How the network's output distribution becomes a coordinate triple is
//! private to this crate; callers treat it as opaque.
//!
//! Device selection happens once at load time and fails fast when a requested
//! accelerator is unavailable, never per batch.

pub mod device;
pub mod model;

pub use device::Device;
pub use model::{FacemapModel, ModelDescriptor, resolve_model_dir};

use ndarray::{Array2, ArrayView3, ArrayView4};

use facemap_common::{BoundingBox, ModelProvenance, Result};

/// Predicted keypoints for one batch: `[batch, keypoint]` arrays of x and y
/// in model input (256x256) coordinates plus a `[0, 1]` likelihood.
#[derive(Debug, Clone)]
pub struct BatchPrediction {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub likelihood: Array2<f32>,
}

/// A loaded keypoint network ready for inference.
///
/// Implementations never mutate their parameters during `predict`; a new
/// parameter state only ever arrives through a [`ModelTrainer`].
pub trait KeypointModel {
    /// Ordered keypoint names, defining output column order
    fn keypoint_names(&self) -> &[String];

    /// Input channel count the network expects (1 for grayscale)
    fn channels(&self) -> usize;

    /// Whether this parameter state is pretrained or fine-tuned
    fn provenance(&self) -> ModelProvenance;

    /// Run a forward pass on a normalized `[batch, channels, 256, 256]` batch
    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<BatchPrediction>;
}

/// Hyperparameters for a fine-tuning run
#[derive(Debug, Clone, Copy)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
}

/// Opaque fine-tuning entry point.
///
/// The pipeline's only contract with a trainer: after `train` returns, the
/// model's keypoint identity is whatever training defined and the model is
/// immediately usable for prediction.
pub trait ModelTrainer {
    /// Fine-tune on labeled data, producing a new model.
    ///
    /// `images` is `[sample, 1, height, width]`; `keypoints` is
    /// `[sample, keypoint, 2]` in raw frame coordinates.
    fn train(
        &mut self,
        images: ArrayView4<f32>,
        keypoints: ArrayView3<f32>,
        bbox: &BoundingBox,
        options: &TrainingOptions,
    ) -> Result<Box<dyn KeypointModel>>;
}
