//! ONNX-backed facemap network
//!
//! Two artifacts make up a model: a descriptor JSON naming the keypoints and
//! input channel count (`facemap_model_params.json`) and the ONNX weight
//! graph (`facemap_model_state.onnx`). Both live in a model directory
//! resolved from an explicit path, the `FACEMAP_MODEL_DIR` environment
//! variable, or `~/.facemap/models`, in that order.

use ndarray::{Array2, ArrayView4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use facemap_common::{ModelProvenance, PoseError, Result, MODEL_INPUT_SIZE};

use crate::{BatchPrediction, Device, KeypointModel};

/// Descriptor file name inside the model directory
pub const PARAMS_FILE: &str = "facemap_model_params.json";
/// Weight file name inside the model directory
pub const STATE_FILE: &str = "facemap_model_state.onnx";

/// Parameter-shape and keypoint-name descriptor stored next to the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Ordered keypoint names the network predicts
    pub bodyparts: Vec<String>,
    /// Input channel count (1 for grayscale)
    pub channels: usize,
}

/// Resolve the model directory convention.
///
/// Priority: explicit override, `FACEMAP_MODEL_DIR`, `$HOME/.facemap/models`.
pub fn resolve_model_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var("FACEMAP_MODEL_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(home) = std::env::var("HOME") {
        return Ok(Path::new(&home).join(".facemap").join("models"));
    }
    Err(PoseError::ModelNotFound(
        "no model directory: set FACEMAP_MODEL_DIR or HOME".to_string(),
    ))
}

/// The trained keypoint network, loaded into an ONNX Runtime session
pub struct FacemapModel {
    session: Session,
    descriptor: ModelDescriptor,
    provenance: ModelProvenance,
    device: Device,
}

impl FacemapModel {
    /// Load the pretrained model from the model directory convention
    pub fn load(model_dir: Option<&Path>, device: Device) -> Result<Self> {
        let dir = resolve_model_dir(model_dir)?;
        Self::from_files(
            &dir.join(PARAMS_FILE),
            &dir.join(STATE_FILE),
            ModelProvenance::Pretrained,
            device,
        )
    }

    /// Load explicit descriptor and weight files.
    ///
    /// A caller-supplied weight file is how fine-tuned parameter states come
    /// back into the pipeline, so provenance is part of the signature.
    pub fn from_files(
        params_path: &Path,
        state_path: &Path,
        provenance: ModelProvenance,
        device: Device,
    ) -> Result<Self> {
        for path in [params_path, state_path] {
            if !path.exists() {
                return Err(PoseError::ModelNotFound(path.display().to_string()));
            }
        }

        let params = std::fs::read_to_string(params_path)?;
        let descriptor: ModelDescriptor =
            serde_json::from_str(&params).map_err(|e| PoseError::ModelLoad {
                path: params_path.display().to_string(),
                reason: format!("invalid descriptor: {e}"),
            })?;
        if descriptor.bodyparts.is_empty() {
            return Err(PoseError::ModelLoad {
                path: params_path.display().to_string(),
                reason: "descriptor names no keypoints".to_string(),
            });
        }

        info!(
            path = %state_path.display(),
            keypoints = descriptor.bodyparts.len(),
            device = device.label(),
            provenance = provenance.label(),
            "loading keypoint model"
        );

        let session = Session::builder()
            .map_err(|e| session_error(state_path, &e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error(state_path, &e))?
            .with_intra_threads(num_cpus::get_physical())
            .map_err(|e| session_error(state_path, &e))?
            .with_memory_pattern(true)
            .map_err(|e| session_error(state_path, &e))?
            .with_execution_providers(device.execution_providers())
            .map_err(|e| device_error(device, &e))?
            .commit_from_file(state_path)
            .map_err(|e| {
                // A forced accelerator that is missing surfaces here, at load.
                if device == Device::Cuda {
                    device_error(device, &e)
                } else {
                    PoseError::ModelLoad {
                        path: state_path.display().to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        Ok(Self {
            session,
            descriptor,
            provenance,
            device,
        })
    }

    /// Device the session was created for
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }
}

fn session_error(path: &Path, e: &ort::Error) -> PoseError {
    PoseError::ModelLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn device_error(device: Device, e: &ort::Error) -> PoseError {
    PoseError::DeviceUnavailable(format!("{}: {e}", device.label()))
}

impl KeypointModel for FacemapModel {
    fn keypoint_names(&self) -> &[String] {
        &self.descriptor.bodyparts
    }

    fn channels(&self) -> usize {
        self.descriptor.channels
    }

    fn provenance(&self) -> ModelProvenance {
        self.provenance
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<BatchPrediction> {
        let (_, channels, height, width) = batch.dim();
        if channels != self.descriptor.channels
            || height != MODEL_INPUT_SIZE
            || width != MODEL_INPUT_SIZE
        {
            return Err(PoseError::Inference(format!(
                "expected [batch, {}, {MODEL_INPUT_SIZE}, {MODEL_INPUT_SIZE}] input, got {:?}",
                self.descriptor.channels,
                batch.shape()
            )));
        }

        let input = TensorRef::from_array_view(batch)
            .map_err(|e| PoseError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| PoseError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PoseError::Inference(format!("failed to extract heatmaps: {e}")))?;

        let dims = shape.as_ref();
        if dims.len() != 4 || dims[1] as usize != self.descriptor.bodyparts.len() {
            return Err(PoseError::Inference(format!(
                "expected [batch, {}, h, w] heatmaps, got {dims:?}",
                self.descriptor.bodyparts.len()
            )));
        }

        let heatmaps = ndarray::ArrayView4::from_shape(
            (
                dims[0] as usize,
                dims[1] as usize,
                dims[2] as usize,
                dims[3] as usize,
            ),
            data,
        )
        .map_err(|e| PoseError::Inference(format!("heatmap shape mismatch: {e}")))?;

        debug!(shape = ?dims, "extracted heatmaps");
        Ok(peaks_from_heatmaps(heatmaps))
    }
}

/// Reduce per-keypoint heatmaps to coordinate triples.
///
/// The peak cell of each heatmap becomes the keypoint location, rescaled from
/// heatmap resolution to model input space; the likelihood is the sigmoid of
/// the peak logit, guaranteeing the `[0, 1]` range.
fn peaks_from_heatmaps(heatmaps: ArrayView4<f32>) -> BatchPrediction {
    let (batch, n_keypoints, hm_h, hm_w) = heatmaps.dim();
    let scale_x = MODEL_INPUT_SIZE as f32 / hm_w as f32;
    let scale_y = MODEL_INPUT_SIZE as f32 / hm_h as f32;

    let mut x = Array2::<f32>::zeros((batch, n_keypoints));
    let mut y = Array2::<f32>::zeros((batch, n_keypoints));
    let mut likelihood = Array2::<f32>::zeros((batch, n_keypoints));

    for b in 0..batch {
        for k in 0..n_keypoints {
            let mut peak = f32::NEG_INFINITY;
            let (mut py, mut px) = (0usize, 0usize);
            for hy in 0..hm_h {
                for hx in 0..hm_w {
                    let v = heatmaps[[b, k, hy, hx]];
                    if v > peak {
                        peak = v;
                        py = hy;
                        px = hx;
                    }
                }
            }
            x[[b, k]] = px as f32 * scale_x;
            y[[b, k]] = py as f32 * scale_y;
            likelihood[[b, k]] = sigmoid(peak);
        }
    }

    BatchPrediction { x, y, likelihood }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}
