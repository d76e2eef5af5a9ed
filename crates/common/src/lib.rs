/// Common types and utilities shared across the facemap pose pipeline
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the square input the keypoint network expects, in pixels.
pub const MODEL_INPUT_SIZE: usize = 256;

/// Errors surfaced by the pose pipeline
#[derive(Debug, Error)]
pub enum PoseError {
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("model file not found: {0}")]
    ModelNotFound(String),

    #[error("requested device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no video stream found in {0}")]
    NoVideoStream(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("failed to fetch frames {first}..={last} from video {video}: {reason}")]
    FrameFetch {
        video: String,
        first: usize,
        last: usize,
        reason: String,
    },

    #[error("frame index {index} out of range ({total} frames available)")]
    FrameIndexOutOfRange { index: usize, total: usize },

    #[error("video index {index} out of range ({total} videos in set)")]
    VideoIndexOutOfRange { index: usize, total: usize },

    #[error("invalid bounding box {bbox}: {reason}")]
    InvalidBoundingBox { bbox: String, reason: String },

    #[error("pipeline is not set up: call setup() before predicting")]
    NotReady,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PoseError>;

/// Per-video crop rectangle in raw frame coordinates.
///
/// `x` runs along the width axis, `y` along the height axis. The region fed
/// to the model is `[y1, y2) x [x1, x2)`. Invariant: `x2 > x1 && y2 > y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub x2: f64,
    pub y1: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Create a bounding box, rejecting degenerate rectangles
    pub fn new(x1: f64, x2: f64, y1: f64, y2: f64) -> Result<Self> {
        let bbox = Self { x1, x2, y1, y2 };
        if x2 <= x1 || y2 <= y1 {
            return Err(PoseError::InvalidBoundingBox {
                bbox: format!("{bbox}"),
                reason: "x2 must exceed x1 and y2 must exceed y1".to_string(),
            });
        }
        Ok(bbox)
    }

    /// Bounding box covering an entire frame of the given dimensions
    #[must_use]
    pub fn full_frame(height: usize, width: usize) -> Self {
        Self {
            x1: 0.0,
            x2: width as f64,
            y1: 0.0,
            y2: height as f64,
        }
    }

    /// Crop width in pixels
    #[must_use]
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    /// Crop height in pixels
    #[must_use]
    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Whether the crop region is square
    #[must_use]
    pub fn is_square(&self) -> bool {
        (self.width() - self.height()).abs() < f64::EPSILON
    }

    /// Check that the box lies inside a frame of the given dimensions
    pub fn validate_within(&self, height: usize, width: usize) -> Result<()> {
        if self.x1 < 0.0 || self.y1 < 0.0 || self.x2 > width as f64 || self.y2 > height as f64 {
            return Err(PoseError::InvalidBoundingBox {
                bbox: format!("{self}"),
                reason: format!("outside frame bounds {height}x{width}"),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[x1={}, x2={}, y1={}, y2={}]",
            self.x1, self.x2, self.y1, self.y2
        )
    }
}

/// Whether a model carries the pretrained weights or fine-tuned ones.
///
/// Consulted wherever output naming or logging differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelProvenance {
    Pretrained,
    Finetuned,
}

impl ModelProvenance {
    /// File stem suffix for the prediction table
    #[must_use]
    pub fn table_suffix(&self) -> &'static str {
        match self {
            ModelProvenance::Pretrained => "_FacemapPose",
            ModelProvenance::Finetuned => "_FacemapPoseFinetuned",
        }
    }

    /// File stem suffix for the run metadata record
    #[must_use]
    pub fn metadata_suffix(&self) -> &'static str {
        match self {
            ModelProvenance::Pretrained => "_Facemap_metadata",
            ModelProvenance::Finetuned => "_FacemapFinetuned_metadata",
        }
    }

    /// Human-readable label for log messages
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ModelProvenance::Pretrained => "pretrained",
            ModelProvenance::Finetuned => "fine-tuned",
        }
    }
}

/// Record describing one completed prediction run, persisted alongside the
/// prediction table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Frames per inference batch
    pub batch_size: usize,
    /// Raw frame dimensions (height, width) of the processed video
    pub image_size: (usize, usize),
    /// Bounding box used for the run
    pub bbox: BoundingBox,
    /// Number of frames processed
    pub total_frames: usize,
    /// Ordered keypoint names, matching table column order
    pub keypoint_names: Vec<String>,
    /// Throughput in frames per second, excluding frame fetch I/O
    pub inference_speed: f64,
}
