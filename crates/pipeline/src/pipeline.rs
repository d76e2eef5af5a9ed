//! Pose pipeline orchestrator
//!
//! Owns the bounding-box state and drives the per-video batch loop: fetch raw
//! frames, normalize into model input space, infer, map predicted coordinates
//! back to raw frame space, accumulate into the prediction buffer. One
//! logical thread of control per video; batches run strictly sequentially.

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use facemap_common::{
    BoundingBox, ModelProvenance, PoseError, Result, RunMetadata, MODEL_INPUT_SIZE,
};
use facemap_inference::{
    Device, FacemapModel, KeypointModel, ModelTrainer, TrainingOptions,
};
use facemap_output::{metadata_path, save_metadata, save_table, table_path, PoseTable};
use facemap_transforms::{adjust_keypoints, preprocess_batch, TransformPlan};
use facemap_video::FrameSource;

use crate::progress::{NoopProgress, ProgressReporter};

/// Tunables fixed at pipeline construction
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames per inference batch. The default of 1 is conservative for
    /// device memory; raise it when the device allows.
    pub batch_size: usize,
    /// Compute device, resolved once and passed down
    pub device: Device,
    /// Model directory override; `None` uses the model directory convention
    pub model_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            device: Device::Auto,
            model_dir: None,
        }
    }
}

/// Orchestrates pose prediction over a set of videos.
///
/// Lifecycle: construct, optionally [`set_bboxes`](Self::set_bboxes), then
/// [`setup`](Self::setup) (idempotent) before any prediction. `&mut self` on
/// both prediction and training keeps the two mutually exclusive on a given
/// model instance.
pub struct PosePipeline {
    source: Box<dyn FrameSource>,
    model: Option<Box<dyn KeypointModel>>,
    progress: Arc<dyn ProgressReporter>,
    config: PipelineConfig,
    bboxes: Vec<BoundingBox>,
    add_padding: bool,
    resize: bool,
    bbox_set: bool,
    ready: bool,
}

impl PosePipeline {
    /// Pipeline that loads the pretrained model during [`setup`](Self::setup)
    #[must_use]
    pub fn new(source: Box<dyn FrameSource>, config: PipelineConfig) -> Self {
        Self {
            source,
            model: None,
            progress: Arc::new(NoopProgress),
            config,
            bboxes: Vec::new(),
            add_padding: false,
            resize: false,
            bbox_set: false,
            ready: false,
        }
    }

    /// Pipeline around an already-loaded model
    #[must_use]
    pub fn with_model(
        source: Box<dyn FrameSource>,
        model: Box<dyn KeypointModel>,
        config: PipelineConfig,
    ) -> Self {
        let mut pipeline = Self::new(source, config);
        pipeline.model = Some(model);
        pipeline
    }

    /// Attach a progress reporter (defaults to the no-op reporter)
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Supply user-chosen bounding boxes, one per video, before setup.
    ///
    /// Replaces the auto-derived full-frame boxes; normalization flags are
    /// recomputed from the supplied boxes.
    pub fn set_bboxes(&mut self, bboxes: Vec<BoundingBox>) -> Result<()> {
        if bboxes.len() != self.source.n_videos() {
            return Err(PoseError::InvalidBoundingBox {
                bbox: format!("{} boxes", bboxes.len()),
                reason: format!("expected one per video ({})", self.source.n_videos()),
            });
        }
        self.add_padding = false;
        self.resize = false;
        for bbox in &bboxes {
            let plan = TransformPlan::for_bbox(bbox);
            self.add_padding |= plan.needs_padding;
            self.resize |= plan.needs_resize;
        }
        self.bboxes = bboxes;
        self.bbox_set = true;
        self.ready = false;
        Ok(())
    }

    /// Prepare for prediction: load the model if absent, derive full-frame
    /// bounding boxes if none were supplied, and validate every box against
    /// its video's dimensions. Idempotent.
    pub fn setup(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }

        if self.model.is_none() {
            let model =
                FacemapModel::load(self.config.model_dir.as_deref(), self.config.device)?;
            self.model = Some(Box::new(model));
        }

        if !self.bbox_set {
            for &(height, width) in self.source.dimensions() {
                let bbox = BoundingBox::full_frame(height, width);
                let plan = TransformPlan::for_bbox(&bbox);
                self.add_padding |= plan.needs_padding;
                self.resize |= plan.needs_resize;
                self.bboxes.push(bbox);
            }
            self.bbox_set = true;
            self.progress.update_message(
                &format!(
                    "No bbox set. Using entire frame view with resize={}",
                    self.resize
                ),
                true,
            );
        }

        // Fail fast on inconsistent boxes rather than mid-batch.
        for (video_id, bbox) in self.bboxes.iter().enumerate() {
            let (height, width) = self.source.dimensions()[video_id];
            bbox.validate_within(height, width)?;
        }

        self.ready = true;
        Ok(())
    }

    /// Predict keypoints for one video, or for an explicit set of global
    /// frame indices.
    ///
    /// Returns the filled `[frame, keypoint, {x, y, likelihood}]` buffer and
    /// the run metadata. The inference-speed figure counts preprocessing,
    /// the forward pass, and coordinate adjustment, but not frame fetch I/O.
    pub fn predict_video(
        &mut self,
        video_id: usize,
        frame_indices: Option<&[usize]>,
    ) -> Result<(Array3<f32>, RunMetadata)> {
        if !self.ready {
            return Err(PoseError::NotReady);
        }
        if video_id >= self.source.n_videos() {
            return Err(PoseError::VideoIndexOutOfRange {
                index: video_id,
                total: self.source.n_videos(),
            });
        }
        let model = self.model.as_mut().ok_or(PoseError::NotReady)?;

        let cumframes = self.source.cumulative_frames();
        let video_range: Vec<usize> = (cumframes[video_id]..cumframes[video_id + 1]).collect();
        let frames: &[usize] = match frame_indices {
            Some(indices) => indices,
            None => &video_range,
        };
        let total_frames = frames.len();

        let bbox = self.bboxes[video_id];
        let (height, width) = self.source.dimensions()[video_id];
        let n_keypoints = model.keypoint_names().len();
        let batch_size = self.config.batch_size.max(1);

        debug!(
            video_id,
            total_frames,
            batch_size,
            %bbox,
            resize = self.resize,
            padding = self.add_padding,
            "starting prediction run"
        );

        let mut predictions = Array3::<f32>::zeros((total_frames, n_keypoints, 3));
        let mut raw = Array4::<f32>::zeros((batch_size, 1, height, width));
        let mut inference_time = Duration::ZERO;

        // Report after roughly every 5% of frames, not every batch.
        let report_every = ((total_frames as f64 * 0.05).floor() as usize).max(1);

        let mut start = 0;
        while start < total_frames {
            let end = (start + batch_size).min(total_frames);
            let batch_indices = &frames[start..end];
            let batch_len = batch_indices.len();

            self.source.read_frames(
                batch_indices,
                raw.slice_mut(s![..batch_len, .., .., ..]),
            )?;

            let t0 = Instant::now();

            let (normalized, geometry) = preprocess_batch(
                raw.slice(s![..batch_len, .., .., ..]),
                &bbox,
                self.add_padding,
                self.resize,
            )?;

            let prediction = model.predict(normalized.view())?;

            let (xs, ys) = adjust_keypoints(
                prediction.x.view(),
                prediction.y.view(),
                &geometry,
                (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
            );

            inference_time += t0.elapsed();

            for (i, row) in (start..end).enumerate() {
                for k in 0..n_keypoints {
                    predictions[[row, k, 0]] = xs[[i, k]];
                    predictions[[row, k, 1]] = ys[[i, k]];
                    predictions[[row, k, 2]] = prediction.likelihood[[i, k]];
                }
            }

            if end == total_frames || end % report_every == 0 {
                self.progress.update_progress_bar(
                    end as f64 / total_frames as f64,
                    "Pose prediction progress",
                );
            }

            start = end;
        }

        let inference_speed = if inference_time.as_secs_f64() > 0.0 {
            total_frames as f64 / inference_time.as_secs_f64()
        } else {
            0.0
        };
        info!(video_id, inference_speed, "prediction run complete");

        let metadata = RunMetadata {
            batch_size,
            image_size: (height, width),
            bbox,
            total_frames,
            keypoint_names: model.keypoint_names().to_vec(),
            inference_speed,
        };
        Ok((predictions, metadata))
    }

    /// Run setup, then predict and persist every video in the set
    /// sequentially, returning the saved table paths.
    ///
    /// Failure policy: abort-all. The first failing video stops the run with
    /// an error naming that video; tables already persisted for earlier
    /// videos are left on disk untouched.
    pub fn run_all(&mut self, output_dir: &Path) -> Result<Vec<PathBuf>> {
        self.setup()?;
        let start_time = Instant::now();

        if self.provenance() == Some(ModelProvenance::Finetuned) {
            info!("using fine-tuned model for pose estimation");
        }

        let mut saved = Vec::with_capacity(self.source.n_videos());
        for video_id in 0..self.source.n_videos() {
            let video_path = self.source.video_path(video_id).to_path_buf();
            self.progress.update_message(
                &format!("Processing video: {}", video_path.display()),
                true,
            );

            let (predictions, metadata) = self.predict_video(video_id, None)?;
            let provenance = self
                .provenance()
                .expect("model is loaded after setup");

            let table = PoseTable::from_predictions(
                predictions.view(),
                &metadata.keypoint_names,
                None,
            )?;
            let table_file = table_path(output_dir, &video_path, provenance);
            save_table(&table, &table_file)?;
            save_metadata(&metadata, &metadata_path(&table_file, provenance))?;

            self.progress.update_message(
                &format!("Saved pose prediction outputs to: {}", table_file.display()),
                true,
            );
            info!(video_id, path = %table_file.display(), "saved pose predictions");
            saved.push(table_file);
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        info!(elapsed, "pose estimation finished");
        self.progress.update_message(
            &format!("Pose estimation time elapsed: {elapsed:.1} seconds"),
            true,
        );
        Ok(saved)
    }

    /// Predict a subset of frames for quick preview; results are returned,
    /// never persisted.
    ///
    /// Without explicit indices, samples `total_frames / 10` distinct global
    /// frame indices uniformly at random and processes them in ascending
    /// order against video 0's bounding box.
    pub fn run_subset(
        &mut self,
        frame_indices: Option<Vec<usize>>,
    ) -> Result<(Array3<f32>, Vec<usize>, Vec<BoundingBox>)> {
        self.setup()?;

        let indices = match frame_indices {
            Some(indices) => indices,
            None => {
                let total = self.source.total_frames();
                let mut indices =
                    rand::seq::index::sample(&mut rand::thread_rng(), total, total / 10)
                        .into_vec();
                indices.sort_unstable();
                indices
            }
        };

        let (predictions, _) = self.predict_video(0, Some(&indices))?;
        Ok((predictions, indices, self.bboxes.clone()))
    }

    /// Fine-tune the model through an opaque trainer.
    ///
    /// After this returns the pipeline predicts with the trainer's output
    /// model; its keypoint identity is whatever training defined.
    pub fn train(
        &mut self,
        trainer: &mut dyn ModelTrainer,
        images: ArrayView4<f32>,
        keypoints: ArrayView3<f32>,
        options: &TrainingOptions,
    ) -> Result<()> {
        self.setup()?;
        let bbox = self.bboxes[0];
        let model = trainer.train(images, keypoints, &bbox, options)?;
        self.model = Some(model);
        info!("model fine-tuning complete");
        Ok(())
    }

    /// Bounding boxes in use (empty before setup unless supplied)
    #[must_use]
    pub fn bboxes(&self) -> &[BoundingBox] {
        &self.bboxes
    }

    /// Provenance of the loaded model, if one is loaded
    #[must_use]
    pub fn provenance(&self) -> Option<ModelProvenance> {
        self.model.as_ref().map(|m| m.provenance())
    }

    /// Ordered keypoint names of the loaded model, if one is loaded
    #[must_use]
    pub fn keypoint_names(&self) -> Option<&[String]> {
        self.model.as_deref().map(KeypointModel::keypoint_names)
    }
}
