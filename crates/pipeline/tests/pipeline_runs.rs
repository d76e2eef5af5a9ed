//! End-to-end pipeline behavior against synthetic sources and a
//! deterministic fake model: no video files or ONNX weights required.

use ndarray::{Array2, ArrayView3, ArrayView4, ArrayViewMut4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use facemap_common::{BoundingBox, ModelProvenance, PoseError, Result};
use facemap_inference::{BatchPrediction, KeypointModel, ModelTrainer, TrainingOptions};
use facemap_pose::{PipelineConfig, PosePipeline, ProgressReporter};
use facemap_video::{locate, FrameSource};

/// Frame source producing deterministic gradients, optionally failing for
/// one video to exercise error paths.
struct SyntheticSource {
    dims: Vec<(usize, usize)>,
    cumframes: Vec<usize>,
    paths: Vec<PathBuf>,
    fail_video: Option<usize>,
}

impl SyntheticSource {
    fn new(frame_counts: &[usize], height: usize, width: usize) -> Self {
        let mut cumframes = vec![0];
        for &count in frame_counts {
            cumframes.push(cumframes.last().unwrap() + count);
        }
        Self {
            dims: vec![(height, width); frame_counts.len()],
            cumframes,
            paths: (0..frame_counts.len())
                .map(|i| PathBuf::from(format!("video{i}.avi")))
                .collect(),
            fail_video: None,
        }
    }

    fn failing_on(mut self, video: usize) -> Self {
        self.fail_video = Some(video);
        self
    }
}

impl FrameSource for SyntheticSource {
    fn n_videos(&self) -> usize {
        self.dims.len()
    }

    fn dimensions(&self) -> &[(usize, usize)] {
        &self.dims
    }

    fn cumulative_frames(&self) -> &[usize] {
        &self.cumframes
    }

    fn video_path(&self, video_id: usize) -> &Path {
        &self.paths[video_id]
    }

    fn read_frames(&mut self, global_indices: &[usize], mut out: ArrayViewMut4<f32>) -> Result<()> {
        for (i, &global) in global_indices.iter().enumerate() {
            let (video, _) = locate(&self.cumframes, global)?;
            if self.fail_video == Some(video) {
                return Err(PoseError::FrameFetch {
                    video: self.paths[video].display().to_string(),
                    first: global,
                    last: global,
                    reason: "synthetic decode failure".to_string(),
                });
            }
            let (height, width) = (out.shape()[2], out.shape()[3]);
            for y in 0..height {
                for x in 0..width {
                    out[[i, 0, y, x]] = ((global * 31 + y * 7 + x) % 256) as f32 / 255.0;
                }
            }
        }
        Ok(())
    }
}

/// Model whose predictions are a pure function of the input pixels
struct FakeModel {
    names: Vec<String>,
    provenance: ModelProvenance,
}

impl FakeModel {
    fn pretrained() -> Self {
        Self {
            names: vec![
                "eye(back)".to_string(),
                "nose(tip)".to_string(),
                "whisker(I)".to_string(),
            ],
            provenance: ModelProvenance::Pretrained,
        }
    }
}

impl KeypointModel for FakeModel {
    fn keypoint_names(&self) -> &[String] {
        &self.names
    }

    fn channels(&self) -> usize {
        1
    }

    fn provenance(&self) -> ModelProvenance {
        self.provenance
    }

    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<BatchPrediction> {
        let (n, _, height, width) = batch.dim();
        let k = self.names.len();
        let mut x = Array2::<f32>::zeros((n, k));
        let mut y = Array2::<f32>::zeros((n, k));
        let mut likelihood = Array2::<f32>::zeros((n, k));
        for i in 0..n {
            let seed = batch[[i, 0, height / 2, width / 2]] + batch[[i, 0, 0, 0]];
            for j in 0..k {
                x[[i, j]] = 20.0 * (j as f32 + 1.0) + seed;
                y[[i, j]] = 10.0 * (j as f32 + 1.0) + seed;
                likelihood[[i, j]] = 0.25 + 0.1 * j as f32;
            }
        }
        Ok(BatchPrediction { x, y, likelihood })
    }
}

struct FakeTrainer;

impl ModelTrainer for FakeTrainer {
    fn train(
        &mut self,
        _images: ArrayView4<f32>,
        _keypoints: ArrayView3<f32>,
        _bbox: &BoundingBox,
        _options: &TrainingOptions,
    ) -> Result<Box<dyn KeypointModel>> {
        Ok(Box::new(FakeModel {
            names: vec!["eye(back)".to_string(), "nose(tip)".to_string()],
            provenance: ModelProvenance::Finetuned,
        }))
    }
}

#[derive(Default)]
struct CountingProgress {
    bar_updates: AtomicUsize,
    messages: AtomicUsize,
}

impl ProgressReporter for CountingProgress {
    fn update_message(&self, _text: &str, _hide_progress_bar: bool) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    fn update_progress_bar(&self, _fraction: f64, _label: &str) {
        self.bar_updates.fetch_add(1, Ordering::Relaxed);
    }
}

fn pipeline(frame_counts: &[usize], batch_size: usize) -> PosePipeline {
    let source = Box::new(SyntheticSource::new(frame_counts, 48, 64));
    let config = PipelineConfig {
        batch_size,
        ..PipelineConfig::default()
    };
    PosePipeline::with_model(source, Box::new(FakeModel::pretrained()), config)
}

#[test]
fn predict_before_setup_is_rejected() {
    let mut pipeline = pipeline(&[10], 1);
    assert!(matches!(
        pipeline.predict_video(0, None),
        Err(PoseError::NotReady)
    ));
}

#[test]
fn setup_derives_full_frame_bboxes_once() {
    let mut pipeline = pipeline(&[10, 20], 1);
    pipeline.setup().unwrap();
    assert_eq!(pipeline.bboxes().len(), 2);
    assert_eq!(pipeline.bboxes()[0], BoundingBox::full_frame(48, 64));

    // Idempotent: a second setup must not grow the bbox list.
    pipeline.setup().unwrap();
    assert_eq!(pipeline.bboxes().len(), 2);
}

#[test]
fn set_bboxes_requires_one_per_video() {
    let mut pipeline = pipeline(&[10, 20], 1);
    let result = pipeline.set_bboxes(vec![BoundingBox::full_frame(48, 64)]);
    assert!(matches!(result, Err(PoseError::InvalidBoundingBox { .. })));
}

#[test]
fn bbox_outside_frame_fails_at_setup() {
    let mut pipeline = pipeline(&[10], 1);
    pipeline
        .set_bboxes(vec![BoundingBox::new(0.0, 128.0, 0.0, 48.0).unwrap()])
        .unwrap();
    assert!(matches!(
        pipeline.setup(),
        Err(PoseError::InvalidBoundingBox { .. })
    ));
}

#[test]
fn out_of_range_video_id_is_rejected() {
    let mut pipeline = pipeline(&[10, 20], 1);
    pipeline.setup().unwrap();
    assert!(matches!(
        pipeline.predict_video(2, None),
        Err(PoseError::VideoIndexOutOfRange { index: 2, total: 2 })
    ));
}

#[test]
fn prediction_buffer_shape_matches_request() {
    let mut pipeline = pipeline(&[12], 5);
    pipeline.setup().unwrap();
    let (predictions, metadata) = pipeline.predict_video(0, None).unwrap();
    // 3 keypoints, 12 frames, trailing partial batch included
    assert_eq!(predictions.dim(), (12, 3, 3));
    assert_eq!(metadata.total_frames, 12);
    assert_eq!(metadata.batch_size, 5);
    assert_eq!(metadata.image_size, (48, 64));
    assert_eq!(metadata.keypoint_names.len(), 3);
}

#[test]
fn full_runs_are_deterministic() {
    let mut first = pipeline(&[20], 1);
    first.setup().unwrap();
    let (a, _) = first.predict_video(0, None).unwrap();

    let mut second = pipeline(&[20], 1);
    second.setup().unwrap();
    let (b, _) = second.predict_video(0, None).unwrap();

    // Bit-identical buffers: no nondeterministic ops anywhere in the loop.
    assert_eq!(a, b);
}

#[test]
fn batch_size_does_not_change_results() {
    let mut by_one = pipeline(&[15], 1);
    by_one.setup().unwrap();
    let (a, _) = by_one.predict_video(0, None).unwrap();

    let mut by_four = pipeline(&[15], 4);
    by_four.setup().unwrap();
    let (b, _) = by_four.predict_video(0, None).unwrap();

    assert_eq!(a, b);
}

#[test]
fn subset_sampling_is_sorted_and_unique() {
    let mut pipeline = pipeline(&[100], 1);
    let (predictions, indices, bboxes) = pipeline.run_subset(None).unwrap();

    assert_eq!(indices.len(), 10);
    assert_eq!(predictions.dim(), (10, 3, 3));
    assert_eq!(bboxes.len(), 1);
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    assert!(indices.iter().all(|&i| i < 100));
}

#[test]
fn explicit_subset_indices_are_used_verbatim() {
    let mut pipeline = pipeline(&[50], 2);
    let wanted = vec![3, 17, 41];
    let (predictions, indices, _) = pipeline.run_subset(Some(wanted.clone())).unwrap();
    assert_eq!(indices, wanted);
    assert_eq!(predictions.dim(), (3, 3, 3));
}

#[test]
fn progress_reports_every_five_percent() {
    let progress = Arc::new(CountingProgress::default());
    let source = Box::new(SyntheticSource::new(&[100], 48, 64));
    let mut pipeline = PosePipeline::with_model(
        source,
        Box::new(FakeModel::pretrained()),
        PipelineConfig::default(),
    )
    .with_progress(progress.clone());

    pipeline.setup().unwrap();
    pipeline.predict_video(0, None).unwrap();

    // 100 frames at batch size 1 report at every 5-frame boundary.
    assert_eq!(progress.bar_updates.load(Ordering::Relaxed), 20);
}

#[test]
fn run_all_persists_one_table_per_video() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(&[6, 4], 2);
    let saved = pipeline.run_all(dir.path()).unwrap();

    assert_eq!(saved.len(), 2);
    assert_eq!(
        saved[0],
        dir.path().join("video0_FacemapPose.json")
    );
    for path in &saved {
        assert!(path.exists());
    }
    // Metadata records sit next to each table
    assert!(dir
        .path()
        .join("video0_FacemapPose_Facemap_metadata.json")
        .exists());

    let table = facemap_output::load_table(&saved[1]).unwrap();
    assert_eq!(table.n_rows(), 4);
    assert_eq!(table.n_columns(), 9);
}

#[test]
fn failing_video_leaves_earlier_results_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source = Box::new(SyntheticSource::new(&[5, 5, 5], 48, 64).failing_on(1));
    let mut pipeline = PosePipeline::with_model(
        source,
        Box::new(FakeModel::pretrained()),
        PipelineConfig::default(),
    );

    let err = pipeline.run_all(dir.path()).unwrap_err();
    match err {
        PoseError::FrameFetch { video, .. } => assert_eq!(video, "video1.avi"),
        other => panic!("expected FrameFetch, got {other}"),
    }

    // Video 0 was persisted before the failure and is untouched.
    assert!(dir.path().join("video0_FacemapPose.json").exists());
    assert!(!dir.path().join("video1_FacemapPose.json").exists());
    assert!(!dir.path().join("video2_FacemapPose.json").exists());
}

#[test]
fn training_swaps_in_the_finetuned_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(&[4], 1);
    assert_eq!(pipeline.provenance(), Some(ModelProvenance::Pretrained));

    let images = ndarray::Array4::<f32>::zeros((2, 1, 48, 64));
    let keypoints = ndarray::Array3::<f32>::zeros((2, 2, 2));
    let options = TrainingOptions {
        epochs: 1,
        batch_size: 1,
        learning_rate: 1e-4,
        weight_decay: 1e-5,
    };
    pipeline
        .train(&mut FakeTrainer, images.view(), keypoints.view(), &options)
        .unwrap();

    assert_eq!(pipeline.provenance(), Some(ModelProvenance::Finetuned));
    assert_eq!(pipeline.keypoint_names().unwrap().len(), 2);

    // Output naming now follows the fine-tuned convention.
    let saved = pipeline.run_all(dir.path()).unwrap();
    assert_eq!(
        saved[0],
        dir.path().join("video0_FacemapPoseFinetuned.json")
    );
    assert!(dir
        .path()
        .join("video0_FacemapPoseFinetuned_FacemapFinetuned_metadata.json")
        .exists());
}
