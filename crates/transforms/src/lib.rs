//! Geometric normalization between raw frame space and model input space
//!
//! The forward direction crops a batch of frames to a bounding box, pads the
//! crop symmetrically to a square, and resizes it to the fixed 256x256 model
//! input. [`adjust_keypoints`] is the exact algebraic inverse of those steps
//! applied to predicted coordinates: undo the resize scale, subtract the pad
//! offsets, add the crop origin. Any asymmetry between the two directions
//! misplaces every keypoint, so the pairing is covered by round-trip tests.

use image::imageops::FilterType;
use image::{ImageBuffer, Luma};
use ndarray::{s, Array4, ArrayView2, ArrayView4};

use facemap_common::{BoundingBox, PoseError, Result, MODEL_INPUT_SIZE};

/// Per-video normalization flags derived from the bounding box against the
/// fixed model input size. Recompute whenever the bounding box changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformPlan {
    /// Crop side length differs from the model input size
    pub needs_resize: bool,
    /// Crop region is non-square and must be padded before resizing
    pub needs_padding: bool,
}

impl TransformPlan {
    /// Derive the plan for one bounding box
    #[must_use]
    pub fn for_bbox(bbox: &BoundingBox) -> Self {
        let target = MODEL_INPUT_SIZE as f64;
        Self {
            needs_resize: bbox.width() != target || bbox.height() != target,
            needs_padding: !bbox.is_square(),
        }
    }
}

/// Pad amounts added on each side of the crop, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadOffsets {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

/// Everything [`adjust_keypoints`] needs to invert one forward pass.
///
/// `crop_origin` is the effective pixel origin after the bounding box is
/// rounded to the pixel grid; inverting against the unrounded box would
/// shift every keypoint by the rounding error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropGeometry {
    /// Crop+pad shape (height, width) prior to the final resize
    pub postpad_shape: (usize, usize),
    /// Per-side pad amounts
    pub pads: PadOffsets,
    /// Pixel-grid origin `(x, y)` the crop was actually taken at
    pub crop_origin: (f64, f64),
}

/// Crop, pad, and resize a raw batch into model input space.
///
/// `raw` has shape `[batch, 1, height, width]`. Returns the normalized batch
/// `[batch, 1, 256, 256]` and the [`CropGeometry`] that inverts the pass
/// exactly, including the pixel-grid origin the crop landed on after the
/// bounding box was rounded.
///
/// With both flags unset and a 256x256 bounding box this is the identity.
pub fn preprocess_batch(
    raw: ArrayView4<f32>,
    bbox: &BoundingBox,
    add_padding: bool,
    resize: bool,
) -> Result<(Array4<f32>, CropGeometry)> {
    let (batch, channels, height, width) = raw.dim();
    bbox.validate_within(height, width)?;

    let x1 = bbox.x1.round() as usize;
    let x2 = bbox.x2.round() as usize;
    let y1 = bbox.y1.round() as usize;
    let y2 = bbox.y2.round() as usize;
    if x2 <= x1 || y2 <= y1 {
        return Err(PoseError::InvalidBoundingBox {
            bbox: format!("{bbox}"),
            reason: "crop region is empty after rounding".to_string(),
        });
    }

    let crop = raw.slice(s![.., .., y1..y2, x1..x2]);
    let (crop_h, crop_w) = (y2 - y1, x2 - x1);
    let crop_origin = (x1 as f64, y1 as f64);

    // Pad symmetrically to a square, recording the per-side amounts so the
    // inverse can subtract them.
    let (padded, pads) = if add_padding && crop_h != crop_w {
        let side = crop_h.max(crop_w);
        let pad_h = side - crop_h;
        let pad_w = side - crop_w;
        let pads = PadOffsets {
            top: pad_h / 2,
            bottom: pad_h - pad_h / 2,
            left: pad_w / 2,
            right: pad_w - pad_w / 2,
        };
        let mut padded = Array4::<f32>::zeros((batch, channels, side, side));
        padded
            .slice_mut(s![
                ..,
                ..,
                pads.top..pads.top + crop_h,
                pads.left..pads.left + crop_w
            ])
            .assign(&crop);
        (padded, pads)
    } else {
        (crop.to_owned(), PadOffsets::default())
    };

    let postpad_shape = (padded.dim().2, padded.dim().3);
    let geometry = CropGeometry {
        postpad_shape,
        pads,
        crop_origin,
    };

    if !resize || postpad_shape == (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE) {
        return Ok((padded, geometry));
    }

    // Bilinear resize each plane to the fixed model input size.
    let (src_h, src_w) = postpad_shape;
    let mut resized = Array4::<f32>::zeros((batch, channels, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE));
    for b in 0..batch {
        for c in 0..channels {
            let plane = padded.slice(s![b, c, .., ..]);
            let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(
                src_w as u32,
                src_h as u32,
                |x, y| Luma([plane[[y as usize, x as usize]]]),
            );
            let scaled = image::imageops::resize(
                &buffer,
                MODEL_INPUT_SIZE as u32,
                MODEL_INPUT_SIZE as u32,
                FilterType::Triangle,
            );
            let mut out = resized.slice_mut(s![b, c, .., ..]);
            for (x, y, pixel) in scaled.enumerate_pixels() {
                out[[y as usize, x as usize]] = pixel[0];
            }
        }
    }

    Ok((resized, geometry))
}

/// Map predicted keypoints from model input space back to raw frame space.
///
/// `xs`/`ys` have shape `[batch, keypoint]` in `current_size` (the 256x256
/// model input) coordinates. `geometry` is the record returned by the
/// [`preprocess_batch`] call that produced the batch: undo the resize scale,
/// subtract the pad offsets, add the effective crop origin.
#[must_use]
pub fn adjust_keypoints(
    xs: ArrayView2<f32>,
    ys: ArrayView2<f32>,
    geometry: &CropGeometry,
    current_size: (usize, usize),
) -> (ndarray::Array2<f32>, ndarray::Array2<f32>) {
    let scale_x = geometry.postpad_shape.1 as f32 / current_size.1 as f32;
    let scale_y = geometry.postpad_shape.0 as f32 / current_size.0 as f32;
    let pads = geometry.pads;
    let (origin_x, origin_y) = geometry.crop_origin;

    let xs = xs.mapv(|x| x * scale_x - pads.left as f32 + origin_x as f32);
    let ys = ys.mapv(|y| y * scale_y - pads.top as f32 + origin_y as f32);
    (xs, ys)
}
