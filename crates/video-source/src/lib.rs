//! Frame acquisition for the pose pipeline
//!
//! A [`VideoSet`] opens one or more video containers through FFmpeg and serves
//! decoded grayscale frames for arbitrary global frame indices. Global indices
//! run across all videos in order; cumulative frame-count boundaries map a
//! global index back to `(video, local frame)`.
//!
//! The [`FrameSource`] trait is the seam the pipeline is driven through, so
//! tests can substitute synthetic sources for real containers.

use ffmpeg_next as ffmpeg;
use ndarray::{ArrayViewMut2, ArrayViewMut4};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use facemap_common::{PoseError, Result};

/// Decoding farther than this past the current position triggers a seek
/// instead of discarding frames one by one.
const SEQUENTIAL_SKIP_MAX: usize = 64;

/// Source of decoded grayscale frames addressed by global frame index.
///
/// Pixel values are scaled to `[0, 1]`. Implementations must support random
/// (non-sequential) access, since subset runs request arbitrary sorted
/// indices.
pub trait FrameSource {
    /// Number of videos in the set
    fn n_videos(&self) -> usize;

    /// Per-video frame dimensions as (height, width)
    fn dimensions(&self) -> &[(usize, usize)];

    /// Cumulative frame-count boundaries: `n_videos + 1` entries, starting at
    /// 0 and ending at the total frame count, monotonically non-decreasing.
    fn cumulative_frames(&self) -> &[usize];

    /// Path of the video backing the given index (used for output naming and
    /// error context)
    fn video_path(&self, video_id: usize) -> &Path;

    /// Total frames across all videos
    fn total_frames(&self) -> usize {
        *self
            .cumulative_frames()
            .last()
            .expect("cumulative boundaries are never empty")
    }

    /// Frame count of a single video
    fn frame_count(&self, video_id: usize) -> usize {
        let cumframes = self.cumulative_frames();
        cumframes[video_id + 1] - cumframes[video_id]
    }

    /// Fill `out[i]` with the decoded pixels for `global_indices[i]`.
    ///
    /// `out` has shape `[batch, 1, height, width]`; a frame whose video
    /// dimensions do not match the buffer is an error.
    fn read_frames(&mut self, global_indices: &[usize], out: ArrayViewMut4<f32>) -> Result<()>;
}

/// Map a global frame index to `(video index, local frame index)` using
/// cumulative frame-count boundaries.
pub fn locate(cumframes: &[usize], global_index: usize) -> Result<(usize, usize)> {
    let total = *cumframes.last().unwrap_or(&0);
    if global_index >= total {
        return Err(PoseError::FrameIndexOutOfRange {
            index: global_index,
            total,
        });
    }
    // Last boundary <= global_index marks the owning video.
    let video = cumframes
        .iter()
        .rposition(|&boundary| boundary <= global_index)
        .expect("first boundary is 0");
    Ok((video, global_index - cumframes[video]))
}

/// Initialize the FFmpeg library once per process
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
    });
}

/// One opened container with its decoder state
struct Container {
    path: PathBuf,
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    fps: f64,
    height: usize,
    width: usize,
    n_frames: usize,
    /// Frame number the decoder will produce next, if known
    next_frame: Option<usize>,
    /// Whether EOF has been sent to the decoder
    flushed: bool,
    decoded: ffmpeg::util::frame::video::Video,
    converted: ffmpeg::util::frame::video::Video,
}

impl Container {
    fn open(path: &Path) -> Result<Self> {
        init_ffmpeg();

        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| PoseError::FFmpegError(format!("failed to open {}: {e}", path.display())))?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PoseError::NoVideoStream(path.display().to_string()))?;

        let stream_index = stream.index();
        let time_base = stream.time_base();

        let frame_rate = stream.avg_frame_rate();
        let frame_rate = if frame_rate.0 > 0 {
            frame_rate
        } else {
            stream.rate()
        };
        if frame_rate.0 <= 0 || frame_rate.1 <= 0 {
            return Err(PoseError::FFmpegError(format!(
                "no usable frame rate in {}",
                path.display()
            )));
        }
        let fps = f64::from(frame_rate.0) / f64::from(frame_rate.1);

        // Frame count from the container, falling back to duration * fps when
        // the stream does not carry nb_frames.
        let n_frames = if stream.frames() > 0 {
            stream.frames() as usize
        } else {
            let duration = stream.duration() as f64 * f64::from(time_base.0)
                / f64::from(time_base.1);
            (duration * fps).round() as usize
        };
        if n_frames == 0 {
            return Err(PoseError::FFmpegError(format!(
                "could not determine frame count of {}",
                path.display()
            )));
        }

        let codec_params = stream.parameters();
        let decoder = ffmpeg::codec::context::Context::from_parameters(codec_params)
            .map_err(|e| PoseError::FFmpegError(format!("failed to create context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| PoseError::FFmpegError(format!("failed to create decoder: {e}")))?;

        let width = decoder.width();
        let height = decoder.height();

        // Single-channel output: the network consumes grayscale frames.
        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg::format::Pixel::GRAY8,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| PoseError::FFmpegError(format!("failed to create scaler: {e}")))?;

        debug!(
            path = %path.display(),
            height,
            width,
            n_frames,
            fps,
            "opened video container"
        );

        Ok(Self {
            path: path.to_path_buf(),
            ictx,
            decoder,
            scaler,
            stream_index,
            time_base,
            fps,
            height: height as usize,
            width: width as usize,
            n_frames,
            next_frame: Some(0),
            flushed: false,
            decoded: ffmpeg::util::frame::video::Video::empty(),
            converted: ffmpeg::util::frame::video::Video::empty(),
        })
    }

    /// Frame number of the currently decoded frame, from its timestamp
    fn current_frame_number(&self) -> usize {
        let ts = self.decoded.timestamp().unwrap_or(0);
        let seconds =
            ts as f64 * f64::from(self.time_base.0) / f64::from(self.time_base.1);
        (seconds * self.fps).round() as usize
    }

    /// Seek so that decoding forward reaches `index`
    fn seek_to(&mut self, index: usize) -> Result<()> {
        let target = (index as f64 / self.fps * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.ictx
            .seek(target, ..target)
            .map_err(|e| PoseError::FFmpegError(format!("seek failed: {e}")))?;
        self.decoder.flush();
        self.next_frame = None;
        self.flushed = false;
        Ok(())
    }

    /// Decode the next frame, returning its frame number, or `None` at EOF
    fn decode_next(&mut self) -> Result<Option<usize>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                let number = self.current_frame_number();
                self.next_frame = Some(number + 1);
                return Ok(Some(number));
            }

            // Feed the decoder one more packet from our stream
            let mut fed = false;
            while let Some((stream, packet)) = self.ictx.packets().next() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .map_err(|e| PoseError::FFmpegError(format!("decode failed: {e}")))?;
                fed = true;
                break;
            }

            if !fed {
                if self.flushed {
                    return Ok(None);
                }
                self.decoder.send_eof().ok();
                self.flushed = true;
            }
        }
    }

    /// Decode the frame at `index` and copy it into `out` as `[0, 1]` floats
    fn read_frame(&mut self, index: usize, out: ArrayViewMut2<f32>) -> Result<()> {
        if index >= self.n_frames {
            return Err(PoseError::FrameIndexOutOfRange {
                index,
                total: self.n_frames,
            });
        }

        match self.next_frame {
            Some(n) if n <= index && index - n <= SEQUENTIAL_SKIP_MAX => {}
            _ => self.seek_to(index)?,
        }

        loop {
            match self.decode_next()? {
                Some(number) if number < index => continue,
                Some(number) if number == index => break,
                Some(number) => {
                    return Err(PoseError::FFmpegError(format!(
                        "decoder skipped frame {index} of {} (landed on {number})",
                        self.path.display()
                    )));
                }
                None => {
                    return Err(PoseError::FFmpegError(format!(
                        "unexpected end of stream before frame {index} of {}",
                        self.path.display()
                    )));
                }
            }
        }

        self.scaler
            .run(&self.decoded, &mut self.converted)
            .map_err(|e| PoseError::FFmpegError(format!("failed to convert frame: {e}")))?;

        self.copy_gray(out);
        Ok(())
    }

    /// Copy the converted GRAY8 plane into the output view, honoring the
    /// frame's row stride
    fn copy_gray(&self, mut out: ArrayViewMut2<f32>) {
        let stride = self.converted.stride(0);
        let data = self.converted.data(0);
        for y in 0..self.height {
            let row = &data[y * stride..y * stride + self.width];
            for (x, &pixel) in row.iter().enumerate() {
                out[[y, x]] = f32::from(pixel) / 255.0;
            }
        }
    }
}

/// Ordered set of video containers with cumulative frame bookkeeping.
///
/// Immutable once opened: dimensions, frame counts, and boundaries are fixed
/// at construction.
pub struct VideoSet {
    containers: Vec<Container>,
    dimensions: Vec<(usize, usize)>,
    cumframes: Vec<usize>,
}

impl VideoSet {
    /// Open every path in order and build the cumulative index
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut containers = Vec::with_capacity(paths.len());
        let mut dimensions = Vec::with_capacity(paths.len());
        let mut cumframes = Vec::with_capacity(paths.len() + 1);
        cumframes.push(0);

        for path in paths {
            let container = Container::open(path.as_ref())?;
            dimensions.push((container.height, container.width));
            cumframes.push(cumframes.last().unwrap() + container.n_frames);
            containers.push(container);
        }

        info!(
            n_videos = containers.len(),
            total_frames = *cumframes.last().unwrap(),
            "opened video set"
        );

        Ok(Self {
            containers,
            dimensions,
            cumframes,
        })
    }
}

impl FrameSource for VideoSet {
    fn n_videos(&self) -> usize {
        self.containers.len()
    }

    fn dimensions(&self) -> &[(usize, usize)] {
        &self.dimensions
    }

    fn cumulative_frames(&self) -> &[usize] {
        &self.cumframes
    }

    fn video_path(&self, video_id: usize) -> &Path {
        &self.containers[video_id].path
    }

    fn read_frames(&mut self, global_indices: &[usize], mut out: ArrayViewMut4<f32>) -> Result<()> {
        debug_assert_eq!(out.shape()[0], global_indices.len());

        for (i, &global_index) in global_indices.iter().enumerate() {
            let (video, local) = locate(&self.cumframes, global_index)?;
            let container = &mut self.containers[video];

            let (buf_h, buf_w) = (out.shape()[2], out.shape()[3]);
            if (container.height, container.width) != (buf_h, buf_w) {
                return Err(PoseError::FrameFetch {
                    video: container.path.display().to_string(),
                    first: global_index,
                    last: global_index,
                    reason: format!(
                        "frame dimensions {}x{} do not match buffer {buf_h}x{buf_w}",
                        container.height, container.width
                    ),
                });
            }

            let video_path = container.path.display().to_string();
            let row = out.index_axis_mut(ndarray::Axis(0), i);
            let plane = row.index_axis_move(ndarray::Axis(0), 0);
            container.read_frame(local, plane).map_err(|e| match e {
                e @ PoseError::FrameFetch { .. } => e,
                other => PoseError::FrameFetch {
                    video: video_path,
                    first: global_index,
                    last: global_index,
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_boundaries() {
        // Two videos with 100 and 50 frames
        let cumframes = vec![0, 100, 150];
        assert_eq!(locate(&cumframes, 0).unwrap(), (0, 0));
        assert_eq!(locate(&cumframes, 99).unwrap(), (0, 99));
        assert_eq!(locate(&cumframes, 100).unwrap(), (1, 0));
        assert_eq!(locate(&cumframes, 120).unwrap(), (1, 20));
        assert_eq!(locate(&cumframes, 149).unwrap(), (1, 49));
    }

    #[test]
    fn test_locate_out_of_range() {
        let cumframes = vec![0, 100, 150];
        assert!(matches!(
            locate(&cumframes, 150),
            Err(PoseError::FrameIndexOutOfRange { index: 150, total: 150 })
        ));
    }

    #[test]
    fn test_locate_single_video() {
        let cumframes = vec![0, 42];
        assert_eq!(locate(&cumframes, 41).unwrap(), (0, 41));
        assert!(locate(&cumframes, 42).is_err());
    }
}
