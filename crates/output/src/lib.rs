//! Structured result assembly and persistence
//!
//! Accumulated predictions become a [`PoseTable`]: three columns per keypoint
//! (x, y, likelihood, adjacent and in that fixed order) with one row per
//! frame, so consumers can address channels by stride-3 offset or by column
//! name. Tables and run metadata persist as self-describing JSON following
//! the Facemap naming convention, with the table nested under the fixed
//! internal key [`TABLE_KEY`]. Note for consumers of Facemap's Python
//! tooling: the file stems, provenance suffixes, and internal key match its
//! HDF5/pickle outputs, but the serialization here is JSON and the files
//! carry a `.json` extension.

use ndarray::{Array2, ArrayView3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use facemap_common::{ModelProvenance, PoseError, Result, RunMetadata};

/// Fixed internal key the prediction table is stored under
pub const TABLE_KEY: &str = "df_with_missing";

/// Scorer label carried in every table
pub const SCORER: &str = "Facemap";

/// Frame-indexed keypoint table with three columns per keypoint
#[derive(Debug, Clone, PartialEq)]
pub struct PoseTable {
    /// Column labels: `{keypoint}_x`, `{keypoint}_y`, `{keypoint}_likelihood`
    pub columns: Vec<String>,
    /// Row labels: contiguous `0..n` or the exact sparse subset indices
    pub index: Vec<usize>,
    /// Cell values, shape `[rows, 3 * keypoints]`
    pub values: Array2<f32>,
}

impl PoseTable {
    /// Build a table from an accumulated `[frame, keypoint, {x, y,
    /// likelihood}]` prediction buffer.
    ///
    /// Rows are labeled `0..n_frames` unless `frame_indices` supplies the
    /// (sparse) indices the predictions were computed for.
    pub fn from_predictions(
        predictions: ArrayView3<f32>,
        keypoint_names: &[String],
        frame_indices: Option<&[usize]>,
    ) -> Result<Self> {
        let (n_frames, n_keypoints, n_channels) = predictions.dim();
        if n_channels != 3 || n_keypoints != keypoint_names.len() {
            return Err(PoseError::Persist {
                path: String::new(),
                reason: format!(
                    "prediction buffer {:?} does not match {} keypoints",
                    predictions.shape(),
                    keypoint_names.len()
                ),
            });
        }
        if let Some(indices) = frame_indices {
            if indices.len() != n_frames {
                return Err(PoseError::Persist {
                    path: String::new(),
                    reason: format!(
                        "{} frame indices for {n_frames} prediction rows",
                        indices.len()
                    ),
                });
            }
        }

        let mut columns = Vec::with_capacity(3 * n_keypoints);
        for name in keypoint_names {
            columns.push(format!("{name}_x"));
            columns.push(format!("{name}_y"));
            columns.push(format!("{name}_likelihood"));
        }

        let mut values = Array2::<f32>::zeros((n_frames, 3 * n_keypoints));
        for frame in 0..n_frames {
            for keypoint in 0..n_keypoints {
                for channel in 0..3 {
                    values[[frame, 3 * keypoint + channel]] =
                        predictions[[frame, keypoint, channel]];
                }
            }
        }

        let index = match frame_indices {
            Some(indices) => indices.to_vec(),
            None => (0..n_frames).collect(),
        };

        Ok(Self {
            columns,
            index,
            values,
        })
    }

    /// Number of frame rows
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of columns (3 per keypoint)
    #[must_use]
    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }
}

/// On-disk form of a table: the fixed key wrapping a self-describing record
#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    #[serde(rename = "df_with_missing")]
    table: TableRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRecord {
    scorer: String,
    columns: Vec<String>,
    index: Vec<usize>,
    data: Vec<Vec<f32>>,
}

/// Prediction table path for a video: `{stem}_FacemapPose.json` in
/// `output_dir` (`_FacemapPoseFinetuned` for a fine-tuned model).
#[must_use]
pub fn table_path(output_dir: &Path, video_path: &Path, provenance: ModelProvenance) -> PathBuf {
    let stem = video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    output_dir.join(format!("{stem}{}.json", provenance.table_suffix()))
}

/// Metadata record path derived from the table path: strip the extension,
/// append the provenance metadata suffix.
#[must_use]
pub fn metadata_path(table_path: &Path, provenance: ModelProvenance) -> PathBuf {
    let stem = table_path.with_extension("");
    PathBuf::from(format!(
        "{}{}.json",
        stem.display(),
        provenance.metadata_suffix()
    ))
}

/// Persist a table under the fixed internal key
pub fn save_table(table: &PoseTable, path: &Path) -> Result<()> {
    let record = TableFile {
        table: TableRecord {
            scorer: SCORER.to_string(),
            columns: table.columns.clone(),
            index: table.index.clone(),
            data: table
                .values
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect(),
        },
    };
    let json = serde_json::to_string(&record).map_err(|e| persist_error(path, &e))?;
    std::fs::write(path, json).map_err(|e| persist_error(path, &e))
}

/// Read a table back from disk
pub fn load_table(path: &Path) -> Result<PoseTable> {
    let json = std::fs::read_to_string(path).map_err(|e| persist_error(path, &e))?;
    let record: TableFile = serde_json::from_str(&json).map_err(|e| persist_error(path, &e))?;

    let rows = record.table.data.len();
    let cols = record.table.columns.len();
    let flat: Vec<f32> = record.table.data.into_iter().flatten().collect();
    let values = Array2::from_shape_vec((rows, cols), flat)
        .map_err(|e| persist_error(path, &e))?;

    Ok(PoseTable {
        columns: record.table.columns,
        index: record.table.index,
        values,
    })
}

/// Persist the run metadata record next to a table
pub fn save_metadata(metadata: &RunMetadata, path: &Path) -> Result<()> {
    let json = serde_json::to_string(metadata).map_err(|e| persist_error(path, &e))?;
    std::fs::write(path, json).map_err(|e| persist_error(path, &e))
}

fn persist_error(path: &Path, e: &dyn std::fmt::Display) -> PoseError {
    PoseError::Persist {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
