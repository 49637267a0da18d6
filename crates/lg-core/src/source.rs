//! Selection between ground-truth and predicted detections.
//!
//! Feature extraction and semantic encoding both need to decide, per image,
//! whether boxes, classes, scores and masks come from the annotations or
//! from the detector. The rule lives here so both paths agree.

use serde::{Deserialize, Serialize};

/// Where an image's instances are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    /// Detector output
    Predicted,
    /// Dataset annotations
    GroundTruth,
    /// Keyframe whose annotation set is empty
    Empty,
}

/// Inputs to the source selection rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceContext {
    pub is_training: bool,
    pub use_gt_dets: bool,
    pub is_keyframe: bool,
    pub has_gt: bool,
}

/// Pick the data source for one image.
///
/// Ground truth is only ever used while training with `use_gt_dets` set, and
/// only on keyframes. Non-keyframes fall back to predictions regardless of
/// the flag. A keyframe with no annotations yields no instances at all.
pub fn select_source(ctx: SourceContext) -> DataSource {
    if !(ctx.is_training && ctx.use_gt_dets) || !ctx.is_keyframe {
        DataSource::Predicted
    } else if ctx.has_gt {
        DataSource::GroundTruth
    } else {
        DataSource::Empty
    }
}
