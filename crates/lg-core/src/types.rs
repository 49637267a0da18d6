//! Per-image metadata carried alongside every sample.

use serde::{Deserialize, Serialize};

/// Image extent in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Divisor that maps `[x1, y1, x2, y2]` boxes into `[0, 1]`.
    ///
    /// Shapes are stored height-first, boxes are width-first.
    pub fn box_normalizer(&self) -> [f32; 4] {
        let (w, h) = (self.width as f32, self.height as f32);
        [w, h, w, h]
    }

    /// Divisor that maps `(x, y)` points into `[0, 1]`.
    pub fn point_normalizer(&self) -> [f32; 2] {
        [self.width as f32, self.height as f32]
    }
}

/// Resize factor from original to working resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactor {
    /// Horizontal factor (applies to x coordinates)
    pub x: f32,
    /// Vertical factor (applies to y coordinates)
    pub y: f32,
}

impl ScaleFactor {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn identity() -> Self {
        Self { x: 1.0, y: 1.0 }
    }

    pub fn inverse(&self) -> Self {
        Self {
            x: 1.0 / self.x,
            y: 1.0 / self.y,
        }
    }

    /// Per-coordinate multipliers for an `[x1, y1, x2, y2]` box.
    pub fn box_multiplier(&self) -> [f32; 4] {
        [self.x, self.y, self.x, self.y]
    }
}

impl Default for ScaleFactor {
    fn default() -> Self {
        Self::identity()
    }
}

/// Metadata for one image of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Shape of the image as loaded from disk
    pub ori_shape: ImageShape,
    /// Shape after resizing to the model's working resolution
    pub img_shape: ImageShape,
    /// Padded shape of the whole batch tensor
    pub batch_input_shape: ImageShape,
    /// Factor applied when going from `ori_shape` to `img_shape`
    pub scale_factor: ScaleFactor,
    /// Whether ground-truth detections exist for this frame
    pub is_det_keyframe: bool,
}

impl ImageMeta {
    /// Metadata for an image that was not resized or padded.
    pub fn unscaled(shape: ImageShape, is_det_keyframe: bool) -> Self {
        Self {
            ori_shape: shape,
            img_shape: shape,
            batch_input_shape: shape,
            scale_factor: ScaleFactor::identity(),
            is_det_keyframe,
        }
    }
}
