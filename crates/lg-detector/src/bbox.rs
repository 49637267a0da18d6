//! Box transforms on `[N, 4]` tensors: rescaling, clamping and
//! training-time perturbation.

use candle_core::{DType, Tensor};
use lg_core::{sanitize_box, BoxXyxy, ImageShape, ScaleFactor};
use rand::Rng;

use crate::error::{Error, Result};

/// Multiply x coordinates by `scale.x` and y coordinates by `scale.y`.
pub fn scale_boxes(boxes: &Tensor, scale: ScaleFactor) -> Result<Tensor> {
    let multiplier = Tensor::new(&scale.box_multiplier(), boxes.device())?.to_dtype(boxes.dtype())?;
    Ok(boxes.broadcast_mul(&multiplier)?)
}

/// Map boxes into `[0, 1]` relative to `shape`.
pub fn normalize_boxes(boxes: &Tensor, shape: ImageShape) -> Result<Tensor> {
    let divisor = Tensor::new(&shape.box_normalizer(), boxes.device())?.to_dtype(boxes.dtype())?;
    Ok(boxes.broadcast_div(&divisor)?)
}

/// Clamp every box into `shape` and order its corners.
pub fn sanitize_boxes(boxes: &Tensor, shape: ImageShape) -> Result<Tensor> {
    let rows = boxes_to_vec(boxes)?;
    let cleaned: Vec<BoxXyxy> = rows.iter().map(|b| sanitize_box(b, shape)).collect();
    boxes_from_vec(&cleaned, boxes)
}

fn boxes_to_vec(boxes: &Tensor) -> Result<Vec<BoxXyxy>> {
    let rows: Vec<Vec<f32>> = boxes.to_dtype(DType::F32)?.to_vec2()?;
    rows.into_iter()
        .map(|r| {
            <[f32; 4]>::try_from(r.as_slice())
                .map_err(|_| Error::InvalidInput(format!("expected 4 box coordinates, got {}", r.len())))
        })
        .collect()
}

/// Build an `[N, 4]` tensor shaped like `like` (dtype and device).
fn boxes_from_vec(rows: &[BoxXyxy], like: &Tensor) -> Result<Tensor> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), 4), like.device())?.to_dtype(like.dtype())?)
}

/// Random jitter applied to boxes before feature extraction
#[derive(Debug, Clone, Copy)]
pub struct BoxPerturber {
    factor: f32,
    range: (f32, f32),
}

impl BoxPerturber {
    /// `factor` scales the jitter (values above 1 act as 1); each coordinate
    /// moves by `factor * u * extent` with `u` uniform in `range` and
    /// `extent` the box's own width (x) or height (y).
    pub fn new(factor: f32, range: (f32, f32)) -> Result<Self> {
        if !(factor >= 0.0) {
            return Err(Error::Config(format!("perturb factor must be >= 0, got {}", factor)));
        }
        if !(range.0 < range.1) {
            return Err(Error::Config(format!(
                "perturb range must satisfy low < high, got [{}, {})",
                range.0, range.1
            )));
        }

        Ok(Self {
            factor: factor.min(1.0),
            range,
        })
    }

    pub fn disabled() -> Self {
        Self {
            factor: 0.0,
            range: (-1.0, 0.0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.factor > 0.0
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    /// Perturb per-image box lists and clamp them into each image.
    ///
    /// With `clip_size = Some(c)` the batch is treated as consecutive clips
    /// of `c` frames and every frame of a clip shares one draw, so a box
    /// that is identical across a clip's frames moves identically.
    pub fn perturb<R: Rng + ?Sized>(
        &self,
        boxes: &[Tensor],
        shapes: &[ImageShape],
        clip_size: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<Tensor>> {
        if boxes.len() != shapes.len() {
            return Err(Error::InvalidInput(format!(
                "{} box groups but {} image shapes",
                boxes.len(),
                shapes.len()
            )));
        }

        if !self.is_active() {
            return Ok(boxes.to_vec());
        }

        let clip_size = clip_size.filter(|&c| c > 0);
        let clip_draws = match clip_size {
            Some(c) => {
                if boxes.len() % c != 0 {
                    return Err(Error::InvalidInput(format!(
                        "batch of {} frames is not divisible into clips of {}",
                        boxes.len(),
                        c
                    )));
                }
                (0..boxes.len() / c).map(|_| self.draw(&mut *rng)).collect()
            }
            None => Vec::new(),
        };

        boxes
            .iter()
            .zip(shapes)
            .enumerate()
            .map(|(img, (b, &shape))| {
                let rows = boxes_to_vec(b)?;
                let perturbed: Vec<BoxXyxy> = rows
                    .iter()
                    .map(|row| {
                        let u = match clip_size {
                            Some(c) => clip_draws[img / c],
                            None => self.draw(&mut *rng),
                        };
                        sanitize_box(&self.apply(row, &u), shape)
                    })
                    .collect();
                boxes_from_vec(&perturbed, b)
            })
            .collect()
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> [f32; 4] {
        let (lo, hi) = self.range;
        [
            rng.random_range(lo..hi),
            rng.random_range(lo..hi),
            rng.random_range(lo..hi),
            rng.random_range(lo..hi),
        ]
    }

    fn apply(&self, b: &BoxXyxy, u: &[f32; 4]) -> BoxXyxy {
        let w = b[2] - b[0];
        let h = b[3] - b[1];
        let extent = [w, h, w, h];
        let mut out = *b;
        for i in 0..4 {
            out[i] += self.factor * u[i] * extent[i];
        }
        out
    }
}
