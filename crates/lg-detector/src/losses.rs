//! Reconstruction loss with extra weight on object regions.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::heads::ReconstructionLoss;
use crate::structures::LossMap;

/// Loss configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxWeightedLossConfig {
    /// Overall multiplier of the loss
    pub loss_weight: f32,
    /// Extra weight of pixels covered by at least one box
    pub box_weight: f32,
}

impl Default for BoxWeightedLossConfig {
    fn default() -> Self {
        Self {
            loss_weight: 1.0,
            box_weight: 1.0,
        }
    }
}

/// Smooth-L1 reconstruction loss, up-weighted inside target boxes
pub struct BoxWeightedReconstructionLoss {
    config: BoxWeightedLossConfig,
}

impl BoxWeightedReconstructionLoss {
    pub fn new(config: BoxWeightedLossConfig) -> Result<Self> {
        if config.loss_weight < 0.0 || config.box_weight < 0.0 {
            return Err(Error::Config(format!(
                "reconstruction loss weights must be >= 0, got {:?}",
                config
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &BoxWeightedLossConfig {
        &self.config
    }

    /// Per-pixel weights `[B, 1, H, W]`: 1 everywhere plus `box_weight`
    /// inside any of the image's boxes.
    fn weight_map(&self, boxes: &[Tensor], height: usize, width: usize, like: &Tensor) -> Result<Tensor> {
        let mut data = vec![1.0f32; boxes.len() * height * width];

        for (img, b) in boxes.iter().enumerate() {
            let rows: Vec<Vec<f32>> = b.to_dtype(DType::F32)?.to_vec2()?;
            let plane = &mut data[img * height * width..(img + 1) * height * width];
            for r in rows {
                let x1 = r[0].floor().clamp(0.0, width as f32) as usize;
                let y1 = r[1].floor().clamp(0.0, height as f32) as usize;
                let x2 = r[2].ceil().clamp(0.0, width as f32) as usize;
                let y2 = r[3].ceil().clamp(0.0, height as f32) as usize;
                for y in y1..y2 {
                    for x in x1..x2 {
                        plane[y * width + x] = 1.0 + self.config.box_weight;
                    }
                }
            }
        }

        Ok(Tensor::from_vec(data, (boxes.len(), 1, height, width), like.device())?
            .to_dtype(like.dtype())?)
    }
}

impl ReconstructionLoss for BoxWeightedReconstructionLoss {
    fn compute(
        &self,
        reconstructed: &Tensor,
        targets: &Tensor,
        target_boxes: &[Tensor],
    ) -> Result<LossMap> {
        if reconstructed.dims() != targets.dims() {
            return Err(lg_core::Error::ShapeMismatch {
                expected: format!("{:?}", targets.dims()),
                actual: format!("{:?}", reconstructed.dims()),
            }
            .into());
        }
        let (batch, _channels, height, width) = reconstructed.dims4()?;
        if target_boxes.len() != batch {
            return Err(Error::InvalidInput(format!(
                "{} box groups for a batch of {}",
                target_boxes.len(),
                batch
            )));
        }

        // Average over channels, then weight spatially
        let per_pixel = smooth_l1_loss(reconstructed, targets)?.mean_keepdim(1)?;
        let weights = self.weight_map(target_boxes, height, width, &per_pixel)?;

        let weighted = (per_pixel * &weights)?.sum_all()?;
        let loss = ((weighted / weights.sum_all()?)? * self.config.loss_weight as f64)?;

        let mut losses = LossMap::new();
        losses.insert("reconstruction_loss".to_string(), loss);
        Ok(losses)
    }
}

/// Elementwise smooth L1 with unit threshold
fn smooth_l1_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (pred - target)?;
    let abs_diff = diff.abs()?;

    // 0.5*x² if |x| < 1, else |x| - 0.5
    let ones = Tensor::ones_like(&abs_diff)?;
    let squared_loss = ((&diff * &diff)? * 0.5)?;
    let linear_loss = (&abs_diff - 0.5)?;

    let mask = abs_diff.lt(&ones)?;
    Ok(mask.where_cond(&squared_loss, &linear_loss)?)
}
