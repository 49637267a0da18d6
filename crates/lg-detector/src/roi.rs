//! ROI Align over multi-level feature maps.
//!
//! Each region is assigned to one pyramid level by its scale, then pooled
//! into a fixed `output_size x output_size` grid by bilinear sampling.
//! Masks, when given, weight the samples so background pixels inside a box
//! contribute less.
//!
//! Sample positions and weights are computed on the host; the feature values
//! are gathered with tensor ops so gradients reach the input maps.

use std::collections::HashMap;

use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::heads::RoiExtractor;

/// Concatenate per-image boxes into `[R, 5]` ROI rows `[img, x1, y1, x2, y2]`.
pub fn boxes_to_rois(boxes: &[Tensor]) -> Result<Tensor> {
    let first = boxes
        .first()
        .ok_or_else(|| Error::InvalidInput("no box groups to convert".to_string()))?;

    let mut rows = Vec::new();
    for (img, b) in boxes.iter().enumerate() {
        let coords: Vec<Vec<f32>> = b.to_dtype(DType::F32)?.to_vec2()?;
        for c in coords {
            rows.push(img as f32);
            rows.extend(c);
        }
    }

    let n = rows.len() / 5;
    Ok(Tensor::from_vec(rows, (n, 5), first.device())?)
}

/// Configuration for ROI Align
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiAlignConfig {
    /// Output grid size per region
    pub output_size: usize,
    /// Samples per bin along each axis
    pub sampling_ratio: usize,
    /// Stride of each input level relative to the image
    pub featmap_strides: Vec<usize>,
    /// Box scale mapped to the finest level
    pub finest_scale: f32,
}

impl Default for RoiAlignConfig {
    fn default() -> Self {
        Self {
            output_size: 1,
            sampling_ratio: 2,
            featmap_strides: vec![4, 8, 16, 32],
            finest_scale: 56.0,
        }
    }
}

/// Single-level-per-ROI align extractor
pub struct RoiAlign2d {
    config: RoiAlignConfig,
}

impl RoiAlign2d {
    pub fn new(config: RoiAlignConfig) -> Result<Self> {
        if config.output_size == 0 || config.sampling_ratio == 0 || config.featmap_strides.is_empty() {
            return Err(Error::Config(
                "ROI align needs a positive output size, sampling ratio and at least one stride"
                    .to_string(),
            ));
        }
        Ok(Self { config })
    }

    /// Pyramid level for a box of the given size.
    pub fn map_level(&self, width: f32, height: f32, num_levels: usize) -> usize {
        let scale = (width.max(0.0) * height.max(0.0)).sqrt();
        let level = (scale / self.config.finest_scale + 1e-6).log2().floor();
        level.clamp(0.0, num_levels.saturating_sub(1) as f32) as usize
    }

    pub fn config(&self) -> &RoiAlignConfig {
        &self.config
    }
}

/// One instance mask in image coordinates
struct MaskMap {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl MaskMap {
    fn at(&self, x: f32, y: f32) -> f32 {
        if x < 0.0 || y < 0.0 {
            return 0.0;
        }
        let (xi, yi) = (x as usize, y as usize);
        if xi >= self.width || yi >= self.height {
            return 0.0;
        }
        self.data[yi * self.width + xi]
    }
}

/// Flat indices and weights of the four pixels interpolated at `(y, x)`;
/// `None` when the point is outside the map.
fn bilinear_corners(height: usize, width: usize, y: f32, x: f32) -> Option<[(u32, f32); 4]> {
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return None;
    }

    let y = y.max(0.0);
    let x = x.max(0.0);
    let y0 = (y.floor() as usize).min(height - 1);
    let x0 = (x.floor() as usize).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let x1 = (x0 + 1).min(width - 1);
    let ly = if y0 == height - 1 { 0.0 } else { y - y0 as f32 };
    let lx = if x0 == width - 1 { 0.0 } else { x - x0 as f32 };
    let (hy, hx) = (1.0 - ly, 1.0 - lx);
    let at = |yy: usize, xx: usize| (yy * width + xx) as u32;

    Some([
        (at(y0, x0), hy * hx),
        (at(y0, x1), hy * lx),
        (at(y1, x0), ly * hx),
        (at(y1, x1), ly * lx),
    ])
}

impl RoiExtractor for RoiAlign2d {
    fn num_inputs(&self) -> usize {
        self.config.featmap_strides.len()
    }

    fn supports_masks(&self) -> bool {
        true
    }

    fn extract(&self, feats: &[Tensor], rois: &Tensor, masks: Option<&[Tensor]>) -> Result<Tensor> {
        let first = feats
            .first()
            .ok_or_else(|| Error::InvalidInput("ROI align needs at least one feature map".to_string()))?;
        let (_, channels, _, _) = first.dims4()?;
        let out = self.config.output_size;
        let ratio = self.config.sampling_ratio;
        let num_levels = feats.len().min(self.config.featmap_strides.len());

        for (level, f) in feats[..num_levels].iter().enumerate() {
            let c = f.dims4()?.1;
            if c != channels {
                return Err(lg_core::Error::ShapeMismatch {
                    expected: format!("{} channels on every level", channels),
                    actual: format!("{} channels on level {}", c, level),
                }
                .into());
            }
        }

        let rows: Vec<Vec<f32>> = rois.to_dtype(DType::F32)?.to_vec2()?;
        if rows.is_empty() {
            return Ok(Tensor::zeros((0, channels, out, out), first.dtype(), first.device())?);
        }

        let bins = out * out;
        let samples = ratio * ratio;
        let per_bin = samples * 4;
        let mut seen_per_img: HashMap<usize, usize> = HashMap::new();
        let mut pooled = Vec::with_capacity(rows.len());

        for row in &rows {
            let img = row[0] as usize;
            let (x1, y1, x2, y2) = (row[1], row[2], row[3], row[4]);
            let level = self.map_level(x2 - x1, y2 - y1, num_levels);
            let scale = 1.0 / self.config.featmap_strides[level] as f32;
            let (_, _, height, width) = feats[level].dims4()?;

            let instance = {
                let counter = seen_per_img.entry(img).or_insert(0);
                let k = *counter;
                *counter += 1;
                k
            };
            let mask = match masks.and_then(|m| m.get(img)) {
                Some(m) if m.dims().first().copied().unwrap_or(0) > instance => {
                    let (_, mh, mw) = m.dims3()?;
                    let data: Vec<f32> = m.i(instance)?.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
                    Some(MaskMap { data, height: mh, width: mw })
                }
                _ => None,
            };

            let (fx1, fy1) = (x1 * scale, y1 * scale);
            let roi_w = ((x2 - x1) * scale).max(1.0);
            let roi_h = ((y2 - y1) * scale).max(1.0);
            let bin_w = roi_w / out as f32;
            let bin_h = roi_h / out as f32;

            let mut index = vec![0u32; bins * per_bin];
            let mut weight = vec![0f32; bins * per_bin];

            for ph in 0..out {
                for pw in 0..out {
                    let bin = ph * out + pw;
                    let mut points = Vec::with_capacity(samples);
                    let mut mask_total = 0.0f32;

                    for iy in 0..ratio {
                        let y = fy1 + (ph as f32 + (iy as f32 + 0.5) / ratio as f32) * bin_h;
                        for ix in 0..ratio {
                            let x = fx1 + (pw as f32 + (ix as f32 + 0.5) / ratio as f32) * bin_w;
                            let m = mask.as_ref().map(|m| m.at(x / scale, y / scale)).unwrap_or(0.0);
                            mask_total += m;
                            points.push((bilinear_corners(height, width, y, x), m));
                        }
                    }

                    // Mask-weighted mean when any sample hits the mask, plain mean otherwise
                    for (s, (corners, m)) in points.into_iter().enumerate() {
                        let Some(corners) = corners else {
                            continue;
                        };
                        let factor = if mask_total > 0.0 { m / mask_total } else { 1.0 / samples as f32 };
                        for (j, (idx, w)) in corners.into_iter().enumerate() {
                            let pos = bin * per_bin + s * 4 + j;
                            index[pos] = idx;
                            weight[pos] = w * factor;
                        }
                    }
                }
            }

            let map = feats[level].i(img)?.flatten_from(1)?;
            let index = Tensor::from_vec(index, bins * per_bin, map.device())?;
            let weight = Tensor::from_vec(weight, (1, bins * per_bin), map.device())?.to_dtype(map.dtype())?;
            let values = map
                .index_select(&index, 1)?
                .broadcast_mul(&weight)?
                .reshape((channels, bins, per_bin))?
                .sum(2)?
                .reshape((channels, out, out))?;
            pooled.push(values);
        }

        Ok(Tensor::stack(&pooled, 0)?)
    }
}
