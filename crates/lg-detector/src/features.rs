//! Per-instance feature extraction.
//!
//! Instances are taken from the detector or the annotations per image (see
//! [`lg_core::select_source`]), optionally jittered, and turned into one
//! feature vector each, either by pooling regions of backbone maps or by
//! asking the backbone for its own query features.

use candle_core::{DType, Tensor};
use lg_core::{select_source, DataSource, ImageShape, SourceContext};
use rand::Rng;

use crate::batching::{pad_sequence, split_and_pad};
use crate::bbox::BoxPerturber;
use crate::error::{Error, Result};
use crate::heads::{DetectorAdapter, FeatureBackbone, QueryFeatures, RoiExtractor};
use crate::roi::boxes_to_rois;
use crate::structures::{DetDataSample, FeatureBundle, InstanceData};

/// How instance features are obtained, fixed at construction
pub enum ExtractionStrategy {
    /// Pool backbone/neck maps inside each box
    RegionPooling(Box<dyn RoiExtractor>),
    /// Use the backbone's query representation
    Queries,
}

/// Instances per image from the data source chosen for it.
///
/// Annotated instances get unit scores. A keyframe with an empty annotation
/// set yields no instances; when masks are in use it also yields an empty
/// mask stack sized to the working image.
pub fn select_instances(
    results: &[DetDataSample],
    is_training: bool,
    use_gt_dets: bool,
) -> Result<Vec<InstanceData>> {
    let use_masks = results
        .first()
        .map(|r| r.pred_instances.has_masks())
        .unwrap_or(false);

    results
        .iter()
        .map(|r| {
            let ctx = SourceContext {
                is_training,
                use_gt_dets,
                is_keyframe: r.meta.is_det_keyframe,
                has_gt: !r.gt_instances.is_empty(),
            };

            match select_source(ctx) {
                DataSource::Predicted => Ok(r.pred_instances.clone()),
                DataSource::GroundTruth => {
                    let gt = &r.gt_instances;
                    let device = gt.bboxes.device();
                    let mut selected = InstanceData::new(
                        gt.bboxes.clone(),
                        gt.labels.clone(),
                        Tensor::ones(gt.len(), DType::F32, device)?,
                    );
                    if use_masks {
                        selected.masks = gt.masks.clone();
                    }
                    Ok(selected)
                }
                DataSource::Empty => {
                    let device = r.pred_instances.bboxes.device();
                    let empty = InstanceData::empty(device)?;
                    if use_masks {
                        let ImageShape { height, width } = r.meta.img_shape;
                        Ok(empty.with_masks(Tensor::zeros((0, height, width), DType::F32, device)?))
                    } else {
                        Ok(empty)
                    }
                }
            }
        })
        .collect()
}

/// Turns detections and images into a [`FeatureBundle`]
pub struct FeatureExtractor {
    strategy: ExtractionStrategy,
    trainable_backbone: Option<Box<dyn FeatureBackbone>>,
    perturber: BoxPerturber,
    use_gt_dets: bool,
}

impl FeatureExtractor {
    pub fn new(
        strategy: ExtractionStrategy,
        trainable_backbone: Option<Box<dyn FeatureBackbone>>,
        perturber: BoxPerturber,
        use_gt_dets: bool,
    ) -> Self {
        Self {
            strategy,
            trainable_backbone,
            perturber,
            use_gt_dets,
        }
    }

    pub fn uses_region_pooling(&self) -> bool {
        matches!(self.strategy, ExtractionStrategy::RegionPooling(_))
    }

    /// Extract features for `results` (detector output for `images`).
    ///
    /// Boxes are jittered when training or when `force_perturb` is set and
    /// the perturber is active. Query extraction uses the backbone's own
    /// boxes, so jitter only affects region pooling.
    #[allow(clippy::too_many_arguments)]
    pub fn extract<R: Rng + ?Sized>(
        &self,
        detector: &dyn DetectorAdapter,
        images: &Tensor,
        results: &[DetDataSample],
        is_training: bool,
        force_perturb: bool,
        clip_size: Option<usize>,
        rng: &mut R,
    ) -> Result<FeatureBundle> {
        if results.is_empty() {
            return Err(Error::InvalidInput("no results to extract features for".to_string()));
        }

        let groups = select_instances(results, is_training, self.use_gt_dets)?;
        let shapes: Vec<ImageShape> = results.iter().map(|r| r.meta.img_shape).collect();
        let mut boxes: Vec<Tensor> = groups.iter().map(|g| g.bboxes.clone()).collect();

        if (is_training || force_perturb) && self.perturber.is_active() {
            tracing::debug!(factor = self.perturber.factor(), ?clip_size, "perturbing boxes");
            boxes = self.perturber.perturb(&boxes, &shapes, clip_size, rng)?;
        }

        match &self.strategy {
            ExtractionStrategy::RegionPooling(roi) => {
                self.pool_regions(detector, roi.as_ref(), images, &groups, &boxes)
            }
            ExtractionStrategy::Queries => self.query(detector, images, results),
        }
    }

    fn pool_regions(
        &self,
        detector: &dyn DetectorAdapter,
        roi: &dyn RoiExtractor,
        images: &Tensor,
        groups: &[InstanceData],
        boxes: &[Tensor],
    ) -> Result<FeatureBundle> {
        let (bb_feats, neck_feats) = match &self.trainable_backbone {
            Some(backbone) => {
                let bb = backbone.backbone_features(images)?;
                let neck = backbone.neck_features(&bb)?;
                (bb, neck)
            }
            None => {
                let bb = detector.backbone_features(images)?;
                let neck = detector.neck_features(&bb)?;
                (bb, neck)
            }
        };

        let inputs = neck_feats.as_ref().unwrap_or(&bb_feats);
        let num_inputs = roi.num_inputs().min(inputs.len());
        let rois = boxes_to_rois(boxes)?;

        let masks: Option<Vec<Tensor>> = if roi.supports_masks() {
            groups.iter().map(|g| g.masks.clone()).collect()
        } else {
            None
        };
        if roi.supports_masks() && masks.is_none() && groups.iter().any(InstanceData::has_masks) {
            tracing::debug!("some images lack masks, pooling without mask weighting");
        }

        let pooled = roi.extract(&inputs[..num_inputs], &rois, masks.as_deref())?;
        let pooled = pooled.flatten_from(1)?;

        let instances_per_img: Vec<usize> = boxes
            .iter()
            .map(|b| b.dim(0))
            .collect::<candle_core::Result<_>>()?;
        let instance_feats = split_and_pad(&pooled, &instances_per_img)?;

        Ok(FeatureBundle {
            bb_feats,
            neck_feats,
            instance_feats,
            instances_per_img,
            semantic_feats: None,
        })
    }

    fn query(
        &self,
        detector: &dyn DetectorAdapter,
        images: &Tensor,
        results: &[DetDataSample],
    ) -> Result<FeatureBundle> {
        if self.trainable_backbone.is_none() {
            if let Some(bundle) = cached_queries(results)? {
                return Ok(bundle);
            }
        }

        let queries = match &self.trainable_backbone {
            Some(backbone) => {
                let selected: Option<Vec<Tensor>> = results
                    .iter()
                    .map(|r| r.pred_instances.instance_ids.clone())
                    .collect();
                backbone.query_features(images, results, selected.as_deref())?
            }
            None => detector.query_features(images, results, None)?,
        };

        match queries {
            QueryFeatures::Padded {
                bb_feats,
                neck_feats,
                instance_feats,
            } => {
                let padded_rows = instance_feats.dim(1)?;
                let instances_per_img = results
                    .iter()
                    .map(|r| r.pred_instances.len().min(padded_rows))
                    .collect();
                Ok(FeatureBundle {
                    bb_feats,
                    neck_feats,
                    instance_feats,
                    instances_per_img,
                    semantic_feats: None,
                })
            }
            QueryFeatures::MaskGuided {
                image_feats,
                instance_feats,
                selected_indices,
            } => {
                if selected_indices.len() != instance_feats.len() {
                    return Err(Error::InvalidInput(format!(
                        "{} query index sets for {} images",
                        selected_indices.len(),
                        instance_feats.len()
                    )));
                }
                // First token of each kept query is the instance feature
                let firsts = instance_feats
                    .iter()
                    .zip(&selected_indices)
                    .map(|(f, ids)| f.index_select(ids, 0)?.narrow(1, 0, 1)?.squeeze(1))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                let instances_per_img = firsts
                    .iter()
                    .map(|f| f.dim(0))
                    .collect::<candle_core::Result<Vec<_>>>()?;

                Ok(FeatureBundle {
                    neck_feats: Some(image_feats.clone()),
                    bb_feats: image_feats,
                    instance_feats: pad_sequence(&firsts)?,
                    instances_per_img,
                    semantic_feats: None,
                })
            }
        }
    }
}

/// Features the detector already attached to its results.
///
/// Used when every image carries `img_feats` `[1, C, H, W]` and per-instance
/// `feats`, so the detector is not run a second time.
fn cached_queries(results: &[DetDataSample]) -> Result<Option<FeatureBundle>> {
    let cached: Option<Vec<(Tensor, Tensor)>> = results
        .iter()
        .map(|r| Some((r.img_feats.clone()?, r.pred_instances.feats.clone()?)))
        .collect();
    let Some(cached) = cached else {
        return Ok(None);
    };

    let (maps, feats): (Vec<Tensor>, Vec<Tensor>) = cached.into_iter().unzip();
    let image_feats = vec![Tensor::cat(&maps, 0)?];
    let instances_per_img = feats
        .iter()
        .map(|f| f.dim(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    tracing::debug!(?instances_per_img, "using detector-cached query features");

    Ok(Some(FeatureBundle {
        neck_feats: Some(image_feats.clone()),
        bb_feats: image_feats,
        instance_feats: pad_sequence(&feats)?,
        instances_per_img,
        semantic_feats: None,
    }))
}
