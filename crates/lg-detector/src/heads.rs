//! Contracts of the collaborators the orchestrator drives.
//!
//! The detector, feature extractors and prediction heads are implemented
//! elsewhere; the orchestrator only sees these traits. Optional heads are
//! held as `Option<Box<dyn ...>>` and checked once at each call site.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::structures::{
    DetDataSample, EdgeAnnotations, FeatureBundle, Graph, LossMap, ReconstructionOutput,
};

/// Instance features produced by a backbone's own query mechanism
#[derive(Debug, Clone)]
pub enum QueryFeatures {
    /// Backbone maps, neck maps and already padded `[B, N_max, D]` queries
    Padded {
        bb_feats: Vec<Tensor>,
        neck_feats: Option<Vec<Tensor>>,
        instance_feats: Tensor,
    },
    /// Per-image `[Q_i, K, D]` features from a mask-guided model with the
    /// `[N_i]` (u32) query index of each kept instance. The first of the
    /// `K` tokens is the instance feature.
    MaskGuided {
        image_feats: Vec<Tensor>,
        instance_feats: Vec<Tensor>,
        selected_indices: Vec<Tensor>,
    },
}

/// Anything that can turn an image batch into feature maps.
///
/// Implemented by the detector itself and by an optional separately
/// trainable backbone.
pub trait FeatureBackbone {
    /// Multi-scale backbone maps for `images` `[B, C, H, W]`.
    fn backbone_features(&self, images: &Tensor) -> Result<Vec<Tensor>>;

    /// Neck maps; `None` when there is no neck.
    fn neck_features(&self, _bb_feats: &[Tensor]) -> Result<Option<Vec<Tensor>>> {
        Ok(None)
    }

    /// Per-instance query features for the given detections.
    ///
    /// `selected` carries the query index of each instance when the
    /// detections came from a mask-guided model.
    fn query_features(
        &self,
        _images: &Tensor,
        _results: &[DetDataSample],
        _selected: Option<&[Tensor]>,
    ) -> Result<QueryFeatures> {
        Err(Error::Unsupported("query features"))
    }
}

/// Wrapped object detector
pub trait DetectorAdapter: FeatureBackbone {
    /// Whether the detector's own parameters are being trained.
    fn is_training(&self) -> bool;

    fn loss(&self, images: &Tensor, samples: &[DetDataSample]) -> Result<LossMap>;

    /// Detect instances; results carry the input samples' metadata and
    /// annotations with `pred_instances` filled in.
    fn predict(
        &self,
        images: &Tensor,
        samples: &[DetDataSample],
        rescale: bool,
    ) -> Result<Vec<DetDataSample>>;
}

/// Region-of-interest feature extractor
pub trait RoiExtractor {
    /// How many feature-map scales are consumed.
    fn num_inputs(&self) -> usize;

    /// Whether `extract` can weight regions by instance masks.
    fn supports_masks(&self) -> bool {
        false
    }

    /// Pool one feature block per ROI row `[img, x1, y1, x2, y2]`.
    fn extract(&self, feats: &[Tensor], rois: &Tensor, masks: Option<&[Tensor]>)
        -> Result<Tensor>;
}

/// Scene-graph head
pub trait GraphHead {
    fn num_edge_classes(&self) -> usize;

    fn loss_and_predict(
        &self,
        results: &[DetDataSample],
        feats: &FeatureBundle,
    ) -> Result<(LossMap, Graph)>;

    fn predict(
        &self,
        results: &[DetDataSample],
        feats: &FeatureBundle,
    ) -> Result<(Graph, Option<EdgeAnnotations>)>;
}

/// Image reconstruction head
pub trait ReconstructionHead {
    fn predict(
        &self,
        results: &[DetDataSample],
        feats: &FeatureBundle,
        graph: Option<&Graph>,
        images: &Tensor,
    ) -> Result<ReconstructionOutput>;
}

/// Loss between reconstructed and target images
pub trait ReconstructionLoss {
    fn compute(
        &self,
        reconstructed: &Tensor,
        targets: &Tensor,
        target_boxes: &[Tensor],
    ) -> Result<LossMap>;
}

/// Graph-conditioned auxiliary prediction head
pub trait DownstreamHead {
    fn loss(
        &self,
        graph: &Graph,
        feats: &FeatureBundle,
        samples: &[DetDataSample],
    ) -> Result<LossMap>;

    /// Per-image predictions plus any auxiliary outputs.
    fn predict(
        &self,
        graph: &Graph,
        feats: &FeatureBundle,
    ) -> Result<(Vec<Tensor>, BTreeMap<String, Tensor>)>;
}
