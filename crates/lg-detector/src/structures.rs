//! Data structures flowing through the detector.
//!
//! Everything here is transient per forward pass: detections and features
//! are produced fresh for each batch and dropped once results are built.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use lg_core::{ImageMeta, ImageShape};

use crate::error::{Error, Result};

/// Named scalar losses
pub type LossMap = BTreeMap<String, Tensor>;

/// Instances detected in (or annotated for) one image
#[derive(Debug, Clone)]
pub struct InstanceData {
    /// Boxes `[N, 4]` as `x1, y1, x2, y2` in working resolution
    pub bboxes: Tensor,
    /// Class indices `[N]` (u32)
    pub labels: Tensor,
    /// Confidence scores `[N]`
    pub scores: Tensor,
    /// Dense masks `[N, H, W]` with values in {0, 1}
    pub masks: Option<Tensor>,
    /// Visual feature per instance `[N, D]`
    pub feats: Option<Tensor>,
    /// GNN-refined feature per instance `[N, D]`
    pub graph_feats: Option<Tensor>,
    /// Indices of the detector queries that produced each instance
    pub instance_ids: Option<Tensor>,
}

impl InstanceData {
    pub fn new(bboxes: Tensor, labels: Tensor, scores: Tensor) -> Self {
        Self {
            bboxes,
            labels,
            scores,
            masks: None,
            feats: None,
            graph_feats: None,
            instance_ids: None,
        }
    }

    pub fn empty(device: &Device) -> Result<Self> {
        Ok(Self::new(
            Tensor::zeros((0, 4), DType::F32, device)?,
            Tensor::zeros(0, DType::U32, device)?,
            Tensor::zeros(0, DType::F32, device)?,
        ))
    }

    pub fn with_masks(mut self, masks: Tensor) -> Self {
        self.masks = Some(masks);
        self
    }

    pub fn len(&self) -> usize {
        self.bboxes.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_masks(&self) -> bool {
        self.masks.is_some()
    }

    /// Cut the detection tensors out of the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            bboxes: self.bboxes.detach(),
            labels: self.labels.detach(),
            scores: self.scores.detach(),
            masks: self.masks.as_ref().map(|m| m.detach()),
            feats: self.feats.clone(),
            graph_feats: self.graph_feats.clone(),
            instance_ids: self.instance_ids.clone(),
        }
    }
}

/// One image's sample: metadata, annotations, predictions and whatever the
/// heads attach during `predict`.
#[derive(Debug, Clone)]
pub struct DetDataSample {
    pub meta: ImageMeta,
    pub gt_instances: InstanceData,
    pub pred_instances: InstanceData,
    /// Image-level map `[1, C, H, W]` cached by the detector, if any
    pub img_feats: Option<Tensor>,
    pub gt_edges: Option<EdgeSet>,
    pub pred_edges: Option<EdgeSet>,
    pub lg: Option<LatentGraph>,
    pub reconstruction: Option<Tensor>,
    pub pred_ds: Option<Tensor>,
}

impl DetDataSample {
    pub fn new(meta: ImageMeta, gt_instances: InstanceData, device: &Device) -> Result<Self> {
        Ok(Self {
            meta,
            gt_instances,
            pred_instances: InstanceData::empty(device)?,
            img_feats: None,
            gt_edges: None,
            pred_edges: None,
            lg: None,
            reconstruction: None,
            pred_ds: None,
        })
    }
}

/// Image and instance features for a batch
#[derive(Debug, Clone)]
pub struct FeatureBundle {
    /// Multi-scale backbone maps, each `[B, C, H, W]`
    pub bb_feats: Vec<Tensor>,
    /// Neck maps, same family as the backbone's
    pub neck_feats: Option<Vec<Tensor>>,
    /// Zero-padded instance features `[B, N_max, D]`
    pub instance_feats: Tensor,
    /// Number of valid rows per image in `instance_feats`
    pub instances_per_img: Vec<usize>,
    /// Zero-padded semantic features `[B, N_max, S]`
    pub semantic_feats: Option<Tensor>,
}

impl FeatureBundle {
    pub fn max_instances(&self) -> usize {
        self.instances_per_img.iter().copied().max().unwrap_or(0)
    }

    /// Instance features of image `img` without the padding rows.
    pub fn valid_instance_feats(&self, img: usize) -> Result<Tensor> {
        let n = self.count(img)?;
        Ok(self.instance_feats.get(img)?.narrow(0, 0, n)?)
    }

    /// Semantic features of image `img` without the padding rows.
    pub fn valid_semantic_feats(&self, img: usize) -> Result<Option<Tensor>> {
        let n = self.count(img)?;
        match &self.semantic_feats {
            Some(s) => {
                let rows = s.dim(1)?.min(n);
                Ok(Some(s.get(img)?.narrow(0, 0, rows)?))
            }
            None => Ok(None),
        }
    }

    fn count(&self, img: usize) -> Result<usize> {
        self.instances_per_img.get(img).copied().ok_or_else(|| {
            Error::InvalidInput(format!(
                "image {} out of range for batch of {}",
                img,
                self.instances_per_img.len()
            ))
        })
    }
}

/// Graph nodes, aligned 1:1 with instances
#[derive(Debug, Clone)]
pub struct GraphNodes {
    /// GNN-refined visual features `[B, N_max, D]`
    pub gnn_viz_feats: Tensor,
    pub nodes_per_img: Vec<usize>,
}

/// Batched graph edges
#[derive(Debug, Clone)]
pub struct GraphEdges {
    /// `[E, 3]` u32 rows of `(image, source, target)`
    pub edge_flats: Tensor,
    pub edges_per_img: Vec<usize>,
    /// Per-image union boxes, each `[E_i, 4]`
    pub boxes: Vec<Tensor>,
    /// Relation-class logits `[E, C_edge]`
    pub class_logits: Tensor,
    /// Edge semantic features `[E, S]`
    pub semantic_feats: Option<Tensor>,
    /// Edge existence logits, batch-level only
    pub presence_logits: Option<Tensor>,
    /// Further per-edge tensors `[E, ...]` emitted by the graph head
    pub extra: BTreeMap<String, Tensor>,
}

impl GraphEdges {
    pub fn num_edges(&self) -> usize {
        self.edges_per_img.iter().sum()
    }

    /// Start row of each image's edges in the batched tensors.
    pub fn offsets(&self) -> Vec<usize> {
        self.edges_per_img
            .iter()
            .scan(0usize, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect()
    }
}

/// Latent graph for a whole batch
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: GraphNodes,
    pub edges: GraphEdges,
}

/// Ground-truth edges per image, as returned by the graph head
#[derive(Debug, Clone)]
pub struct EdgeAnnotations {
    /// `[E_i, 2]` source/target pairs
    pub edge_flats: Vec<Tensor>,
    pub edge_boxes: Vec<Tensor>,
    pub relations: Vec<Tensor>,
}

/// Edges of one image attached to a result
#[derive(Debug, Clone)]
pub struct EdgeSet {
    /// `[E_i, 2]` source/target pairs (no image column)
    pub edge_flats: Tensor,
    pub edge_boxes: Tensor,
    pub relations: Tensor,
}

/// Nodes of one image's latent graph
#[derive(Debug, Clone)]
pub struct LatentNodes {
    pub viz_feats: Tensor,
    pub gnn_viz_feats: Tensor,
    pub semantic_feats: Option<Tensor>,
    pub nodes_per_img: usize,
    pub bboxes: Tensor,
    pub scores: Tensor,
    pub labels: Tensor,
    pub masks: Option<Tensor>,
}

/// Edges of one image's latent graph
#[derive(Debug, Clone)]
pub struct LatentEdges {
    /// `[E_i, 2]` source/target pairs (no image column)
    pub edge_flats: Tensor,
    pub boxes: Tensor,
    pub class_logits: Tensor,
    pub semantic_feats: Option<Tensor>,
    pub extra: BTreeMap<String, Tensor>,
}

impl LatentEdges {
    pub fn len(&self) -> usize {
        self.edge_flats.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-image latent graph attached to a result
#[derive(Debug, Clone)]
pub struct LatentGraph {
    pub nodes: LatentNodes,
    pub edges: LatentEdges,
    /// Globally pooled last backbone map `[C]`
    pub img_feats: Option<Tensor>,
    pub ori_shape: ImageShape,
    pub batch_input_shape: ImageShape,
}

/// Output of a reconstruction head
#[derive(Debug, Clone)]
pub struct ReconstructionOutput {
    /// Reconstructed images `[B, C, H, W]`
    pub images: Tensor,
    /// Reconstruction targets `[B, C, H, W]`
    pub targets: Tensor,
    /// Results rescaled to the reconstruction resolution
    pub rescaled: Vec<DetDataSample>,
}

/// Everything produced by latent-graph extraction
#[derive(Debug, Clone)]
pub struct LgOutput {
    pub feats: FeatureBundle,
    pub graph: Option<Graph>,
    pub results: Vec<DetDataSample>,
    pub gt_edges: Option<EdgeAnnotations>,
    pub losses: LossMap,
}
