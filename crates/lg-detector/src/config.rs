//! Construction-time configuration of the latent-graph detector.

use serde::{Deserialize, Serialize};

use crate::bbox::BoxPerturber;
use crate::error::{Error, Result};

/// Per-channel statistics used to normalize reconstruction targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionImageStats {
    /// Channel means in 0-255 pixel units
    pub mean: Vec<f32>,
    /// Channel standard deviations in 0-255 pixel units
    pub std: Vec<f32>,
}

impl Default for ReconstructionImageStats {
    fn default() -> Self {
        Self {
            mean: vec![123.675, 116.28, 103.53],
            std: vec![58.395, 57.12, 57.375],
        }
    }
}

/// Complete detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LgDetectorConfig {
    /// Number of object classes
    pub num_classes: usize,
    /// Size of per-instance visual features
    pub viz_feat_size: usize,
    /// Size of semantic embeddings (0 disables semantics unless forced)
    pub semantic_feat_size: usize,
    /// Hidden width of the semantic projectors
    pub sem_feat_hidden_dim: usize,
    /// Number of linear layers in the semantic projectors
    pub semantic_feat_projector_layers: usize,
    /// Box jitter strength during training (0 disables)
    pub perturb_factor: f32,
    /// Range of the uniform jitter draw, as multiples of box extent
    pub perturb_range: [f32; 2],
    /// Weight reconstruction by predicted instead of annotated boxes
    pub use_pred_boxes_recon_loss: bool,
    /// Use annotated detections on keyframes while training
    pub use_gt_dets: bool,
    /// Train the graph head even when the detector is frozen
    pub force_train_graph_head: bool,
    pub sem_feat_use_class_logits: bool,
    pub sem_feat_use_bboxes: bool,
    pub sem_feat_use_masks: bool,
    /// Points per polygonized mask
    pub mask_polygon_num_points: usize,
    /// Randomly rotate polygon start points while training
    pub mask_augment: bool,
    /// Encode semantics even without a head that consumes them
    pub force_encode_semantics: bool,
    pub reconstruction_img_stats: Option<ReconstructionImageStats>,
    /// Seed for perturbation and mask augmentation
    pub seed: Option<u64>,
}

impl Default for LgDetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 6,
            viz_feat_size: 256,
            semantic_feat_size: 512,
            sem_feat_hidden_dim: 2048,
            semantic_feat_projector_layers: 3,
            perturb_factor: 0.0,
            perturb_range: [-1.0, 0.0],
            use_pred_boxes_recon_loss: false,
            use_gt_dets: false,
            force_train_graph_head: false,
            sem_feat_use_class_logits: true,
            sem_feat_use_bboxes: true,
            sem_feat_use_masks: true,
            mask_polygon_num_points: 16,
            mask_augment: true,
            force_encode_semantics: false,
            reconstruction_img_stats: None,
            seed: None,
        }
    }
}

impl LgDetectorConfig {
    /// Load configuration from file, with `LG_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LG"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("LG"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".to_string()));
        }
        if self.viz_feat_size == 0 {
            return Err(Error::Config("viz_feat_size must be positive".to_string()));
        }
        if self.semantic_feat_projector_layers == 0 {
            return Err(Error::Config(
                "semantic_feat_projector_layers must be at least 1".to_string(),
            ));
        }
        if self.mask_polygon_num_points == 0 {
            return Err(Error::Config(
                "mask_polygon_num_points must be positive".to_string(),
            ));
        }
        if let Some(stats) = &self.reconstruction_img_stats {
            if stats.mean.len() != stats.std.len() || stats.mean.is_empty() {
                return Err(Error::Config(
                    "reconstruction image mean and std must have the same non-zero length"
                        .to_string(),
                ));
            }
        }
        self.perturber().map(|_| ())
    }

    /// Jitter is disabled whenever annotated detections are used.
    pub fn effective_perturb_factor(&self) -> f32 {
        if self.use_gt_dets {
            0.0
        } else {
            self.perturb_factor
        }
    }

    pub fn perturber(&self) -> Result<BoxPerturber> {
        BoxPerturber::new(
            self.effective_perturb_factor(),
            (self.perturb_range[0], self.perturb_range[1]),
        )
    }

    /// Input width of the node semantic projector.
    pub fn node_semantic_input_dim(&self) -> usize {
        let mut dim = 1; // score
        if self.sem_feat_use_bboxes {
            dim += 4;
        }
        if self.sem_feat_use_class_logits {
            dim += self.num_classes;
        }
        if self.sem_feat_use_masks {
            dim += self.mask_polygon_num_points * 2;
        }
        dim
    }

    /// Input width of the edge semantic projector (no score term).
    pub fn edge_semantic_input_dim(&self, num_edge_classes: usize) -> usize {
        let mut dim = 0;
        if self.sem_feat_use_bboxes {
            dim += 4;
        }
        if self.sem_feat_use_class_logits {
            dim += num_edge_classes;
        }
        dim
    }

    /// Layer widths of a projector with the given input width.
    ///
    /// A layer count of zero is rejected by `validate`; here it gives a
    /// single input-to-output layer.
    pub fn projector_dims(&self, input_dim: usize) -> Vec<usize> {
        let hidden = self.semantic_feat_projector_layers.saturating_sub(1);
        let mut dims = vec![input_dim];
        dims.extend(std::iter::repeat(self.sem_feat_hidden_dim).take(hidden));
        dims.push(self.semantic_feat_size);
        dims
    }
}
