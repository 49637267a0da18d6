//! The latent-graph detector.
//!
//! [`LgDetector`] wraps an object detector and sequences feature
//! extraction, semantic encoding and the optional graph, reconstruction and
//! downstream heads. It owns no tensors between calls: every `loss` or
//! `predict` builds its feature bundle and graph from scratch.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use lg_core::ImageShape;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::aggregate::{
    add_lg_to_results, add_scene_graph_to_results, renormalize_reconstruction, rescale_results,
};
use crate::config::LgDetectorConfig;
use crate::error::{Error, Result};
use crate::features::{select_instances, ExtractionStrategy, FeatureExtractor};
use crate::heads::{
    DetectorAdapter, DownstreamHead, FeatureBackbone, GraphHead, ReconstructionHead,
    ReconstructionLoss, RoiExtractor,
};
use crate::semantic::SemanticEncoder;
use crate::structures::{DetDataSample, LgOutput, LossMap};

/// Assembles an [`LgDetector`] from its collaborators.
///
/// Every head is optional; leaving one out disables it.
pub struct LgDetectorBuilder {
    config: LgDetectorConfig,
    detector: Box<dyn DetectorAdapter>,
    graph_head: Option<Box<dyn GraphHead>>,
    reconstruction_head: Option<Box<dyn ReconstructionHead>>,
    reconstruction_loss: Option<Box<dyn ReconstructionLoss>>,
    ds_head: Option<Box<dyn DownstreamHead>>,
    roi_extractor: Option<Box<dyn RoiExtractor>>,
    trainable_backbone: Option<Box<dyn FeatureBackbone>>,
}

impl LgDetectorBuilder {
    pub fn new(config: LgDetectorConfig, detector: Box<dyn DetectorAdapter>) -> Self {
        Self {
            config,
            detector,
            graph_head: None,
            reconstruction_head: None,
            reconstruction_loss: None,
            ds_head: None,
            roi_extractor: None,
            trainable_backbone: None,
        }
    }

    pub fn graph_head(mut self, head: Box<dyn GraphHead>) -> Self {
        self.graph_head = Some(head);
        self
    }

    pub fn reconstruction(
        mut self,
        head: Box<dyn ReconstructionHead>,
        loss: Box<dyn ReconstructionLoss>,
    ) -> Self {
        self.reconstruction_head = Some(head);
        self.reconstruction_loss = Some(loss);
        self
    }

    pub fn reconstruction_head(mut self, head: Box<dyn ReconstructionHead>) -> Self {
        self.reconstruction_head = Some(head);
        self
    }

    pub fn reconstruction_loss(mut self, loss: Box<dyn ReconstructionLoss>) -> Self {
        self.reconstruction_loss = Some(loss);
        self
    }

    pub fn ds_head(mut self, head: Box<dyn DownstreamHead>) -> Self {
        self.ds_head = Some(head);
        self
    }

    /// Pool instance features from regions instead of detector queries.
    pub fn roi_extractor(mut self, extractor: Box<dyn RoiExtractor>) -> Self {
        self.roi_extractor = Some(extractor);
        self
    }

    /// Backbone used for instance features in place of the detector's.
    pub fn trainable_backbone(mut self, backbone: Box<dyn FeatureBackbone>) -> Self {
        self.trainable_backbone = Some(backbone);
        self
    }

    pub fn build(self, vb: VarBuilder) -> Result<LgDetector> {
        let config = self.config;
        config.validate()?;

        let reconstruction = match (self.reconstruction_head, self.reconstruction_loss) {
            (Some(head), Some(loss)) => Some(Reconstruction { head, loss }),
            (Some(_), None) => {
                return Err(Error::Config(
                    "reconstruction head configured without a reconstruction loss".to_string(),
                ))
            }
            (None, Some(_)) => {
                tracing::warn!("reconstruction loss configured without a head, ignoring it");
                None
            }
            (None, None) => None,
        };

        if self.ds_head.is_some() && self.graph_head.is_none() {
            tracing::warn!("downstream head configured without a graph head; loss and predict will fail");
        }

        let num_edge_classes = self.graph_head.as_ref().map_or(0, |g| g.num_edge_classes());
        let encode_semantics = config.force_encode_semantics
            || ((self.ds_head.is_some() || reconstruction.is_some()) && config.semantic_feat_size > 0);

        let semantic = if encode_semantics {
            if config.semantic_feat_size == 0 {
                return Err(Error::Config(
                    "semantic encoding forced with semantic_feat_size 0".to_string(),
                ));
            }
            Some(SemanticEncoder::new(&config, num_edge_classes, vb.pp("semantic"))?)
        } else {
            None
        };

        let strategy = match self.roi_extractor {
            Some(roi) => ExtractionStrategy::RegionPooling(roi),
            None => ExtractionStrategy::Queries,
        };
        let features = FeatureExtractor::new(
            strategy,
            self.trainable_backbone,
            config.perturber()?,
            config.use_gt_dets,
        );

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        tracing::info!(
            graph_head = self.graph_head.is_some(),
            reconstruction = reconstruction.is_some(),
            ds_head = self.ds_head.is_some(),
            region_pooling = features.uses_region_pooling(),
            encode_semantics,
            perturb_factor = config.effective_perturb_factor(),
            "LG detector built"
        );

        Ok(LgDetector {
            config,
            detector: self.detector,
            features,
            semantic,
            graph_head: self.graph_head,
            reconstruction,
            ds_head: self.ds_head,
            training: true,
            rng: Mutex::new(rng),
        })
    }
}

struct Reconstruction {
    head: Box<dyn ReconstructionHead>,
    loss: Box<dyn ReconstructionLoss>,
}

/// Detector with latent-graph, semantic, reconstruction and downstream heads
pub struct LgDetector {
    config: LgDetectorConfig,
    detector: Box<dyn DetectorAdapter>,
    features: FeatureExtractor,
    semantic: Option<SemanticEncoder>,
    graph_head: Option<Box<dyn GraphHead>>,
    reconstruction: Option<Reconstruction>,
    ds_head: Option<Box<dyn DownstreamHead>>,
    training: bool,
    rng: Mutex<StdRng>,
}

impl LgDetector {
    pub fn config(&self) -> &LgDetectorConfig {
        &self.config
    }

    /// Whether the model is in training mode (the default after `build`).
    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn encodes_semantics(&self) -> bool {
        self.semantic.is_some()
    }

    pub fn has_graph_head(&self) -> bool {
        self.graph_head.is_some()
    }

    /// Generic dispatch is not offered; use [`Self::loss`] or [`Self::predict`].
    pub fn forward(&self, _images: &Tensor, _samples: &[DetDataSample]) -> Result<Vec<DetDataSample>> {
        Err(Error::UnsupportedForward)
    }

    fn require_graph_head_for_ds(&self) -> Result<()> {
        if self.ds_head.is_some() && self.graph_head.is_none() {
            return Err(Error::MissingGraphHead);
        }
        Ok(())
    }

    /// Training losses for a batch with annotations.
    pub fn loss(&self, images: &Tensor, samples: &[DetDataSample]) -> Result<LossMap> {
        self.require_graph_head_for_ds()?;

        let mut losses = if self.detector.is_training() {
            self.detector.loss(images, samples)?
        } else {
            tracing::debug!("detector frozen, skipping detection losses");
            LossMap::new()
        };

        let lg = self.extract_lg(images, samples, false, None)?;
        losses.extend(lg.losses);

        if let Some(recon) = &self.reconstruction {
            let output = recon
                .head
                .predict(&lg.results, &lg.feats, lg.graph.as_ref(), images)?;

            let target_boxes: Vec<Tensor> = output
                .rescaled
                .iter()
                .map(|r| {
                    if r.meta.is_det_keyframe && !self.config.use_pred_boxes_recon_loss {
                        r.gt_instances.bboxes.clone()
                    } else {
                        r.pred_instances.bboxes.clone()
                    }
                })
                .collect();

            losses.extend(recon.loss.compute(&output.images, &output.targets, &target_boxes)?);
        }

        if let Some(ds) = &self.ds_head {
            let graph = lg.graph.as_ref().ok_or(Error::MissingGraphHead)?;
            losses.extend(ds.loss(graph, &lg.feats, samples)?);
        }

        tracing::debug!(num_losses = losses.len(), "losses computed");
        Ok(losses)
    }

    /// Detections with latent graph, scene graph, reconstruction and
    /// downstream predictions attached, optionally mapped back to original
    /// image resolution.
    pub fn predict(
        &self,
        images: &Tensor,
        samples: &[DetDataSample],
        rescale: bool,
    ) -> Result<Vec<DetDataSample>> {
        self.require_graph_head_for_ds()?;

        let LgOutput {
            feats,
            graph,
            mut results,
            gt_edges,
            ..
        } = self.extract_lg(images, samples, false, None)?;

        if let Some(graph) = &graph {
            add_lg_to_results(&mut results, &feats, graph)?;
            add_scene_graph_to_results(&mut results, gt_edges.as_ref(), graph)?;
        }

        if let Some(recon) = &self.reconstruction {
            let output = recon.head.predict(&results, &feats, graph.as_ref(), images)?;
            let stats = self.config.reconstruction_img_stats.clone().unwrap_or_default();
            let images = renormalize_reconstruction(&output.images, &stats)?;

            for (i, r) in results.iter_mut().enumerate() {
                r.reconstruction = Some(images.get(i)?);
            }
        }

        if let Some(ds) = &self.ds_head {
            let graph = graph.as_ref().ok_or(Error::MissingGraphHead)?;
            let (preds, _) = ds.predict(graph, &feats)?;
            for (r, p) in results.iter_mut().zip(preds) {
                r.pred_ds = Some(p);
            }
        }

        if rescale {
            rescale_results(&mut results)?;
        }

        Ok(results)
    }

    /// Run the detector and build instance features and the latent graph.
    ///
    /// `force_perturb` jitters boxes outside training; `clip_size` makes
    /// frames of the same clip share one jitter draw.
    pub fn extract_lg(
        &self,
        images: &Tensor,
        samples: &[DetDataSample],
        force_perturb: bool,
        clip_size: Option<usize>,
    ) -> Result<LgOutput> {
        let mut results = self.detector.predict(images, samples, false)?;
        for r in results.iter_mut() {
            r.pred_instances = r.pred_instances.detach();
        }

        let mut feats = {
            let mut rng = self.rng.lock();
            self.features.extract(
                self.detector.as_ref(),
                images,
                &results,
                self.training,
                force_perturb,
                clip_size,
                &mut *rng,
            )?
        };

        for (img, r) in results.iter_mut().enumerate() {
            let valid = feats.valid_instance_feats(img)?;
            let n = r.pred_instances.len().min(valid.dim(0)?);
            r.pred_instances.feats = Some(valid.narrow(0, 0, n)?);
        }

        let mut losses = LossMap::new();
        let mut gt_edges = None;
        let mut graph = match &self.graph_head {
            Some(head) => {
                let train_graph = self.detector.is_training()
                    || (self.config.force_train_graph_head && self.training);
                if train_graph {
                    tracing::debug!("training graph head");
                    let (graph_losses, graph) = head.loss_and_predict(&results, &feats)?;
                    losses.extend(graph_losses);
                    Some(graph)
                } else {
                    let (graph, edges) = head.predict(&results, &feats)?;
                    gt_edges = edges;
                    Some(graph)
                }
            }
            None => None,
        };

        if let Some(encoder) = &self.semantic {
            let groups = select_instances(&results, self.training, self.config.use_gt_dets)?;
            let shapes: Vec<ImageShape> = results.iter().map(|r| r.meta.img_shape).collect();
            let node_semantics = {
                let mut rng = self.rng.lock();
                encoder.encode_nodes(&groups, &shapes, self.training, &mut *rng)?
            };
            feats.semantic_feats = Some(node_semantics);

            if let (Some(graph), Some(first)) = (graph.as_mut(), results.first()) {
                graph.edges.semantic_feats =
                    encoder.encode_edges(&graph.edges, first.meta.batch_input_shape, self.training)?;
            }
        }

        if let Some(graph) = &graph {
            let rows = graph.nodes.gnn_viz_feats.dim(1)?;
            for (img, r) in results.iter_mut().enumerate() {
                let n = r.pred_instances.len().min(rows);
                r.pred_instances.graph_feats = Some(graph.nodes.gnn_viz_feats.get(img)?.narrow(0, 0, n)?);
            }
        }

        Ok(LgOutput {
            feats,
            graph,
            results,
            gt_edges,
            losses,
        })
    }
}
