//! End-to-end behavior of `LgDetector` with mock collaborators.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use lg_core::{ImageMeta, ImageShape, ScaleFactor};
use lg_detector::{
    BoxWeightedLossConfig, BoxWeightedReconstructionLoss, DetDataSample, DetectorAdapter,
    DownstreamHead, EdgeAnnotations, Error, FeatureBackbone, FeatureBundle, Graph, GraphEdges,
    GraphHead, GraphNodes, InstanceData, LgDetector, LgDetectorBuilder, LgDetectorConfig, LossMap,
    QueryFeatures, ReconstructionHead, ReconstructionLoss, ReconstructionOutput, Result, RoiAlign2d,
    RoiAlignConfig,
};

const CHANNELS: usize = 4;
const SIZE: usize = 32;

fn instances(n: usize, with_masks: bool, device: &Device) -> Result<InstanceData> {
    let boxes: Vec<f32> = (0..n)
        .flat_map(|i| {
            let x = (i * 5 % 20) as f32;
            [x, 2.0, x + 10.0, 14.0]
        })
        .collect();
    let labels: Vec<u32> = (0..n).map(|i| (i % 3) as u32).collect();
    let inst = InstanceData::new(
        Tensor::from_vec(boxes, (n, 4), device)?,
        Tensor::from_vec(labels, n, device)?,
        Tensor::full(0.8f32, n, device)?,
    );

    if !with_masks {
        return Ok(inst);
    }
    let mut masks = vec![0.0f32; n * SIZE * SIZE];
    for i in 0..n {
        let x0 = i * 5 % 20;
        for y in 2..14 {
            for x in x0..x0 + 10 {
                masks[i * SIZE * SIZE + y * SIZE + x] = 1.0;
            }
        }
    }
    Ok(inst.with_masks(Tensor::from_vec(masks, (n, SIZE, SIZE), device)?))
}

fn samples(gt_counts: &[usize], keyframes: &[bool]) -> Result<Vec<DetDataSample>> {
    let device = Device::Cpu;
    gt_counts
        .iter()
        .zip(keyframes)
        .map(|(&n, &keyframe)| {
            let meta = ImageMeta {
                ori_shape: ImageShape::new(2 * SIZE, 2 * SIZE),
                img_shape: ImageShape::new(SIZE, SIZE),
                batch_input_shape: ImageShape::new(SIZE, SIZE),
                scale_factor: ScaleFactor::new(0.5, 0.5),
                is_det_keyframe: keyframe,
            };
            DetDataSample::new(meta, instances(n, true, &device)?, &device)
        })
        .collect()
}

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, SIZE, SIZE), &Device::Cpu)?)
}

struct MockDetector {
    training: bool,
    counts: Vec<usize>,
    with_masks: bool,
}

impl FeatureBackbone for MockDetector {
    fn backbone_features(&self, images: &Tensor) -> Result<Vec<Tensor>> {
        let (b, _, h, w) = images.dims4()?;
        Ok(vec![Tensor::randn(0f32, 1.0, (b, CHANNELS, h / 4, w / 4), images.device())?])
    }

    fn query_features(
        &self,
        images: &Tensor,
        results: &[DetDataSample],
        _selected: Option<&[Tensor]>,
    ) -> Result<QueryFeatures> {
        let bb_feats = self.backbone_features(images)?;
        let max = results.iter().map(|r| r.pred_instances.len()).max().unwrap_or(0);
        Ok(QueryFeatures::Padded {
            bb_feats,
            neck_feats: None,
            instance_feats: Tensor::ones((results.len(), max, CHANNELS), DType::F32, images.device())?,
        })
    }
}

impl DetectorAdapter for MockDetector {
    fn is_training(&self) -> bool {
        self.training
    }

    fn loss(&self, _images: &Tensor, _samples: &[DetDataSample]) -> Result<LossMap> {
        let mut losses = LossMap::new();
        losses.insert("loss_cls".to_string(), Tensor::new(0.5f32, &Device::Cpu)?);
        Ok(losses)
    }

    fn predict(&self, _images: &Tensor, samples: &[DetDataSample], _rescale: bool) -> Result<Vec<DetDataSample>> {
        samples
            .iter()
            .zip(&self.counts)
            .map(|(s, &n)| {
                let mut r = s.clone();
                r.pred_instances = instances(n, self.with_masks, &Device::Cpu)?;
                Ok(r)
            })
            .collect()
    }
}

/// Links node 0 to node 1 in every image with at least two nodes
#[derive(Clone, Default)]
struct MockGraphHead {
    trained: Rc<Cell<usize>>,
    inferred: Rc<Cell<usize>>,
}

impl MockGraphHead {
    fn graph(&self, feats: &FeatureBundle) -> Result<Graph> {
        let device = Device::Cpu;
        let mut flats = Vec::new();
        let mut edges_per_img = Vec::new();
        let mut boxes = Vec::new();
        for (img, &n) in feats.instances_per_img.iter().enumerate() {
            let e = usize::from(n >= 2);
            if e == 1 {
                flats.extend([img as u32, 0, 1]);
            }
            edges_per_img.push(e);
            boxes.push(Tensor::new(&[[0.0f32, 0.0, 16.0, 16.0]], &device)?.narrow(0, 0, e)?);
        }
        let total = edges_per_img.iter().sum::<usize>();

        Ok(Graph {
            nodes: GraphNodes {
                gnn_viz_feats: (feats.instance_feats.clone() * 2.0)?,
                nodes_per_img: feats.instances_per_img.clone(),
            },
            edges: GraphEdges {
                edge_flats: Tensor::from_vec(flats, (total, 3), &device)?,
                edges_per_img,
                boxes,
                class_logits: Tensor::randn(0f32, 1.0, (total, 2), &device)?,
                semantic_feats: None,
                presence_logits: Some(Tensor::zeros(total, DType::F32, &device)?),
                extra: BTreeMap::new(),
            },
        })
    }
}

impl GraphHead for MockGraphHead {
    fn num_edge_classes(&self) -> usize {
        2
    }

    fn loss_and_predict(&self, _results: &[DetDataSample], feats: &FeatureBundle) -> Result<(LossMap, Graph)> {
        self.trained.set(self.trained.get() + 1);
        let mut losses = LossMap::new();
        losses.insert("loss_graph".to_string(), Tensor::new(1.0f32, &Device::Cpu)?);
        Ok((losses, self.graph(feats)?))
    }

    fn predict(&self, results: &[DetDataSample], feats: &FeatureBundle) -> Result<(Graph, Option<EdgeAnnotations>)> {
        self.inferred.set(self.inferred.get() + 1);
        let device = Device::Cpu;
        let gt = EdgeAnnotations {
            edge_flats: results
                .iter()
                .map(|_| Tensor::zeros((0, 2), DType::U32, &device))
                .collect::<candle_core::Result<_>>()?,
            edge_boxes: results
                .iter()
                .map(|_| Tensor::zeros((0, 4), DType::F32, &device))
                .collect::<candle_core::Result<_>>()?,
            relations: results
                .iter()
                .map(|_| Tensor::zeros(0, DType::U32, &device))
                .collect::<candle_core::Result<_>>()?,
        };
        Ok((self.graph(feats)?, Some(gt)))
    }
}

/// Reconstructs a blank image
struct MockReconstruction;

impl ReconstructionHead for MockReconstruction {
    fn predict(
        &self,
        results: &[DetDataSample],
        _feats: &FeatureBundle,
        _graph: Option<&Graph>,
        images: &Tensor,
    ) -> Result<ReconstructionOutput> {
        Ok(ReconstructionOutput {
            images: images.zeros_like()?,
            targets: images.clone(),
            rescaled: results.to_vec(),
        })
    }
}

/// Remembers how many target boxes each image was scored against
#[derive(Clone, Default)]
struct RecordingLoss {
    box_counts: Rc<RefCell<Vec<Vec<usize>>>>,
}

impl ReconstructionLoss for RecordingLoss {
    fn compute(&self, _reconstructed: &Tensor, _targets: &Tensor, target_boxes: &[Tensor]) -> Result<LossMap> {
        let counts = target_boxes
            .iter()
            .map(|b| b.dim(0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        self.box_counts.borrow_mut().push(counts);
        let mut losses = LossMap::new();
        losses.insert("reconstruction_loss".to_string(), Tensor::new(0.0f32, &Device::Cpu)?);
        Ok(losses)
    }
}

struct MockDownstream;

impl DownstreamHead for MockDownstream {
    fn loss(&self, _graph: &Graph, _feats: &FeatureBundle, _samples: &[DetDataSample]) -> Result<LossMap> {
        let mut losses = LossMap::new();
        losses.insert("loss_ds".to_string(), Tensor::new(0.25f32, &Device::Cpu)?);
        Ok(losses)
    }

    fn predict(&self, graph: &Graph, _feats: &FeatureBundle) -> Result<(Vec<Tensor>, BTreeMap<String, Tensor>)> {
        let preds = graph
            .nodes
            .nodes_per_img
            .iter()
            .map(|_| Tensor::new(&[0.1f32, 0.2, 0.7], &Device::Cpu))
            .collect::<candle_core::Result<_>>()?;
        Ok((preds, BTreeMap::new()))
    }
}

fn config() -> LgDetectorConfig {
    LgDetectorConfig {
        num_classes: 3,
        viz_feat_size: CHANNELS,
        semantic_feat_size: 8,
        sem_feat_hidden_dim: 16,
        semantic_feat_projector_layers: 2,
        mask_polygon_num_points: 4,
        seed: Some(17),
        ..Default::default()
    }
}

fn detector(training: bool, counts: &[usize]) -> Box<MockDetector> {
    Box::new(MockDetector {
        training,
        counts: counts.to_vec(),
        with_masks: true,
    })
}

fn roi() -> Result<Box<RoiAlign2d>> {
    Ok(Box::new(RoiAlign2d::new(RoiAlignConfig {
        featmap_strides: vec![4],
        ..Default::default()
    })?))
}

fn recon_loss() -> Result<Box<BoxWeightedReconstructionLoss>> {
    Ok(Box::new(BoxWeightedReconstructionLoss::new(BoxWeightedLossConfig::default())?))
}

fn full_model(detector_training: bool, config: LgDetectorConfig, counts: &[usize], graph: MockGraphHead) -> Result<LgDetector> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    LgDetectorBuilder::new(config, detector(detector_training, counts))
        .roi_extractor(roi()?)
        .graph_head(Box::new(graph))
        .reconstruction(Box::new(MockReconstruction), recon_loss()?)
        .ds_head(Box::new(MockDownstream))
        .build(vb)
}

#[test]
fn test_training_detector_collects_all_losses() -> Result<()> {
    let graph = MockGraphHead::default();
    let model = full_model(true, config(), &[3, 0, 2], graph.clone())?;

    let losses = model.loss(&images(3)?, &samples(&[2, 1, 0], &[true, false, true])?)?;

    let keys: Vec<&str> = losses.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["loss_cls", "loss_ds", "loss_graph", "reconstruction_loss"]);
    assert_eq!(graph.trained.get(), 1);
    assert_eq!(graph.inferred.get(), 0);
    Ok(())
}

#[test]
fn test_frozen_detector_skips_detection_and_graph_losses() -> Result<()> {
    let graph = MockGraphHead::default();
    let model = full_model(false, config(), &[2, 2], graph.clone())?;

    let losses = model.loss(&images(2)?, &samples(&[1, 1], &[true, true])?)?;

    assert!(!losses.contains_key("loss_cls"));
    assert!(!losses.contains_key("loss_graph"));
    assert!(losses.contains_key("reconstruction_loss"));
    assert_eq!(graph.inferred.get(), 1);
    Ok(())
}

#[test]
fn test_forced_graph_training_needs_training_mode() -> Result<()> {
    let graph = MockGraphHead::default();
    let forced = LgDetectorConfig {
        force_train_graph_head: true,
        ..config()
    };
    let mut model = full_model(false, forced, &[2, 3], graph.clone())?;
    let batch = samples(&[1, 1], &[true, true])?;

    let losses = model.loss(&images(2)?, &batch)?;
    assert!(losses.contains_key("loss_graph"));
    assert_eq!(graph.trained.get(), 1);

    model.eval();
    model.extract_lg(&images(2)?, &batch, false, None)?;
    assert_eq!(graph.trained.get(), 1);
    assert_eq!(graph.inferred.get(), 1);
    Ok(())
}

#[test]
fn test_instance_feats_padded_to_max_count() -> Result<()> {
    let mut model = full_model(false, config(), &[1, 4, 0], MockGraphHead::default())?;
    model.eval();

    let out = model.extract_lg(&images(3)?, &samples(&[0, 0, 0], &[false; 3])?, false, None)?;

    assert_eq!(out.feats.instance_feats.dims(), &[3, 4, CHANNELS]);
    assert_eq!(out.feats.instances_per_img, vec![1, 4, 0]);
    let semantic = out.feats.semantic_feats.as_ref().map(|s| s.dims().to_vec());
    assert_eq!(semantic, Some(vec![3, 4, 8]));

    let rows: Vec<usize> = out
        .results
        .iter()
        .map(|r| r.pred_instances.feats.as_ref().map_or(0, |f| f.dims()[0]))
        .collect();
    assert_eq!(rows, vec![1, 4, 0]);

    // Edge semantics exist for the single edge of image 1
    let graph = out.graph.as_ref().ok_or(Error::MissingGraphHead)?;
    let edge_sem = graph.edges.semantic_feats.as_ref().map(|s| s.dims().to_vec());
    assert_eq!(edge_sem, Some(vec![1, 8]));
    Ok(())
}

#[test]
fn test_ground_truth_detections_on_keyframes() -> Result<()> {
    let config = LgDetectorConfig {
        use_gt_dets: true,
        perturb_factor: 0.5,
        ..config()
    };
    let model = full_model(false, config, &[2, 2, 2], MockGraphHead::default())?;
    assert_eq!(model.config().effective_perturb_factor(), 0.0);

    let batch = samples(&[3, 1, 0], &[true, false, true])?;
    let out = model.extract_lg(&images(3)?, &batch, false, None)?;

    // keyframe -> annotations, other frame -> predictions, empty keyframe -> nothing
    assert_eq!(out.feats.instances_per_img, vec![3, 2, 0]);
    Ok(())
}

#[test]
fn test_predict_attaches_outputs_and_rescales() -> Result<()> {
    let mut model = full_model(false, config(), &[3, 1], MockGraphHead::default())?;
    model.eval();

    let results = model.predict(&images(2)?, &samples(&[0, 0], &[true, true])?, true)?;

    let first = &results[0];
    let lg = first.lg.as_ref().ok_or(Error::MissingGraphHead)?;
    assert_eq!(lg.nodes.viz_feats.dims(), &[3, CHANNELS]);
    assert_eq!(lg.edges.edge_flats.dims(), &[1, 2]);
    assert_eq!(lg.img_feats.as_ref().map(|t| t.dims().to_vec()), Some(vec![CHANNELS]));
    assert_eq!(first.pred_edges.as_ref().map(|e| e.edge_flats.dims()[0]), Some(1));
    assert_eq!(results[1].pred_edges.as_ref().map(|e| e.edge_flats.dims()[0]), Some(0));
    assert!(first.gt_edges.is_some());
    assert!(first.pred_ds.is_some());

    // Blank reconstruction maps to the channel mean
    let recon = first.reconstruction.as_ref().ok_or(Error::MissingGraphHead)?;
    let values: Vec<f32> = recon.flatten_all()?.to_vec1()?;
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!((values[0] - 123.675 / 255.0).abs() < 1e-5);

    // Boxes and masks are back at original resolution
    for r in &results {
        let boxes: Vec<Vec<f32>> = r.pred_instances.bboxes.to_vec2()?;
        for b in boxes {
            assert!(0.0 <= b[0] && b[0] <= b[2] && b[2] <= (2 * SIZE) as f32);
            assert!(0.0 <= b[1] && b[1] <= b[3] && b[3] <= (2 * SIZE) as f32);
        }
        let masks = r.pred_instances.masks.as_ref().map(|m| m.dims()[1..].to_vec());
        assert_eq!(masks, Some(vec![2 * SIZE, 2 * SIZE]));
    }
    let first_box: Vec<f32> = results[0].pred_instances.bboxes.get(0)?.to_vec1()?;
    assert_eq!(first_box, vec![0.0, 4.0, 20.0, 28.0]);
    Ok(())
}

#[test]
fn test_downstream_head_requires_graph_head() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = LgDetectorBuilder::new(config(), detector(false, &[2]))
        .roi_extractor(roi()?)
        .ds_head(Box::new(MockDownstream))
        .build(vb)?;
    let batch = samples(&[1], &[true])?;

    assert!(matches!(model.loss(&images(1)?, &batch), Err(Error::MissingGraphHead)));
    assert!(matches!(model.predict(&images(1)?, &batch, true), Err(Error::MissingGraphHead)));
    Ok(())
}

#[test]
fn test_generic_forward_is_unsupported() -> Result<()> {
    let model = full_model(false, config(), &[1], MockGraphHead::default())?;
    let result = model.forward(&images(1)?, &samples(&[1], &[true])?);
    assert!(matches!(result, Err(Error::UnsupportedForward)));
    Ok(())
}

#[test]
fn test_reconstruction_head_needs_loss() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let result = LgDetectorBuilder::new(config(), detector(false, &[1]))
        .reconstruction_head(Box::new(MockReconstruction))
        .build(vb);
    assert!(matches!(result, Err(Error::Config(_))));
    Ok(())
}

#[test]
fn test_semantics_only_when_consumed_or_forced() -> Result<()> {
    let device = Device::Cpu;

    let varmap = VarMap::new();
    let plain = LgDetectorBuilder::new(config(), detector(false, &[1]))
        .graph_head(Box::new(MockGraphHead::default()))
        .build(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
    assert!(!plain.encodes_semantics());

    let varmap = VarMap::new();
    let forced = LgDetectorBuilder::new(
        LgDetectorConfig {
            force_encode_semantics: true,
            ..config()
        },
        detector(false, &[1]),
    )
    .build(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
    assert!(forced.encodes_semantics());

    let varmap = VarMap::new();
    let no_size = LgDetectorBuilder::new(
        LgDetectorConfig {
            semantic_feat_size: 0,
            ..config()
        },
        detector(false, &[1]),
    )
    .ds_head(Box::new(MockDownstream))
    .graph_head(Box::new(MockGraphHead::default()))
    .build(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
    assert!(!no_size.encodes_semantics());
    Ok(())
}

#[test]
fn test_query_features_without_roi_extractor() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut model = LgDetectorBuilder::new(config(), detector(false, &[2, 5]))
        .graph_head(Box::new(MockGraphHead::default()))
        .build(vb)?;
    model.eval();

    let out = model.extract_lg(&images(2)?, &samples(&[0, 0], &[true, true])?, false, None)?;
    assert_eq!(out.feats.instance_feats.dims(), &[2, 5, CHANNELS]);
    assert_eq!(out.feats.instances_per_img, vec![2, 5]);
    Ok(())
}

#[test]
fn test_clip_perturbation_requires_whole_clips() -> Result<()> {
    let config = LgDetectorConfig {
        perturb_factor: 0.3,
        ..config()
    };
    let mut model = full_model(false, config, &[2, 2, 2], MockGraphHead::default())?;
    model.eval();
    let batch = samples(&[0, 0, 0], &[true; 3])?;

    assert!(model.extract_lg(&images(3)?, &batch, true, Some(3)).is_ok());
    assert!(model.extract_lg(&images(3)?, &batch, true, Some(2)).is_err());
    // Without forcing, eval mode never perturbs
    assert!(model.extract_lg(&images(3)?, &batch, false, Some(2)).is_ok());
    Ok(())
}

#[test]
fn test_reconstruction_targets_follow_keyframes() -> Result<()> {
    let batch = samples(&[2, 1], &[true, false])?;

    for (use_pred, expected) in [(false, vec![2, 4]), (true, vec![3, 4])] {
        let loss = RecordingLoss::default();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LgDetectorBuilder::new(
            LgDetectorConfig {
                use_pred_boxes_recon_loss: use_pred,
                ..config()
            },
            detector(false, &[3, 4]),
        )
        .roi_extractor(roi()?)
        .reconstruction(Box::new(MockReconstruction), Box::new(loss.clone()))
        .build(vb)?;

        model.loss(&images(2)?, &batch)?;

        // Keyframes score against annotations unless predictions are requested
        assert_eq!(*loss.box_counts.borrow(), vec![expected]);
    }
    Ok(())
}
