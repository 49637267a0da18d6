//! Semantic feature encoder.
//!
//! Each instance's discrete attributes are turned into a dense embedding:
//!
//! 1. normalized box `[x1, y1, x2, y2] / [W, H, W, H]`
//! 2. one-hot class vector
//! 3. polygonized mask, flattened and normalized
//! 4. confidence score (always present, last)
//!
//! The concatenation goes through a batch-normalized MLP. Edges use a
//! mirrored projector fed with the edge box and detached relation logits.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, ModuleT, VarBuilder};
use lg_core::{dense_mask_to_polygon, roll_points, ImageShape};
use rand::Rng;

use crate::batching::{cat_rows, pad_sequence, split_rows};
use crate::bbox::normalize_boxes;
use crate::config::LgDetectorConfig;
use crate::error::{Error, Result};
use crate::structures::{GraphEdges, InstanceData};

/// Linear layers with batch norm and ReLU between them
pub struct SemanticProjector {
    layers: Vec<Linear>,
    norms: Vec<BatchNorm>,
    input_dim: usize,
    output_dim: usize,
}

impl SemanticProjector {
    /// `dims` lists layer widths from input to output.
    pub fn new(dims: &[usize], vb: VarBuilder) -> Result<Self> {
        if dims.len() < 2 {
            return Err(Error::Config(format!(
                "projector needs at least an input and output width, got {:?}",
                dims
            )));
        }

        let mut layers = Vec::with_capacity(dims.len() - 1);
        let mut norms = Vec::with_capacity(dims.len() - 2);
        for i in 0..dims.len() - 1 {
            layers.push(linear(dims[i], dims[i + 1], vb.pp(format!("fc_{}", i)))?);
            if i + 2 < dims.len() {
                norms.push(batch_norm(dims[i + 1], 1e-5, vb.pp(format!("bn_{}", i)))?);
            }
        }

        Ok(Self {
            layers,
            norms,
            input_dim: dims[0],
            output_dim: dims[dims.len() - 1],
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if let Some(norm) = self.norms.get(i) {
                x = norm.forward_t(&x, train)?.relu()?;
            }
        }
        Ok(x)
    }

    /// Project `[N, input_dim]` rows to `[N, output_dim]`.
    ///
    /// Batch statistics are undefined for a single sample, so one row is
    /// always normalized with the running statistics. No rows yields an
    /// empty output without touching the layers.
    pub fn project(&self, rows: &Tensor, train: bool) -> Result<Tensor> {
        let (n, dim) = rows.dims2()?;
        if dim != self.input_dim {
            return Err(lg_core::Error::ShapeMismatch {
                expected: format!("{} input features", self.input_dim),
                actual: format!("{}", dim),
            }
            .into());
        }

        match n {
            0 => Ok(Tensor::zeros((0, self.output_dim), rows.dtype(), rows.device())?),
            1 => self.forward_t(rows, false),
            _ => self.forward_t(rows, train),
        }
    }
}

/// Node and edge semantic feature encoder
pub struct SemanticEncoder {
    node_projector: SemanticProjector,
    edge_projector: Option<SemanticProjector>,
    num_classes: usize,
    use_bboxes: bool,
    use_class_logits: bool,
    use_masks: bool,
    polygon_points: usize,
    mask_augment: bool,
}

impl SemanticEncoder {
    pub fn new(config: &LgDetectorConfig, num_edge_classes: usize, vb: VarBuilder) -> Result<Self> {
        let node_dims = config.projector_dims(config.node_semantic_input_dim());
        let node_projector = SemanticProjector::new(&node_dims, vb.pp("node"))?;

        let edge_input = config.edge_semantic_input_dim(num_edge_classes);
        let edge_projector = if edge_input > 0 {
            Some(SemanticProjector::new(&config.projector_dims(edge_input), vb.pp("edge"))?)
        } else {
            None
        };

        Ok(Self {
            node_projector,
            edge_projector,
            num_classes: config.num_classes,
            use_bboxes: config.sem_feat_use_bboxes,
            use_class_logits: config.sem_feat_use_class_logits,
            use_masks: config.sem_feat_use_masks,
            polygon_points: config.mask_polygon_num_points,
            mask_augment: config.mask_augment,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.node_projector.output_dim()
    }

    /// Raw projector input `[N, D_in]` for one image's instances.
    pub fn node_input<R: Rng + ?Sized>(
        &self,
        instances: &InstanceData,
        shape: ImageShape,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let device = instances.bboxes.device();
        let n = instances.len();
        if n == 0 {
            return Ok(Tensor::zeros((0, self.node_projector.input_dim()), DType::F32, device)?);
        }
        let mut parts = Vec::with_capacity(4);

        if self.use_bboxes {
            parts.push(normalize_boxes(&instances.bboxes.to_dtype(DType::F32)?, shape)?);
        }
        if self.use_class_logits {
            parts.push(one_hot(&instances.labels, self.num_classes, device)?);
        }
        if self.use_masks {
            parts.push(self.polygon_input(instances.masks.as_ref(), n, shape, train, rng, device)?);
        }
        parts.push(instances.scores.to_dtype(DType::F32)?.reshape((n, 1))?);

        Ok(Tensor::cat(&parts, 1)?)
    }

    fn polygon_input<R: Rng + ?Sized>(
        &self,
        masks: Option<&Tensor>,
        n: usize,
        shape: ImageShape,
        train: bool,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        let width = self.polygon_points * 2;
        let masks = match masks {
            Some(m) if n > 0 => m,
            _ => return Ok(Tensor::zeros((n, width), DType::F32, device)?),
        };

        let (count, h, w) = masks.dims3()?;
        if count != n {
            return Err(lg_core::Error::ShapeMismatch {
                expected: format!("{} masks", n),
                actual: format!("{}", count),
            }
            .into());
        }

        let [sx, sy] = shape.point_normalizer();
        let mut flat = Vec::with_capacity(n * width);
        for i in 0..n {
            let dense: Vec<f32> = masks.get(i)?.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
            let mut polygon = dense_mask_to_polygon(&dense, w, h, self.polygon_points)?;
            if train && self.mask_augment {
                roll_points(&mut polygon, rng.random_range(0..self.polygon_points));
            }
            flat.extend(polygon.iter().flat_map(|p| [p[0] / sx, p[1] / sy]));
        }

        Ok(Tensor::from_vec(flat, (n, width), device)?)
    }

    /// Semantic features `[B, N_max, S]` for per-image instance groups.
    ///
    /// Only valid rows are projected; padding rows are zero.
    pub fn encode_nodes<R: Rng + ?Sized>(
        &self,
        groups: &[InstanceData],
        shapes: &[ImageShape],
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        if groups.len() != shapes.len() {
            return Err(Error::InvalidInput(format!(
                "{} instance groups but {} image shapes",
                groups.len(),
                shapes.len()
            )));
        }
        let device = groups
            .first()
            .map(|g| g.bboxes.device().clone())
            .ok_or_else(|| Error::InvalidInput("cannot encode an empty batch".to_string()))?;

        let inputs = groups
            .iter()
            .zip(shapes)
            .map(|(g, &shape)| self.node_input(g, shape, train, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        let counts: Vec<usize> = groups.iter().map(InstanceData::len).collect();

        let projected = match cat_rows(&inputs)? {
            Some(rows) => self.node_projector.project(&rows, train)?,
            None => Tensor::zeros((0, self.output_dim()), DType::F32, &device)?,
        };

        pad_sequence(&split_rows(&projected, &counts)?)
    }

    /// Edge semantic features `[E, S]`, or `None` without an edge projector.
    ///
    /// Relation logits are detached so the graph loss cannot reach the
    /// reconstruction path through edge semantics.
    pub fn encode_edges(
        &self,
        edges: &GraphEdges,
        batch_input_shape: ImageShape,
        train: bool,
    ) -> Result<Option<Tensor>> {
        let projector = match &self.edge_projector {
            Some(p) => p,
            None => return Ok(None),
        };

        let num_edges = edges.num_edges();
        let device = edges.class_logits.device();
        if num_edges == 0 {
            return Ok(Some(Tensor::zeros((0, projector.output_dim()), DType::F32, device)?));
        }

        let mut parts = Vec::with_capacity(2);
        if self.use_bboxes {
            let boxes = cat_rows(&edges.boxes)?.ok_or_else(|| {
                Error::InvalidInput(format!("{} edges but no edge boxes", num_edges))
            })?;
            parts.push(normalize_boxes(&boxes.to_dtype(DType::F32)?, batch_input_shape)?);
        }
        if self.use_class_logits {
            parts.push(edges.class_logits.detach().to_dtype(DType::F32)?);
        }

        let input = Tensor::cat(&parts, 1)?;
        Ok(Some(projector.project(&input, train)?))
    }
}

/// One-hot encode `[N]` class indices into `[N, num_classes]`.
fn one_hot(labels: &Tensor, num_classes: usize, device: &Device) -> Result<Tensor> {
    let indices: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
    let mut data = vec![0.0f32; indices.len() * num_classes];

    for (row, &idx) in indices.iter().enumerate() {
        let idx = idx as usize;
        if idx >= num_classes {
            return Err(Error::InvalidInput(format!(
                "class index {} out of range for {} classes",
                idx, num_classes
            )));
        }
        data[row * num_classes + idx] = 1.0;
    }

    Ok(Tensor::from_vec(data, (indices.len(), num_classes), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn small_config() -> LgDetectorConfig {
        LgDetectorConfig {
            num_classes: 3,
            semantic_feat_size: 8,
            sem_feat_hidden_dim: 16,
            semantic_feat_projector_layers: 2,
            mask_polygon_num_points: 4,
            ..Default::default()
        }
    }

    fn instances(n: usize, device: &Device) -> Result<InstanceData> {
        let boxes: Vec<f32> = (0..n).flat_map(|i| [i as f32, 1.0, i as f32 + 4.0, 6.0]).collect();
        let labels: Vec<u32> = (0..n).map(|i| (i % 3) as u32).collect();
        let scores: Vec<f32> = (0..n).map(|i| 0.5 + 0.1 * i as f32).collect();

        let mut masks = vec![0.0f32; n * 8 * 8];
        for i in 0..n {
            for y in 1..6 {
                for x in i..i + 4 {
                    masks[i * 64 + y * 8 + x] = 1.0;
                }
            }
        }

        Ok(InstanceData::new(
            Tensor::from_vec(boxes, (n, 4), device)?,
            Tensor::from_vec(labels, n, device)?,
            Tensor::from_vec(scores, n, device)?,
        )
        .with_masks(Tensor::from_vec(masks, (n, 8, 8), device)?))
    }

    #[test]
    fn test_single_row_keeps_output_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projector = SemanticProjector::new(&[5, 16, 16, 8], vb)?;

        let many = projector.project(&Tensor::randn(0f32, 1.0, (6, 5), &device)?, true)?;
        let one = projector.project(&Tensor::randn(0f32, 1.0, (1, 5), &device)?, true)?;
        let none = projector.project(&Tensor::zeros((0, 5), DType::F32, &device)?, true)?;

        assert_eq!(many.dims(), &[6, 8]);
        assert_eq!(one.dims(), &[1, 8]);
        assert_eq!(none.dims(), &[0, 8]);
        Ok(())
    }

    #[test]
    fn test_projector_rejects_wrong_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projector = SemanticProjector::new(&[5, 8], vb)?;

        assert!(projector.project(&Tensor::zeros((2, 4), DType::F32, &device)?, false).is_err());
        Ok(())
    }

    #[test]
    fn test_node_input_layout() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = small_config();
        let encoder = SemanticEncoder::new(&config, 2, vb)?;
        let mut rng = StdRng::seed_from_u64(0);

        let input = encoder.node_input(&instances(2, &device)?, ImageShape::new(8, 8), false, &mut rng)?;
        assert_eq!(input.dims(), &[2, config.node_semantic_input_dim()]);

        let rows: Vec<Vec<f32>> = input.to_vec2()?;
        // box / [8, 8, 8, 8]
        assert_eq!(&rows[0][0..4], &[0.0, 0.125, 0.5, 0.75]);
        // one-hot class 1 for the second instance
        assert_eq!(&rows[1][4..7], &[0.0, 1.0, 0.0]);
        // score is last
        assert!((rows[1][rows[1].len() - 1] - 0.6).abs() < 1e-6);
        // polygon coordinates are normalized
        assert!(rows[0][7..15].iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    /// Polygon columns of the first row as points
    fn polygon_of(input: &Tensor) -> Result<Vec<[f32; 2]>> {
        let rows: Vec<Vec<f32>> = input.to_vec2()?;
        Ok(rows[0][7..15].chunks(2).map(|p| [p[0], p[1]]).collect())
    }

    #[test]
    fn test_mask_augment_rolls_polygon_only_in_training() -> Result<()> {
        let device = Device::Cpu;
        let shape = ImageShape::new(8, 8);
        let mut rng = StdRng::seed_from_u64(3);
        let inst = instances(1, &device)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = SemanticEncoder::new(&small_config(), 2, vb)?;
        let reference = polygon_of(&encoder.node_input(&inst, shape, false, &mut rng)?)?;

        let mut shifts = Vec::new();
        for _ in 0..32 {
            let rolled = polygon_of(&encoder.node_input(&inst, shape, true, &mut rng)?)?;
            let shift = (0..reference.len()).find(|&k| {
                let mut expected = reference.clone();
                expected.rotate_left(k);
                expected == rolled
            });
            assert!(shift.is_some(), "{:?} is not a rotation of {:?}", rolled, reference);
            shifts.extend(shift);
        }
        assert!(shifts.iter().any(|&k| k != 0));

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let fixed = SemanticEncoder::new(
            &LgDetectorConfig {
                mask_augment: false,
                ..small_config()
            },
            2,
            vb,
        )?;
        for _ in 0..4 {
            assert_eq!(polygon_of(&fixed.node_input(&inst, shape, true, &mut rng)?)?, reference);
        }
        Ok(())
    }

    #[test]
    fn test_encode_nodes_pads_to_max() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = SemanticEncoder::new(&small_config(), 2, vb)?;
        let mut rng = StdRng::seed_from_u64(3);

        let groups = vec![instances(3, &device)?, InstanceData::empty(&device)?, instances(1, &device)?];
        let shapes = [ImageShape::new(8, 8); 3];
        let feats = encoder.encode_nodes(&groups, &shapes, true, &mut rng)?;

        assert_eq!(feats.dims(), &[3, 3, 8]);
        // The empty image contributes only padding
        let empty_sum: f32 = feats.get(1)?.abs()?.sum_all()?.to_scalar()?;
        assert_eq!(empty_sum, 0.0);
        Ok(())
    }

    #[test]
    fn test_out_of_range_class_rejected() -> Result<()> {
        let device = Device::Cpu;
        let labels = Tensor::new(&[0u32, 5], &device)?;
        assert!(one_hot(&labels, 3, &device).is_err());
        Ok(())
    }

    #[test]
    fn test_encode_edges() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = SemanticEncoder::new(&small_config(), 2, vb)?;

        let edges = GraphEdges {
            edge_flats: Tensor::new(&[[0u32, 0, 1], [0, 1, 0], [1, 0, 1]], &device)?,
            edges_per_img: vec![2, 1],
            boxes: vec![
                Tensor::new(&[[0.0f32, 0.0, 4.0, 4.0], [1.0, 1.0, 5.0, 5.0]], &device)?,
                Tensor::new(&[[2.0f32, 2.0, 6.0, 6.0]], &device)?,
            ],
            class_logits: Tensor::randn(0f32, 1.0, (3, 2), &device)?,
            semantic_feats: None,
            presence_logits: None,
            extra: BTreeMap::new(),
        };

        let feats = encoder.encode_edges(&edges, ImageShape::new(8, 8), true)?;
        assert_eq!(feats.map(|f| f.dims().to_vec()), Some(vec![3, 8]));
        Ok(())
    }

    #[test]
    fn test_no_edge_projector_without_edge_terms() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = LgDetectorConfig {
            sem_feat_use_bboxes: false,
            ..small_config()
        };
        let encoder = SemanticEncoder::new(&config, 0, vb)?;

        let edges = GraphEdges {
            edge_flats: Tensor::zeros((0, 3), DType::U32, &device)?,
            edges_per_img: vec![0],
            boxes: vec![Tensor::zeros((0, 4), DType::F32, &device)?],
            class_logits: Tensor::zeros((0, 0), DType::F32, &device)?,
            semantic_feats: None,
            presence_logits: None,
            extra: BTreeMap::new(),
        };
        assert!(encoder.encode_edges(&edges, ImageShape::new(8, 8), false)?.is_none());
        Ok(())
    }
}
