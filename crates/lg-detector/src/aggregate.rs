//! Folding batched graph, edge and reconstruction outputs back onto
//! per-image results.

use candle_core::{DType, Tensor};
use lg_core::ImageShape;

use crate::bbox::{sanitize_boxes, scale_boxes};
use crate::config::ReconstructionImageStats;
use crate::error::{Error, Result};
use crate::structures::{
    DetDataSample, EdgeAnnotations, EdgeSet, FeatureBundle, Graph, GraphEdges, LatentEdges,
    LatentGraph, LatentNodes,
};

/// Edges of image `img`, with the image column removed from `edge_flats`.
///
/// Every per-edge field is cut with the same per-image split. Presence
/// logits are batch-level and not carried over.
pub fn slice_edges(edges: &GraphEdges, img: usize) -> Result<LatentEdges> {
    let count = *edges.edges_per_img.get(img).ok_or_else(|| {
        Error::InvalidInput(format!(
            "image {} out of range for {} edge groups",
            img,
            edges.edges_per_img.len()
        ))
    })?;
    let start = edges.offsets()[img];

    let total = edges.edge_flats.dim(0)?;
    if total != edges.num_edges() {
        return Err(lg_core::Error::ShapeMismatch {
            expected: format!("{} edges", edges.num_edges()),
            actual: format!("{} edge rows", total),
        }
        .into());
    }

    let rows = |t: &Tensor| t.narrow(0, start, count);
    let boxes = edges.boxes.get(img).cloned().ok_or_else(|| {
        Error::InvalidInput(format!("no edge boxes for image {}", img))
    })?;

    let extra = edges
        .extra
        .iter()
        .map(|(k, v)| Ok((k.clone(), rows(v)?)))
        .collect::<Result<_>>()?;

    Ok(LatentEdges {
        edge_flats: rows(&edges.edge_flats)?.narrow(1, 1, 2)?,
        boxes,
        class_logits: rows(&edges.class_logits)?,
        semantic_feats: edges.semantic_feats.as_ref().map(rows).transpose()?,
        extra,
    })
}

/// Global average of the last backbone map for image `img`, shape `[C]`.
fn pooled_image_feats(feats: &FeatureBundle, img: usize) -> Result<Option<Tensor>> {
    match feats.bb_feats.last() {
        Some(last) => Ok(Some(last.get(img)?.mean((1, 2))?)),
        None => Ok(None),
    }
}

/// Attach each image's slice of the latent graph to its result.
pub fn add_lg_to_results(
    results: &mut [DetDataSample],
    feats: &FeatureBundle,
    graph: &Graph,
) -> Result<()> {
    for (img, r) in results.iter_mut().enumerate() {
        let nodes_per_img = graph.nodes.nodes_per_img.get(img).copied().unwrap_or(0);
        let gnn_rows = nodes_per_img.min(graph.nodes.gnn_viz_feats.dim(1)?);
        let pred = &r.pred_instances;

        let nodes = LatentNodes {
            viz_feats: feats.valid_instance_feats(img)?,
            gnn_viz_feats: graph.nodes.gnn_viz_feats.get(img)?.narrow(0, 0, gnn_rows)?,
            semantic_feats: feats.valid_semantic_feats(img)?,
            nodes_per_img,
            bboxes: pred.bboxes.clone(),
            scores: pred.scores.clone(),
            labels: pred.labels.clone(),
            masks: pred.masks.clone(),
        };

        r.lg = Some(LatentGraph {
            nodes,
            edges: slice_edges(&graph.edges, img)?,
            img_feats: pooled_image_feats(feats, img)?,
            ori_shape: r.meta.ori_shape,
            batch_input_shape: r.meta.batch_input_shape,
        });
    }
    Ok(())
}

/// Attach annotated and predicted edge sets to each result.
///
/// Predicted edges are selected by the image column of `edge_flats`, which
/// is then dropped.
pub fn add_scene_graph_to_results(
    results: &mut [DetDataSample],
    gt_edges: Option<&EdgeAnnotations>,
    graph: &Graph,
) -> Result<()> {
    let edges = &graph.edges;
    let flats: Vec<Vec<u32>> = edges.edge_flats.to_dtype(DType::U32)?.to_vec2()?;
    let device = edges.edge_flats.device();

    for (img, r) in results.iter_mut().enumerate() {
        if let Some(gt) = gt_edges {
            r.gt_edges = Some(EdgeSet {
                edge_flats: index_group(&gt.edge_flats, img)?,
                edge_boxes: index_group(&gt.edge_boxes, img)?,
                relations: index_group(&gt.relations, img)?,
            });
        }

        let selected: Vec<u32> = flats
            .iter()
            .enumerate()
            .filter(|(_, row)| row.first().copied() == Some(img as u32))
            .map(|(i, _)| i as u32)
            .collect();
        let index = Tensor::from_vec(selected.clone(), selected.len(), device)?;

        r.pred_edges = Some(EdgeSet {
            edge_flats: edges.edge_flats.index_select(&index, 0)?.narrow(1, 1, 2)?,
            edge_boxes: index_group(&edges.boxes, img)?,
            relations: edges.class_logits.index_select(&index, 0)?,
        });
    }
    Ok(())
}

fn index_group(groups: &[Tensor], img: usize) -> Result<Tensor> {
    groups
        .get(img)
        .cloned()
        .ok_or_else(|| Error::InvalidInput(format!("no edge group for image {}", img)))
}

/// Map predicted boxes and masks back to each image's original resolution.
pub fn rescale_results(results: &mut [DetDataSample]) -> Result<()> {
    for r in results.iter_mut() {
        let ImageShape { height, width } = r.meta.ori_shape;
        let pred = &mut r.pred_instances;

        let scaled = scale_boxes(&pred.bboxes, r.meta.scale_factor.inverse())?;
        pred.bboxes = sanitize_boxes(&scaled, r.meta.ori_shape)?;

        if let Some(masks) = &pred.masks {
            let resized = if masks.dim(0)? == 0 {
                Tensor::zeros((0, height, width), masks.dtype(), masks.device())?
            } else {
                masks
                    .to_dtype(DType::F32)?
                    .unsqueeze(0)?
                    .upsample_nearest2d(height, width)?
                    .squeeze(0)?
                    .to_dtype(masks.dtype())?
            };
            pred.masks = Some(resized);
        }
    }
    Ok(())
}

/// Undo image normalization: `x * std / 255 + mean / 255`, clamped to `[0, 1]`.
pub fn renormalize_reconstruction(
    images: &Tensor,
    stats: &ReconstructionImageStats,
) -> Result<Tensor> {
    let channels = images.dim(1)?;
    if stats.std.len() != channels {
        return Err(lg_core::Error::ShapeMismatch {
            expected: format!("{} channel statistics", channels),
            actual: format!("{}", stats.std.len()),
        }
        .into());
    }

    let device = images.device();
    let std: Vec<f32> = stats.std.iter().map(|s| s / 255.0).collect();
    let mean: Vec<f32> = stats.mean.iter().map(|m| m / 255.0).collect();
    let std = Tensor::from_vec(std, (1, channels, 1, 1), device)?.to_dtype(images.dtype())?;
    let mean = Tensor::from_vec(mean, (1, channels, 1, 1), device)?.to_dtype(images.dtype())?;

    Ok(images.broadcast_mul(&std)?.broadcast_add(&mean)?.clamp(0f32, 1f32)?)
}
