//! Planar geometry for boxes and instance masks.

use crate::error::{Error, Result};
use crate::types::ImageShape;

/// Axis-aligned box as `[x1, y1, x2, y2]`
pub type BoxXyxy = [f32; 4];

/// 2D point as `[x, y]`
pub type Point2 = [f32; 2];

/// Clamp a box into `[0, width] x [0, height]`.
pub fn clamp_box(b: &BoxXyxy, shape: ImageShape) -> BoxXyxy {
    let (w, h) = (shape.width as f32, shape.height as f32);
    [
        b[0].clamp(0.0, w),
        b[1].clamp(0.0, h),
        b[2].clamp(0.0, w),
        b[3].clamp(0.0, h),
    ]
}

/// Swap coordinates where needed so that `x1 <= x2` and `y1 <= y2`.
pub fn order_box(b: &BoxXyxy) -> BoxXyxy {
    [
        b[0].min(b[2]),
        b[1].min(b[3]),
        b[0].max(b[2]),
        b[1].max(b[3]),
    ]
}

/// Clamp then order, the canonical form of every box leaving a transform.
pub fn sanitize_box(b: &BoxXyxy, shape: ImageShape) -> BoxXyxy {
    order_box(&clamp_box(b, shape))
}

/// 8-neighbourhood in clockwise order (image coordinates, y pointing down).
const NEIGHBORS: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// Trace the outer boundary of the first foreground component of a dense
/// mask using Moore-neighbour tracing.
///
/// `mask` is row-major with `width * height` entries; values above 0.5 are
/// foreground. Returns an empty contour for an empty mask.
pub fn trace_boundary(mask: &[f32], width: usize, height: usize) -> Result<Vec<Point2>> {
    if mask.len() != width * height {
        return Err(Error::ShapeMismatch {
            expected: format!("{} mask values", width * height),
            actual: format!("{}", mask.len()),
        });
    }

    let is_fg = |x: i64, y: i64| {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < height
            && mask[y as usize * width + x as usize] > 0.5
    };

    let start = match mask.iter().position(|&v| v > 0.5) {
        Some(i) => ((i % width) as i64, (i / width) as i64),
        None => return Ok(Vec::new()),
    };

    let mut contour = vec![start];
    let mut current = start;
    // Start is the first foreground pixel in raster order, so its west
    // neighbour is background.
    let mut backtrack = 4usize;
    let mut first_step = None;
    let limit = 4 * width * height + 8;

    loop {
        let found = (1..=8)
            .map(|step| (backtrack + step) % 8)
            .find(|&k| is_fg(current.0 + NEIGHBORS[k].0, current.1 + NEIGHBORS[k].1));

        let Some(k) = found else {
            break;
        };
        let next = (current.0 + NEIGHBORS[k].0, current.1 + NEIGHBORS[k].1);

        // Start can be passed more than once when it joins two lobes; the
        // contour is closed once start is left the same way as the first time.
        if current == start {
            match first_step {
                None => first_step = Some(next),
                Some(step) if step == next => break,
                Some(_) => {}
            }
        }

        let prev = NEIGHBORS[(k + 7) % 8];
        let back_pixel = (current.0 + prev.0, current.1 + prev.1);
        backtrack = NEIGHBORS
            .iter()
            .position(|&d| d == (back_pixel.0 - next.0, back_pixel.1 - next.1))
            .unwrap_or(4);
        current = next;

        if contour.len() >= limit {
            break;
        }
        contour.push(current);
    }

    if contour.len() > 1 && contour.last() == Some(&start) {
        contour.pop();
    }

    Ok(contour
        .into_iter()
        .map(|(x, y)| [x as f32, y as f32])
        .collect())
}

/// Resample a closed contour to exactly `num_points` points spaced evenly
/// by arc length.
pub fn resample_closed(contour: &[Point2], num_points: usize) -> Vec<Point2> {
    match contour {
        [] => return vec![[0.0, 0.0]; num_points],
        [only] => return vec![*only; num_points],
        _ => {}
    }

    let m = contour.len();
    let segments: Vec<f32> = (0..m)
        .map(|i| {
            let (a, b) = (contour[i], contour[(i + 1) % m]);
            ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt()
        })
        .collect();
    let perimeter: f32 = segments.iter().sum();

    if perimeter <= 0.0 {
        return vec![contour[0]; num_points];
    }

    let step = perimeter / num_points as f32;
    let mut points = Vec::with_capacity(num_points);
    let mut seg_idx = 0;
    let mut seg_start = 0.0f32;

    for i in 0..num_points {
        let target = i as f32 * step;
        while seg_idx < m - 1 && seg_start + segments[seg_idx] < target {
            seg_start += segments[seg_idx];
            seg_idx += 1;
        }

        let t = if segments[seg_idx] > 0.0 {
            ((target - seg_start) / segments[seg_idx]).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let a = contour[seg_idx];
        let b = contour[(seg_idx + 1) % m];
        points.push([a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])]);
    }

    points
}

/// Convert a dense mask into a fixed-size polygon.
pub fn dense_mask_to_polygon(
    mask: &[f32],
    width: usize,
    height: usize,
    num_points: usize,
) -> Result<Vec<Point2>> {
    if num_points == 0 {
        return Err(Error::InvalidInput(
            "polygon point count must be positive".to_string(),
        ));
    }

    let contour = trace_boundary(mask, width, height)?;
    Ok(resample_closed(&contour, num_points))
}

/// Cyclically shift polygon points right by `offset` positions.
pub fn roll_points(points: &mut [Point2], offset: usize) {
    if !points.is_empty() {
        let len = points.len();
        points.rotate_right(offset % len);
    }
}
