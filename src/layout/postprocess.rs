//! Detection postprocessing: gated sigmoid scoring, order sorting, polygon
//! extraction from instance masks, NMS, containment filtering, and unclip.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::config::{LayoutOptions, MergeMode};
use crate::tensor::sigmoid;
use crate::types::{LayoutRegion, PipelineTask};

use super::config::LayoutModelConfig;
use super::decoder::LayoutPrediction;
use super::order::order_by_voting;

/// Score assigned to candidates whose predicted box is thinner than one mask
/// pixel in either dimension.
const GATED_SCORE: f32 = -100.0;
/// Same-class and cross-class NMS IoU thresholds.
const NMS_SAME_CLASS_IOU: f32 = 0.6;
const NMS_CROSS_CLASS_IOU: f32 = 0.98;
/// Area share above which an `image` detection is dropped as a false
/// full-page hit (portrait / landscape).
const LARGE_IMAGE_PORTRAIT: f32 = 0.82;
const LARGE_IMAGE_LANDSCAPE: f32 = 0.93;
/// Containment ratio for the merge filters.
const CONTAINMENT_RATIO: f32 = 0.8;
/// Labels never removed by the containment filter.
const PRESERVED_LABELS: [&str; 3] = ["image", "seal", "chart"];

#[derive(Debug, Clone)]
struct Detection {
    class_id: u32,
    label: String,
    score: f32,
    /// `x1, y1, x2, y2` in page pixels.
    bbox: [f32; 4],
    /// Absolute polygon in page pixels.
    polygon: Vec<[f32; 2]>,
    order: usize,
    selection_index: usize,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }
}

/// Inclusive-pixel IoU: widths and heights count both endpoints.
fn inclusive_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let iw = ix2 - ix1 + 1.0;
    let ih = iy2 - iy1 + 1.0;
    if iw <= 0.0 || ih <= 0.0 {
        return 0.0;
    }
    let inter = iw * ih;
    let area_a = (a[2] - a[0] + 1.0) * (a[3] - a[1] + 1.0);
    let area_b = (b[2] - b[0] + 1.0) * (b[3] - b[1] + 1.0);
    inter / (area_a + area_b - inter)
}

/// Intersection area over `own`'s plain area.
fn containment(own: &[f32; 4], other: &[f32; 4]) -> f32 {
    let ix1 = own[0].max(other[0]);
    let iy1 = own[1].max(other[1]);
    let ix2 = own[2].min(other[2]);
    let iy2 = own[3].min(other[3]);
    let iw = (ix2 - ix1).max(0.0);
    let ih = (iy2 - iy1).max(0.0);
    let own_area = (own[2] - own[0]).max(0.0) * (own[3] - own[1]).max(0.0);
    if own_area <= 0.0 {
        return 0.0;
    }
    iw * ih / own_area
}

/// Run the full postprocessing chain on one page's raw prediction.
///
/// `page_size` is the original page in pixels; boxes are emitted normalized
/// to `[0, 1000]`.
pub fn postprocess(
    prediction: &LayoutPrediction,
    page_size: (u32, u32),
    options: &LayoutOptions,
    config: &LayoutModelConfig,
) -> Vec<LayoutRegion> {
    let (q_total, num_classes) = prediction.logits.dim();
    let (_, mh, mw) = prediction.out_masks.dim();
    let eval = config.eval_size as f32;
    let (page_w, page_h) = (page_size.0 as f32, page_size.1 as f32);
    let order = order_by_voting(prediction.order_logits.view());

    // 1. Gated sigmoid scoring over (query, class), stable top-Q.
    let min_w = 1.0 / mw as f32;
    let min_h = 1.0 / mh as f32;
    let mut flat: Vec<(f32, usize)> = Vec::with_capacity(q_total * num_classes);
    for q in 0..q_total {
        let bw = prediction.pred_boxes[[q, 2]];
        let bh = prediction.pred_boxes[[q, 3]];
        let gate = bw > min_w && bh > min_h;
        for c in 0..num_classes {
            let score = if gate {
                sigmoid(prediction.logits[[q, c]])
            } else {
                GATED_SCORE
            };
            flat.push((score, q * num_classes + c));
        }
    }
    flat.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    flat.truncate(q_total);

    // 2-3. Build candidates, threshold, sort by order.
    let scale_x = page_w / eval;
    let scale_y = page_h / eval;
    let mut candidates: Vec<Detection> = Vec::new();
    for (selection_index, (score, flat_index)) in flat.iter().enumerate() {
        let q = flat_index / num_classes;
        let class_id = (flat_index % num_classes) as u32;
        let effective_threshold = options
            .threshold_by_class
            .get(&class_id)
            .map_or(options.threshold, |t| options.threshold.max(*t));
        if *score < effective_threshold {
            continue;
        }
        let cx = prediction.pred_boxes[[q, 0]] * eval;
        let cy = prediction.pred_boxes[[q, 1]] * eval;
        let bw = prediction.pred_boxes[[q, 2]] * eval;
        let bh = prediction.pred_boxes[[q, 3]] * eval;
        let eval_box = [
            (cx - bw / 2.0).max(0.0),
            (cy - bh / 2.0).max(0.0),
            (cx + bw / 2.0).min(eval),
            (cy + bh / 2.0).min(eval),
        ];

        // 4. Polygon from the binarized mask, rectangle fallback.
        let polygon_eval = extract_polygon(
            prediction,
            q,
            &eval_box,
            options.threshold,
            (mh, mw),
            eval,
        )
        .unwrap_or_else(|| {
            vec![
                [eval_box[0], eval_box[1]],
                [eval_box[2], eval_box[1]],
                [eval_box[2], eval_box[3]],
                [eval_box[0], eval_box[3]],
            ]
        });

        candidates.push(Detection {
            class_id,
            label: config.label_for(class_id),
            score: *score,
            bbox: [
                eval_box[0] * scale_x,
                eval_box[1] * scale_y,
                eval_box[2] * scale_x,
                eval_box[3] * scale_y,
            ],
            polygon: polygon_eval
                .iter()
                .map(|p| [p[0] * scale_x, p[1] * scale_y])
                .collect(),
            order: order[q],
            selection_index,
        });
    }
    candidates.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then(a.selection_index.cmp(&b.selection_index))
    });

    // 5. Optional NMS, decided on a score-descending view, applied without
    // reordering.
    if options.layout_nms {
        let mut by_score: Vec<usize> = (0..candidates.len()).collect();
        by_score.sort_by(|a, b| {
            candidates[*b]
                .score
                .total_cmp(&candidates[*a].score)
                .then(a.cmp(b))
        });
        let mut kept: Vec<usize> = Vec::new();
        let mut dropped = vec![false; candidates.len()];
        for &i in &by_score {
            let keep = kept.iter().all(|&j| {
                let iou = inclusive_iou(&candidates[i].bbox, &candidates[j].bbox);
                let limit = if candidates[i].class_id == candidates[j].class_id {
                    NMS_SAME_CLASS_IOU
                } else {
                    NMS_CROSS_CLASS_IOU
                };
                iou < limit
            });
            if keep {
                kept.push(i);
            } else {
                dropped[i] = true;
            }
        }
        let mut idx = 0;
        candidates.retain(|_| {
            let keep = !dropped[idx];
            idx += 1;
            keep
        });
    }

    // 6. Drop near-full-page image detections, but never the only one.
    if candidates.len() > 1 {
        let page_area = page_w * page_h;
        let limit = if page_h >= page_w {
            LARGE_IMAGE_PORTRAIT
        } else {
            LARGE_IMAGE_LANDSCAPE
        };
        candidates.retain(|d| d.label != "image" || d.area() <= limit * page_area);
    }

    // 7. Containment filtering by merge mode.
    if !options.merge_bboxes_mode.is_empty() {
        let snapshot = candidates.clone();
        candidates.retain(|d| !containment_dropped(d, &snapshot, &options.merge_bboxes_mode));
    }

    // 8. Unclip from the box center, clamped to the page.
    let ux = options.unclip_ratio.0.max(1.0);
    let uy = options.unclip_ratio.1.max(1.0);
    if ux > 1.0 || uy > 1.0 {
        for d in &mut candidates {
            let cx = (d.bbox[0] + d.bbox[2]) / 2.0;
            let cy = (d.bbox[1] + d.bbox[3]) / 2.0;
            let hw = (d.bbox[2] - d.bbox[0]) / 2.0 * ux;
            let hh = (d.bbox[3] - d.bbox[1]) / 2.0 * uy;
            d.bbox = [
                (cx - hw).max(0.0),
                (cy - hh).max(0.0),
                (cx + hw).min(page_w),
                (cy + hh).min(page_h),
            ];
        }
    }

    // 9-10. Truncate to integer pixels, drop degenerate boxes, normalize,
    // map labels to tasks, assign reading-order indices.
    let mut regions = Vec::with_capacity(candidates.len());
    for d in candidates {
        let x1 = d.bbox[0].trunc();
        let y1 = d.bbox[1].trunc();
        let x2 = d.bbox[2].trunc();
        let y2 = d.bbox[3].trunc();
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        let task = options
            .label_task_mapping
            .get(&d.label)
            .copied()
            .unwrap_or(PipelineTask::Text);
        let index = regions.len();
        regions.push(LayoutRegion {
            index,
            label: d.label,
            task,
            score: d.score,
            bbox: [
                x1 / page_w * 1000.0,
                y1 / page_h * 1000.0,
                x2 / page_w * 1000.0,
                y2 / page_h * 1000.0,
            ],
            polygon: d
                .polygon
                .iter()
                .map(|p| {
                    [
                        (p[0] / page_w * 1000.0).clamp(0.0, 1000.0),
                        (p[1] / page_h * 1000.0).clamp(0.0, 1000.0),
                    ]
                })
                .collect(),
            order: d.order,
        });
    }
    regions
}

fn containment_dropped(
    d: &Detection,
    all: &[Detection],
    modes: &std::collections::BTreeMap<String, MergeMode>,
) -> bool {
    if PRESERVED_LABELS.contains(&d.label.as_str()) {
        return false;
    }
    for (label, mode) in modes {
        match mode {
            MergeMode::Large => {
                // Drop when contained in another detection of `label`.
                let contained = all.iter().any(|o| {
                    o.label == *label
                        && o.selection_index != d.selection_index
                        && containment(&d.bbox, &o.bbox) >= CONTAINMENT_RATIO
                });
                if contained {
                    return true;
                }
            }
            MergeMode::Small => {
                // Drop when containing another detection of `label`, unless
                // itself contained in something.
                let contains_small = all.iter().any(|o| {
                    o.label == *label
                        && o.selection_index != d.selection_index
                        && containment(&o.bbox, &d.bbox) >= CONTAINMENT_RATIO
                });
                if contains_small {
                    let itself_contained = all.iter().any(|o| {
                        o.selection_index != d.selection_index
                            && containment(&d.bbox, &o.bbox) >= CONTAINMENT_RATIO
                    });
                    if !itself_contained {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Extract a polygon from the query's instance mask.
///
/// The mask is cropped to the box in mask resolution, resized to the box
/// pixel size with nearest neighbor, the largest 8-connected component is
/// found by BFS, its boundary pixels are convex-hulled, simplified with
/// Ramer-Douglas-Peucker, and sharp 45-degree vertices get a bisector point
/// inserted. Returns `None` on any failure so the caller can fall back to
/// the rectangle.
fn extract_polygon(
    prediction: &LayoutPrediction,
    query: usize,
    eval_box: &[f32; 4],
    threshold: f32,
    mask_size: (usize, usize),
    eval: f32,
) -> Option<Vec<[f32; 2]>> {
    let (mh, mw) = mask_size;
    let mask_scale_x = mw as f32 / eval;
    let mask_scale_y = mh as f32 / eval;

    // Box in mask coordinates.
    let mx1 = (eval_box[0] * mask_scale_x).floor() as usize;
    let my1 = (eval_box[1] * mask_scale_y).floor() as usize;
    let mx2 = ((eval_box[2] * mask_scale_x).ceil() as usize).min(mw).max(mx1 + 1);
    let my2 = ((eval_box[3] * mask_scale_y).ceil() as usize).min(mh).max(my1 + 1);
    if mx1 >= mw || my1 >= mh {
        return None;
    }
    let crop_w = mx2 - mx1;
    let crop_h = my2 - my1;

    // Binarize the crop at the detection threshold.
    let mut crop = vec![false; crop_w * crop_h];
    for y in 0..crop_h {
        for x in 0..crop_w {
            let logit = prediction.out_masks[[query, my1 + y, mx1 + x]];
            crop[y * crop_w + x] = sigmoid(logit) > threshold;
        }
    }

    // Nearest-neighbor resize to the box pixel size.
    let out_w = ((eval_box[2] - eval_box[0]).round() as usize).max(1);
    let out_h = ((eval_box[3] - eval_box[1]).round() as usize).max(1);
    let mut bitmap = vec![false; out_w * out_h];
    for y in 0..out_h {
        let sy = ((y as f32 + 0.5) * crop_h as f32 / out_h as f32) as usize;
        let sy = sy.min(crop_h - 1);
        for x in 0..out_w {
            let sx = ((x as f32 + 0.5) * crop_w as f32 / out_w as f32) as usize;
            let sx = sx.min(crop_w - 1);
            bitmap[y * out_w + x] = crop[sy * crop_w + sx];
        }
    }

    let component = largest_component(&bitmap, out_w, out_h)?;
    let boundary = boundary_pixels(&component, &bitmap, out_w, out_h);
    if boundary.len() < 3 {
        return None;
    }
    let hull = convex_hull(&boundary);
    if hull.len() < 3 {
        return None;
    }
    let perimeter = polygon_perimeter(&hull);
    let simplified = rdp_closed(&hull, 0.004 * perimeter);
    if simplified.len() < 3 {
        return None;
    }
    let sharpened = insert_sharp_angle_points(&simplified);

    // Back to eval coordinates, offset by the box origin.
    Some(
        sharpened
            .iter()
            .map(|p| [p[0] + eval_box[0], p[1] + eval_box[1]])
            .collect(),
    )
}

/// Largest 8-connected foreground component as a membership bitmap.
fn largest_component(bitmap: &[bool], w: usize, h: usize) -> Option<Vec<bool>> {
    let mut visited = vec![false; w * h];
    let mut best: Option<(usize, Vec<usize>)> = None;
    let mut queue = std::collections::VecDeque::new();
    for start in 0..w * h {
        if !bitmap[start] || visited[start] {
            continue;
        }
        let mut pixels = Vec::new();
        visited[start] = true;
        queue.push_back(start);
        while let Some(cur) = queue.pop_front() {
            pixels.push(cur);
            let cy = cur / w;
            let cx = cur % w;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let ny = cy as i32 + dy;
                    let nx = cx as i32 + dx;
                    if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if bitmap[n] && !visited[n] {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }
        if best.as_ref().map_or(true, |(n, _)| pixels.len() > *n) {
            best = Some((pixels.len(), pixels));
        }
    }
    best.map(|(_, pixels)| {
        let mut member = vec![false; w * h];
        for p in pixels {
            member[p] = true;
        }
        member
    })
}

/// Pixels of the component with at least one missing 4-neighbor.
fn boundary_pixels(component: &[bool], _bitmap: &[bool], w: usize, h: usize) -> Vec<[f32; 2]> {
    let mut out = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if !component[y * w + x] {
                continue;
            }
            let interior = x > 0
                && x + 1 < w
                && y > 0
                && y + 1 < h
                && component[y * w + x - 1]
                && component[y * w + x + 1]
                && component[(y - 1) * w + x]
                && component[(y + 1) * w + x];
            if !interior {
                out.push([x as f32, y as f32]);
            }
        }
    }
    out
}

/// Andrew's monotone chain convex hull, counter-clockwise.
fn convex_hull(points: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let mut pts: Vec<[f32; 2]> = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup_by(|a, b| a[0] == b[0] && a[1] == b[1]);
    if pts.len() < 3 {
        return pts;
    }
    let cross = |o: &[f32; 2], a: &[f32; 2], b: &[f32; 2]| -> f32 {
        (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
    };
    let mut lower: Vec<[f32; 2]> = Vec::new();
    for p in &pts {
        while lower.len() >= 2 && cross(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0
        {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<[f32; 2]> = Vec::new();
    for p in pts.iter().rev() {
        while upper.len() >= 2 && cross(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0
        {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn polygon_perimeter(points: &[[f32; 2]]) -> f32 {
    let n = points.len();
    let mut total = 0.0f32;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        total += ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt();
    }
    total
}

/// Ramer-Douglas-Peucker over a closed ring.
fn rdp_closed(points: &[[f32; 2]], epsilon: f32) -> Vec<[f32; 2]> {
    if points.len() <= 3 {
        return points.to_vec();
    }
    let mut ring: Vec<[f32; 2]> = points.to_vec();
    ring.push(points[0]);
    let mut simplified = rdp(&ring, epsilon);
    simplified.pop();
    simplified
}

fn rdp(points: &[[f32; 2]], epsilon: f32) -> Vec<[f32; 2]> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let first = points[0];
    let last = points[points.len() - 1];
    let mut max_dist = 0.0f32;
    let mut max_idx = 0usize;
    for (i, p) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let d = perpendicular_distance(p, &first, &last);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    if max_dist > epsilon {
        let mut left = rdp(&points[..=max_idx], epsilon);
        let right = rdp(&points[max_idx..], epsilon);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

fn perpendicular_distance(p: &[f32; 2], a: &[f32; 2], b: &[f32; 2]) -> f32 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return ((p[0] - a[0]).powi(2) + (p[1] - a[1]).powi(2)).sqrt();
    }
    ((dx * (a[1] - p[1]) - (a[0] - p[0]) * dy) / len).abs()
}

/// For each vertex whose interior angle is within one degree of 45 degrees,
/// insert a point along the angle bisector at half the sum of the adjacent
/// edge lengths.
fn insert_sharp_angle_points(points: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let n = points.len();
    let mut out = Vec::with_capacity(n + 2);
    for i in 0..n {
        let prev = points[(i + n - 1) % n];
        let cur = points[i];
        let next = points[(i + 1) % n];
        out.push(cur);
        let v1 = [prev[0] - cur[0], prev[1] - cur[1]];
        let v2 = [next[0] - cur[0], next[1] - cur[1]];
        let l1 = (v1[0] * v1[0] + v1[1] * v1[1]).sqrt();
        let l2 = (v2[0] * v2[0] + v2[1] * v2[1]).sqrt();
        if l1 == 0.0 || l2 == 0.0 {
            continue;
        }
        let cos = ((v1[0] * v2[0] + v1[1] * v2[1]) / (l1 * l2)).clamp(-1.0, 1.0);
        let angle = cos.acos().to_degrees();
        if (angle - 45.0).abs() < 1.0 {
            let bis = [v1[0] / l1 + v2[0] / l2, v1[1] / l1 + v2[1] / l2];
            let bis_len = (bis[0] * bis[0] + bis[1] * bis[1]).sqrt();
            if bis_len > 0.0 {
                let dist = (l1 + l2) / 2.0;
                out.push([
                    cur[0] + bis[0] / bis_len * dist,
                    cur[1] + bis[1] / bis_len * dist,
                ]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutOptions;
    use ndarray::{Array2, Array3};

    fn prediction_with(
        boxes: &[[f32; 4]],
        class_scores: &[(usize, f32)],
        num_classes: usize,
    ) -> LayoutPrediction {
        let q = boxes.len();
        let mut logits = Array2::<f32>::from_elem((q, num_classes), -20.0);
        for (i, (class, logit)) in class_scores.iter().enumerate() {
            logits[[i, *class]] = *logit;
        }
        let mut pred_boxes = Array2::<f32>::zeros((q, 4));
        for (i, b) in boxes.iter().enumerate() {
            for c in 0..4 {
                pred_boxes[[i, c]] = b[c];
            }
        }
        // Identity reading order, strongly positive masks.
        let mut order_logits = Array2::<f32>::from_elem((q, q), -10_000.0);
        for i in 0..q {
            for j in (i + 1)..q {
                order_logits[[i, j]] = 50.0;
            }
        }
        LayoutPrediction {
            logits,
            pred_boxes,
            order_logits,
            out_masks: Array3::<f32>::from_elem((q, 200, 200), 10.0),
        }
    }

    fn default_config() -> LayoutModelConfig {
        LayoutModelConfig::default()
    }

    #[test]
    fn test_threshold_filters_low_scores() {
        // sigmoid(3.0) ~ 0.95 passes; sigmoid(-3.0) ~ 0.05 does not.
        let prediction = prediction_with(
            &[[0.3, 0.3, 0.2, 0.2], [0.7, 0.7, 0.2, 0.2]],
            &[(2, 3.0), (2, -3.0)],
            25,
        );
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label, "text");
    }

    #[test]
    fn test_index_strictly_increases_and_bbox_normalized() {
        let prediction = prediction_with(
            &[[0.25, 0.25, 0.2, 0.2], [0.75, 0.75, 0.2, 0.2]],
            &[(2, 4.0), (8, 4.0)],
            25,
        );
        let regions = postprocess(
            &prediction,
            (1600, 1200),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 2);
        for (i, r) in regions.iter().enumerate() {
            assert_eq!(r.index, i);
            assert!(r.bbox[0] < r.bbox[2]);
            assert!(r.bbox[1] < r.bbox[3]);
            for c in r.bbox {
                assert!((0.0..=1000.0).contains(&c));
            }
            for p in &r.polygon {
                assert!((0.0..=1000.0).contains(&p[0]));
                assert!((0.0..=1000.0).contains(&p[1]));
            }
        }
    }

    #[test]
    fn test_nms_drops_same_class_duplicate() {
        // Two near-identical text boxes; the lower-scoring one is dropped.
        let prediction = prediction_with(
            &[[0.5, 0.5, 0.4, 0.4], [0.5, 0.5, 0.41, 0.41]],
            &[(2, 5.0), (2, 4.0)],
            25,
        );
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 1);
        assert!(regions[0].score > 0.99);
    }

    #[test]
    fn test_nms_keeps_cross_class_overlap() {
        // Same overlap but different classes stays under the 0.98 limit.
        let prediction = prediction_with(
            &[[0.5, 0.5, 0.4, 0.4], [0.52, 0.5, 0.4, 0.4]],
            &[(2, 5.0), (8, 4.0)],
            25,
        );
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_nms_monotonic_in_threshold() {
        // Raising the same-class IoU threshold must never remove detections
        // a lower threshold kept; with the fixed built-in thresholds we
        // verify the equivalent property: disabling NMS keeps a superset.
        let prediction = prediction_with(
            &[[0.5, 0.5, 0.4, 0.4], [0.5, 0.5, 0.41, 0.41]],
            &[(2, 5.0), (2, 4.0)],
            25,
        );
        let with_nms = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        let without = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions {
                layout_nms: false,
                ..LayoutOptions::default()
            },
            &default_config(),
        );
        assert!(without.len() >= with_nms.len());
    }

    #[test]
    fn test_large_image_dropped_when_not_alone() {
        // Class 1 is "image"; a full-page image plus a text region.
        let prediction = prediction_with(
            &[[0.5, 0.5, 0.98, 0.98], [0.2, 0.2, 0.1, 0.1]],
            &[(1, 5.0), (2, 5.0)],
            25,
        );
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label, "text");
    }

    #[test]
    fn test_large_image_kept_when_alone() {
        let prediction = prediction_with(&[[0.5, 0.5, 0.98, 0.98]], &[(1, 5.0)], 25);
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label, "image");
    }

    #[test]
    fn test_containment_large_mode() {
        // A text region nested inside a table is dropped when table uses
        // Large merge mode.
        let prediction = prediction_with(
            &[[0.5, 0.5, 0.8, 0.8], [0.5, 0.5, 0.2, 0.2]],
            &[(8, 5.0), (2, 5.0)],
            25,
        );
        let mut options = LayoutOptions::default();
        options
            .merge_bboxes_mode
            .insert("table".to_string(), MergeMode::Large);
        let regions = postprocess(&prediction, (800, 800), &options, &default_config());
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].label, "table");
    }

    #[test]
    fn test_unclip_expands_and_clamps() {
        let prediction = prediction_with(&[[0.5, 0.5, 0.5, 0.5]], &[(2, 5.0)], 25);
        let base = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        let expanded = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions {
                unclip_ratio: (1.5, 1.5),
                ..LayoutOptions::default()
            },
            &default_config(),
        );
        let base_w = base[0].bbox[2] - base[0].bbox[0];
        let exp_w = expanded[0].bbox[2] - expanded[0].bbox[0];
        assert!(exp_w > base_w);
        assert!(expanded[0].bbox[0] >= 0.0 && expanded[0].bbox[2] <= 1000.0);
    }

    #[test]
    fn test_task_mapping_defaults_to_text() {
        let prediction = prediction_with(&[[0.5, 0.5, 0.3, 0.3]], &[(4, 5.0)], 25);
        let regions = postprocess(
            &prediction,
            (800, 800),
            &LayoutOptions::default(),
            &default_config(),
        );
        // Class 4 is "abstract", unmapped -> text task.
        assert_eq!(regions[0].task, PipelineTask::Text);
    }

    #[test]
    fn test_convex_hull_square() {
        let points = vec![
            [0.0, 0.0],
            [2.0, 0.0],
            [2.0, 2.0],
            [0.0, 2.0],
            [1.0, 1.0],
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
    }

    #[test]
    fn test_rdp_collapses_collinear() {
        let points = vec![
            [0.0, 0.0],
            [1.0, 0.001],
            [2.0, 0.0],
            [2.0, 2.0],
            [0.0, 2.0],
        ];
        let simplified = rdp_closed(&points, 0.1);
        assert_eq!(simplified.len(), 4);
    }

    #[test]
    fn test_inclusive_iou_identical() {
        let b = [0.0, 0.0, 9.0, 9.0];
        assert!((inclusive_iou(&b, &b) - 1.0).abs() < 1e-6);
    }
}
