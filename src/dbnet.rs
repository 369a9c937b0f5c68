//! Differentiable Binarization: training targets and loss.
//!
//! Text regions are shrunk before being rasterized into the segmentation
//! target, and a threshold target is drawn in the band between the shrunk and
//! the dilated polygon, decaying with the distance to the polygon border.

use float_ord::FloatOrd;
use geo::{BoundingRect, Coord, EuclideanDistance, Line, Point, Polygon};
use ndarray::{s, Array2, Array3, ArrayView3, Zip};
use tracing::instrument;

use crate::{
    error::{Error, Result},
    net::{sigmoid, NetOutput},
    target::TargetBox,
    util::{fill_polygon, offset, offset_distance, polygon_points},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbLossConfig {
    pub shrink_ratio: f32,
    pub thresh_min: f32,
    pub thresh_max: f32,
    pub min_size_box: f32,
    pub bce_scale: f32,
    pub l1_scale: f32,
    /// Steepness of the approximate binarization `1 / (1 + e^(-k (P - T)))`.
    pub k: f32,
}

impl Default for DbLossConfig {
    fn default() -> Self {
        Self {
            shrink_ratio: 0.4,
            thresh_min: 0.3,
            thresh_max: 0.7,
            min_size_box: 3.0,
            bce_scale: 5.0,
            l1_scale: 10.0,
            k: 50.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbTarget {
    pub seg_target: Array3<f32>,
    pub seg_mask: Array3<bool>,
    pub thresh_target: Array3<f32>,
    pub thresh_mask: Array3<bool>,
}

/// Rasterizes `targets` into maps of shape `(N, height, width)`.
#[instrument(level = "debug", skip(targets, config))]
pub fn build_target(
    targets: &[Vec<TargetBox>],
    height: usize,
    width: usize,
    config: &DbLossConfig,
) -> DbTarget {
    let n = targets.len();
    let mut seg_target = Array3::<f32>::zeros((n, height, width));
    let mut seg_mask = Array3::<bool>::from_elem((n, height, width), true);
    let mut thresh_target = Array3::<f32>::zeros((n, height, width));
    let mut thresh_mask = Array3::<bool>::from_elem((n, height, width), false);

    for (idx, boxes) in targets.iter().enumerate() {
        let mut seg = seg_target.slice_mut(s![idx, .., ..]);
        let mut canvas = Array2::<f32>::zeros((height, width));
        let mut mask = Array2::<f32>::zeros((height, width));
        for target in boxes {
            let polygon = target.polygon(width, height);
            if target.min_side(width, height) < config.min_size_box {
                mask_out(&mut seg_mask, idx, &polygon);
                continue;
            }
            let distance = offset_distance(&polygon, 1.0 - config.shrink_ratio.powi(2));
            let Some(shrunk) = offset(&polygon, -distance) else {
                mask_out(&mut seg_mask, idx, &polygon);
                continue;
            };
            if polygon_points(&shrunk).len() < 3 {
                mask_out(&mut seg_mask, idx, &polygon);
                continue;
            }
            let mut filled = Array2::<f32>::zeros((height, width));
            fill_polygon(&mut filled, &shrunk, 1.0);
            Zip::from(&mut seg).and(&filled).for_each(|s, f| *s = s.max(*f));
            draw_thresh_map(&polygon, distance, &mut canvas, &mut mask);
        }
        thresh_target
            .slice_mut(s![idx, .., ..])
            .assign(&canvas.mapv(|v| {
                v * (config.thresh_max - config.thresh_min) + config.thresh_min
            }));
        thresh_mask
            .slice_mut(s![idx, .., ..])
            .assign(&mask.mapv(|v| v > 0.0));
    }

    DbTarget {
        seg_target,
        seg_mask,
        thresh_target,
        thresh_mask,
    }
}

fn mask_out(seg_mask: &mut Array3<bool>, idx: usize, polygon: &Polygon<f32>) {
    let (_, height, width) = seg_mask.dim();
    let Some(rect) = polygon.bounding_rect() else {
        return;
    };
    let clamp = |v: f32, max: usize| (v.round().max(0.0) as usize).min(max);
    let (x0, x1) = (clamp(rect.min().x, width), clamp(rect.max().x + 1.0, width));
    let (y0, y1) = (clamp(rect.min().y, height), clamp(rect.max().y + 1.0, height));
    if x0 < x1 && y0 < y1 {
        seg_mask.slice_mut(s![idx, y0..y1, x0..x1]).fill(false);
    }
}

/// Draws `1 - d / distance` around the border of `polygon`, where `d` is the
/// distance to the nearest edge, inside the polygon dilated by `distance`.
fn draw_thresh_map(
    polygon: &Polygon<f32>,
    distance: f32,
    canvas: &mut Array2<f32>,
    mask: &mut Array2<f32>,
) {
    if distance <= 0.0 {
        return;
    }
    let Some(padded) = offset(polygon, distance) else {
        return;
    };
    fill_polygon(mask, &padded, 1.0);

    let Some(rect) = padded.bounding_rect() else {
        return;
    };
    let (height, width) = canvas.dim();
    let clamp = |v: f32, max: usize| (v.max(0.0) as usize).min(max);
    let (x0, x1) = (
        clamp(rect.min().x.floor(), width),
        clamp(rect.max().x.ceil() + 1.0, width),
    );
    let (y0, y1) = (
        clamp(rect.min().y.floor(), height),
        clamp(rect.max().y.ceil() + 1.0, height),
    );

    let edges: Vec<Line<f32>> = polygon.exterior().lines().collect();
    for y in y0..y1 {
        for x in x0..x1 {
            let point = Point::from(Coord {
                x: x as f32,
                y: y as f32,
            });
            let nearest = edges
                .iter()
                .map(|edge| point.euclidean_distance(edge))
                .min_by_key(|d| FloatOrd(*d))
                .unwrap_or(distance);
            let value = 1.0 - (nearest / distance).clamp(0.0, 1.0);
            let pixel = &mut canvas[[y, x]];
            *pixel = pixel.max(value);
        }
    }
}

/// Numerically stable binary cross-entropy on a logit.
pub(crate) fn bce_with_logits(logit: f32, target: f32) -> f32 {
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}

/// `l1_scale * L1(threshold) + bce_scale * balanced BCE + dice(approximate binary map)`.
#[instrument(level = "debug", skip_all)]
pub fn compute_loss(
    output: &NetOutput,
    targets: &[Vec<TargetBox>],
    config: &DbLossConfig,
) -> Result<f32> {
    let thresh_map = output
        .thresholds()
        .ok_or_else(|| Error::ModelOutput("DB loss needs the threshold map".into()))?;
    let logits = output.logits();
    let (_, height, width) = logits.dim();
    if thresh_map.dim() != logits.dim() {
        return Err(Error::ModelOutput(format!(
            "threshold map shape {:?} differs from segmentation map shape {:?}",
            thresh_map.shape(),
            logits.shape()
        )));
    }
    let target = build_target(targets, height, width, config);
    Ok(loss_from_target(logits.view(), thresh_map.view(), &target, config))
}

fn loss_from_target(
    logits: ArrayView3<f32>,
    thresh_map: ArrayView3<f32>,
    target: &DbTarget,
    config: &DbLossConfig,
) -> f32 {
    // Values at masked pixels: (logit, threshold, target)
    let mut entries = Vec::new();
    Zip::from(&logits)
        .and(&thresh_map)
        .and(&target.seg_target)
        .and(&target.seg_mask)
        .for_each(|&logit, &thresh, &seg, &keep| {
            if keep {
                entries.push((logit, thresh, seg));
            }
        });

    let bce: Vec<f32> = entries
        .iter()
        .map(|&(logit, _, seg)| bce_with_logits(logit, seg))
        .collect();

    // Balanced BCE with hard negative mining, at most 3 negatives per positive.
    let positive_count: f32 = entries.iter().map(|&(_, _, seg)| seg).sum();
    let negative_total: f32 = entries.iter().map(|&(_, _, seg)| 1.0 - seg).sum();
    let negative_count = negative_total.min(3.0 * positive_count).floor();
    let mut negative_loss: Vec<f32> = bce
        .iter()
        .zip(&entries)
        .map(|(loss, &(_, _, seg))| loss * (1.0 - seg))
        .collect();
    negative_loss.sort_unstable_by_key(|v| std::cmp::Reverse(FloatOrd(*v)));
    let hard_negatives: f32 = negative_loss.iter().take(negative_count as usize).sum();
    let positive_loss: f32 = bce
        .iter()
        .zip(&entries)
        .map(|(loss, &(_, _, seg))| loss * seg)
        .sum();
    let balanced_bce = (positive_loss + hard_negatives) / (positive_count + negative_count + 1e-6);

    // Dice on the approximate binary map, weighted by the normalized BCE.
    let bce_min = bce.iter().copied().min_by_key(|v| FloatOrd(*v)).unwrap_or(0.0);
    let bce_max = bce.iter().copied().max_by_key(|v| FloatOrd(*v)).unwrap_or(0.0);
    let spread = bce_max - bce_min;
    let (mut inter, mut bin_sum, mut seg_sum) = (0.0f32, 0.0f32, 0.0f32);
    for (loss, &(logit, thresh, seg)) in bce.iter().zip(&entries) {
        let bin = sigmoid(config.k * (sigmoid(logit) - thresh));
        let weight = if spread > 0.0 {
            (loss - bce_min) / spread + 1.0
        } else {
            1.0
        };
        inter += bin * seg * weight;
        bin_sum += bin;
        seg_sum += seg;
    }
    let dice_loss = 1.0 - 2.0 * inter / (bin_sum + seg_sum + 1e-8);

    let mut l1_sum = 0.0f32;
    let mut l1_count = 0usize;
    Zip::from(&thresh_map)
        .and(&target.thresh_target)
        .and(&target.thresh_mask)
        .for_each(|&pred, &expected, &keep| {
            if keep {
                l1_sum += (pred - expected).abs();
                l1_count += 1;
            }
        });
    let l1_loss = if l1_count > 0 {
        l1_sum / l1_count as f32
    } else {
        0.0
    };

    log::trace!("DB loss terms: bce {balanced_bce}, dice {dice_loss}, l1 {l1_loss}");
    config.l1_scale * l1_loss + config.bce_scale * balanced_bce + dice_loss
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use crate::net::MapKind;

    use super::*;

    fn straight(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> TargetBox {
        TargetBox::Straight {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    fn rotated(cx: f32, cy: f32, width: f32, height: f32) -> TargetBox {
        TargetBox::Rotated {
            cx,
            cy,
            width,
            height,
            angle: 0.0,
        }
    }

    fn output(n: usize, size: usize) -> NetOutput {
        let mut map = Array3::<f32>::from_elem((n, size, size), -2.0);
        map.slice_mut(s![.., size / 2.., size / 2..]).fill(2.0);
        NetOutput {
            map,
            kind: MapKind::Logits,
            thresh_map: Some(Array3::zeros((n, size, size))),
        }
    }

    #[test]
    fn target_shrinks_text_and_marks_border() {
        let targets = vec![vec![straight(0.25, 0.25, 0.75, 0.75)]];
        let target = build_target(&targets, 64, 64, &DbLossConfig::default());
        assert_eq!(target.seg_target[[0, 32, 32]], 1.0);
        // the box edge lies outside the shrunk polygon
        assert_eq!(target.seg_target[[0, 16, 32]], 0.0);
        assert!(target.thresh_mask[[0, 16, 32]]);
        assert!((target.thresh_target[[0, 16, 32]] - 0.7).abs() < 0.05);
        assert_eq!(target.thresh_target[[0, 0, 0]], 0.3);
        assert!(target.seg_mask.iter().all(|keep| *keep));
    }

    #[test]
    fn tiny_boxes_are_masked_out() {
        let targets = vec![vec![straight(0.5, 0.5, 0.52, 0.9)]];
        let target = build_target(&targets, 64, 64, &DbLossConfig::default());
        assert!(!target.seg_mask[[0, 40, 32]]);
        assert_eq!(target.seg_target.sum(), 0.0);
    }

    #[test]
    fn loss_is_finite_and_positive() {
        let targets = vec![
            vec![straight(0.5, 0.5, 1.0, 1.0), straight(0.5, 0.5, 0.8, 0.8)],
            vec![straight(0.5, 0.5, 1.0, 1.0), straight(0.5, 0.5, 0.8, 0.9)],
        ];
        let loss = compute_loss(&output(2, 64), &targets, &DbLossConfig::default()).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn rotated_targets_match_straight_ones() {
        let out = output(2, 64);
        let straight_targets = vec![
            vec![straight(0.5, 0.5, 1.0, 1.0), straight(0.5, 0.5, 0.8, 0.8)],
            vec![straight(0.5, 0.5, 1.0, 1.0), straight(0.5, 0.5, 0.8, 0.9)],
        ];
        let rotated_targets = vec![
            vec![rotated(0.75, 0.75, 0.5, 0.5), rotated(0.65, 0.65, 0.3, 0.3)],
            vec![rotated(0.75, 0.75, 0.5, 0.5), rotated(0.65, 0.7, 0.3, 0.4)],
        ];
        let config = DbLossConfig::default();
        let a = compute_loss(&out, &straight_targets, &config).unwrap();
        let b = compute_loss(&out, &rotated_targets, &config).unwrap();
        assert!(((b - a) / b).abs() < 0.21);
    }

    #[test]
    fn threshold_logits_match_probabilities() {
        let targets = vec![vec![straight(0.5, 0.5, 1.0, 1.0)]];
        let config = DbLossConfig::default();
        let logits = output(1, 32);
        let probs = NetOutput {
            map: logits.probabilities(),
            kind: MapKind::Probabilities,
            thresh_map: Some(Array3::from_elem((1, 32, 32), 0.5)),
        };
        let a = compute_loss(&logits, &targets, &config).unwrap();
        let b = compute_loss(&probs, &targets, &config).unwrap();
        assert!((a - b).abs() < 1e-3, "{a} != {b}");

        // A raw threshold logit far from the target range is penalized.
        let mut saturated = output(1, 32);
        saturated.thresh_map = Some(Array3::from_elem((1, 32, 32), 8.0));
        let c = compute_loss(&saturated, &targets, &config).unwrap();
        assert!(c > a);
    }

    #[test]
    fn loss_needs_threshold_map() {
        let mut out = output(1, 32);
        out.thresh_map = None;
        let err = compute_loss(&out, &[vec![]], &DbLossConfig::default()).unwrap_err();
        assert!(matches!(err, Error::ModelOutput(_)));
    }

    #[test]
    fn stable_bce() {
        assert!((bce_with_logits(0.0, 1.0) - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(bce_with_logits(100.0, 0.0).is_finite());
        assert!(bce_with_logits(-100.0, 0.0) < 1e-6);
    }
}
