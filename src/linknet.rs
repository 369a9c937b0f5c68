//! LinkNet: training targets and loss.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_line_segment_mut;
use ndarray::{s, Array2, Array3, Zip};
use tracing::instrument;

use crate::{
    dbnet::bce_with_logits,
    error::Result,
    net::NetOutput,
    target::TargetBox,
    util::{fill_polygon, polygon_points},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkNetLossConfig {
    pub min_size_box: f32,
    /// Weight of border pixels relative to the rest.
    pub edge_factor: f32,
}

impl Default for LinkNetLossConfig {
    fn default() -> Self {
        Self {
            min_size_box: 3.0,
            edge_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkNetTarget {
    pub seg_target: Array3<f32>,
    pub seg_mask: Array3<bool>,
    pub edge_mask: Array3<bool>,
}

#[instrument(level = "debug", skip(targets, config))]
pub fn build_target(
    targets: &[Vec<TargetBox>],
    height: usize,
    width: usize,
    config: &LinkNetLossConfig,
) -> LinkNetTarget {
    let n = targets.len();
    let mut seg_target = Array3::<f32>::zeros((n, height, width));
    let mut seg_mask = Array3::<bool>::from_elem((n, height, width), true);
    let mut edge_mask = Array3::<bool>::from_elem((n, height, width), false);

    for (idx, boxes) in targets.iter().enumerate() {
        let mut seg = Array2::<f32>::zeros((height, width));
        let mut edges = GrayImage::new(width as u32, height as u32);
        for target in boxes {
            let polygon = target.polygon(width, height);
            let too_small = target.min_side(width, height) < config.min_size_box;
            if too_small {
                let mut region = Array2::<f32>::zeros((height, width));
                fill_polygon(&mut region, &polygon, 1.0);
                Zip::from(seg_mask.slice_mut(s![idx, .., ..]))
                    .and(&region)
                    .for_each(|keep, r| *keep &= *r == 0.0);
                continue;
            }
            fill_polygon(&mut seg, &polygon, 1.0);
            let points = polygon_points(&polygon);
            for (i, start) in points.iter().enumerate() {
                let end = points[(i + 1) % points.len()];
                // Keep edges on the canvas when boxes touch the right or bottom border.
                let clip = |p: imageproc::point::Point<i32>| {
                    (
                        p.x.clamp(0, width as i32 - 1) as f32,
                        p.y.clamp(0, height as i32 - 1) as f32,
                    )
                };
                draw_line_segment_mut(&mut edges, clip(*start), clip(end), Luma([255u8]));
            }
        }
        seg_target.slice_mut(s![idx, .., ..]).assign(&seg);
        for (x, y, pixel) in edges.enumerate_pixels() {
            if pixel[0] > 0 {
                edge_mask[[idx, y as usize, x as usize]] = true;
            }
        }
    }

    LinkNetTarget {
        seg_target,
        seg_mask,
        edge_mask,
    }
}

/// Mean BCE over unmasked pixels, with border pixels weighted by `edge_factor`.
#[instrument(level = "debug", skip_all)]
pub fn compute_loss(
    output: &NetOutput,
    targets: &[Vec<TargetBox>],
    config: &LinkNetLossConfig,
) -> Result<f32> {
    let logits = output.logits();
    let (_, height, width) = logits.dim();
    let target = build_target(targets, height, width, config);

    let mut sum = 0.0f32;
    let mut count = 0usize;
    Zip::from(&logits)
        .and(&target.seg_target)
        .and(&target.seg_mask)
        .and(&target.edge_mask)
        .for_each(|&logit, &seg, &keep, &edge| {
            if keep {
                let weight = if edge { config.edge_factor } else { 1.0 };
                sum += weight * bce_with_logits(logit, seg);
                count += 1;
            }
        });
    Ok(if count > 0 { sum / count as f32 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use crate::net::MapKind;

    use super::*;

    fn boxes() -> Vec<Vec<TargetBox>> {
        vec![vec![TargetBox::Straight {
            xmin: 0.25,
            ymin: 0.25,
            xmax: 0.5,
            ymax: 0.75,
        }]]
    }

    #[test]
    fn target_fills_boxes_and_marks_edges() {
        let target = build_target(&boxes(), 32, 32, &LinkNetLossConfig::default());
        assert_eq!(target.seg_target[[0, 16, 12]], 1.0);
        assert_eq!(target.seg_target[[0, 2, 2]], 0.0);
        assert!(target.edge_mask[[0, 8, 12]]);
        assert!(!target.edge_mask[[0, 16, 12]]);
        assert!(target.seg_mask.iter().all(|keep| *keep));
    }

    #[test]
    fn perfect_prediction_has_lower_loss() {
        let target = build_target(&boxes(), 32, 32, &LinkNetLossConfig::default());
        let good = NetOutput {
            map: target.seg_target.mapv(|v| if v > 0.0 { 8.0 } else { -8.0 }),
            kind: MapKind::Logits,
            thresh_map: None,
        };
        let bad = NetOutput {
            map: Array3::zeros((1, 32, 32)),
            kind: MapKind::Logits,
            thresh_map: None,
        };
        let config = LinkNetLossConfig::default();
        let good_loss = compute_loss(&good, &boxes(), &config).unwrap();
        let bad_loss = compute_loss(&bad, &boxes(), &config).unwrap();
        assert!(good_loss < 0.01);
        assert!(bad_loss > good_loss);
    }

    #[test]
    fn tiny_boxes_are_masked_out() {
        let targets = vec![vec![TargetBox::Rotated {
            cx: 0.5,
            cy: 0.5,
            width: 0.05,
            height: 0.5,
            angle: 0.0,
        }]];
        let target = build_target(&targets, 32, 32, &LinkNetLossConfig::default());
        assert!(!target.seg_mask[[0, 16, 16]]);
        assert_eq!(target.seg_target.sum(), 0.0);
    }
}
