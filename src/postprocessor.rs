use geo::{BoundingRect, Coord, Polygon};
use imageproc::contours::{find_contours, BorderType};
use ndarray::{ArrayView2, ArrayView3};
use tracing::instrument;

use crate::{
    morphology,
    target::rect_polygon,
    util::{box_score, min_rotated_rect, rect_score, to_geo_poly, to_luma_image, unclip},
    BoxGeometry, Detection,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessorConfig {
    /// Probability above which a pixel is text.
    pub bin_thresh: f32,
    /// Minimum mean probability of a kept box.
    pub box_thresh: f32,
    pub unclip_ratio: f32,
    /// Boxes with a side shorter than this many pixels are dropped.
    pub min_size_box: f32,
    pub max_candidates: usize,
    /// Kernel of the opening applied to the binarized map.
    pub kernel_size: usize,
    /// Emit axis-aligned boxes instead of rotated ones.
    pub assume_straight_pages: bool,
}

impl PostProcessorConfig {
    pub fn db() -> Self {
        Self::default()
    }

    pub fn linknet() -> Self {
        Self {
            bin_thresh: 0.1,
            ..Self::default()
        }
    }
}

impl Default for PostProcessorConfig {
    fn default() -> Self {
        Self {
            bin_thresh: 0.3,
            box_thresh: 0.1,
            unclip_ratio: 1.5,
            min_size_box: 3.0,
            max_candidates: 1000,
            kernel_size: 3,
            assume_straight_pages: true,
        }
    }
}

/// Turns probability maps into scored boxes.
#[derive(Debug, Clone)]
pub struct DetectionPostProcessor {
    config: PostProcessorConfig,
}

impl DetectionPostProcessor {
    pub fn new(config: PostProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostProcessorConfig {
        &self.config
    }

    /// Processes an `(N, H, W)` batch of probability maps.
    #[instrument(level = "debug", skip_all, fields(batch = prob_maps.len_of(ndarray::Axis(0))))]
    pub fn process(&self, prob_maps: ArrayView3<f32>) -> Vec<Vec<Detection>> {
        prob_maps
            .outer_iter()
            .map(|pred| self.bitmap_to_boxes(pred))
            .collect()
    }

    #[instrument(level = "trace", skip_all)]
    pub fn bitmap_to_boxes(&self, pred: ArrayView2<f32>) -> Vec<Detection> {
        let (height, width) = pred.dim();
        if height == 0 || width == 0 {
            return Vec::new();
        }
        let bitmap = pred.mapv(|p| if p > self.config.bin_thresh { 1.0 } else { 0.0 });
        let bitmap = morphology::opening(bitmap.view(), self.config.kernel_size);
        let image = to_luma_image(bitmap.view());

        #[cfg(feature = "debug")]
        if let Err(err) = image.save("bitmap.png") {
            log::warn!("Failed to save debug bitmap: {err}");
        }

        let contours = find_contours::<i32>(&image)
            .into_iter()
            .filter(|it| it.border_type == BorderType::Outer && it.parent.is_none())
            .take(self.config.max_candidates);

        let mut boxes = Vec::new();
        for contour in contours {
            let points = &contour.points;
            let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (
                points.iter().map(|p| p.x).min(),
                points.iter().map(|p| p.x).max(),
                points.iter().map(|p| p.y).min(),
                points.iter().map(|p| p.y).max(),
            ) else {
                continue;
            };
            let min_size = self.config.min_size_box;
            if ((max_x - min_x) as f32) < min_size || ((max_y - min_y) as f32) < min_size {
                continue;
            }

            let detection = if self.config.assume_straight_pages {
                let (x0, y0) = (min_x as usize, min_y as usize);
                let (x1, y1) = (max_x as usize + 1, max_y as usize + 1);
                let score = rect_score(pred, x0, y0, x1, y1);
                if score < self.config.box_thresh {
                    continue;
                }
                let rect = rect_polygon(x0 as f32, y0 as f32, x1 as f32, y1 as f32);
                self.straight_box(&rect, score, width, height)
            } else {
                let polygon = to_geo_poly(points);
                let score = box_score(&polygon, pred);
                if score < self.config.box_thresh {
                    continue;
                }
                self.rotated_box(&polygon, score, width, height)
            };
            boxes.extend(detection);
        }
        log::trace!("Found {} boxes", boxes.len());
        boxes
    }

    fn straight_box(
        &self,
        rect: &Polygon<f32>,
        score: f32,
        width: usize,
        height: usize,
    ) -> Option<Detection> {
        let expanded = unclip(rect, self.config.unclip_ratio)?.bounding_rect()?;
        if expanded.width() < self.config.min_size_box
            || expanded.height() < self.config.min_size_box
        {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        let xmin = (expanded.min().x / w).clamp(0.0, 1.0);
        let ymin = (expanded.min().y / h).clamp(0.0, 1.0);
        let xmax = (expanded.max().x / w).clamp(0.0, 1.0);
        let ymax = (expanded.max().y / h).clamp(0.0, 1.0);
        if xmin >= xmax || ymin >= ymax {
            return None;
        }
        Some(Detection {
            geometry: BoxGeometry::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            },
            score,
        })
    }

    fn rotated_box(
        &self,
        polygon: &Polygon<f32>,
        score: f32,
        width: usize,
        height: usize,
    ) -> Option<Detection> {
        let expanded = unclip(polygon, self.config.unclip_ratio)?;
        let rect = min_rotated_rect(&expanded)?;
        let corners: Vec<Coord<f32>> = rect.exterior().coords().take(4).copied().collect();
        let [c0, c1, c2, _] = corners[..] else {
            return None;
        };
        let side_w = (c1 - c0).x.hypot((c1 - c0).y);
        let side_h = (c2 - c1).x.hypot((c2 - c1).y);
        if side_w < self.config.min_size_box || side_h < self.config.min_size_box {
            return None;
        }
        let center = corners.iter().fold(Coord::zero(), |acc, c| acc + *c) / 4.0;
        let angle = (c1 - c0).y.atan2((c1 - c0).x).to_degrees();
        let (w, h) = (width as f32, height as f32);
        Some(Detection {
            geometry: BoxGeometry::Rotated {
                cx: (center.x / w).clamp(0.0, 1.0),
                cy: (center.y / h).clamp(0.0, 1.0),
                width: (side_w / w).clamp(0.0, 1.0),
                height: (side_h / h).clamp(0.0, 1.0),
                angle,
            },
            score,
        })
    }
}

impl Default for DetectionPostProcessor {
    fn default() -> Self {
        Self::new(PostProcessorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array2, Array3};

    use super::*;

    fn map_with_block() -> Array2<f32> {
        let mut pred = Array2::<f32>::zeros((64, 64));
        pred.slice_mut(s![10..20, 8..40]).fill(0.9);
        pred
    }

    #[test]
    fn finds_straight_block() {
        let boxes = DetectionPostProcessor::default().bitmap_to_boxes(map_with_block().view());
        assert_eq!(boxes.len(), 1);
        let Detection { geometry, score } = boxes[0];
        assert!((score - 0.9).abs() < 1e-5);
        let BoxGeometry::Straight {
            xmin,
            ymin,
            xmax,
            ymax,
        } = geometry
        else {
            panic!("expected a straight box");
        };
        assert!(xmin < 8.0 / 64.0 && xmax > 40.0 / 64.0);
        assert!(ymin < 10.0 / 64.0 && ymax > 20.0 / 64.0);
        for v in [xmin, ymin, xmax, ymax] {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn finds_rotated_block() {
        let processor = DetectionPostProcessor::new(PostProcessorConfig {
            assume_straight_pages: false,
            ..PostProcessorConfig::default()
        });
        let boxes = processor.bitmap_to_boxes(map_with_block().view());
        assert_eq!(boxes.len(), 1);
        let BoxGeometry::Rotated { cx, cy, .. } = boxes[0].geometry else {
            panic!("expected a rotated box");
        };
        assert!((cx - 24.0 / 64.0).abs() < 0.05);
        assert!((cy - 15.0 / 64.0).abs() < 0.05);
        assert_eq!(boxes[0].to_vec().len(), 6);
    }

    #[test]
    fn drops_specks_and_weak_regions() {
        let mut pred = Array2::<f32>::zeros((32, 32));
        pred[[5, 5]] = 1.0;
        pred.slice_mut(s![15..18, 15..17]).fill(1.0);
        assert!(DetectionPostProcessor::default()
            .bitmap_to_boxes(pred.view())
            .is_empty());

        let processor = DetectionPostProcessor::new(PostProcessorConfig {
            box_thresh: 0.95,
            ..PostProcessorConfig::default()
        });
        assert!(processor.bitmap_to_boxes(map_with_block().view()).is_empty());
    }

    #[test]
    fn processes_each_map() {
        let mut maps = Array3::<f32>::zeros((2, 64, 64));
        maps.slice_mut(s![1, .., ..]).assign(&map_with_block());
        let out = DetectionPostProcessor::default().process(maps.view());
        assert_eq!(out.len(), 2);
        assert!(out[0].is_empty());
        assert_eq!(out[1].len(), 1);
    }
}
