use geo::{
    Area, BoundingRect, Coord, EuclideanLength, Intersects, LineString, MinimumRotatedRect,
    Polygon,
};
use geo_clipper::{Clipper, EndType, JoinType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::{drawing::draw_polygon_mut, point::Point};
use ndarray::{s, Array2, ArrayView2, Axis};

/// Converts a `{0, 1}` or probability map to an 8-bit image.
pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .iter()
        .map(|p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
        .unwrap_or_else(|| GrayImage::new(width as u32, height as u32))
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

/// Mean of `pred` over the pixels covered by `polygon`, boundary included.
pub(crate) fn box_score(polygon: &Polygon<f32>, pred: ArrayView2<f32>) -> f32 {
    let Some(bounds) = polygon.bounding_rect() else {
        return 0.0;
    };
    let (height, width) = pred.dim();
    let clamp = |v: f32, max: usize| (v.max(0.0) as usize).min(max);
    let (x0, x1) = (
        clamp(bounds.min().x.floor(), width),
        clamp(bounds.max().x.ceil() + 1.0, width),
    );
    let (y0, y1) = (
        clamp(bounds.min().y.floor(), height),
        clamp(bounds.max().y.ceil() + 1.0, height),
    );
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }

    let (sum, count) = pred
        .slice(s![y0..y1, x0..x1])
        .indexed_iter()
        .filter(|((y, x), _)| {
            polygon.intersects(&Coord {
                x: (x + x0) as f32,
                y: (y + y0) as f32,
            })
        })
        .fold((0.0f32, 0usize), |(sum, count), (_, value)| (sum + *value, count + 1));

    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Mean of `pred` over the axis-aligned pixel box `[x0, x1) x [y0, y1)`.
pub(crate) fn rect_score(pred: ArrayView2<f32>, x0: usize, y0: usize, x1: usize, y1: usize) -> f32 {
    let (height, width) = pred.dim();
    let (x1, y1) = (x1.min(width), y1.min(height));
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    pred.slice(s![y0..y1, x0..x1]).mean().unwrap_or(0.0)
}

/// Offsets `polygon` by `distance` pixels (negative shrinks) and returns the
/// largest resulting polygon.
pub(crate) fn offset(polygon: &Polygon<f32>, distance: f32) -> Option<Polygon<f32>> {
    let result = polygon.offset(distance, JoinType::Round(0.25), EndType::ClosedPolygon, 1.0);
    result
        .into_iter()
        .filter(|poly| poly.exterior().0.len() > 3)
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
}

/// Distance used to expand (unclip) or shrink a polygon: `area * ratio / perimeter`.
pub(crate) fn offset_distance(polygon: &Polygon<f32>, ratio: f32) -> f32 {
    let length = polygon.exterior().euclidean_length();
    if length <= f32::EPSILON {
        return 0.0;
    }
    polygon.unsigned_area() * ratio / length
}

pub(crate) fn unclip(polygon: &Polygon<f32>, unclip_ratio: f32) -> Option<Polygon<f32>> {
    let distance = offset_distance(polygon, unclip_ratio);
    offset(polygon, distance)
}

pub(crate) fn min_rotated_rect(polygon: &Polygon<f32>) -> Option<Polygon<f32>> {
    polygon.minimum_rotated_rect()
}

/// Polygon corners as integer pixel points, without the closing duplicate.
pub(crate) fn polygon_points(polygon: &Polygon<f32>) -> Vec<Point<i32>> {
    let mut points: Vec<Point<i32>> = polygon
        .exterior()
        .coords()
        .map(|c| Point::new(c.x.round() as i32, c.y.round() as i32))
        .collect();
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

/// Sets every pixel covered by `polygon` to `value`.
pub(crate) fn fill_polygon(canvas: &mut Array2<f32>, polygon: &Polygon<f32>, value: f32) {
    let points = polygon_points(polygon);
    if points.len() < 3 {
        return;
    }
    let (height, width) = canvas.dim();
    let mut image = GrayImage::new(width as u32, height as u32);
    draw_polygon_mut(&mut image, &points, Luma([255u8]));
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[0] > 0 {
            canvas[[y as usize, x as usize]] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use geo::polygon;
    use ndarray::Array2;

    use super::*;

    #[test]
    fn box_score_averages_inside_pixels() {
        let mut pred = Array2::<f32>::zeros((10, 10));
        pred.slice_mut(s![2..5, 2..5]).fill(1.0);
        let poly = polygon![(x: 2.0, y: 2.0), (x: 4.0, y: 2.0), (x: 4.0, y: 4.0), (x: 2.0, y: 4.0)];
        assert_eq!(box_score(&poly, pred.view()), 1.0);
        assert_eq!(rect_score(pred.view(), 0, 0, 10, 10), 0.09);
    }

    #[test]
    fn unclip_grows_and_offset_shrinks() {
        let poly = polygon![
            (x: 10.0, y: 10.0),
            (x: 30.0, y: 10.0),
            (x: 30.0, y: 20.0),
            (x: 10.0, y: 20.0),
        ];
        let grown = unclip(&poly, 1.5).unwrap();
        assert!(grown.unsigned_area() > poly.unsigned_area());
        let shrunk = offset(&poly, -2.0).unwrap();
        assert!(shrunk.unsigned_area() < poly.unsigned_area());
        assert_eq!(offset_distance(&poly, 1.0), 200.0 / 60.0);
    }

    #[test]
    fn fill_covers_polygon() {
        let mut canvas = Array2::<f32>::zeros((8, 8));
        let poly = polygon![(x: 1.0, y: 1.0), (x: 4.0, y: 1.0), (x: 4.0, y: 3.0), (x: 1.0, y: 3.0)];
        fill_polygon(&mut canvas, &poly, 1.0);
        assert_eq!(canvas[[2, 2]], 1.0);
        assert_eq!(canvas[[6, 6]], 0.0);
        assert_eq!(canvas.sum(), 12.0);
    }
}
