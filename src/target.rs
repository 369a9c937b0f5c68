//! Ground-truth boxes used for training-mode loss computation.

use geo::{coord, Coord, LineString, Point, Polygon, Rotate};
use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

/// Box array of one image, tagged with its element type.
///
/// Only `F32` arrays are accepted as targets; the other variants exist so that
/// integer or double precision data coming from label files is rejected
/// explicitly instead of being silently cast.
#[derive(Debug, Clone)]
pub enum TargetArray {
    F32(Array2<f32>),
    F64(Array2<f64>),
    U8(Array2<u8>),
    I32(Array2<i32>),
    I64(Array2<i64>),
}

impl TargetArray {
    pub fn dtype(&self) -> &'static str {
        match self {
            TargetArray::F32(_) => "float32",
            TargetArray::F64(_) => "float64",
            TargetArray::U8(_) => "uint8",
            TargetArray::I32(_) => "int32",
            TargetArray::I64(_) => "int64",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TargetArray::F32(a) => a.shape(),
            TargetArray::F64(a) => a.shape(),
            TargetArray::U8(a) => a.shape(),
            TargetArray::I32(a) => a.shape(),
            TargetArray::I64(a) => a.shape(),
        }
    }
}

macro_rules! impl_from_array {
    ($($ty:ty => $variant:ident),+) => {
        $(impl From<Array2<$ty>> for TargetArray {
            fn from(value: Array2<$ty>) -> Self {
                TargetArray::$variant(value)
            }
        })+
    };
}

impl_from_array!(f32 => F32, f64 => F64, u8 => U8, i32 => I32, i64 => I64);

/// A validated, normalized ground-truth box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetBox {
    Straight {
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    },
    /// Centre, size and rotation in degrees.
    Rotated {
        cx: f32,
        cy: f32,
        width: f32,
        height: f32,
        angle: f32,
    },
}

impl TargetBox {
    /// Corners in pixel coordinates of a `width` x `height` map.
    pub fn polygon(&self, width: usize, height: usize) -> Polygon<f32> {
        let (w, h) = (width as f32, height as f32);
        match *self {
            TargetBox::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            } => rect_polygon(xmin * w, ymin * h, xmax * w, ymax * h),
            TargetBox::Rotated {
                cx,
                cy,
                width,
                height,
                angle,
            } => {
                let (cx, cy) = (cx * w, cy * h);
                let (half_w, half_h) = (width * w / 2.0, height * h / 2.0);
                let rect = rect_polygon(cx - half_w, cy - half_h, cx + half_w, cy + half_h);
                if angle == 0.0 {
                    rect
                } else {
                    rect.rotate_around_point(angle, Point::new(cx, cy))
                }
            }
        }
    }

    /// Length of the shorter side in pixels.
    pub fn min_side(&self, width: usize, height: usize) -> f32 {
        let (w, h) = (width as f32, height as f32);
        match *self {
            TargetBox::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            } => ((xmax - xmin) * w).min((ymax - ymin) * h),
            TargetBox::Rotated { width, height, .. } => (width * w).min(height * h),
        }
    }
}

pub(crate) fn rect_polygon(x0: f32, y0: f32, x1: f32, y1: f32) -> Polygon<f32> {
    let exterior: Vec<Coord<f32>> = vec![
        coord! { x: x0, y: y0 },
        coord! { x: x1, y: y0 },
        coord! { x: x1, y: y1 },
        coord! { x: x0, y: y1 },
    ];
    Polygon::new(LineString::new(exterior), vec![])
}

/// Checks a batch of targets and converts them into [`TargetBox`]es.
///
/// Element type and column count are checked for every image first, then the
/// values: coordinates in `[0, 1]` and non-inverted straight boxes.
pub fn validate_targets(targets: &[TargetArray]) -> Result<Vec<Vec<TargetBox>>> {
    let arrays = targets
        .iter()
        .map(|target| match target {
            TargetArray::F32(array) => Ok(array.view()),
            other => Err(Error::TargetDtype {
                found: other.dtype(),
            }),
        })
        .collect::<Result<Vec<_>>>()?;

    let columns = arrays.first().map(|array| array.ncols()).unwrap_or(4);
    if !(columns == 4 || columns == 5) || arrays.iter().any(|array| array.ncols() != columns) {
        let found = arrays
            .iter()
            .map(|array| format!("{:?}", array.shape()))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::TargetShape { found });
    }

    let in_range = |v: f32| (0.0..=1.0).contains(&v);
    if arrays.iter().any(|array| {
        array
            .rows()
            .into_iter()
            .any(|row| !row.iter().take(4).all(|v| in_range(*v)))
    }) {
        return Err(Error::TargetRange);
    }

    arrays
        .iter()
        .enumerate()
        .map(|(image, array)| to_boxes(image, *array))
        .collect()
}

fn to_boxes(image: usize, array: ArrayView2<f32>) -> Result<Vec<TargetBox>> {
    array
        .rows()
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            if row.len() == 5 {
                if !row[4].is_finite() {
                    return Err(Error::TargetGeometry { image, index });
                }
                return Ok(TargetBox::Rotated {
                    cx: row[0],
                    cy: row[1],
                    width: row[2],
                    height: row[3],
                    angle: row[4],
                });
            }
            if row[0] >= row[2] || row[1] >= row[3] {
                return Err(Error::TargetGeometry { image, index });
            }
            Ok(TargetBox::Straight {
                xmin: row[0],
                ymin: row[1],
                xmax: row[2],
                ymax: row[3],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use geo::{Area, BoundingRect};
    use ndarray::array;

    use crate::error::ErrorKind;

    use super::*;

    #[test]
    fn accepts_float_boxes() {
        let targets = vec![
            array![[0.5f32, 0.5, 1.0, 1.0], [0.5, 0.5, 0.8, 0.8]].into(),
            array![[0.5f32, 0.5, 1.0, 1.0], [0.5, 0.5, 0.8, 0.9]].into(),
        ];
        let boxes = validate_targets(&targets).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(
            boxes[1][1],
            TargetBox::Straight {
                xmin: 0.5,
                ymin: 0.5,
                xmax: 0.8,
                ymax: 0.9
            }
        );
    }

    #[test]
    fn integer_boxes_are_a_type_error() {
        let targets = vec![
            array![[0u8, 0, 1, 1]].into(),
            array![[0u8, 0, 1, 1]].into(),
        ];
        let err = validate_targets(&targets).unwrap_err();
        assert!(matches!(err, Error::TargetDtype { found: "uint8" }));
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn out_of_range_boxes_are_a_value_error() {
        let targets = vec![
            array![[0.0f32, 0.0, 1.5, 1.5]].into(),
            array![[-0.2f32, -0.3, 1.0, 1.0]].into(),
        ];
        let err = validate_targets(&targets).unwrap_err();
        assert!(matches!(err, Error::TargetRange));
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn inverted_boxes_are_a_value_error() {
        let targets = vec![array![[0.6f32, 0.1, 0.2, 0.4]].into()];
        let err = validate_targets(&targets).unwrap_err();
        assert!(matches!(err, Error::TargetGeometry { image: 0, index: 0 }));
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn wrong_column_count_is_a_type_error() {
        let targets = vec![array![[0.1f32, 0.1, 0.2]].into()];
        let err = validate_targets(&targets).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn rotated_polygon_matches_straight_box() {
        let targets = vec![array![[0.75f32, 0.75, 0.5, 0.5, 0.0]].into()];
        let boxes = validate_targets(&targets).unwrap();
        let poly = boxes[0][0].polygon(100, 100);
        let rect = poly.bounding_rect().unwrap();
        assert_eq!(rect.min(), coord! { x: 50.0, y: 50.0 });
        assert_eq!(rect.max(), coord! { x: 100.0, y: 100.0 });
        assert_eq!(boxes[0][0].min_side(100, 100), 50.0);
    }

    #[test]
    fn rotation_preserves_area() {
        let rotated = TargetBox::Rotated {
            cx: 0.5,
            cy: 0.5,
            width: 0.4,
            height: 0.2,
            angle: 30.0,
        };
        let area = rotated.polygon(100, 100).unsigned_area();
        assert!((area - 800.0).abs() < 1e-2);
    }

    #[test]
    fn empty_image_is_fine() {
        let targets = vec![Array2::<f32>::zeros((0, 4)).into()];
        assert_eq!(validate_targets(&targets).unwrap(), vec![vec![]]);
    }
}
