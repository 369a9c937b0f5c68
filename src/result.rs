use ndarray::Array2;

/// A detected text region, in coordinates relative to the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub geometry: BoxGeometry,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxGeometry {
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

impl Detection {
    /// `[xmin, ymin, xmax, ymax, score]` or `[cx, cy, w, h, angle, score]`.
    pub fn to_vec(&self) -> Vec<f32> {
        match self.geometry {
            BoxGeometry::Straight {
                xmin,
                ymin,
                xmax,
                ymax,
            } => vec![xmin, ymin, xmax, ymax, self.score],
            BoxGeometry::Rotated {
                cx,
                cy,
                width,
                height,
                angle,
            } => vec![cx, cy, width, height, angle, self.score],
        }
    }
}

/// Stacks detections into an `(n, 5)` array, or `(n, 6)` for rotated boxes.
pub fn detections_to_array(detections: &[Detection]) -> Array2<f32> {
    let width = match detections.first().map(|it| it.geometry) {
        Some(BoxGeometry::Rotated { .. }) => 6,
        _ => 5,
    };
    let data = detections
        .iter()
        .flat_map(|it| it.to_vec())
        .collect::<Vec<_>>();
    Array2::from_shape_vec((detections.len(), width), data)
        .unwrap_or_else(|_| Array2::zeros((0, width)))
}
