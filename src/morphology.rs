//! Binary morphology on single-channel maps.
//!
//! Both operators use a square `kernel_size` window and zero padding, so pixels
//! outside the map count as background. On `{0, 1}` maps erosion keeps a pixel
//! only when its whole window is foreground and dilation sets it when any
//! neighbour is foreground; on probability maps they act as min / max filters.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};

#[derive(Debug, Clone, Copy)]
enum Reduce {
    Min,
    Max,
}

impl Reduce {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Reduce::Min => a.min(b),
            Reduce::Max => a.max(b),
        }
    }
}

pub fn erode(map: ArrayView2<f32>, kernel_size: usize) -> Array2<f32> {
    filter(map, kernel_size, Reduce::Min)
}

pub fn dilate(map: ArrayView2<f32>, kernel_size: usize) -> Array2<f32> {
    filter(map, kernel_size, Reduce::Max)
}

/// Erosion followed by dilation. Removes specks smaller than the kernel.
pub fn opening(map: ArrayView2<f32>, kernel_size: usize) -> Array2<f32> {
    dilate(erode(map, kernel_size).view(), kernel_size)
}

/// [`erode`] applied to each map of an `(N, H, W)` batch.
pub fn erode_batch(maps: ArrayView3<f32>, kernel_size: usize) -> Array3<f32> {
    map_batch(maps, |map| erode(map, kernel_size))
}

/// [`dilate`] applied to each map of an `(N, H, W)` batch.
pub fn dilate_batch(maps: ArrayView3<f32>, kernel_size: usize) -> Array3<f32> {
    map_batch(maps, |map| dilate(map, kernel_size))
}

fn map_batch(maps: ArrayView3<f32>, f: impl Fn(ArrayView2<f32>) -> Array2<f32>) -> Array3<f32> {
    let mut out = Array3::zeros(maps.raw_dim());
    for (src, mut dst) in maps.outer_iter().zip(out.outer_iter_mut()) {
        dst.assign(&f(src));
    }
    out
}

fn filter(map: ArrayView2<f32>, kernel_size: usize, reduce: Reduce) -> Array2<f32> {
    if kernel_size <= 1 || map.is_empty() {
        return map.to_owned();
    }
    // A square window is separable: filter rows, then columns.
    let mut rows = Array2::zeros(map.raw_dim());
    Zip::from(map.rows())
        .and(rows.rows_mut())
        .for_each(|src, dst| filter_line(src, dst, kernel_size, reduce));

    let mut out = Array2::zeros(map.raw_dim());
    Zip::from(rows.columns())
        .and(out.columns_mut())
        .for_each(|src, dst| filter_line(src, dst, kernel_size, reduce));
    out
}

fn filter_line(
    src: ArrayView1<f32>,
    mut dst: ArrayViewMut1<f32>,
    kernel_size: usize,
    reduce: Reduce,
) {
    let len = src.len_of(Axis(0));
    let before = (kernel_size - 1) / 2;
    let after = kernel_size - 1 - before;
    for i in 0..len {
        let start = i.checked_sub(before);
        let end = i + after;
        let mut acc = src[i];
        if start.is_none() || end >= len {
            acc = reduce.apply(acc, 0.0);
        }
        for j in start.unwrap_or(0)..=end.min(len - 1) {
            acc = reduce.apply(acc, src[j]);
        }
        dst[i] = acc;
    }
}
