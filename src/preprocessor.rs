use image::{
    imageops::{self, FilterType},
    DynamicImage, ImageBuffer, Rgb, RgbImage,
};
use ndarray::{s, Array3, Array4, ArrayD, ArrayView3, ArrayView4, Axis, Ix3};
use tracing::instrument;

use crate::error::{Error, Result};

type Rgb32FImage = ImageBuffer<Rgb<f32>, Vec<f32>>;

/// Resizes, normalizes and batches page images for a detection model.
///
/// Output batches are channels-last `(N, H, W, 3)` float tensors.
#[derive(Debug, Clone)]
pub struct PreProcessor {
    /// `(height, width)` of the model input.
    output_size: (u32, u32),
    batch_size: usize,
    mean: [f32; 3],
    std: [f32; 3],
    preserve_aspect_ratio: bool,
    symmetric_pad: bool,
}

impl PreProcessor {
    pub fn new(output_size: (u32, u32), batch_size: usize) -> Self {
        Self {
            output_size,
            batch_size: batch_size.max(1),
            mean: [0.5, 0.5, 0.5],
            std: [1.0, 1.0, 1.0],
            preserve_aspect_ratio: false,
            symmetric_pad: false,
        }
    }

    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    /// Letterbox pages instead of stretching them. Padding goes to the
    /// bottom-right unless `symmetric` is set.
    pub fn preserve_aspect_ratio(mut self, preserve: bool, symmetric: bool) -> Self {
        self.preserve_aspect_ratio = preserve;
        self.symmetric_pad = symmetric;
        self
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Checks that every page is an `(H, W, 3)` image.
    pub fn validate_pages(pages: &[ArrayD<u8>]) -> Result<()> {
        for (index, page) in pages.iter().enumerate() {
            let shape = page.shape();
            if shape.len() != 3 {
                return Err(Error::InputShape(format!(
                    "all pages are expected to be multi-channel 2D images, page {index} has shape {shape:?}"
                )));
            }
            if shape[2] != 3 || shape[0] == 0 || shape[1] == 0 {
                return Err(Error::InputShape(format!(
                    "expected (H, W, 3) pages, page {index} has shape {shape:?}"
                )));
            }
        }
        Ok(())
    }

    /// Turns `(H, W, 3)` 8-bit pages into normalized batches.
    #[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
    pub fn process_pages(&self, pages: &[ArrayD<u8>]) -> Result<Vec<Array4<f32>>> {
        Self::validate_pages(pages)?;
        let images = pages
            .iter()
            .map(|page| {
                let page = page.view().into_dimensionality::<Ix3>()?;
                let (height, width, _) = page.dim();
                let data = page.iter().copied().collect::<Vec<u8>>();
                let image = RgbImage::from_raw(width as u32, height as u32, data)
                    .ok_or_else(|| {
                        Error::InputShape(format!("page of shape {:?} is not RGB", page.shape()))
                    })?;
                let image = DynamicImage::ImageRgb8(image).into_rgb32f();
                Ok(self.normalize(self.resize(&image)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.batch(images)
    }

    /// Resizes and normalizes an already batched `(N, H, W, 3)` tensor with
    /// values in `[0, 1]`.
    #[instrument(level = "debug", skip_all, fields(shape = ?batch.shape()))]
    pub fn process_tensor(&self, batch: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let (_, height, width, channels) = batch.dim();
        if channels != 3 || height == 0 || width == 0 {
            return Err(Error::InputShape(format!(
                "expected an (N, H, W, 3) batch, got {:?}",
                batch.shape()
            )));
        }
        let images = batch
            .outer_iter()
            .map(|image| {
                let (height, width, _) = image.dim();
                if (height as u32, width as u32) == self.output_size {
                    return Ok(self.normalize(image.to_owned()));
                }
                let data = image.iter().copied().collect::<Vec<f32>>();
                let image = Rgb32FImage::from_raw(width as u32, height as u32, data)
                    .ok_or_else(|| Error::InputShape("image is not RGB".into()))?;
                Ok(self.normalize(self.resize(&image)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.batch(images)
    }

    fn resize(&self, image: &Rgb32FImage) -> Array3<f32> {
        let (target_h, target_w) = self.output_size;
        if !self.preserve_aspect_ratio {
            let resized = imageops::resize(image, target_w, target_h, FilterType::Triangle);
            return to_array(&resized);
        }

        let scale = (target_h as f32 / image.height() as f32)
            .min(target_w as f32 / image.width() as f32);
        let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, target_w);
        let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, target_h);
        log::trace!(
            "Letterboxing ({}, {}) into ({new_w}, {new_h}) on ({target_w}, {target_h})",
            image.width(),
            image.height()
        );
        let resized = to_array(&imageops::resize(image, new_w, new_h, FilterType::Triangle));

        let (top, left) = if self.symmetric_pad {
            ((target_h - new_h) / 2, (target_w - new_w) / 2)
        } else {
            (0, 0)
        };
        let mut canvas = Array3::<f32>::zeros((target_h as usize, target_w as usize, 3));
        canvas
            .slice_mut(s![
                top as usize..(top + new_h) as usize,
                left as usize..(left + new_w) as usize,
                ..
            ])
            .assign(&resized);
        canvas
    }

    fn normalize(&self, mut image: Array3<f32>) -> Array3<f32> {
        for (ch, mut channel) in image.axis_iter_mut(Axis(2)).enumerate() {
            let (mean, std) = (self.mean[ch], self.std[ch]);
            channel.mapv_inplace(|v| (v - mean) / std);
        }
        image
    }

    fn batch(&self, images: Vec<Array3<f32>>) -> Result<Vec<Array4<f32>>> {
        images
            .chunks(self.batch_size)
            .map(|chunk| {
                let views = chunk.iter().map(|it| it.view()).collect::<Vec<ArrayView3<f32>>>();
                Ok(ndarray::stack(Axis(0), &views)?)
            })
            .collect()
    }
}

fn to_array(image: &Rgb32FImage) -> Array3<f32> {
    Array3::from_shape_fn(
        (image.height() as usize, image.width() as usize, 3),
        |(y, x, ch)| image.get_pixel(x as u32, y as u32)[ch],
    )
}

/// Converts a decoded image into an `(H, W, 3)` page.
pub fn page_from_image(image: &DynamicImage) -> ArrayD<u8> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
        .map(|page| page.into_dyn())
        .unwrap_or_else(|_| ArrayD::zeros(vec![0, 0, 3]))
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, IxDyn};

    use crate::error::ErrorKind;

    use super::*;

    fn page(height: usize, width: usize, value: u8) -> ArrayD<u8> {
        Array3::from_elem((height, width, 3), value).into_dyn()
    }

    #[test]
    fn resizes_and_batches_pages() {
        let processor = PreProcessor::new((64, 32), 2);
        let pages = vec![page(100, 80, 255), page(40, 20, 0), page(64, 32, 128)];
        let batches = processor.process_pages(&pages).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].shape(), &[2, 64, 32, 3]);
        assert_eq!(batches[1].shape(), &[1, 64, 32, 3]);
        assert!((batches[0][[0, 10, 10, 0]] - 0.5).abs() < 1e-5);
        assert!((batches[0][[1, 10, 10, 2]] + 0.5).abs() < 1e-5);
    }

    #[test]
    fn applies_normalization() {
        let processor =
            PreProcessor::new((8, 8), 4).with_normalization([0.2, 0.4, 0.6], [0.5, 0.5, 0.5]);
        let batches = processor.process_pages(&[page(8, 8, 255)]).unwrap();
        assert!((batches[0][[0, 0, 0, 0]] - 1.6).abs() < 1e-5);
        assert!((batches[0][[0, 0, 0, 2]] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn rejects_batched_page() {
        let processor = PreProcessor::new((512, 512), 4);
        let bad = ArrayD::<u8>::zeros(IxDyn(&[1, 256, 512, 3]));
        let err = processor.process_pages(&[bad]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);

        let grey = ArrayD::<u8>::zeros(IxDyn(&[32, 32, 1]));
        assert!(processor.process_pages(&[grey]).is_err());
    }

    #[test]
    fn letterboxes_when_asked() {
        let processor = PreProcessor::new((32, 32), 1)
            .with_normalization([0.0; 3], [1.0; 3])
            .preserve_aspect_ratio(true, true);
        let batches = processor.process_pages(&[page(16, 32, 255)]).unwrap();
        let batch = &batches[0];
        assert_eq!(batch[[0, 0, 16, 0]], 0.0);
        assert!((batch[[0, 16, 16, 0]] - 1.0).abs() < 1e-5);
        assert_eq!(batch[[0, 31, 16, 0]], 0.0);
    }

    #[test]
    fn tensor_input_is_resized() {
        let processor = PreProcessor::new((16, 16), 8);
        let batch = Array4::<f32>::from_elem((3, 32, 24, 3), 1.0);
        let out = processor.process_tensor(batch.view()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].shape(), &[3, 16, 16, 3]);
        assert!((out[0][[2, 8, 8, 1]] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn empty_tensor_extent_is_rejected() {
        let processor = PreProcessor::new((16, 16), 8);
        for shape in [(1, 0, 16, 3), (2, 16, 0, 3), (1, 16, 16, 1)] {
            let err = processor
                .process_tensor(Array4::<f32>::zeros(shape).view())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Value);
        }
    }

    #[test]
    fn converts_decoded_images() {
        let image = DynamicImage::new_rgb8(5, 4);
        assert_eq!(page_from_image(&image).shape(), &[4, 5, 3]);
    }
}
