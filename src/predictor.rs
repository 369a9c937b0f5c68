use image::DynamicImage;
use ndarray::{ArrayD, ArrayView4};
use tracing::instrument;

use crate::{
    error::Result,
    model::DetectionModel,
    preprocessor::{page_from_image, PreProcessor},
    Detection,
};

/// Page images in, text boxes out.
pub struct DetectionPredictor {
    pre_processor: PreProcessor,
    model: DetectionModel,
}

impl DetectionPredictor {
    pub fn new(pre_processor: PreProcessor, model: DetectionModel) -> Self {
        Self {
            pre_processor,
            model,
        }
    }

    pub fn model(&self) -> &DetectionModel {
        &self.model
    }

    pub fn pre_processor(&self) -> &PreProcessor {
        &self.pre_processor
    }

    /// One set of boxes per `(H, W, 3)` page.
    ///
    /// Every page is checked before anything runs, so a malformed page fails
    /// the whole call without partial results.
    #[instrument(skip_all, fields(model = self.model.name(), pages = pages.len()))]
    pub fn predict(&self, pages: &[ArrayD<u8>]) -> Result<Vec<Vec<Detection>>> {
        PreProcessor::validate_pages(pages)?;
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let batches = self.pre_processor.process_pages(pages)?;
        self.run(batches.iter().map(|batch| batch.view()))
    }

    pub fn predict_images(&self, images: &[DynamicImage]) -> Result<Vec<Vec<Detection>>> {
        let pages = images.iter().map(page_from_image).collect::<Vec<_>>();
        self.predict(&pages)
    }

    /// Predicts on an `(N, H, W, 3)` float batch with values in `[0, 1]`.
    #[instrument(skip_all, fields(model = self.model.name(), shape = ?batch.shape()))]
    pub fn predict_tensor(&self, batch: ArrayView4<f32>) -> Result<Vec<Vec<Detection>>> {
        let batches = self.pre_processor.process_tensor(batch)?;
        self.run(batches.iter().map(|batch| batch.view()))
    }

    fn run<'a>(
        &self,
        batches: impl Iterator<Item = ArrayView4<'a, f32>>,
    ) -> Result<Vec<Vec<Detection>>> {
        let mut out = Vec::new();
        for batch in batches {
            out.extend(self.model.detect(batch)?);
        }
        log::debug!(
            "Detected {} boxes on {} pages",
            out.iter().map(Vec::len).sum::<usize>(),
            out.len()
        );
        Ok(out)
    }
}
