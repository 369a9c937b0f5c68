use ndarray::{Array3, ArrayView4, Axis};
use tracing::instrument;

use crate::{
    dbnet::{self, DbLossConfig},
    error::{Error, Result},
    linknet::{self, LinkNetLossConfig},
    net::SegmentationNet,
    postprocessor::{DetectionPostProcessor, PostProcessorConfig},
    target::{validate_targets, TargetArray},
    Detection,
};

/// Architecture family, which fixes post-processing defaults and the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchFamily {
    Db,
    LinkNet,
}

impl ArchFamily {
    pub fn post_processor_config(self) -> PostProcessorConfig {
        match self {
            ArchFamily::Db => PostProcessorConfig::db(),
            ArchFamily::LinkNet => PostProcessorConfig::linknet(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Include the probability map in the output.
    pub return_model_output: bool,
    /// Include post-processed boxes in the output.
    pub return_preds: bool,
}

impl ForwardOptions {
    pub fn all() -> Self {
        Self {
            return_model_output: true,
            return_preds: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionOutput {
    /// `(N, H, W)` probability map.
    pub out_map: Option<Array3<f32>>,
    pub preds: Option<Vec<Vec<Detection>>>,
    pub loss: Option<f32>,
}

impl DetectionOutput {
    /// Number of populated entries.
    pub fn len(&self) -> usize {
        [
            self.out_map.is_some(),
            self.preds.is_some(),
            self.loss.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A text detection model: segmentation network, post-processing and loss.
pub struct DetectionModel {
    name: String,
    family: ArchFamily,
    net: Box<dyn SegmentationNet>,
    post_processor: DetectionPostProcessor,
    db_loss: DbLossConfig,
    linknet_loss: LinkNetLossConfig,
}

impl DetectionModel {
    pub fn new(name: impl Into<String>, family: ArchFamily, net: Box<dyn SegmentationNet>) -> Self {
        Self {
            name: name.into(),
            family,
            net,
            post_processor: DetectionPostProcessor::new(family.post_processor_config()),
            db_loss: DbLossConfig::default(),
            linknet_loss: LinkNetLossConfig::default(),
        }
    }

    pub fn with_post_processor(mut self, config: PostProcessorConfig) -> Self {
        self.post_processor = DetectionPostProcessor::new(config);
        self
    }

    pub fn with_db_loss(mut self, config: DbLossConfig) -> Self {
        self.db_loss = config;
        self
    }

    pub fn with_linknet_loss(mut self, config: LinkNetLossConfig) -> Self {
        self.linknet_loss = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> ArchFamily {
        self.family
    }

    pub fn post_processor(&self) -> &DetectionPostProcessor {
        &self.post_processor
    }

    /// Runs the network on an `(N, H, W, 3)` batch.
    ///
    /// When `targets` are given they are validated before the network runs and
    /// the loss is computed. Boxes are returned with `return_preds`, the
    /// probability map with `return_model_output`.
    #[instrument(skip_all, fields(model = %self.name, shape = ?batch.shape()))]
    pub fn forward(
        &self,
        batch: ArrayView4<f32>,
        targets: Option<&[TargetArray]>,
        options: ForwardOptions,
    ) -> Result<DetectionOutput> {
        let batch_size = batch.len_of(Axis(0));
        if batch.len_of(Axis(3)) != 3 {
            return Err(Error::InputShape(format!(
                "expected (N, H, W, 3) images, got {:?}",
                batch.shape()
            )));
        }
        let targets = targets
            .map(|targets| {
                if targets.len() != batch_size {
                    return Err(Error::TargetCount {
                        targets: targets.len(),
                        batch: batch_size,
                    });
                }
                validate_targets(targets)
            })
            .transpose()?;

        let output = self.net.forward(batch)?;
        if output.map.len_of(Axis(0)) != batch_size {
            return Err(Error::ModelOutput(format!(
                "expected {batch_size} maps, got {}",
                output.map.len_of(Axis(0))
            )));
        }
        let prob_map = output.probabilities();

        let loss = targets
            .map(|targets| match self.family {
                ArchFamily::Db => dbnet::compute_loss(&output, &targets, &self.db_loss),
                ArchFamily::LinkNet => {
                    linknet::compute_loss(&output, &targets, &self.linknet_loss)
                }
            })
            .transpose()?;

        let preds = options
            .return_preds
            .then(|| self.post_processor.process(prob_map.view()));

        Ok(DetectionOutput {
            out_map: options.return_model_output.then_some(prob_map),
            preds,
            loss,
        })
    }

    /// Boxes for an `(N, H, W, 3)` batch.
    pub fn detect(&self, batch: ArrayView4<f32>) -> Result<Vec<Vec<Detection>>> {
        let output = self.forward(
            batch,
            None,
            ForwardOptions {
                return_model_output: false,
                return_preds: true,
            },
        )?;
        Ok(output.preds.unwrap_or_default())
    }
}
