use std::path::PathBuf;

pub mod backend;
pub mod dbnet;
mod error;
pub mod linknet;
pub mod model;
pub mod morphology;
pub mod net;
pub mod postprocessor;
pub mod predictor;
pub mod preprocessor;
mod result;
pub mod target;
mod util;
pub mod zoo;

pub use backend::{is_tf_available, is_torch_available, Backend, BackendConfig};
pub use error::*;
pub use model::{ArchFamily, DetectionModel, DetectionOutput, ForwardOptions};
pub use predictor::DetectionPredictor;
pub use preprocessor::PreProcessor;
pub use result::*;
pub use target::TargetArray;
use tracing::instrument;
use zoo::{ModelZoo, ZooOptions};

pub use ort as runtime;

/// Configures and builds a [`DetectionPredictor`] from the model zoo.
pub struct DetectorBuilder {
    arch: String,
    backend: Option<BackendConfig>,
    options: ZooOptions,
}

impl DetectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arch(mut self, name: impl Into<String>) -> Self {
        self.arch = name.into();
        self
    }

    /// Uses `backend` instead of resolving it from the environment.
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn weights_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.weights_dir = path.into();
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.model_path = Some(path.into());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.options.session.threads = threads;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    pub fn input_size(mut self, height: u32, width: u32) -> Self {
        self.options.input_size = Some((height, width));
        self.options.session.max_side_len = height.max(width);
        self
    }

    pub fn assume_straight_pages(mut self, straight: bool) -> Self {
        self.options.assume_straight_pages = straight;
        self
    }

    pub fn bin_thresh(mut self, thresh: f32) -> Self {
        self.options.bin_thresh = Some(thresh);
        self
    }

    pub fn box_thresh(mut self, thresh: f32) -> Self {
        self.options.box_thresh = Some(thresh);
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.session.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.options.session.execution_providers = providers.into_iter().collect();
        self
    }

    pub fn options(&self) -> &ZooOptions {
        &self.options
    }

    #[instrument(skip(self), fields(arch = %self.arch))]
    pub fn build(self) -> Result<DetectionPredictor> {
        self.build_with(&ModelZoo::default())
    }

    pub fn build_with(self, zoo: &ModelZoo) -> Result<DetectionPredictor> {
        zoo.arch(&self.arch)?;
        let backend = match self.backend {
            Some(backend) => backend,
            None => backend::init()?,
        };
        zoo.detection_predictor(&self.arch, &self.options, &backend)
    }
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        Self {
            arch: "db_resnet50".to_string(),
            backend: None,
            options: ZooOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

pub(crate) const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
