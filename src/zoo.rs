//! Architecture registry.
//!
//! Maps architecture names to their configuration and builds models and
//! predictors from them. Networks are created by a [`NetLoader`]; the default
//! one opens ONNX exports from a weights directory.

use std::{collections::BTreeMap, path::PathBuf};

use tracing::instrument;

use crate::{
    backend::{self, BackendConfig},
    error::{Error, Result},
    model::{ArchFamily, DetectionModel},
    net::{MapKind, OnnxNet, SegmentationNet, SessionOptions},
    postprocessor::PostProcessorConfig,
    predictor::DetectionPredictor,
    preprocessor::PreProcessor,
};

const DOC_MEAN: [f32; 3] = [0.798, 0.785, 0.772];
const DOC_STD: [f32; 3] = [0.264, 0.2749, 0.287];

#[derive(Debug, Clone, PartialEq)]
pub struct ArchConfig {
    pub name: String,
    pub family: ArchFamily,
    /// `(height, width, channels)` the network was trained on.
    pub input_shape: (u32, u32, u32),
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ArchConfig {
    pub fn new(name: impl Into<String>, family: ArchFamily) -> Self {
        Self {
            name: name.into(),
            family,
            input_shape: (1024, 1024, 3),
            mean: DOC_MEAN,
            std: DOC_STD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZooOptions {
    /// Directory holding `<arch>_<tf|torch>.onnx` files.
    pub weights_dir: PathBuf,
    /// Explicit model file, overrides `weights_dir`.
    pub model_path: Option<PathBuf>,
    pub session: SessionOptions,
    pub batch_size: usize,
    /// Overrides the architecture's `(height, width)`.
    pub input_size: Option<(u32, u32)>,
    pub assume_straight_pages: bool,
    pub bin_thresh: Option<f32>,
    pub box_thresh: Option<f32>,
}

impl Default for ZooOptions {
    fn default() -> Self {
        Self {
            weights_dir: PathBuf::from("models"),
            model_path: None,
            session: SessionOptions::default(),
            batch_size: 1,
            input_size: None,
            assume_straight_pages: true,
            bin_thresh: None,
            box_thresh: None,
        }
    }
}

/// Creates the segmentation network of an architecture.
pub trait NetLoader: Send + Sync {
    fn load(
        &self,
        arch: &ArchConfig,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<Box<dyn SegmentationNet>>;
}

impl<F> NetLoader for F
where
    F: Fn(&ArchConfig, &ZooOptions, &BackendConfig) -> Result<Box<dyn SegmentationNet>>
        + Send
        + Sync,
{
    fn load(
        &self,
        arch: &ArchConfig,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<Box<dyn SegmentationNet>> {
        self(arch, options, backend)
    }
}

/// Loads ONNX exports with ONNX Runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

impl OnnxLoader {
    pub fn weights_path(
        arch: &ArchConfig,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<PathBuf> {
        if let Some(path) = &options.model_path {
            return Ok(path.clone());
        }
        let backend = backend.active().ok_or(Error::NoBackend)?;
        Ok(options
            .weights_dir
            .join(format!("{}_{}.onnx", arch.name, backend.suffix())))
    }
}

impl NetLoader for OnnxLoader {
    fn load(
        &self,
        arch: &ArchConfig,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<Box<dyn SegmentationNet>> {
        let path = Self::weights_path(arch, options, backend)?;
        let layout = backend.active().ok_or(Error::NoBackend)?.layout();
        log::debug!("Loading {} from {}", arch.name, path.display());
        Ok(Box::new(OnnxNet::init(
            &path,
            layout,
            MapKind::Logits,
            &options.session,
        )?))
    }
}

pub struct ModelZoo {
    archs: BTreeMap<String, ArchConfig>,
    loader: Box<dyn NetLoader>,
}

impl Default for ModelZoo {
    fn default() -> Self {
        Self::with_loader(OnnxLoader)
    }
}

impl ModelZoo {
    /// A zoo with the built-in architectures and a custom loader.
    pub fn with_loader(loader: impl NetLoader + 'static) -> Self {
        let mut zoo = Self {
            archs: BTreeMap::new(),
            loader: Box::new(loader),
        };
        for (name, family) in [
            ("db_resnet50", ArchFamily::Db),
            ("db_mobilenet_v3_large", ArchFamily::Db),
            ("linknet_resnet18", ArchFamily::LinkNet),
            ("linknet_resnet34", ArchFamily::LinkNet),
            ("linknet_resnet50", ArchFamily::LinkNet),
        ] {
            zoo.register(ArchConfig::new(name, family));
        }
        zoo
    }

    /// Adds or replaces an architecture.
    pub fn register(&mut self, arch: ArchConfig) {
        self.archs.insert(arch.name.clone(), arch);
    }

    pub fn architectures(&self) -> impl Iterator<Item = &str> {
        self.archs.keys().map(String::as_str)
    }

    pub fn arch(&self, name: &str) -> Result<&ArchConfig> {
        self.archs
            .get(name)
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))
    }

    #[instrument(skip(self, options, backend))]
    pub fn detection_model(
        &self,
        name: &str,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<DetectionModel> {
        let arch = self.arch(name)?;
        let net = self.loader.load(arch, options, backend)?;
        let defaults = arch.family.post_processor_config();
        let post_processor = PostProcessorConfig {
            bin_thresh: options.bin_thresh.unwrap_or(defaults.bin_thresh),
            box_thresh: options.box_thresh.unwrap_or(defaults.box_thresh),
            assume_straight_pages: options.assume_straight_pages,
            ..defaults
        };
        Ok(DetectionModel::new(name, arch.family, net).with_post_processor(post_processor))
    }

    #[instrument(skip(self, options, backend))]
    pub fn detection_predictor(
        &self,
        name: &str,
        options: &ZooOptions,
        backend: &BackendConfig,
    ) -> Result<DetectionPredictor> {
        let arch = self.arch(name)?;
        let (height, width, _) = arch.input_shape;
        let output_size = options.input_size.unwrap_or((height, width));
        let pre_processor = PreProcessor::new(output_size, options.batch_size)
            .with_normalization(arch.mean, arch.std);
        let model = self.detection_model(name, options, backend)?;
        Ok(DetectionPredictor::new(pre_processor, model))
    }
}

/// Builds a predictor from the built-in zoo, resolving the backend from the
/// environment.
pub fn detection_predictor(name: &str, options: &ZooOptions) -> Result<DetectionPredictor> {
    let zoo = ModelZoo::default();
    // Unknown names are reported even without a backend.
    zoo.arch(name)?;
    let backend = backend::init()?;
    zoo.detection_predictor(name, options, &backend)
}

#[cfg(test)]
mod tests {
    use crate::{backend::Backend, error::ErrorKind};

    use super::*;

    #[test]
    fn registers_builtin_architectures() {
        let zoo = ModelZoo::default();
        let names = zoo.architectures().collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "db_mobilenet_v3_large",
                "db_resnet50",
                "linknet_resnet18",
                "linknet_resnet34",
                "linknet_resnet50"
            ]
        );
        assert_eq!(zoo.arch("linknet_resnet34").unwrap().family, ArchFamily::LinkNet);
    }

    #[test]
    fn unknown_name_is_a_value_error() {
        let err = detection_predictor("my_fancy_model", &ZooOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownArchitecture(ref name) if name == "my_fancy_model"));
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn weights_follow_the_backend() {
        let zoo = ModelZoo::default();
        let arch = zoo.arch("db_resnet50").unwrap();
        let options = ZooOptions {
            weights_dir: PathBuf::from("weights"),
            ..ZooOptions::default()
        };
        let torch = BackendConfig::with_backend(Backend::Torch);
        assert_eq!(
            OnnxLoader::weights_path(arch, &options, &torch).unwrap(),
            PathBuf::from("weights/db_resnet50_torch.onnx")
        );
        let tf = BackendConfig::with_backend(Backend::TensorFlow);
        assert_eq!(
            OnnxLoader::weights_path(arch, &options, &tf).unwrap(),
            PathBuf::from("weights/db_resnet50_tf.onnx")
        );
    }

    #[test]
    fn missing_weights_are_reported() {
        let options = ZooOptions {
            weights_dir: PathBuf::from("does-not-exist"),
            ..ZooOptions::default()
        };
        let err = ModelZoo::default()
            .detection_model(
                "linknet_resnet18",
                &options,
                &BackendConfig::with_backend(Backend::Torch),
            )
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingWeights(_)));
    }
}
