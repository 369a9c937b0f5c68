use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView4, ArrayViewD, Axis, Ix3};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{
    backend::TensorLayout,
    error::{Error, Result},
    ExecutionProvider,
};

/// What the values of a segmentation map mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Logits,
    Probabilities,
}

/// Raw output of a segmentation network for an `(N, H, W)` batch.
#[derive(Debug, Clone)]
pub struct NetOutput {
    pub map: Array3<f32>,
    pub kind: MapKind,
    /// DB threshold map, present when the network exports it. Shares `kind`
    /// with `map`.
    pub thresh_map: Option<Array3<f32>>,
}

const PROB_EPS: f32 = 1e-6;

impl NetOutput {
    pub fn logits(&self) -> Array3<f32> {
        match self.kind {
            MapKind::Logits => self.map.clone(),
            MapKind::Probabilities => self.map.mapv(|p| {
                let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
                (p / (1.0 - p)).ln()
            }),
        }
    }

    pub fn probabilities(&self) -> Array3<f32> {
        match self.kind {
            MapKind::Logits => self.map.mapv(sigmoid),
            MapKind::Probabilities => self.map.clone(),
        }
    }

    /// Threshold map as probabilities.
    pub fn thresholds(&self) -> Option<Array3<f32>> {
        self.thresh_map.as_ref().map(|thresh| match self.kind {
            MapKind::Logits => thresh.mapv(sigmoid),
            MapKind::Probabilities => thresh.clone(),
        })
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// A text segmentation network.
///
/// Input batches are channels-last `(N, H, W, 3)`, normalized floats.
pub trait SegmentationNet: Send + Sync {
    fn forward(&self, batch: ArrayView4<f32>) -> Result<NetOutput>;
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub threads: usize,
    pub execution_providers: Vec<ExecutionProvider>,
    pub cache_path: Option<PathBuf>,
    /// Largest side fed to the model, used to size TensorRT profiles.
    pub max_side_len: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            execution_providers: crate::DEFAULT_PROVIDERS.to_vec(),
            cache_path: None,
            max_side_len: 1024,
        }
    }
}

/// A segmentation network exported to ONNX.
pub struct OnnxNet {
    session: Session,
    layout: TensorLayout,
    kind: MapKind,
    input_name: String,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(
    cache_path: PathBuf,
    input_name: &str,
    layout: TensorLayout,
    max_side_len: u32,
) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    let shape = |side: u32| match layout {
        TensorLayout::ChannelsFirst => format!("{input_name}:1x3x{side}x{side}"),
        TensorLayout::ChannelsLast => format!("{input_name}:1x{side}x{side}x3"),
    };
    TensorRTExecutionProvider::default()
        .with_profile_min_shapes(shape(32))
        .with_profile_max_shapes(shape(max_side_len))
        .with_profile_opt_shapes(shape(max_side_len))
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .with_builder_optimization_level(5)
        .with_detailed_build_log(true)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

impl OnnxNet {
    #[instrument(level = "debug", skip(options))]
    pub fn init(
        path: &Path,
        layout: TensorLayout,
        kind: MapKind,
        options: &SessionOptions,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingWeights(path.to_path_buf()));
        }

        #[cfg(feature = "directml")]
        let parallel = !options
            .execution_providers
            .contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = options.execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "tensorrt")]
                    ExecutionProvider::TensorRT => Some(setup_tensorrt(
                        options.cache_path.clone().unwrap_or_else(|| {
                            path.parent()
                                .map(|parent| parent.join(".cache"))
                                .unwrap_or_else(|| PathBuf::from(".cache"))
                        }),
                        "input",
                        layout,
                        options.max_side_len,
                    )),
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => Some(setup_coreml()),
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(parallel)?
            .with_parallel_execution(parallel)?
            .with_inter_threads(options.threads)?
            .with_intra_threads(options.threads)?
            .with_execution_providers(execution_providers)?
            .commit_from_file(path)?;

        log::debug!("Detection session inputs: {:?}", session.inputs);
        log::debug!("Detection session outputs: {:?}", session.outputs);

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| Error::ModelOutput("model declares no inputs".into()))?;

        Ok(Self {
            session,
            layout,
            kind,
            input_name,
        })
    }

    /// Drops the channel axis of a single output map.
    fn channel(&self, output: &ArrayViewD<f32>, channel: usize) -> Result<Option<Array3<f32>>> {
        let map = match output.ndim() {
            3 if channel == 0 => output.to_owned(),
            3 => return Ok(None),
            4 => {
                let axis = match self.layout {
                    TensorLayout::ChannelsLast => Axis(3),
                    TensorLayout::ChannelsFirst => Axis(1),
                };
                if channel >= output.len_of(axis) {
                    return Ok(None);
                }
                output.index_axis(axis, channel).to_owned()
            }
            ndim => {
                return Err(Error::ModelOutput(format!(
                    "expected a 3-D or 4-D segmentation map, got {ndim} dimensions"
                )))
            }
        };
        Ok(Some(map.into_dimensionality::<Ix3>()?))
    }
}

impl SegmentationNet for OnnxNet {
    #[instrument(level = "debug", skip_all, fields(shape = ?batch.shape()))]
    fn forward(&self, batch: ArrayView4<f32>) -> Result<NetOutput> {
        let input = match self.layout {
            TensorLayout::ChannelsLast => batch.as_standard_layout().into_owned(),
            TensorLayout::ChannelsFirst => batch
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        };
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input]?)?;

        let names = self
            .session
            .outputs
            .iter()
            .map(|output| output.name.as_str())
            .collect::<Vec<_>>();
        let Some(prob) = names.first().and_then(|name| outputs.get(name)) else {
            return Err(Error::ModelOutput("model produced no output".into()));
        };
        let prob = prob.try_extract_tensor::<f32>()?;
        let map = self
            .channel(&prob, 0)?
            .ok_or_else(|| Error::ModelOutput("empty segmentation map".into()))?;

        // Either a second channel of the first output or a second output.
        let thresh_map = match self.channel(&prob, 1)? {
            Some(thresh) => Some(thresh),
            None => match names.get(1).and_then(|name| outputs.get(name)) {
                Some(value) => self.channel(&value.try_extract_tensor::<f32>()?, 0)?,
                None => None,
            },
        };

        Ok(NetOutput {
            map,
            kind: self.kind,
            thresh_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn logits_and_probabilities_round_trip() {
        let out = NetOutput {
            map: array![[[0.0f32, 2.0], [-2.0, 0.5]]],
            kind: MapKind::Logits,
            thresh_map: None,
        };
        let probs = out.probabilities();
        assert_eq!(probs[[0, 0, 0]], 0.5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

        let back = NetOutput {
            map: probs,
            kind: MapKind::Probabilities,
            thresh_map: None,
        }
        .logits();
        assert!((back[[0, 0, 1]] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn thresholds_follow_map_kind() {
        let mut out = NetOutput {
            map: array![[[0.0f32]]],
            kind: MapKind::Logits,
            thresh_map: Some(array![[[0.0f32, 4.0]]]),
        };
        let thresh = out.thresholds().unwrap();
        assert_eq!(thresh[[0, 0, 0]], 0.5);
        assert!(thresh[[0, 0, 1]] > 0.98);

        out.kind = MapKind::Probabilities;
        assert_eq!(out.thresholds().unwrap()[[0, 0, 1]], 4.0);

        out.thresh_map = None;
        assert!(out.thresholds().is_none());
    }

    #[test]
    fn missing_model_file_is_reported() {
        let err = OnnxNet::init(
            Path::new("does/not/exist.onnx"),
            TensorLayout::ChannelsFirst,
            MapKind::Logits,
            &SessionOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::MissingWeights(_)));
    }
}
