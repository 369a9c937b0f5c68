//! Tensor backend selection.
//!
//! Which framework the exported detection models come from is decided once per
//! process from the `USE_TF` / `USE_TORCH` environment flags and from which
//! native runtime libraries are installed. The outcome is a [`BackendConfig`]
//! that is handed to every consumer; nothing reads the environment again after
//! [`init`].

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use tracing::instrument;

use crate::error::{Error, Result};

const TRUE_VALUES: &[&str] = &["1", "ON", "YES", "TRUE"];
const AUTO_VALUE: &str = "AUTO";

const TORCH_PACKAGES: &[&str] = &["torch", "torch_cpu"];
const TF_PACKAGES: &[&str] = &[
    "tensorflow",
    "tensorflow_cc",
    "tensorflow_framework",
    "tensorflow-cpu",
    "tensorflow-gpu",
    "tf-nightly",
    "tf-nightly-cpu",
    "tf-nightly-gpu",
    "intel-tensorflow",
    "tensorflow-rocm",
    "tensorflow-macos",
];
const MIN_TF_MAJOR: u32 = 2;

/// One backend flag, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag(String);

impl Flag {
    pub fn parse(value: &str) -> Self {
        Self(value.to_uppercase())
    }

    pub fn force_true(&self) -> bool {
        TRUE_VALUES.contains(&self.0.as_str())
    }

    pub fn allows(&self) -> bool {
        self.force_true() || self.0 == AUTO_VALUE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self(AUTO_VALUE.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendFlags {
    pub use_tf: Flag,
    pub use_torch: Flag,
}

impl BackendFlags {
    pub fn new(use_tf: &str, use_torch: &str) -> Self {
        Self {
            use_tf: Flag::parse(use_tf),
            use_torch: Flag::parse(use_torch),
        }
    }

    pub fn from_env() -> Self {
        let read = |name: &str| {
            env::var(name)
                .map(|value| Flag::parse(&value))
                .unwrap_or_default()
        };
        Self {
            use_tf: read("USE_TF"),
            use_torch: read("USE_TORCH"),
        }
    }

    /// Torch is looked up only if `USE_TORCH` allows it and `USE_TF` doesn't force TF.
    pub fn considers_torch(&self) -> bool {
        self.use_torch.allows() && !self.use_tf.force_true()
    }

    pub fn considers_tf(&self) -> bool {
        self.use_tf.allows() && !self.use_torch.force_true()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub version: Option<String>,
}

/// Looks up installed framework runtimes.
pub trait PackageProbe {
    fn find(&self, package: &str) -> Option<PackageInfo>;
}

/// Finds native runtime libraries on disk.
///
/// `LIBTORCH` and `LIBTENSORFLOW` point at install roots; otherwise the dynamic
/// library search path and the usual system directories are scanned.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    extra_dirs: Vec<PathBuf>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_dirs.push(dir.into());
        self
    }

    fn search_dirs(&self, package: &str) -> Vec<PathBuf> {
        let mut dirs = self.extra_dirs.clone();
        let root_var = if package.starts_with("torch") {
            "LIBTORCH"
        } else {
            "LIBTENSORFLOW"
        };
        if let Some(root) = env::var_os(root_var) {
            let root = PathBuf::from(root);
            dirs.push(root.join("lib"));
            dirs.push(root);
        }
        for var in ["LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH", "PATH"] {
            if let Some(paths) = env::var_os(var) {
                dirs.extend(env::split_paths(&paths));
            }
        }
        dirs.extend(
            ["/usr/local/lib", "/usr/lib", "/usr/lib64", "/opt/homebrew/lib"]
                .into_iter()
                .map(PathBuf::from),
        );
        dirs
    }
}

impl PackageProbe for SystemProbe {
    fn find(&self, package: &str) -> Option<PackageInfo> {
        let stem = package.replace('-', "_");
        self.search_dirs(package)
            .iter()
            .find_map(|dir| find_library(dir, &stem))
            .map(|version| PackageInfo {
                name: package.to_string(),
                version,
            })
    }
}

/// Returns `Some(version)` if `dir` holds a library called `stem`.
fn find_library(dir: &Path, stem: &str) -> Option<Option<String>> {
    let entries = fs::read_dir(dir).ok()?;
    let unix_prefix = format!("lib{stem}.");
    let windows_name = format!("{stem}.dll");
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name == windows_name {
            return Some(version_file(dir));
        }
        let Some(rest) = file_name.strip_prefix(&unix_prefix) else {
            continue;
        };
        // libfoo.so.2.15.0, libfoo.2.15.0.dylib, libfoo.so, libfoo.dylib
        let version = rest
            .split('.')
            .filter(|part| part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty())
            .collect::<Vec<_>>();
        if rest.starts_with("so") || rest.ends_with("dylib") {
            return Some(if version.is_empty() {
                version_file(dir)
            } else {
                Some(version.join("."))
            });
        }
    }
    None
}

fn version_file(lib_dir: &Path) -> Option<String> {
    let roots = [Some(lib_dir), lib_dir.parent()];
    roots
        .into_iter()
        .flatten()
        .flat_map(|root| [root.join("build-version"), root.join("version.txt")])
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// A tensor-computation framework the detection models were exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    TensorFlow,
    Torch,
}

/// Memory layout of image batches fed to an exported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `(N, H, W, C)`
    ChannelsLast,
    /// `(N, C, H, W)`
    ChannelsFirst,
}

impl Backend {
    pub fn layout(self) -> TensorLayout {
        match self {
            Backend::TensorFlow => TensorLayout::ChannelsLast,
            Backend::Torch => TensorLayout::ChannelsFirst,
        }
    }

    /// Suffix of exported weight files.
    pub fn suffix(self) -> &'static str {
        match self {
            Backend::TensorFlow => "tf",
            Backend::Torch => "torch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    tf_available: bool,
    torch_available: bool,
}

impl BackendConfig {
    /// A configuration with exactly one backend available.
    pub fn with_backend(backend: Backend) -> Self {
        Self {
            tf_available: backend == Backend::TensorFlow,
            torch_available: backend == Backend::Torch,
        }
    }

    #[instrument(level = "debug", skip(probe))]
    pub fn resolve(flags: &BackendFlags, probe: &impl PackageProbe) -> Result<Self> {
        let config = Self::probe(flags, probe);
        if config.tf_available || config.torch_available {
            Ok(config)
        } else {
            Err(Error::NoBackend)
        }
    }

    /// Like [`resolve`](Self::resolve) but keeps the all-false outcome.
    pub fn probe(flags: &BackendFlags, probe: &impl PackageProbe) -> Self {
        Self {
            tf_available: probe_tf(flags, probe),
            torch_available: probe_torch(flags, probe),
        }
    }

    pub fn is_tf_available(&self) -> bool {
        self.tf_available
    }

    pub fn is_torch_available(&self) -> bool {
        self.torch_available
    }

    /// TensorFlow wins when both are installed.
    pub fn active(&self) -> Option<Backend> {
        if self.tf_available {
            Some(Backend::TensorFlow)
        } else if self.torch_available {
            Some(Backend::Torch)
        } else {
            None
        }
    }
}

fn probe_torch(flags: &BackendFlags, probe: &impl PackageProbe) -> bool {
    if !flags.considers_torch() {
        log::info!("Disabling PyTorch because USE_TF is set");
        return false;
    }
    match TORCH_PACKAGES.iter().find_map(|name| probe.find(name)) {
        Some(PackageInfo {
            version: Some(version),
            ..
        }) => {
            log::info!("PyTorch version {version} available.");
            true
        }
        Some(PackageInfo { version: None, .. }) => {
            log::info!("PyTorch available.");
            true
        }
        None => false,
    }
}

fn probe_tf(flags: &BackendFlags, probe: &impl PackageProbe) -> bool {
    if !flags.considers_tf() {
        log::info!("Disabling Tensorflow because USE_TORCH is set");
        return false;
    }
    let Some(package) = TF_PACKAGES.iter().find_map(|name| probe.find(name)) else {
        return false;
    };
    match package.version.as_deref().and_then(major_version) {
        Some(major) if major >= MIN_TF_MAJOR => {
            log::info!(
                "TensorFlow version {} available.",
                package.version.as_deref().unwrap_or_default()
            );
            true
        }
        _ => {
            log::info!(
                "TensorFlow found but with version {:?}. Version {MIN_TF_MAJOR} minimum is required.",
                package.version
            );
            false
        }
    }
}

static BACKEND: OnceLock<BackendConfig> = OnceLock::new();

/// Resolves the process-wide backend from the environment on first call.
pub fn init() -> Result<BackendConfig> {
    let config = *BACKEND.get_or_init(|| {
        BackendConfig::probe(&BackendFlags::from_env(), &SystemProbe::new())
    });
    if config.active().is_some() {
        Ok(config)
    } else {
        Err(Error::NoBackend)
    }
}

pub fn is_tf_available() -> bool {
    init().is_ok_and(|config| config.tf_available)
}

pub fn is_torch_available() -> bool {
    init().is_ok_and(|config| config.torch_available)
}
