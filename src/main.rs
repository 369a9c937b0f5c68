use std::{path::PathBuf, process::ExitCode, time::Instant};

use clap::Parser;
use docdet::{detections_to_array, DetectorBuilder};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Detects text boxes on page images.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Page images to process.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Detection architecture.
    #[arg(long, default_value = "db_resnet50")]
    arch: String,

    /// Directory holding `<arch>_<tf|torch>.onnx` weights.
    #[arg(long, default_value = "models")]
    weights_dir: PathBuf,

    /// Explicit ONNX model, overrides --weights-dir.
    #[arg(long)]
    model: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Emit rotated boxes.
    #[arg(long)]
    rotated: bool,

    #[arg(long)]
    engine_cache: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = DetectorBuilder::new()
        .arch(&args.arch)
        .weights_dir(args.weights_dir)
        .threads(args.threads)
        .batch_size(args.batch_size)
        .assume_straight_pages(!args.rotated);
    if let Some(model) = args.model {
        builder = builder.det_model(model);
    }
    if let Some(cache) = args.engine_cache {
        std::fs::create_dir_all(&cache)?;
        builder = builder.with_engine_cache_path(cache);
    }
    let predictor = builder.build()?;

    let images = args
        .images
        .iter()
        .map(image::open)
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    let results = predictor.predict_images(&images)?;
    log::debug!("{:?}", start.elapsed());

    for (path, detections) in args.images.iter().zip(results) {
        println!("{}: {} boxes", path.display(), detections.len());
        for row in detections_to_array(&detections).rows() {
            let values = row
                .iter()
                .map(|v| format!("{v:.4}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("  {values}");
        }
    }
    Ok(())
}
