// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// YOLOv8 图片/视频检测
///
/// 主程序入口: cargo run --release --features onnx --bin yolov8 -- -s input.mp4
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use yolov8_annotate::{
    gen_time_string, telemetry, Args, DeliveryReceiver, DetectionPipeline, ModelHandle,
    PipelineSettings, RunState,
};

#[cfg(feature = "onnx")]
fn load_model(args: &Args) -> Result<ModelHandle> {
    use yolov8_annotate::models::{ModelOptions, YOLOv8};

    let opts = ModelOptions {
        model: args.model.clone(),
        cuda: args.cuda,
        device_id: args.device_id,
        imgsz: args.imgsz,
        iou: args.iou,
    };
    Ok(Box::new(YOLOv8::new(&opts)?))
}

#[cfg(not(feature = "onnx"))]
fn load_model(args: &Args) -> Result<ModelHandle> {
    bail!(
        "no inference backend compiled in; rebuild with `--features onnx` to load {}",
        args.model
    )
}

/// 显示线程: consumes the newest annotated frame and logs what it shows.
fn spawn_display(rx: DeliveryReceiver, done: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("display".to_string())
        .spawn(move || {
            let mut shown = 0u64;
            while !done.load(Ordering::Relaxed) {
                if let Some(delivery) = rx.recv_timeout(Duration::from_millis(100)) {
                    shown += 1;
                    debug!(
                        "🖼️  frame #{} {}x{}: {} detections",
                        delivery.frame.index(),
                        delivery.frame.width(),
                        delivery.frame.height(),
                        delivery.detections.len()
                    );
                }
            }
            debug!("display thread exiting after {} frames", shown);
        })
        .context("failed to spawn display thread")?;
    Ok(handle)
}

fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.verbose);

    let settings_path = args.settings_path();
    let settings = PipelineSettings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    settings.print_summary();

    let config = args
        .pipeline_config(&settings)
        .context("invalid run configuration")?;
    info!(
        "📦 source: {} ({}) | conf {:.2} | model {}",
        config.source_path().display(),
        if config.is_video() { "video" } else { "image" },
        config.confidence_threshold(),
        args.model
    );

    let model = load_model(&args)?;
    let pipeline = Arc::new(DetectionPipeline::new(settings)?);

    {
        let pipeline = Arc::clone(&pipeline);
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("🛑 Ctrl+C received, stopping");
            pipeline.stop();
        }) {
            warn!("⚠️  failed to install Ctrl+C handler: {}", e);
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let display = spawn_display(pipeline.subscribe(), Arc::clone(&done))?;

    let started = pipeline.start(&config, model);
    let state = match started {
        Ok(()) => pipeline.wait(),
        Err(e) => {
            error!("❌ {}", e);
            pipeline.state()
        }
    };

    done.store(true, Ordering::Relaxed);
    if display.join().is_err() {
        warn!("⚠️  display thread panicked");
    }

    let report = pipeline.report();
    if args.report {
        let path = config
            .output_dir()
            .join(format!("run_report_{}.json", gen_time_string("-")));
        fs::create_dir_all(config.output_dir())?;
        fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!("📝 run report written to {}", path.display());
    }

    match state {
        RunState::Failed => bail!(
            "run failed: {}",
            report.last_error.unwrap_or_else(|| "unknown error".to_string())
        ),
        _ => {
            if let Some(path) = report.output_path {
                info!("✅ output: {}", path.display());
            }
            Ok(())
        }
    }
}
