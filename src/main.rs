use chrono::Local;
use log::{LevelFilter, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vqa::cli::{self, CliArgs};
use vqa::error::{Result, VqaError};
use vqa::ffmpeg::FfmpegToolkit;
use vqa::metrics::MetricKind;
use vqa::pipeline;
use vqa::plot;
use vqa::report::{self, ReportData};
use vqa::tool::FfmpegMetricTool;

fn main() -> ExitCode {
    let start_time = Instant::now();
    let args = cli::parse_args();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting vqa analysis...");
    info!("Arguments: {:?}", args);

    match run(args) {
        Ok(()) => {
            let duration = start_time.elapsed();
            info!("Analysis completed successfully in {:.2?}", duration);
            println!("Analysis completed successfully in {:.2?}", duration);
            ExitCode::SUCCESS
        }
        Err(VqaError::Cancelled) => {
            warn!("Analysis cancelled after {:.2?}", start_time.elapsed());
            eprintln!("Cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            let duration = start_time.elapsed();
            error!("Analysis failed after {:.2?}: {}", duration, e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sets up logging to console and optionally to a file.
fn setup_logging(args: &CliArgs) -> std::result::Result<(), fern::InitError> {
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("vqa", LevelFilter::Debug);

    let mut logger = base_config.chain(fern::Dispatch::new().chain(std::io::stdout()));

    let mut log_path = None;
    if args.log {
        let log_filename = format!("vqa_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        let path = output_dir(args).join(log_filename);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        logger = logger.chain(fern::Dispatch::new().chain(fern::log_file(&path)?));
        log_path = Some(path);
    }

    logger.apply()?;
    if let Some(path) = log_path {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}

fn output_dir(args: &CliArgs) -> PathBuf {
    args.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
}

fn run(args: CliArgs) -> Result<()> {
    let config = args.to_run_config()?;

    let output_dir = output_dir(&args);
    if !output_dir.exists() {
        info!("Creating output directory: {}", output_dir.display());
        fs::create_dir_all(&output_dir)?;
    }
    let prefix = config.captured.file_stem().map_or_else(
        || "vqa_analysis".to_string(),
        |stem| stem.to_string_lossy().to_string(),
    );
    let report_path = args
        .output
        .clone()
        .unwrap_or_else(|| output_dir.join(format!("{}.report.json", prefix)));

    let toolkit = Arc::new(FfmpegToolkit::new(&config.tool));
    let tool = Arc::new(FfmpegMetricTool::new(&config.tool));
    let handle = pipeline::spawn(config, toolkit, tool)?;

    if let Some(seconds) = args.timeout {
        let token = handle.cancellation_token();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            if !token.is_cancelled() {
                warn!("Timeout of {}s reached, cancelling run", seconds);
                token.cancel();
            }
        });
    }

    let report = handle.join()?;
    report::write_report(&report, &report_path)?;

    println!("Results saved:");
    println!("  Report: {}", report_path.display());
    if report.partial {
        println!("  (partial: {} frames analysed)", report.summary.frame_count);
    }
    if args.plots {
        for path in write_plots(&report, &output_dir, &prefix) {
            println!("  Plot: {}", path.display());
        }
    }
    Ok(())
}

/// Plot failures are logged and skipped; the report is already written.
fn write_plots(report: &ReportData, output_dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut written = Vec::new();
    for kind in [MetricKind::Vmaf, MetricKind::Psnr, MetricKind::Ssim] {
        let path = plot::plot_path(output_dir, prefix, kind);
        match plot::generate_plot(&report.summary, kind, &path) {
            Ok(()) => written.push(path),
            Err(e) => warn!("Skipping {} plot: {}", kind, e),
        }
    }
    written
}
