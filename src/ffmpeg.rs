// src/ffmpeg.rs

use crate::cancel::CancellationToken;
use crate::config::ToolConfig;
use crate::error::{Result, VqaError};
use crate::trigger::LumaSample;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A media file as reported by ffprobe. Read-only for the whole run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoStream {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub frame_rate: f64,
    pub pixel_format: String,
    pub is_hdr: bool,
}

impl VideoStream {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Media operations the pipeline needs from the outside world.
///
/// [`FfmpegToolkit`] is the production implementation; tests script their own.
pub trait MediaToolkit: Send + Sync {
    fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<VideoStream>;

    /// Per-frame luminance statistics for `frames`, indexed from the start
    /// of the stream.
    fn luma_samples(
        &self,
        stream: &VideoStream,
        frames: Range<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LumaSample>>;

    /// Writes frames `start_frame..start_frame + frame_count` of `stream` to
    /// `output` without lossy re-encoding.
    fn trim(
        &self,
        stream: &VideoStream,
        start_frame: u64,
        frame_count: u64,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Captured result of an external process that ran to completion.
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs `command` to completion while honouring `cancel`.
///
/// Output pipes are drained on helper threads so a chatty child can never
/// block on a full pipe. If the token fires, the child is killed and reaped
/// before `Cancelled` is returned.
pub fn run_command(
    command: &mut Command,
    description: &str,
    cancel: &CancellationToken,
) -> Result<CommandOutcome> {
    cancel.check()?;
    debug!("Spawning {}: {:?}", description, command);

    let start_time = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| VqaError::Command(format!("failed to start {}: {}", description, e)))?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let status = loop {
        let polled = match child.try_wait() {
            Ok(polled) => polled,
            Err(e) => {
                error!("Failed to poll {} (pid {}): {}", description, child.id(), e);
                kill_and_reap(&mut child);
                let _ = collect(stdout_reader);
                let _ = collect(stderr_reader);
                return Err(VqaError::Io(e));
            }
        };
        match polled {
            Some(status) => break status,
            None if cancel.is_cancelled() => {
                warn!("Cancelling {} (pid {})", description, child.id());
                kill_and_reap(&mut child);
                let _ = collect(stdout_reader);
                let _ = collect(stderr_reader);
                return Err(VqaError::Cancelled);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let outcome = CommandOutcome {
        status,
        stdout: collect(stdout_reader),
        stderr: collect(stderr_reader),
        elapsed: start_time.elapsed(),
    };
    debug!(
        "{} exited with {} after {}ms",
        description,
        outcome.status,
        outcome.elapsed.as_millis()
    );
    Ok(outcome)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        // Already exited between try_wait and kill.
        debug!("kill failed for pid {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        error!("Failed to reap pid {}: {}", child.id(), e);
    }
}

/// Executes an FFmpeg command and treats a non-zero exit as an error.
pub fn run_ffmpeg(
    ffmpeg: &Path,
    args: &[String],
    description: &str,
    cancel: &CancellationToken,
) -> Result<CommandOutcome> {
    info!("Running FFmpeg for {}: ffmpeg {}", description, args.join(" "));

    let mut command = Command::new(ffmpeg);
    command.args(args);
    let outcome = run_command(&mut command, description, cancel)?;

    if !outcome.status.success() {
        error!(
            "FFmpeg command failed for {} ({}ms): {}",
            description,
            outcome.elapsed.as_millis(),
            outcome.stderr
        );
        return Err(VqaError::Command(format!(
            "FFmpeg {} failed: {}",
            description, outcome.stderr
        )));
    }
    info!(
        "FFmpeg command successful for {} ({}ms)",
        description,
        outcome.elapsed.as_millis()
    );
    Ok(outcome)
}

/// [`MediaToolkit`] backed by the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegToolkit {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
        }
    }
}

impl MediaToolkit for FfmpegToolkit {
    fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<VideoStream> {
        info!("Probing video file: {}", path.display());
        if !path.exists() {
            return Err(VqaError::Input(format!(
                "Input video file not found: {}",
                path.display()
            )));
        }

        let mut command = Command::new(&self.ffprobe);
        command.args([
            "-v", "error",
            "-count_frames",
            "-select_streams", "v:0",
            "-show_entries",
            "stream=width,height,nb_frames,nb_read_frames,r_frame_rate,pix_fmt,color_transfer",
            "-of", "json",
        ]);
        command.arg(path);
        let output = run_command(&mut command, "ffprobe", cancel)?;

        if !output.status.success() {
            error!("ffprobe failed for {}: {}", path.display(), output.stderr);
            return Err(VqaError::Command(format!(
                "ffprobe failed for {}: {}",
                path.display(),
                output.stderr
            )));
        }
        debug!("ffprobe output for {}: {}", path.display(), output.stdout);

        let stream = parse_probe_output(path, &output.stdout)?;
        info!(
            "Detected Info for {}: {} @ {:.3} fps, {} frames, {}, HDR={}",
            path.display(),
            stream.resolution(),
            stream.frame_rate,
            stream.frame_count,
            stream.pixel_format,
            stream.is_hdr
        );
        Ok(stream)
    }

    fn luma_samples(
        &self,
        stream: &VideoStream,
        frames: Range<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LumaSample>> {
        let filter = format!(
            "trim=start_frame={}:end_frame={},format=yuv420p,signalstats,metadata=mode=print",
            frames.start, frames.end
        );
        let args = vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(), "info".to_string(),
            "-i".to_string(), stream.path.to_string_lossy().to_string(),
            "-map".to_string(), "0:v:0".to_string(),
            "-vf".to_string(), filter,
            "-an".to_string(),
            "-f".to_string(), "null".to_string(),
            "-".to_string(),
        ];
        let outcome = run_ffmpeg(&self.ffmpeg, &args, "luma scan", cancel)?;
        let samples = parse_signalstats_log(&outcome.stderr, frames.start);
        debug!(
            "Collected {} luma samples for frames {}..{} of {}",
            samples.len(),
            frames.start,
            frames.end,
            stream.path.display()
        );
        Ok(samples)
    }

    fn trim(
        &self,
        stream: &VideoStream,
        start_frame: u64,
        frame_count: u64,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let filter = format!(
            "trim=start_frame={}:end_frame={},setpts=PTS-STARTPTS",
            start_frame,
            start_frame + frame_count
        );
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(), "error".to_string(),
            "-y".to_string(),
            "-i".to_string(), stream.path.to_string_lossy().to_string(),
            "-map".to_string(), "0:v:0".to_string(),
            "-vf".to_string(), filter,
            "-fps_mode".to_string(), "passthrough".to_string(),
            "-frames:v".to_string(), frame_count.to_string(),
            // FFV1 is lossless, the trimmed copy carries the source pixels unchanged.
            "-c:v".to_string(), "ffv1".to_string(),
            "-an".to_string(),
            output.to_string_lossy().to_string(),
        ];
        run_ffmpeg(&self.ffmpeg, &args, "trim", cancel)?;
        Ok(())
    }
}

/// Parses ffprobe's JSON stream description.
pub fn parse_probe_output(path: &Path, stdout: &str) -> Result<VideoStream> {
    let json: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| VqaError::Parse(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let stream = json["streams"]
        .get(0)
        .ok_or_else(|| VqaError::Parse("No video stream found in ffprobe output".to_string()))?;

    let width = stream["width"]
        .as_u64()
        .ok_or_else(|| VqaError::Parse("Missing width".to_string()))? as u32;
    let height = stream["height"]
        .as_u64()
        .ok_or_else(|| VqaError::Parse("Missing height".to_string()))? as u32;

    // nb_read_frames is what -count_frames actually decoded; nb_frames is the
    // container's claim and is absent for some formats.
    let frame_count_str = stream["nb_read_frames"]
        .as_str()
        .filter(|s| *s != "N/A")
        .or_else(|| stream["nb_frames"].as_str().filter(|s| *s != "N/A"))
        .ok_or_else(|| {
            VqaError::Parse(format!("Failed to count frames for {}", path.display()))
        })?;
    let frame_count = frame_count_str.parse::<u64>().map_err(|e| {
        VqaError::Parse(format!("Invalid frame count value '{}': {}", frame_count_str, e))
    })?;

    let fps_str = stream["r_frame_rate"]
        .as_str()
        .ok_or_else(|| VqaError::Parse("Missing r_frame_rate".to_string()))?;
    let frame_rate = parse_frame_rate(fps_str)?;

    let pixel_format = stream["pix_fmt"].as_str().unwrap_or("unknown").to_string();
    let color_transfer = stream["color_transfer"].as_str().unwrap_or("unknown");
    let is_hdr = color_transfer == "smpte2084" || color_transfer == "arib-std-b67";

    Ok(VideoStream {
        path: path.to_path_buf(),
        width,
        height,
        frame_count,
        frame_rate,
        pixel_format,
        is_hdr,
    })
}

/// Parses frame rate string (e.g., "24000/1001") into f64.
pub fn parse_frame_rate(fps_str: &str) -> Result<f64> {
    match fps_str.split_once('/') {
        Some((num, den)) => {
            let num = num
                .parse::<f64>()
                .map_err(|_| VqaError::Parse(format!("Invalid FPS numerator: {}", num)))?;
            let den = den
                .parse::<f64>()
                .map_err(|_| VqaError::Parse(format!("Invalid FPS denominator: {}", den)))?;
            if den == 0.0 {
                Err(VqaError::Parse("FPS denominator cannot be zero".to_string()))
            } else {
                Ok(num / den)
            }
        }
        None => fps_str
            .parse::<f64>()
            .map_err(|_| VqaError::Parse(format!("Invalid FPS format: {}", fps_str))),
    }
}

static METADATA_FRAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\]\s+frame:(?P<n>\d+)\s+pts:").expect("Invalid metadata frame regex")
});

static SIGNALSTATS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"lavfi\.signalstats\.(?P<key>YAVG|YLOW)=(?P<value>[0-9]+(?:\.[0-9]*)?)")
        .expect("Invalid signalstats regex")
});

/// Extracts per-frame `YAVG`/`YLOW` from `metadata=mode=print` log output.
/// The log counts frames after the trim; `first_frame` maps them back to
/// stream indices. Frames missing either statistic are dropped.
pub fn parse_signalstats_log(log: &str, first_frame: u64) -> Vec<LumaSample> {
    let mut samples = Vec::new();
    let mut current: Option<(u64, Option<f64>, Option<f64>)> = None;

    let mut flush = |entry: Option<(u64, Option<f64>, Option<f64>)>| {
        if let Some((frame_index, Some(mean), Some(low))) = entry {
            samples.push(LumaSample {
                frame_index: first_frame + frame_index,
                mean,
                low,
            });
        }
    };

    for line in log.lines() {
        if let Some(caps) = METADATA_FRAME_REGEX.captures(line) {
            let Ok(frame_index) = caps["n"].parse::<u64>() else {
                warn!("Unparseable frame number in metadata line: {}", line);
                continue;
            };
            flush(current.take());
            current = Some((frame_index, None, None));
        } else if let Some(caps) = SIGNALSTATS_REGEX.captures(line) {
            let Some(entry) = current.as_mut() else {
                continue;
            };
            let Ok(value) = caps["value"].parse::<f64>() else {
                continue;
            };
            match &caps["key"] {
                "YAVG" => entry.1 = Some(value),
                _ => entry.2 = Some(value),
            }
        }
    }
    flush(current.take());
    samples
}
