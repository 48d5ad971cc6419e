//! Audio and video transcoding through the FFmpeg CLI.
//!
//! Video settings: `crf` (0-51, default 28), `preset` (x264 preset, default
//! `medium`), `audioBitrate` (kbps, default 128). Output is always MP4.
//!
//! Audio settings: `format` (`mp3` default, `m4a`, `ogg`), `bitrate` (kbps,
//! 32-320, default 128).
//!
//! Progress comes from `-progress pipe:1`, scaled against the duration
//! reported by `ffprobe`. When the duration is unknown only completion is
//! reported.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use squish_models::JobSettings;

use crate::processor::{
    ProcessContext, ProcessOutput, ProcessRequest, Processor, ProcessorError, ProgressReporter,
};

const X264_PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Bytes of stderr kept for error details.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Encoder arguments derived from job settings.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Encoding {
    extension: &'static str,
    args: Vec<String>,
}

impl MediaKind {
    fn encoding(&self, settings: &JobSettings) -> Result<Encoding, ProcessorError> {
        match self {
            MediaKind::Video => {
                let crf = bounded(settings, "crf", 0, 51, 28)?;
                let preset = match settings.get_str("preset") {
                    None => "medium",
                    Some(p) => X264_PRESETS
                        .into_iter()
                        .find(|known| *known == p)
                        .ok_or_else(|| {
                            ProcessorError::invalid_settings(format!("unknown preset '{p}'"))
                        })?,
                };
                let audio_kbps = bounded(settings, "audioBitrate", 32, 320, 128)?;
                Ok(Encoding {
                    extension: "mp4",
                    args: vec![
                        "-c:v".into(),
                        "libx264".into(),
                        "-preset".into(),
                        preset.into(),
                        "-crf".into(),
                        crf.to_string(),
                        "-pix_fmt".into(),
                        "yuv420p".into(),
                        "-c:a".into(),
                        "aac".into(),
                        "-b:a".into(),
                        format!("{audio_kbps}k"),
                        "-movflags".into(),
                        "+faststart".into(),
                    ],
                })
            }
            MediaKind::Audio => {
                let (extension, codec) = match settings.get_str("format") {
                    None | Some("mp3") => ("mp3", "libmp3lame"),
                    Some("m4a") | Some("aac") => ("m4a", "aac"),
                    Some("ogg") => ("ogg", "libvorbis"),
                    Some(other) => {
                        return Err(ProcessorError::invalid_settings(format!(
                            "unsupported audio format '{other}'"
                        )))
                    }
                };
                let kbps = bounded(settings, "bitrate", 32, 320, 128)?;
                Ok(Encoding {
                    extension,
                    args: vec![
                        "-vn".into(),
                        "-c:a".into(),
                        codec.into(),
                        "-b:a".into(),
                        format!("{kbps}k"),
                    ],
                })
            }
        }
    }
}

fn bounded(settings: &JobSettings, key: &str, min: u64, max: u64, default: u64) -> Result<u64, ProcessorError> {
    match settings.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|v| (min..=max).contains(v))
            .ok_or_else(|| {
                ProcessorError::invalid_settings(format!(
                    "{key} must be an integer between {min} and {max}"
                ))
            }),
    }
}

/// FFmpeg-backed delegate for one media kind.
#[derive(Debug, Clone)]
pub struct FfmpegProcessor {
    kind: MediaKind,
}

impl FfmpegProcessor {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind }
    }

    pub fn video() -> Self {
        Self::new(MediaKind::Video)
    }

    pub fn audio() -> Self {
        Self::new(MediaKind::Audio)
    }
}

#[async_trait]
impl Processor for FfmpegProcessor {
    fn name(&self) -> &'static str {
        match self.kind {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    fn output_extension(&self, settings: &JobSettings) -> Result<String, ProcessorError> {
        Ok(self.kind.encoding(settings)?.extension.to_string())
    }

    async fn process(
        &self,
        request: ProcessRequest,
        ctx: ProcessContext,
    ) -> Result<ProcessOutput, ProcessorError> {
        let encoding = self.kind.encoding(&request.settings)?;
        which::which("ffmpeg").map_err(|_| ProcessorError::ToolMissing("ffmpeg"))?;

        let duration_us = match probe_duration_us(request.input.as_path()).await {
            Ok(duration) => duration,
            Err(e) => {
                warn!(error = %e, "Could not probe media duration, progress limited to completion");
                None
            }
        };

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
        ];
        args.push(request.input.to_string());
        args.extend(encoding.args);
        args.extend(["-progress".into(), "pipe:1".into(), "-nostats".into()]);
        args.push(request.output.to_string());

        debug!(kind = self.name(), "Running ffmpeg {}", args.join(" "));
        run_ffmpeg(&args, duration_us, ctx.clone()).await?;

        let output_size = tokio::fs::metadata(request.output.as_path()).await?.len();
        ctx.progress.report(100);
        info!(kind = self.name(), output_size, "Media transcoded");
        Ok(ProcessOutput { output_size })
    }
}

async fn run_ffmpeg(args: &[String], duration_us: Option<i64>, mut ctx: ProcessContext) -> Result<(), ProcessorError> {
    let mut child = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessorError::failed("ffmpeg stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessorError::failed("ffmpeg stderr not captured"))?;

    let reporter = ctx.progress.clone();
    let progress_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut state = ProgressState::default();
        while let Ok(Some(line)) = lines.next_line().await {
            parse_progress_line(&line, &mut state);
            publish(&reporter, &state, duration_us);
        }
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        let text = String::from_utf8_lossy(&buf).into_owned();
        tail(&text, STDERR_TAIL).to_string()
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = ctx.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status?,
        None => {
            info!("FFmpeg cancelled, killing process");
            let _ = child.kill().await;
            progress_task.abort();
            stderr_task.abort();
            return Err(ProcessorError::Cancelled);
        }
    };

    let _ = progress_task.await;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(ProcessorError::failed_with_detail(
            format!("ffmpeg exited with status {code}"),
            stderr_tail,
        ))
    }
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

// ============================================================================
// Progress parsing
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ProgressState {
    /// Encoded output time in microseconds
    out_time_us: i64,
    is_complete: bool,
}

impl ProgressState {
    fn percentage(&self, total_us: i64) -> u8 {
        if total_us <= 0 {
            return 0;
        }
        ((self.out_time_us as f64 / total_us as f64) * 100.0).clamp(0.0, 100.0) as u8
    }
}

/// Apply one `key=value` line of `-progress` output.
fn parse_progress_line(line: &str, state: &mut ProgressState) {
    let Some((key, value)) = line.trim().split_once('=') else {
        return;
    };
    match key {
        // ffmpeg writes microseconds under both names
        "out_time_us" | "out_time_ms" => {
            if let Ok(us) = value.parse::<i64>() {
                state.out_time_us = us;
            }
        }
        "progress" => state.is_complete = value == "end",
        _ => {}
    }
}

fn publish(reporter: &ProgressReporter, state: &ProgressState, duration_us: Option<i64>) {
    // Keep 100 for after the output file is verified
    if let Some(total) = duration_us {
        reporter.report(state.percentage(total).min(99));
    }
    if state.is_complete {
        reporter.report(99);
    }
}

// ============================================================================
// Duration probe
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Media duration in microseconds, if ffprobe can tell.
async fn probe_duration_us(path: &Path) -> Result<Option<i64>, ProcessorError> {
    which::which("ffprobe").map_err(|_| ProcessorError::ToolMissing("ffprobe"))?;

    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(ProcessorError::failed_with_detail(
            "ffprobe failed",
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| ProcessorError::failed(format!("unreadable ffprobe output: {e}")))?;
    Ok(probe
        .format
        .duration
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .map(|d| (d * 1_000_000.0) as i64))
}
