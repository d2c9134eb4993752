//! ffmpeg re-encode fallback
//!
//! Fragments of each track are concatenated into one input file per track in
//! a private work directory, then ffmpeg decodes and re-encodes them into a
//! single MP4. Progress comes from ffmpeg's `-progress` key/value stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use remux_lib::{
    CancellationToken, Capabilities, FallbackRequest, FragmentRecord, OutputArtifact,
    ProgressSink, ReencodeFallback, RemuxError, Result, TrackKind,
};

use crate::config::FallbackConfig;

const WORK_DIR_PREFIX: &str = "remux-ffmpeg-";

pub struct FfmpegFallback {
    ffmpeg: PathBuf,
    config: FallbackConfig,
    capabilities: Capabilities,
}

impl FfmpegFallback {
    /// Locate ffmpeg and probe its codec support. `None` when no binary is found.
    pub async fn discover(config: &FallbackConfig) -> Option<Self> {
        let ffmpeg = match &config.ffmpeg_path {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                warn!(
                    "Configured ffmpeg {} does not exist, searching PATH",
                    path.display()
                );
                which::which("ffmpeg").ok()?
            }
            None => which::which("ffmpeg").ok()?,
        };

        let decoders = list_codecs(&ffmpeg, "-decoders").await;
        let encoders = list_codecs(&ffmpeg, "-encoders").await;
        let capabilities = Capabilities {
            video_decode: decoders.iter().any(|c| c == "h264"),
            video_encode: encoders.iter().any(|c| *c == config.video_encoder),
            audio_decode: decoders.iter().any(|c| c == "aac"),
            audio_encode: encoders.iter().any(|c| *c == config.audio_encoder),
        };
        info!(
            "Using {} for re-encode fallback ({:?})",
            ffmpeg.display(),
            capabilities
        );

        Some(Self {
            ffmpeg,
            config: config.clone(),
            capabilities,
        })
    }

    fn build_args(&self, inputs: &[(TrackKind, PathBuf)], output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "error",
            "-y",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for (_, path) in inputs {
            args.push("-i".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        if inputs.len() == 1 {
            // A single input may be muxed TS carrying both streams
            args.extend(["-map", "0:v?", "-map", "0:a?"].map(String::from));
        } else {
            for (i, (kind, _)) in inputs.iter().enumerate() {
                let selector = match kind {
                    TrackKind::Video => "v",
                    TrackKind::Audio => "a",
                };
                args.push("-map".to_string());
                args.push(format!("{}:{}:0", i, selector));
            }
        }

        let config = &self.config;
        args.extend([
            "-c:v".to_string(),
            config.video_encoder.clone(),
            "-preset".to_string(),
            config.preset.clone(),
            "-crf".to_string(),
            config.crf.to_string(),
            "-c:a".to_string(),
            config.audio_encoder.clone(),
            "-b:a".to_string(),
            config.audio_bitrate.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]);
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl ReencodeFallback for FfmpegFallback {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn convert(
        &self,
        request: FallbackRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<OutputArtifact> {
        let work_dir = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .tempdir()?;
        let inputs = write_track_inputs(work_dir.path(), &request.fragments, &cancel).await?;
        if inputs.is_empty() {
            return Err(RemuxError::Fallback("no fragments to re-encode".to_string()));
        }
        let output = work_dir.path().join("output.mp4");
        let args = self.build_args(&inputs, &output);
        debug!("Running {} {}", self.ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RemuxError::Fallback("ffmpeg pipes not captured".to_string()));
        };
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Err(e) = stderr.read_to_string(&mut text).await {
                warn!("Failed to read ffmpeg stderr: {}", e);
            }
            text
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Re-encode cancelled, stopping ffmpeg");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill ffmpeg: {}", e);
                    }
                    return Err(RemuxError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let (Some(done), Some(total)) = (parse_progress_time(&line), request.duration) {
                            if total > 0.0 {
                                progress.report((done / total).min(1.0) * 99.0);
                            }
                        }
                    }
                    None => break,
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(RemuxError::Fallback(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr.trim()
            )));
        }

        let data = tokio::fs::read(&output).await?;
        progress.complete();
        info!(
            "Re-encoded {} fragments into {} bytes",
            request.fragments.len(),
            data.len()
        );
        Ok(OutputArtifact {
            mime_type: request.mime_type,
            data: Bytes::from(data),
        })
    }
}

/// Concatenate each track's fragments, in input order, into `<dir>/<kind>.input`.
async fn write_track_inputs(
    dir: &Path,
    fragments: &[FragmentRecord],
    cancel: &CancellationToken,
) -> Result<Vec<(TrackKind, PathBuf)>> {
    let mut inputs = Vec::new();
    for kind in [TrackKind::Video, TrackKind::Audio] {
        let records: Vec<&FragmentRecord> = fragments.iter().filter(|f| f.track == kind).collect();
        if records.is_empty() {
            continue;
        }
        let path = dir.join(format!("{}.input", kind));
        let mut file = tokio::fs::File::create(&path).await?;
        for record in records {
            if cancel.is_cancelled() {
                return Err(RemuxError::Cancelled);
            }
            file.write_all(&record.fetch().await?).await?;
        }
        file.flush().await?;
        inputs.push((kind, path));
    }
    Ok(inputs)
}

async fn list_codecs(ffmpeg: &Path, flag: &str) -> Vec<String> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", flag])
        .stdin(Stdio::null())
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_codec_list(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            warn!("ffmpeg {} exited with {}", flag, out.status);
            Vec::new()
        }
        Err(e) => {
            warn!("Failed to run ffmpeg {}: {}", flag, e);
            Vec::new()
        }
    }
}

/// Codec names from `ffmpeg -decoders` / `-encoders` output.
/// Everything up to the `------` line is the legend.
fn parse_codec_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _flags = parts.next()?;
            parts.next().map(str::to_string)
        })
        .collect()
}

/// Encoded position in seconds from a `-progress` line.
/// ffmpeg reports `out_time_ms` in microseconds too.
fn parse_progress_time(line: &str) -> Option<f64> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    let micros: i64 = value.trim().parse().ok()?;
    (micros >= 0).then(|| micros as f64 / 1_000_000.0)
}
