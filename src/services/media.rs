//! Audio operations behind a narrow trait; the shipped implementation shells
//! out to `ffmpeg`/`ffprobe`.

use crate::core::error::DramaError;
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("{tool} binary not found: {source}")]
    NotFound {
        tool: &'static str,
        source: std::io::Error,
    },

    #[error("{tool} failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        tool: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl From<MediaError> for DramaError {
    fn from(e: MediaError) -> Self {
        DramaError::MediaToolchain(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTargets {
    pub integrated: f64,
    pub true_peak: f64,
    pub range: f64,
}

#[async_trait]
pub trait MediaToolchain: Send + Sync {
    /// Joins `inputs` in order into one encoded file.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
    async fn normalize_loudness(&self, input: &Path, output: &Path, targets: &LoudnessTargets) -> Result<()>;
    /// Fade-in from the start; the fade-out ends exactly at the measured duration.
    async fn fade(&self, input: &Path, output: &Path, fade_in: f64, fade_out: f64) -> Result<()>;
    async fn probe_duration(&self, input: &Path) -> Result<f64>;
    /// Decodes to 16-bit PCM WAV at the toolchain's sample rate, mono.
    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<()>;
    async fn encode_mp3(&self, input: &Path, output: &Path) -> Result<()>;
    async fn silence(&self, seconds: f64, output: &Path) -> Result<()>;
}

pub struct FfmpegToolchain {
    bitrate: String,
    sample_rate: u32,
}

impl FfmpegToolchain {
    pub fn new(bitrate: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            bitrate: bitrate.into(),
            sample_rate,
        }
    }

    fn mp3_args(&self) -> Vec<OsString> {
        vec![
            "-ar".into(),
            self.sample_rate.to_string().into(),
            "-ac".into(),
            "1".into(),
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            self.bitrate.clone().into(),
        ]
    }

    async fn ffmpeg_filter(&self, input: &Path, output: &Path, filter: &str) -> Result<()> {
        let mut args: Vec<OsString> = vec!["-i".into(), input.into(), "-af".into(), filter.into()];
        args.extend(self.mp3_args());
        args.push(output.into());
        run_tool("ffmpeg", args).await.map(|_| ())
    }
}

async fn run_tool(tool: &'static str, args: Vec<OsString>) -> Result<Vec<u8>> {
    debug!("{} {:?}", tool, args);
    let mut command = tokio::process::Command::new(tool);
    if tool == "ffmpeg" {
        command.args(["-y", "-hide_banner", "-loglevel", "error"]);
    }
    let output = command
        .args(&args)
        .output()
        .await
        .map_err(|source| DramaError::from(MediaError::NotFound { tool, source }))?;

    if !output.status.success() {
        return Err(DramaError::from(MediaError::ExecutionFailed {
            tool,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
        .into());
    }
    Ok(output.stdout)
}

pub fn concat_filter(inputs: usize, sample_rate: u32) -> String {
    let mut filter = String::new();
    for i in 0..inputs {
        filter.push_str(&format!(
            "[{i}:a]aresample={sample_rate},aformat=sample_fmts=s16:channel_layouts=mono[a{i}];"
        ));
    }
    for i in 0..inputs {
        filter.push_str(&format!("[a{i}]"));
    }
    filter.push_str(&format!("concat=n={inputs}:v=0:a=1[out]"));
    filter
}

pub fn loudnorm_filter(targets: &LoudnessTargets) -> String {
    format!(
        "loudnorm=I={}:TP={}:LRA={}",
        targets.integrated, targets.true_peak, targets.range
    )
}

pub fn fade_filter(fade_in: f64, fade_out: f64, duration: f64) -> String {
    let fade_out = fade_out.min(duration).max(0.0);
    let start = (duration - fade_out).max(0.0);
    format!(
        "afade=t=in:st=0:d={:.3},afade=t=out:st={:.3}:d={:.3}",
        fade_in.max(0.0),
        start,
        fade_out
    )
}

pub fn parse_duration(stdout: &str) -> Result<f64, MediaError> {
    let trimmed = stdout.trim();
    trimmed
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| MediaError::ParseError(format!("unexpected duration {:?}", trimmed)))
}

#[async_trait]
impl MediaToolchain for FfmpegToolchain {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(DramaError::from(MediaError::InvalidInput("nothing to concatenate".to_string())).into());
        }
        let mut args: Vec<OsString> = Vec::new();
        for input in inputs {
            args.push("-i".into());
            args.push(input.into());
        }
        args.push("-filter_complex".into());
        args.push(concat_filter(inputs.len(), self.sample_rate).into());
        args.push("-map".into());
        args.push("[out]".into());
        args.extend(self.mp3_args());
        args.push(output.into());
        run_tool("ffmpeg", args).await.map(|_| ())
    }

    async fn normalize_loudness(&self, input: &Path, output: &Path, targets: &LoudnessTargets) -> Result<()> {
        self.ffmpeg_filter(input, output, &loudnorm_filter(targets)).await
    }

    async fn fade(&self, input: &Path, output: &Path, fade_in: f64, fade_out: f64) -> Result<()> {
        let duration = self.probe_duration(input).await?;
        self.ffmpeg_filter(input, output, &fade_filter(fade_in, fade_out, duration))
            .await
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            input.into(),
        ];
        let stdout = run_tool("ffprobe", args).await?;
        Ok(parse_duration(&String::from_utf8_lossy(&stdout)).map_err(DramaError::from)?)
    }

    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-ar".into(),
            self.sample_rate.to_string().into(),
            "-ac".into(),
            "1".into(),
            "-c:a".into(),
            "pcm_s16le".into(),
            output.into(),
        ];
        run_tool("ffmpeg", args).await.map(|_| ())
    }

    async fn encode_mp3(&self, input: &Path, output: &Path) -> Result<()> {
        let mut args: Vec<OsString> = vec!["-i".into(), input.into()];
        args.extend(self.mp3_args());
        args.push(output.into());
        run_tool("ffmpeg", args).await.map(|_| ())
    }

    async fn silence(&self, seconds: f64, output: &Path) -> Result<()> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={}:cl=mono", self.sample_rate).into(),
            "-t".into(),
            format!("{:.3}", seconds.max(0.0)).into(),
        ];
        args.extend(self.mp3_args());
        args.push(output.into());
        run_tool("ffmpeg", args).await.map(|_| ())
    }
}
