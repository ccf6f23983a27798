#![forbid(unsafe_code)]

//! Narrow seam around the external extraction/download client.
//!
//! Handlers only ever see [`VideoExtractor`]. The production implementation,
//! [`YtDlp`], shells out to the `yt-dlp` executable; tests swap in fakes.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

/// Container every merged download is remuxed into.
pub const MERGE_CONTAINER: &str = "mp4";
/// Output name template handed to yt-dlp, relative to the target directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("{program} is not installed or not on PATH")]
    Missing { program: String },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
    #[error("could not parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("extractor did not report a downloaded file")]
    NoOutput,
}

/// Subset of yt-dlp's `--dump-single-json` payload that the service reads.
/// Everything is optional; absent fields become sentinels later on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub channel: Option<String>,
    pub view_count: Option<u64>,
    /// `YYYYMMDD`
    pub upload_date: Option<String>,
    pub formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub height: Option<u64>,
    pub filesize: Option<u64>,
    pub ext: Option<String>,
}

#[async_trait]
pub trait VideoExtractor: Send + Sync {
    /// Reads metadata without downloading any media.
    async fn fetch_metadata(&self, url: &str) -> Result<RawVideoInfo, ExtractorError>;

    /// Downloads the best video stream no taller than `max_height`, merged
    /// with the best audio, into `output_dir`. Returns the produced file.
    async fn download(
        &self,
        url: &str,
        max_height: u32,
        output_dir: &Path,
    ) -> Result<PathBuf, ExtractorError>;
}

/// Option bag translated into yt-dlp command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YtDlpOptions {
    pub quiet: bool,
    pub skip_download: bool,
    pub format: Option<String>,
    pub output_template: Option<PathBuf>,
    pub merge_output_format: Option<String>,
}

impl YtDlpOptions {
    pub fn metadata_only() -> Self {
        Self {
            quiet: true,
            skip_download: true,
            ..Self::default()
        }
    }

    pub fn download(max_height: u32, output_dir: &Path) -> Self {
        Self {
            quiet: true,
            skip_download: false,
            format: Some(format_selector(max_height)),
            output_template: Some(output_dir.join(OUTPUT_TEMPLATE)),
            merge_output_format: Some(MERGE_CONTAINER.to_string()),
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string(), "--no-progress".to_string()];
        if self.quiet {
            args.push("--quiet".into());
            args.push("--no-warnings".into());
        }
        if self.skip_download {
            args.push("--skip-download".into());
            args.push("--dump-single-json".into());
        } else {
            // --print implies --simulate, which would skip the actual download.
            args.push("--no-simulate".into());
            args.push("--print".into());
            args.push("after_move:filepath".into());
        }
        if let Some(format) = &self.format {
            args.push("--format".into());
            args.push(format.clone());
        }
        if let Some(template) = &self.output_template {
            args.push("--output".into());
            args.push(template.to_string_lossy().into_owned());
        }
        if let Some(container) = &self.merge_output_format {
            args.push("--merge-output-format".into());
            args.push(container.clone());
        }
        args
    }
}

/// Best video at or below `max_height` plus best audio, falling back to the
/// best single muxed stream under the same cap.
pub fn format_selector(max_height: u32) -> String {
    format!("bestvideo[height<={max_height}]+bestaudio/best[height<={max_height}]")
}

/// Drives the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, options: &YtDlpOptions, url: &str) -> Result<Vec<u8>, ExtractorError> {
        let program = self.program.to_string_lossy().into_owned();
        tracing::debug!(%program, %url, "invoking extractor");
        let output = Command::new(&self.program)
            .args(options.to_args())
            // Keeps a URL that starts with `-` from being read as a flag.
            .arg("--")
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| {
                if source.kind() == ErrorKind::NotFound {
                    ExtractorError::Missing {
                        program: program.clone(),
                    }
                } else {
                    ExtractorError::Launch {
                        program: program.clone(),
                        source,
                    }
                }
            })?;

        if !output.status.success() {
            return Err(ExtractorError::Failed(failure_message(
                &output.stderr,
                output.status,
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl VideoExtractor for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<RawVideoInfo, ExtractorError> {
        let stdout = self.run(&YtDlpOptions::metadata_only(), url).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn download(
        &self,
        url: &str,
        max_height: u32,
        output_dir: &Path,
    ) -> Result<PathBuf, ExtractorError> {
        let options = YtDlpOptions::download(max_height, output_dir);
        let stdout = self.run(&options, url).await?;
        let path = last_line(&stdout)
            .map(PathBuf::from)
            .ok_or(ExtractorError::NoOutput)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ExtractorError::NoOutput);
        }
        Ok(path)
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

fn failure_message(stderr: &[u8], status: std::process::ExitStatus) -> String {
    last_line(stderr).unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}
