//! The one integration point with the external extraction tool.
//!
//! Everything above this module talks to [`Extractor`]; only [`YtDlp`] knows
//! how yt-dlp is invoked. Calls block until the child process exits, so async
//! callers run them through `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::metadata::VideoInfo;

/// What the extractor should do after fetching the selected streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    /// Remux separately fetched streams into this container.
    Merge { container: &'static str },
    /// Drop the video and transcode the audio.
    ExtractAudio {
        codec: &'static str,
        bitrate: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Format selector understood by the extractor (`-f`).
    pub selector: String,
    /// Output file name without extension; the extractor appends its own.
    pub output_stem: String,
    pub post_process: PostProcess,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadedMedia {
    pub title: Option<String>,
}

pub trait Extractor: Send + Sync {
    /// Descriptive metadata and available formats for `url`.
    fn fetch_info(&self, url: &str) -> Result<VideoInfo, ExtractError>;

    /// Materializes the planned download inside `dest_dir`.
    fn download(
        &self,
        url: &str,
        plan: &DownloadPlan,
        dest_dir: &Path,
    ) -> Result<DownloadedMedia, ExtractError>;

    /// Version string of the backing tool, if it can be run at all.
    fn version(&self) -> Option<String>;
}

/// [`Extractor`] backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: None,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist");

        if let Some(cookies) = &self.cookies {
            if cookies.exists() {
                command.arg("--cookies").arg(cookies);
            } else {
                warn!("cookies file {} does not exist, ignoring", cookies.display());
            }
        }
        command
    }

    /// Runs the command and returns stdout, classifying failures.
    fn run(&self, mut command: Command) -> Result<Vec<u8>, ExtractError> {
        debug!(?command, "running extractor");
        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ExtractError::Launch {
                program: self.program_name(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::from_failure(
                &self.program_name(),
                output.status.to_string(),
                &stderr,
            ));
        }
        Ok(output.stdout)
    }
}

impl Extractor for YtDlp {
    fn fetch_info(&self, url: &str) -> Result<VideoInfo, ExtractError> {
        let mut command = self.base_command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--")
            .arg(url);

        let stdout = self.run(command)?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    fn download(
        &self,
        url: &str,
        plan: &DownloadPlan,
        dest_dir: &Path,
    ) -> Result<DownloadedMedia, ExtractError> {
        let template = dest_dir.join(format!("{}.%(ext)s", plan.output_stem));

        let mut command = self.base_command();
        command
            .arg("--format")
            .arg(&plan.selector)
            .arg("--output")
            .arg(&template)
            .arg("--no-part")
            .arg("--dump-single-json")
            .arg("--no-simulate");

        match plan.post_process {
            PostProcess::Merge { container } => {
                command.arg("--merge-output-format").arg(container);
            }
            PostProcess::ExtractAudio { codec, bitrate } => {
                command
                    .arg("--extract-audio")
                    .arg("--audio-format")
                    .arg(codec)
                    .arg("--audio-quality")
                    .arg(bitrate);
            }
        }
        command.arg("--").arg(url);

        let stdout = self.run(command)?;

        // The file is already on disk at this point; a record we cannot read
        // only costs us the title.
        let title = match serde_json::from_slice::<VideoInfo>(&stdout) {
            Ok(info) => info.title.or(info.fulltitle),
            Err(err) => {
                warn!("could not parse download record for {url}: {err}");
                None
            }
        };
        Ok(DownloadedMedia { title })
    }

    fn version(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .ok()
            .filter(|output| output.status.success())?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
    }
}
