//! Server-side downloads handed back to the browser as attachments.
//!
//! Every request gets its own temporary directory. The directory is owned by
//! a [`DownloadArtifact`] and, once the artifact is turned into a body, by the
//! body stream itself, so it disappears when the response finishes or is
//! abandoned.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use axum::body::Body;
use futures::StreamExt;
use mime_guess::{MimeGuess, mime::Mime};
use tempfile::TempDir;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::extractor::{DownloadPlan, Extractor, PostProcess};
use crate::video_url::VideoReference;

pub const DEFAULT_VIDEO_SELECTOR: &str = "best[height<=720]/best";
pub const DEFAULT_AUDIO_SELECTOR: &str = "bestaudio/best";
pub const MERGE_CONTAINER: &str = "mp4";
pub const AUDIO_CODEC: &str = "mp3";
pub const AUDIO_BITRATE: &str = "192K";
pub const MAX_FILENAME_CHARS: usize = 50;

const TEMP_DIR_PREFIX: &str = "tubefetch-";
const MAX_SELECTOR_LEN: usize = 128;
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Video,
    Audio,
}

impl DownloadKind {
    pub fn default_selector(self) -> &'static str {
        match self {
            Self::Video => DEFAULT_VIDEO_SELECTOR,
            Self::Audio => DEFAULT_AUDIO_SELECTOR,
        }
    }

    fn fallback_name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    fn post_process(self) -> PostProcess {
        match self {
            Self::Video => PostProcess::Merge {
                container: MERGE_CONTAINER,
            },
            Self::Audio => PostProcess::ExtractAudio {
                codec: AUDIO_CODEC,
                bitrate: AUDIO_BITRATE,
            },
        }
    }

    fn default_mime(self) -> Mime {
        match self {
            Self::Video => MimeGuess::from_ext(MERGE_CONTAINER).first_or_octet_stream(),
            Self::Audio => MimeGuess::from_ext(AUDIO_CODEC).first_or_octet_stream(),
        }
    }
}

/// Removes its directory on drop, logging instead of failing.
#[derive(Debug)]
struct ScratchDir(Option<TempDir>);

impl ScratchDir {
    fn create_in(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(root)?;
        Ok(Self(Some(dir)))
    }

    fn path(&self) -> &Path {
        self.0.as_ref().map(TempDir::path).unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.0.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("removed {}", path.display()),
                Err(err) => warn!("could not remove {}: {err}", path.display()),
            }
        }
    }
}

/// A produced file plus the directory that holds it.
#[derive(Debug)]
pub struct DownloadArtifact {
    dir: ScratchDir,
    path: PathBuf,
    filename: String,
    mime: Mime,
    len: u64,
}

impl DownloadArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Name the browser should save the file as.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mime(&self) -> &Mime {
        &self.mime
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opens the file and moves the directory guard into the body stream.
    /// Dropping the body, whether fully sent or not, removes everything.
    pub async fn into_body(self) -> io::Result<Body> {
        let Self { dir, path, .. } = self;
        let file = File::open(&path).await?;
        let stream = ReaderStream::new(file).map(move |chunk| {
            let _held = &dir;
            chunk
        });
        Ok(Body::from_stream(stream))
    }
}

/// Validates the URL, has the extractor produce the file in a fresh scratch
/// directory under `temp_root`, and locates it.
///
/// On every error path the scratch directory is removed before returning.
pub fn prepare_download(
    extractor: &dyn Extractor,
    temp_root: &Path,
    raw_url: &str,
    selector: Option<&str>,
    kind: DownloadKind,
) -> Result<DownloadArtifact, FetchError> {
    let reference = VideoReference::parse(raw_url)?;
    let selector = normalize_selector(selector, kind)?;

    let dir = ScratchDir::create_in(temp_root).map_err(|err| {
        FetchError::Extraction(format!(
            "creating scratch directory in {}: {err}",
            temp_root.display()
        ))
    })?;

    let plan = DownloadPlan {
        selector,
        output_stem: reference.video_id.clone(),
        post_process: kind.post_process(),
    };
    info!(video_id = %reference.video_id, selector = %plan.selector, ?kind, "starting download");

    let media = extractor
        .download(&reference.url, &plan, dir.path())
        .map_err(|err| {
            error!(url = %reference.url, "download failed: {err}");
            FetchError::from(err)
        })?;

    let located = match kind {
        DownloadKind::Video => find_by_prefix(dir.path(), &reference.video_id),
        DownloadKind::Audio => find_by_extension(dir.path(), AUDIO_CODEC),
    }
    .map_err(|err| FetchError::Artifact(format!("scanning {}: {err}", dir.path().display())))?;

    let path = located.ok_or_else(|| {
        FetchError::Artifact(format!(
            "no output for {} in {}",
            reference.video_id,
            dir.path().display()
        ))
    })?;

    let len = fs::metadata(&path)
        .map_err(|err| FetchError::Artifact(format!("reading {}: {err}", path.display())))?
        .len();

    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(match kind {
            DownloadKind::Video => MERGE_CONTAINER,
            DownloadKind::Audio => AUDIO_CODEC,
        })
        .to_owned();

    let stem = media
        .title
        .as_deref()
        .map(sanitize_title)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| kind.fallback_name().to_owned());

    let mime = match kind {
        DownloadKind::Video => MimeGuess::from_ext(&ext)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::VIDEO)
            .unwrap_or_else(|| kind.default_mime()),
        DownloadKind::Audio => kind.default_mime(),
    };

    Ok(DownloadArtifact {
        dir,
        path,
        filename: format!("{stem}.{ext}"),
        mime,
        len,
    })
}

/// Turns the requested format into a selector. A bare video format id gets
/// the best audio merged in when that format carries no audio of its own;
/// full selector expressions pass through untouched.
fn normalize_selector(selector: Option<&str>, kind: DownloadKind) -> Result<String, FetchError> {
    let selector = selector.map(str::trim).filter(|s| !s.is_empty());
    match selector {
        None => Ok(kind.default_selector().to_owned()),
        Some(s) if s.len() > MAX_SELECTOR_LEN || s.chars().any(|c| c.is_control()) => {
            Err(FetchError::input("Invalid format selection."))
        }
        Some(id) if kind == DownloadKind::Video && is_plain_format_id(id) => {
            Ok(format!("{id}[acodec=none]+bestaudio/{id}"))
        }
        Some(s) => Ok(s.to_owned()),
    }
}

fn is_plain_format_id(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_partial(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Finished files in `dir`, sorted by name so the pick is stable.
fn finished_files(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_partial(&name) {
            continue;
        }
        files.push((name, entry.path()));
    }
    files.sort();
    Ok(files)
}

fn find_by_prefix(dir: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    Ok(finished_files(dir)?
        .into_iter()
        .find(|(name, _)| name.starts_with(prefix))
        .map(|(_, path)| path))
}

fn find_by_extension(dir: &Path, ext: &str) -> io::Result<Option<PathBuf>> {
    Ok(finished_files(dir)?
        .into_iter()
        .find(|(_, path)| {
            path.extension()
                .and_then(|value| value.to_str())
                .is_some_and(|value| value.eq_ignore_ascii_case(ext))
        })
        .map(|(_, path)| path))
}

/// Keeps letters, digits, spaces, `-` and `_`, trims trailing whitespace and
/// caps the result at [`MAX_FILENAME_CHARS`] characters.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    kept.trim_end().chars().take(MAX_FILENAME_CHARS).collect()
}

/// `Content-Disposition` value with an ASCII fallback name and the exact
/// name in RFC 5987 form.
pub fn attachment_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::extractor::{DownloadedMedia, YtDlp};
    use crate::metadata::VideoInfo;
    use anyhow::Result;
    use tempfile::tempdir;

    /// Writes whatever files it is told to and reports a title.
    struct FakeExtractor {
        files: Vec<&'static str>,
        title: Option<&'static str>,
        fail: bool,
    }

    impl Extractor for FakeExtractor {
        fn fetch_info(&self, _url: &str) -> Result<VideoInfo, ExtractError> {
            Ok(VideoInfo::default())
        }

        fn download(
            &self,
            _url: &str,
            _plan: &DownloadPlan,
            dest_dir: &Path,
        ) -> Result<DownloadedMedia, ExtractError> {
            for name in &self.files {
                fs::write(dest_dir.join(name), b"partial").unwrap();
            }
            if self.fail {
                return Err(ExtractError::Other("ffmpeg exited with 1".into()));
            }
            Ok(DownloadedMedia {
                title: self.title.map(str::to_owned),
            })
        }

        fn version(&self) -> Option<String> {
            None
        }
    }

    fn root_is_empty(root: &Path) -> bool {
        fs::read_dir(root).map(|mut it| it.next().is_none()).unwrap_or(true)
    }

    const URL: &str = "https://www.youtube.com/watch?v=abc123XYZ_0";

    #[test]
    fn sanitize_strips_illegal_characters() {
        assert_eq!(sanitize_title("Test/Video: <Cool>!"), "TestVideo Cool");
        assert_eq!(sanitize_title("under_score - dash  "), "under_score - dash");
        assert_eq!(sanitize_title("???"), "");
        let long = "a".repeat(80);
        assert_eq!(sanitize_title(&long).len(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn disposition_has_ascii_fallback() {
        let value = attachment_disposition("Café Mix.mp3");
        assert!(value.starts_with("attachment; filename=\"Caf_ Mix.mp3\""));
        assert!(value.ends_with("filename*=UTF-8''Caf%C3%A9%20Mix.mp3"));
    }

    #[test]
    fn selector_defaults_and_limits() {
        assert_eq!(
            normalize_selector(None, DownloadKind::Video).unwrap(),
            DEFAULT_VIDEO_SELECTOR
        );
        assert_eq!(
            normalize_selector(Some("  "), DownloadKind::Audio).unwrap(),
            DEFAULT_AUDIO_SELECTOR
        );
        assert_eq!(normalize_selector(Some("137+140"), DownloadKind::Video).unwrap(), "137+140");
        assert!(normalize_selector(Some("a\nb"), DownloadKind::Video).is_err());
    }

    #[test]
    fn bare_video_format_ids_pull_in_audio() {
        assert_eq!(
            normalize_selector(Some(" 137 "), DownloadKind::Video).unwrap(),
            "137[acodec=none]+bestaudio/137"
        );
        assert_eq!(
            normalize_selector(Some("hls-1080p"), DownloadKind::Video).unwrap(),
            "hls-1080p[acodec=none]+bestaudio/hls-1080p"
        );
        assert_eq!(
            normalize_selector(Some("bv*+ba/b"), DownloadKind::Video).unwrap(),
            "bv*+ba/b"
        );
        assert_eq!(normalize_selector(Some("251"), DownloadKind::Audio).unwrap(), "251");
    }

    /// Records the plan it was handed and writes nothing.
    struct PlanRecorder(std::sync::Mutex<Vec<DownloadPlan>>);

    impl Extractor for PlanRecorder {
        fn fetch_info(&self, _url: &str) -> Result<VideoInfo, ExtractError> {
            Ok(VideoInfo::default())
        }

        fn download(
            &self,
            _url: &str,
            plan: &DownloadPlan,
            _dest_dir: &Path,
        ) -> Result<DownloadedMedia, ExtractError> {
            self.0.lock().unwrap().push(plan.clone());
            Ok(DownloadedMedia::default())
        }

        fn version(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn video_plan_merges_audio_into_chosen_rendition() {
        let root = tempdir().unwrap();
        let recorder = PlanRecorder(std::sync::Mutex::new(Vec::new()));
        let err = prepare_download(&recorder, root.path(), URL, Some("137"), DownloadKind::Video)
            .unwrap_err();
        assert!(matches!(err, FetchError::Artifact(_)));

        let plans = recorder.0.lock().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].selector, "137[acodec=none]+bestaudio/137");
        assert_eq!(plans[0].output_stem, "abc123XYZ_0");
        assert_eq!(plans[0].post_process, PostProcess::Merge { container: "mp4" });
    }

    /// Writes `{dest}/{stem}.mp4`, creating parents the way yt-dlp does.
    struct TemplateWriter;

    impl Extractor for TemplateWriter {
        fn fetch_info(&self, _url: &str) -> Result<VideoInfo, ExtractError> {
            Ok(VideoInfo::default())
        }

        fn download(
            &self,
            _url: &str,
            plan: &DownloadPlan,
            dest_dir: &Path,
        ) -> Result<DownloadedMedia, ExtractError> {
            let target = dest_dir.join(format!("{}.mp4", plan.output_stem));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(target, b"escaped").unwrap();
            Ok(DownloadedMedia::default())
        }

        fn version(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn ids_cannot_steer_output_outside_scratch_dir() {
        let root = tempdir().unwrap();
        let err = prepare_download(
            &TemplateWriter,
            root.path(),
            "https://www.youtube.com/watch?v=abcdefghijk/../../escaped",
            None,
            DownloadKind::Video,
        )
        .unwrap_err();
        assert!(err.is_input());
        assert!(root_is_empty(root.path()));
        assert!(!root.path().join("escaped.mp4").exists());
    }

    #[tokio::test]
    async fn video_artifact_is_removed_after_body_is_consumed() -> Result<()> {
        let root = tempdir()?;
        let extractor = FakeExtractor {
            files: vec!["abc123XYZ_0.webm", "other.txt"],
            title: Some("Test/Video: <Cool>!"),
            fail: false,
        };
        let artifact =
            prepare_download(&extractor, root.path(), URL, None, DownloadKind::Video)?;
        assert_eq!(artifact.filename(), "TestVideo Cool.webm");
        assert_eq!(artifact.mime().essence_str(), "video/webm");
        assert_eq!(artifact.len(), 7);
        let dir = artifact.dir().to_path_buf();
        assert!(dir.exists());
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(TEMP_DIR_PREFIX)
        );

        let body = artifact.into_body().await?;
        assert!(dir.exists());
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;
        assert_eq!(&bytes[..], b"partial");
        assert!(!dir.exists());
        assert!(root_is_empty(root.path()));
        Ok(())
    }

    #[tokio::test]
    async fn dropping_an_unsent_body_cleans_up() -> Result<()> {
        let root = tempdir()?;
        let extractor = FakeExtractor {
            files: vec!["abc123XYZ_0.mp3"],
            title: None,
            fail: false,
        };
        let artifact =
            prepare_download(&extractor, root.path(), URL, Some("251"), DownloadKind::Audio)?;
        assert_eq!(artifact.filename(), "audio.mp3");
        assert_eq!(artifact.mime().essence_str(), "audio/mpeg");
        let body = artifact.into_body().await?;
        drop(body);
        assert!(root_is_empty(root.path()));
        Ok(())
    }

    #[test]
    fn failed_extraction_leaves_nothing_behind() {
        let root = tempdir().unwrap();
        let extractor = FakeExtractor {
            files: vec!["abc123XYZ_0.f137.mp4.part"],
            title: None,
            fail: true,
        };
        let err = prepare_download(&extractor, root.path(), URL, None, DownloadKind::Video)
            .unwrap_err();
        assert!(matches!(err, FetchError::Extraction(_)));
        assert!(root_is_empty(root.path()));
    }

    #[test]
    fn missing_output_is_an_artifact_error() {
        let root = tempdir().unwrap();
        let extractor = FakeExtractor {
            files: vec!["abc123XYZ_0.mp4.part", "abc123XYZ_0.m4a"],
            title: Some("x"),
            fail: false,
        };
        // Audio looks for the transcoded extension only.
        let err = prepare_download(&extractor, root.path(), URL, None, DownloadKind::Audio)
            .unwrap_err();
        assert!(matches!(err, FetchError::Artifact(_)));
        assert!(root_is_empty(root.path()));

        let extractor = FakeExtractor {
            files: vec!["abc123XYZ_0.mp4.part"],
            title: Some("x"),
            fail: false,
        };
        let err = prepare_download(&extractor, root.path(), URL, None, DownloadKind::Video)
            .unwrap_err();
        assert!(matches!(err, FetchError::Artifact(_)));
        assert!(root_is_empty(root.path()));
    }

    #[test]
    fn invalid_url_never_allocates() {
        let root = tempdir().unwrap();
        let extractor = FakeExtractor {
            files: vec![],
            title: None,
            fail: false,
        };
        let err = prepare_download(
            &extractor,
            root.path(),
            "https://example.com/watch?v=abc123XYZ_0",
            None,
            DownloadKind::Video,
        )
        .unwrap_err();
        assert!(err.is_input());
        assert!(root_is_empty(root.path()));
    }

    #[tokio::test]
    async fn end_to_end_with_ytdlp_stub() -> Result<()> {
        let bin = tempdir()?;
        let root = tempdir()?;
        let ytdlp = YtDlp::new(crate::extractor::tests::install_ytdlp_stub(bin.path())?);

        let artifact = prepare_download(&ytdlp, root.path(), URL, None, DownloadKind::Audio)?;
        assert_eq!(artifact.filename(), "Stub TitleWith Odd Chars.mp3");
        let bytes = axum::body::to_bytes(artifact.into_body().await?, usize::MAX).await?;
        assert_eq!(&bytes[..], b"media-bytes");
        assert!(root_is_empty(root.path()));
        Ok(())
    }
}
