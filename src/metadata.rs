//! Video metadata as reported by the extractor and as shown to users.
//!
//! [`VideoInfo`] and [`FormatInfo`] mirror the subset of yt-dlp's JSON that we
//! read. Everything is optional because older or restricted videos routinely
//! lack fields. [`VideoMetadata`] is the normalized, display-ready form that
//! `/get_video_info` returns.

use std::cmp::Reverse;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::FetchError;
use crate::extractor::Extractor;
use crate::thumbnail::ThumbnailSet;
use crate::video_url::VideoReference;

pub const MAX_VIDEO_RENDITIONS: usize = 8;
pub const MAX_AUDIO_RENDITIONS: usize = 5;
pub const DESCRIPTION_EXCERPT_CHARS: usize = 200;
pub const UNKNOWN: &str = "Unknown";

/// Full `yt-dlp --dump-single-json` payload, reduced to what we use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fulltitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
}

impl FormatInfo {
    fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    fn size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// yt-dlp marks a missing stream with the literal codec `none`.
fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|value| !value.is_empty() && !value.eq_ignore_ascii_case("none"))
}

/// One downloadable option offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rendition {
    pub format_id: String,
    pub label: String,
    pub resolution: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_mb: Option<f64>,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub author: String,
    pub duration: u64,
    pub duration_str: String,
    pub views: u64,
    pub publish_date: String,
    pub description: String,
    pub thumbnails: ThumbnailSet,
    pub video_streams: Vec<Rendition>,
    pub audio_streams: Vec<Rendition>,
}

/// Validates `raw_url`, asks the extractor for the record and normalizes it.
///
/// Extractor failures are logged here with their full detail; the returned
/// error only carries what the HTTP layer needs.
pub fn fetch_video_metadata(
    extractor: &dyn Extractor,
    raw_url: &str,
    image_host: &str,
) -> Result<VideoMetadata, FetchError> {
    let reference = VideoReference::parse(raw_url)?;
    let thumbnails = ThumbnailSet::for_video(image_host, &reference.video_id);

    debug!(video_id = %reference.video_id, "fetching metadata");
    let info = extractor.fetch_info(&reference.url).map_err(|err| {
        error!(url = %reference.url, "metadata extraction failed: {err}");
        FetchError::from(err)
    })?;

    Ok(build_video_metadata(&reference.video_id, &info, thumbnails))
}

/// Turns the raw record into the display structure.
pub fn build_video_metadata(
    video_id: &str,
    info: &VideoInfo,
    thumbnails: ThumbnailSet,
) -> VideoMetadata {
    let title = info
        .title
        .as_deref()
        .or(info.fulltitle.as_deref())
        .filter(|t| !t.is_empty())
        .unwrap_or(video_id);

    let author = info
        .uploader
        .as_deref()
        .or(info.channel.as_deref())
        .filter(|a| !a.is_empty())
        .unwrap_or(UNKNOWN);

    let duration = info
        .duration
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| secs as u64)
        .unwrap_or(0);

    let (video_streams, audio_streams) = select_renditions(&info.formats);

    VideoMetadata {
        video_id: video_id.to_owned(),
        title: title.to_owned(),
        author: author.to_owned(),
        duration,
        duration_str: format_duration(duration),
        views: info.view_count.unwrap_or(0),
        publish_date: info
            .upload_date
            .as_deref()
            .and_then(format_upload_date)
            .unwrap_or_else(|| UNKNOWN.to_owned()),
        description: description_excerpt(info.description.as_deref()),
        thumbnails,
        video_streams,
        audio_streams,
    }
}

/// Splits formats into video and audio-only groups, best first, capped.
pub fn select_renditions(formats: &[FormatInfo]) -> (Vec<Rendition>, Vec<Rendition>) {
    let mut video: Vec<&FormatInfo> = formats.iter().filter(|f| f.has_video()).collect();
    let mut audio: Vec<&FormatInfo> = formats
        .iter()
        .filter(|f| !f.has_video() && f.has_audio())
        .collect();

    video.sort_by_key(|f| Reverse(f.height.unwrap_or(0)));
    audio.sort_by(|a, b| b.abr.unwrap_or(0.0).total_cmp(&a.abr.unwrap_or(0.0)));

    let video = video
        .into_iter()
        .filter_map(video_rendition)
        .take(MAX_VIDEO_RENDITIONS)
        .collect();
    let audio = audio
        .into_iter()
        .filter_map(audio_rendition)
        .take(MAX_AUDIO_RENDITIONS)
        .collect();
    (video, audio)
}

fn video_rendition(format: &FormatInfo) -> Option<Rendition> {
    let format_id = format.format_id.as_deref()?.trim();
    if format_id.is_empty() {
        return None;
    }
    let label = format
        .format_note
        .clone()
        .filter(|note| !note.is_empty())
        .or_else(|| video_quality_label(format.height, format.fps))
        .unwrap_or_else(|| UNKNOWN.to_owned());

    Some(Rendition {
        format_id: format_id.to_owned(),
        label,
        resolution: format
            .height
            .map(|h| h.to_string())
            .unwrap_or_else(|| UNKNOWN.to_owned()),
        ext: format.ext.clone().unwrap_or_else(|| "mp4".to_owned()),
        fps: format.fps,
        abr: None,
        filesize: format.size(),
        filesize_mb: format.size().map(bytes_to_mb),
        has_audio: format.has_audio(),
    })
}

fn audio_rendition(format: &FormatInfo) -> Option<Rendition> {
    let format_id = format.format_id.as_deref()?.trim();
    if format_id.is_empty() {
        return None;
    }
    let label = match format.abr {
        Some(abr) if abr > 0.0 => format!("{} kbps", abr.round() as u64),
        _ => format
            .format_note
            .clone()
            .filter(|note| !note.is_empty())
            .unwrap_or_else(|| "audio".to_owned()),
    };

    Some(Rendition {
        format_id: format_id.to_owned(),
        label,
        resolution: "audio only".to_owned(),
        ext: format.ext.clone().unwrap_or_else(|| "m4a".to_owned()),
        fps: None,
        abr: format.abr,
        filesize: format.size(),
        filesize_mb: format.size().map(bytes_to_mb),
        has_audio: true,
    })
}

/// Creates a label such as `1080p` or `720p60`.
fn video_quality_label(height: Option<u32>, fps: Option<f64>) -> Option<String> {
    let height = height?;
    match fps {
        Some(fps) if fps > 30.0 => Some(format!("{height}p{}", fps.round() as u32)),
        _ => Some(format!("{height}p")),
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// Renders durations as `M:SS`; minutes are not folded into hours.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return UNKNOWN.to_owned();
    }
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Converts yt-dlp's `YYYYMMDD` upload date into `YYYY-MM-DD`.
fn format_upload_date(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

pub fn description_excerpt(description: Option<&str>) -> String {
    match description {
        Some(text) if !text.is_empty() => {
            let mut excerpt: String = text.chars().take(DESCRIPTION_EXCERPT_CHARS).collect();
            excerpt.push_str("...");
            excerpt
        }
        _ => String::new(),
    }
}
