//! Thumbnail tiers, image URLs and the passthrough fetch.

use std::io::Read;

use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::FetchError;

pub const DEFAULT_IMAGE_HOST: &str = "https://img.youtube.com";

/// Images larger than this are not proxied.
const MAX_THUMBNAIL_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailQuality {
    Default,
    High,
    Medium,
    Standard,
    Maxres,
}

impl ThumbnailQuality {
    pub const ALL: [Self; 5] = [
        Self::Default,
        Self::High,
        Self::Medium,
        Self::Standard,
        Self::Maxres,
    ];

    /// Unrecognized tokens fall back to `high`.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "default" => Self::Default,
            "medium" => Self::Medium,
            "standard" => Self::Standard,
            "maxres" => Self::Maxres,
            _ => Self::High,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Standard => "standard",
            Self::Maxres => "maxres",
        }
    }

    /// File name stem the image host uses for this tier.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::High => "hqdefault",
            Self::Medium => "mqdefault",
            Self::Standard => "sddefault",
            Self::Maxres => "maxresdefault",
        }
    }
}

pub fn thumbnail_url(image_host: &str, video_id: &str, quality: ThumbnailQuality) -> String {
    format!(
        "{}/vi/{}/{}.jpg",
        image_host.trim_end_matches('/'),
        video_id,
        quality.suffix()
    )
}

/// One URL per quality tier, keyed the way the page expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailSet {
    pub default: String,
    pub high: String,
    pub medium: String,
    pub standard: String,
    pub maxres: String,
}

impl ThumbnailSet {
    pub fn for_video(image_host: &str, video_id: &str) -> Self {
        let url = |quality| thumbnail_url(image_host, video_id, quality);
        Self {
            default: url(ThumbnailQuality::Default),
            high: url(ThumbnailQuality::High),
            medium: url(ThumbnailQuality::Medium),
            standard: url(ThumbnailQuality::Standard),
            maxres: url(ThumbnailQuality::Maxres),
        }
    }
}

/// Recovers the id from an image URL of the form `…/vi/<id>/<tier>.jpg`.
pub fn video_id_from_thumbnail_url(input: &str) -> Option<String> {
    let parsed = Url::parse(input).ok()?;
    let mut segments = parsed.path_segments()?;
    match (segments.next(), segments.next(), segments.next()) {
        (Some("vi"), Some(id), Some(_)) if !id.is_empty() => Some(id.to_owned()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct ThumbnailImage {
    pub bytes: Vec<u8>,
    pub filename: String,
}

/// Fetches one tier synchronously. Any non-success status is terminal.
pub fn fetch_thumbnail(
    image_host: &str,
    video_id: &str,
    quality: ThumbnailQuality,
) -> Result<ThumbnailImage, FetchError> {
    let url = thumbnail_url(image_host, video_id, quality);
    debug!(%url, "fetching thumbnail");

    let response = ureq::get(&url).call().map_err(|err| match err {
        ureq::Error::Status(code, _) => {
            FetchError::Extraction(format!("thumbnail {url} returned status {code}"))
        }
        other => FetchError::Extraction(format!("fetching thumbnail {url}: {other}")),
    })?;

    let bytes = read_capped(response.into_reader(), MAX_THUMBNAIL_BYTES)
        .map_err(|err| FetchError::Extraction(format!("reading thumbnail {url}: {err}")))?
        .ok_or_else(|| {
            FetchError::Extraction(format!(
                "thumbnail {url} exceeds {MAX_THUMBNAIL_BYTES} bytes"
            ))
        })?;

    Ok(ThumbnailImage {
        bytes,
        filename: format!("{}_{}.jpg", video_id, quality.suffix()),
    })
}

/// Reads at most `limit` bytes; `None` when the source has more.
fn read_capped(reader: impl Read, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut bytes = Vec::new();
    reader.take(limit + 1).read_to_end(&mut bytes)?;
    Ok((bytes.len() as u64 <= limit).then_some(bytes))
}
