//! Recognizes video-hosting URLs and pulls the video id out of them.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::{FetchError, MSG_INVALID_URL, MSG_MISSING_URL, MSG_NO_VIDEO_ID};

const SHORT_HOST: &str = "youtu.be";

static VIDEO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%\?]{11})",
    )
    .unwrap()
});

/// Returns whether `input` looks like a link to a single video. Only the
/// prefix has to match; anything after the 11-character id is ignored.
pub fn is_valid_video_url(input: &str) -> bool {
    VIDEO_URL_RE.is_match(input)
}

/// Derives the video id from `input`, or `None` when the host or path shape
/// is not one we know. Never panics on malformed input.
pub fn extract_video_id(input: &str) -> Option<String> {
    if input.contains(SHORT_HOST) {
        let last = input.rsplit('/').next().unwrap_or_default();
        let id = last.split('?').next().unwrap_or_default();
        return Some(id.to_owned());
    }

    let parsed = Url::parse(input).ok()?;
    let host = parsed.host_str()?;
    let path = parsed.path();

    match host {
        "youtu.be" | "www.youtu.be" => Some(path.trim_start_matches('/').to_owned()),
        "youtube.com" | "www.youtube.com" => {
            if path == "/watch" {
                return parsed
                    .query_pairs()
                    .find(|(key, value)| key == "v" && !value.is_empty())
                    .map(|(_, value)| value.into_owned());
            }
            if path.starts_with("/embed/") || path.starts_with("/v/") {
                return path.split('/').nth(2).map(str::to_owned);
            }
            None
        }
        _ => None,
    }
}

/// A user-supplied URL together with the id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReference {
    pub url: String,
    pub video_id: String,
}

impl VideoReference {
    /// Validates `raw` and extracts its id, producing the user-facing input
    /// error for each way that can fail. Ids with anything beyond
    /// `[A-Za-z0-9_-]` are rejected even when the URL prefix matched.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let url = raw.trim();
        if url.is_empty() {
            return Err(FetchError::input(MSG_MISSING_URL));
        }
        if !is_valid_video_url(url) {
            return Err(FetchError::input(MSG_INVALID_URL));
        }
        let video_id = extract_video_id(url).ok_or_else(|| FetchError::input(MSG_NO_VIDEO_ID))?;
        // The id ends up in output paths and image URLs.
        if !is_safe_video_id(&video_id) {
            return Err(FetchError::input(MSG_INVALID_URL));
        }
        Ok(Self {
            url: url.to_owned(),
            video_id,
        })
    }
}

/// Ids are interpolated into image URLs and file names, so only the
/// characters the host actually uses are accepted.
pub fn is_safe_video_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
