//! Shapes raw extractor metadata into the listings served by the info and
//! formats endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::formats::Resolution;

/// Streaming-manifest origin whose URLs are useless as direct downloads.
pub const MANIFEST_ORIGIN: &str = "https://manifest.googlevideo.com/";

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Subset of a yt-dlp format entry read by the listings.
#[derive(Debug, Default, Deserialize)]
struct FormatEntry {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    #[serde(default)]
    filesize: Value,
    format: Option<String>,
    url: Option<String>,
    video_ext: Option<String>,
    acodec: Option<String>,
    format_note: Option<String>,
}

fn format_entries(info: &Value) -> impl Iterator<Item = FormatEntry> + '_ {
    info.get("formats")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| FormatEntry::deserialize(entry).ok())
}

/// One directly downloadable mp4 rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub resolution: String,
    pub is_audio: bool,
    pub download_url: String,
}

/// Direct mp4 renditions, one per resolution label, ascending. When a label
/// appears more than once the first rendition that carries audio wins.
pub fn allow_resolutions(info: &Value) -> Vec<ResolutionOption> {
    let mut options: Vec<ResolutionOption> = Vec::new();
    for entry in format_entries(info) {
        let (Some(url), Some(resolution)) = (entry.url, entry.format_note) else {
            continue;
        };
        if url.starts_with(MANIFEST_ORIGIN) || entry.video_ext.as_deref() != Some("mp4") {
            continue;
        }
        let is_audio = entry.acodec.as_deref() != Some("none");
        let candidate = ResolutionOption {
            resolution,
            is_audio,
            download_url: url,
        };
        match options
            .iter_mut()
            .find(|existing| existing.resolution == candidate.resolution)
        {
            Some(existing) => {
                if !existing.is_audio && candidate.is_audio {
                    *existing = candidate;
                }
            }
            None => options.push(candidate),
        }
    }
    options.sort_by_key(|option| resolution_rank(&option.resolution));
    options
}

/// Numeric height encoded in a label such as `720p` or `1080p60`; labels
/// without leading digits rank as zero.
pub fn resolution_rank(label: &str) -> u32 {
    let digits: String = label
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatSummary {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub filesize: Value,
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatListing {
    pub title: Option<String>,
    pub formats: Vec<FormatSummary>,
}

/// Every format the extractor reported, flattened.
pub fn format_listing(info: &Value) -> FormatListing {
    let formats = format_entries(info)
        .map(|entry| FormatSummary {
            format_id: entry.format_id,
            ext: entry.ext,
            resolution: entry.resolution,
            filesize: entry.filesize,
            format: entry.format,
        })
        .collect();
    FormatListing {
        title: info.get("title").and_then(Value::as_str).map(str::to_string),
        formats,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableResolutions {
    pub resolutions: Vec<&'static str>,
    pub default: &'static str,
}

pub fn available_resolutions() -> AvailableResolutions {
    AvailableResolutions {
        resolutions: Resolution::ALL.iter().map(|tier| tier.as_str()).collect(),
        default: Resolution::DEFAULT.as_str(),
    }
}
