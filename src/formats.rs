//! Resolution tiers and output formats offered to clients, plus the mapping
//! from a client's choice onto the extractor's format selector.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ceiling a client can pick for a muxed video download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    R360,
    R480,
    R720,
    R1080,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [Self::R360, Self::R480, Self::R720, Self::R1080];
    pub const DEFAULT: Resolution = Self::R360;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::R360 => "360p",
            Self::R480 => "480p",
            Self::R720 => "720p",
            Self::R1080 => "1080p",
        }
    }

    pub fn height(self) -> u32 {
        match self {
            Self::R360 => 360,
            Self::R480 => 480,
            Self::R720 => 720,
            Self::R1080 => 1080,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|tier| tier.as_str() == value)
    }

    /// Unknown labels quietly map to the lowest tier instead of failing the
    /// request.
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::DEFAULT)
    }

    /// Ordered format constraints, most preferred first: split avc1/m4a
    /// streams, then a pre-muxed avc1 file, then any mp4 under the ceiling.
    pub fn fallback_chain(self) -> Vec<String> {
        let height = self.height();
        vec![
            format!("bestvideo[height<={height}][ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]"),
            format!("best[height<={height}][ext=mp4][vcodec^=avc1]"),
            format!("best[height<={height}][ext=mp4]"),
        ]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container the client wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp4,
    Mp3,
}

impl MediaFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3)
    }

    pub fn mime_type(self) -> String {
        mime_guess::from_ext(self.extension())
            .first_or_octet_stream()
            .to_string()
    }
}

const AUDIO_SELECTOR: &str = "bestaudio[ext=m4a]/best";
const AUDIO_CODEC: &str = "mp3";
const AUDIO_QUALITY: &str = "192K";
const REMUX_ARGS: &str = "ffmpeg:-c:v copy -c:a copy -movflags +faststart";

/// What the extractor should fetch and how the transcoder finishes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub format: MediaFormat,
    pub resolution: Resolution,
    pub selector: String,
    pub post_process: PostProcess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    /// Re-encode the downloaded audio stream into `codec`.
    ExtractAudio {
        codec: &'static str,
        quality: &'static str,
    },
    /// Mux video and audio into `container` without re-encoding.
    Merge {
        container: &'static str,
        ffmpeg_args: &'static str,
    },
}

impl ExtractionPlan {
    pub fn new(format: MediaFormat, resolution: Resolution) -> Self {
        match format {
            MediaFormat::Mp3 => Self {
                format,
                resolution,
                selector: AUDIO_SELECTOR.to_string(),
                post_process: PostProcess::ExtractAudio {
                    codec: AUDIO_CODEC,
                    quality: AUDIO_QUALITY,
                },
            },
            MediaFormat::Mp4 => Self {
                format,
                resolution,
                selector: resolution.fallback_chain().join("/"),
                post_process: PostProcess::Merge {
                    container: "mp4",
                    ffmpeg_args: REMUX_ARGS,
                },
            },
        }
    }

    pub fn audio_only(&self) -> bool {
        self.format.is_audio_only()
    }
}
