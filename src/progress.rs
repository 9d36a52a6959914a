//! Turns the extractor's raw progress samples into the records pushed to
//! clients.
//!
//! A muxed job downloads two sub-streams back to back, so the displayed
//! percentage is split into bands: video fills 0-50, audio fills 50-99 and the
//! last point is left for packaging. Audio-only jobs fill 0-50 and leave the
//! upper half to the mp3 conversion that follows.

use serde::{Deserialize, Serialize};

pub const STATUS_DOWNLOADING: &str = "downloading";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_FINISHED: &str = "finished";

pub const PHASE_VIDEO: &str = "video";
pub const PHASE_AUDIO: &str = "audio";
pub const PHASE_AUDIO_ONLY: &str = "downloading audio";
pub const PHASE_CONVERTING: &str = "converting";
pub const PHASE_COMPLETED: &str = "completed";

const AUDIO_STREAM_HINT: &str = ".m4a";
const MUXED_AUDIO_CAP: f64 = 99.0;
const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// One progress sample as reported by the extractor's download hook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProgress {
    #[serde(default)]
    pub status: String,
    pub downloaded_bytes: Option<f64>,
    pub total_bytes: Option<f64>,
    pub total_bytes_estimate: Option<f64>,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
    pub filename: Option<String>,
}

impl RawProgress {
    /// Exact size when known, otherwise the extractor's estimate.
    fn total(&self) -> Option<f64> {
        positive(self.total_bytes).or_else(|| positive(self.total_bytes_estimate))
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite() && *value > 0.0)
}

/// Which sub-stream of a muxed job a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStream {
    Video,
    Audio,
}

impl SubStream {
    pub fn classify(filename: Option<&str>) -> Self {
        match filename {
            Some(name) if name.to_lowercase().contains(AUDIO_STREAM_HINT) => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Payload sent over a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub progress: f64,
    /// Megabytes per second.
    pub speed: f64,
    /// Seconds remaining.
    pub eta: u64,
    pub status: String,
    pub phase: String,
}

impl ProgressRecord {
    pub fn stage(progress: f64, status: &str, phase: &str) -> Self {
        Self {
            progress,
            speed: 0.0,
            eta: 0,
            status: status.to_string(),
            phase: phase.to_string(),
        }
    }

    /// Emitted once the transcoder takes over from the downloader.
    pub fn converting(audio_only: bool) -> Self {
        let progress = if audio_only { 50.0 } else { MUXED_AUDIO_CAP };
        Self::stage(progress, STATUS_PROCESSING, PHASE_CONVERTING)
    }

    pub fn completed() -> Self {
        Self::stage(100.0, STATUS_FINISHED, PHASE_COMPLETED)
    }
}

/// Maps a raw sample onto the displayed range. Samples that are not active
/// transfers or that carry no size information yield `None`.
pub fn normalize(sample: &RawProgress, audio_only: bool) -> Option<ProgressRecord> {
    if sample.status != STATUS_DOWNLOADING {
        return None;
    }
    let total = sample.total()?;
    let downloaded = sample.downloaded_bytes.unwrap_or(0.0).max(0.0);
    let percent = (downloaded / total * 100.0).clamp(0.0, 100.0);

    let (progress, phase) = if audio_only {
        (percent * 0.5, PHASE_AUDIO_ONLY)
    } else {
        match SubStream::classify(sample.filename.as_deref()) {
            SubStream::Video => (percent / 2.0, PHASE_VIDEO),
            SubStream::Audio => ((50.0 + percent / 2.0).min(MUXED_AUDIO_CAP), PHASE_AUDIO),
        }
    };

    let speed = sample.speed.unwrap_or(0.0).max(0.0) / BYTES_PER_MEGABYTE;
    let eta = sample
        .eta
        .filter(|eta| eta.is_finite() && *eta > 0.0)
        .map(|eta| eta.round() as u64)
        .unwrap_or(0);

    Some(ProgressRecord {
        progress: round_tenth(progress),
        speed: round_tenth(speed),
        eta,
        status: STATUS_DOWNLOADING.to_string(),
        phase: phase.to_string(),
    })
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
