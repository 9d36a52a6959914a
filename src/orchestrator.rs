//! Runs one download job per request: builds the extractor plan, drives the
//! blocking extractor on a worker thread under a deadline, and classifies the
//! outcome.
//!
//! Job lifecycle:
//!
//! ```text
//! Initializing -> Downloading -> (Transcoding) -> Completed | TimedOut | Failed
//! ```
//!
//! Every terminal state other than `Completed` removes the working directory
//! before returning. A completed job hands the directory to the caller inside
//! [`CompletedDownload`], which removes it when dropped.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    error::DownloadError,
    extractor::{Extractor, ExtractorEvent, ProcessSlot},
    formats::{ExtractionPlan, MediaFormat, Resolution},
    progress::{ProgressRecord, normalize},
    sessions::SessionRegistry,
    workdir::WorkDir,
};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TITLE: &str = "video";

/// Body of `POST /youtube-download/{session_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub resolution: String,
    pub format: MediaFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Downloading,
    Transcoding,
    Completed,
    TimedOut,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Downloading => "downloading",
            Self::Transcoding => "transcoding",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished job whose output is ready to be packaged.
#[derive(Debug)]
pub struct CompletedDownload {
    pub workdir: WorkDir,
    pub output: PathBuf,
    pub title: String,
    pub format: MediaFormat,
    pub resolution: Resolution,
}

/// Forwards extractor events from the worker thread to the session channel.
struct ProgressReporter {
    sessions: Arc<SessionRegistry>,
    session_id: String,
    audio_only: bool,
    transcoding: bool,
}

impl ProgressReporter {
    fn handle(&mut self, event: ExtractorEvent) {
        match event {
            ExtractorEvent::Progress(raw) => {
                if let Some(record) = normalize(&raw, self.audio_only) {
                    self.sessions.publish(&self.session_id, &record);
                }
            }
            ExtractorEvent::PostProcess(pp) if pp.starts_transcoding() && !self.transcoding => {
                self.transcoding = true;
                info!(
                    session_id = %self.session_id,
                    state = %JobState::Transcoding,
                    postprocessor = pp.postprocessor.as_deref().unwrap_or_default(),
                    "job state changed"
                );
                self.sessions
                    .publish_final(&self.session_id, &ProgressRecord::converting(self.audio_only));
            }
            ExtractorEvent::PostProcess(_) => {}
            ExtractorEvent::Finished(info) => {
                debug!(session_id = %self.session_id, id = ?info.id, "extractor reported result");
            }
        }
    }
}

pub struct Orchestrator {
    extractor: Extractor,
    sessions: Arc<SessionRegistry>,
    timeout: Duration,
    temp_root: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(extractor: Extractor, sessions: Arc<SessionRegistry>, timeout: Duration) -> Self {
        Self {
            extractor,
            sessions,
            timeout,
            temp_root: None,
        }
    }

    /// Parent directory for job working directories. Defaults to the system
    /// temp dir.
    pub fn with_temp_root(mut self, temp_root: Option<PathBuf>) -> Self {
        self.temp_root = temp_root;
        self
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Downloads `request.url`, streaming progress to `session_id` if that
    /// session has a live channel.
    pub async fn run(
        &self,
        session_id: &str,
        request: DownloadRequest,
    ) -> Result<CompletedDownload, DownloadError> {
        let resolution = Resolution::parse_or_default(&request.resolution);
        let plan = ExtractionPlan::new(request.format, resolution);
        info!(
            session_id,
            url = %request.url,
            format = plan.format.extension(),
            %resolution,
            state = %JobState::Initializing,
            "job state changed"
        );

        let workdir = WorkDir::create(self.temp_root.as_deref()).map_err(|err| {
            error!(session_id, error = %err, state = %JobState::Failed, "could not create working directory");
            DownloadError::Extraction(format!("failed to create working directory: {err}"))
        })?;

        let slot = Arc::new(ProcessSlot::default());
        let mut reporter = ProgressReporter {
            sessions: self.sessions.clone(),
            session_id: session_id.to_string(),
            audio_only: plan.audio_only(),
            transcoding: false,
        };
        let worker = {
            let extractor = self.extractor.clone();
            let slot = slot.clone();
            let plan = plan.clone();
            let url = request.url.clone();
            let dir = workdir.path().to_path_buf();
            tokio::task::spawn_blocking(move || {
                extractor.download(&plan, &url, &dir, &slot, |event| reporter.handle(event))
            })
        };
        info!(session_id, state = %JobState::Downloading, "job state changed");

        let outcome = match tokio::time::timeout(self.timeout, worker).await {
            Err(_) => {
                slot.kill();
                warn!(
                    session_id,
                    timeout_secs = self.timeout.as_secs(),
                    state = %JobState::TimedOut,
                    "download exceeded deadline"
                );
                workdir.cleanup().await;
                return Err(DownloadError::Timeout(self.timeout));
            }
            Ok(Err(join_err)) => Err(DownloadError::Extraction(format!(
                "download worker failed: {join_err}"
            ))),
            Ok(Ok(result)) => result,
        };

        let info = match outcome {
            Ok(info) => info,
            Err(err) => {
                error!(session_id, error = %err, state = %JobState::Failed, "download failed");
                workdir.cleanup().await;
                return Err(err);
            }
        };

        let extension = plan.format.extension();
        let Some(output) = find_output(workdir.path(), extension) else {
            error!(session_id, extension, state = %JobState::Failed, "download produced no output file");
            workdir.cleanup().await;
            return Err(DownloadError::IncompleteOutput { extension });
        };

        self.sessions
            .publish_final(session_id, &ProgressRecord::completed());
        info!(
            session_id,
            output = %output.display(),
            state = %JobState::Completed,
            "job state changed"
        );

        let title = info
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        Ok(CompletedDownload {
            workdir,
            output,
            title,
            format: plan.format,
            resolution,
        })
    }
}

/// First file directly inside `dir` with the given extension, by name.
pub fn find_output(dir: &Path, extension: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
}
