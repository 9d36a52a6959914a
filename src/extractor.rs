//! Thin wrapper around the `yt-dlp` executable.
//!
//! Downloads run with `--newline` and custom progress templates so every hook
//! invocation prints as one tagged JSON line. With `--print` active yt-dlp
//! writes those lines to stderr, while the result line goes to stdout, so both
//! streams are read and merged before parsing into [`ExtractorEvent`]s.

use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    error::{DownloadError, MetadataError},
    formats::{ExtractionPlan, PostProcess},
    progress::RawProgress,
};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

const PROGRESS_MARKER: &str = "[progress] ";
const POSTPROCESS_MARKER: &str = "[postprocess] ";
const RESULT_MARKER: &str = "[result] ";

const DOWNLOAD_TEMPLATE: &str = "download:[progress] %(progress.{status,downloaded_bytes,total_bytes,total_bytes_estimate,speed,eta,filename})j";
const POSTPROCESS_TEMPLATE: &str = "postprocess:[postprocess] %(progress.{status,postprocessor})j";
const RESULT_TEMPLATE: &str = "after_move:[result] %(.{id,title,ext})j";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Post-processors that actually run the transcoder.
const TRANSCODING_POSTPROCESSORS: &[&str] = &[
    "Merger",
    "ExtractAudio",
    "VideoConvertor",
    "VideoRemuxer",
];

const STDERR_TAIL_LINES: usize = 5;

/// Hook notification emitted by a running post-processor.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PostProcessEvent {
    #[serde(default)]
    pub status: String,
    pub postprocessor: Option<String>,
}

impl PostProcessEvent {
    /// True when the transcoder starts working on the downloaded streams.
    pub fn starts_transcoding(&self) -> bool {
        self.status == "started"
            && self
                .postprocessor
                .as_deref()
                .is_some_and(|name| TRANSCODING_POSTPROCESSORS.contains(&name))
    }
}

/// Final descriptor printed once the output file is in place.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ExtractedInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ExtractorEvent {
    Progress(RawProgress),
    PostProcess(PostProcessEvent),
    Finished(ExtractedInfo),
}

/// Parses one output line. Lines without a known marker are ignored.
pub fn parse_event(line: &str) -> Option<ExtractorEvent> {
    let line = line.trim_start();
    if let Some(payload) = line.strip_prefix(PROGRESS_MARKER) {
        return serde_json::from_str(payload.trim())
            .ok()
            .map(ExtractorEvent::Progress);
    }
    if let Some(payload) = line.strip_prefix(POSTPROCESS_MARKER) {
        return serde_json::from_str(payload.trim())
            .ok()
            .map(ExtractorEvent::PostProcess);
    }
    if let Some(payload) = line.strip_prefix(RESULT_MARKER) {
        return serde_json::from_str(payload.trim())
            .ok()
            .map(ExtractorEvent::Finished);
    }
    None
}

/// Shares a running extractor process between the worker that drives it and
/// the task that may have to abandon it.
#[derive(Debug, Default)]
pub struct ProcessSlot {
    child: Mutex<Option<Child>>,
    cancelled: AtomicBool,
}

impl ProcessSlot {
    /// Parks `child` in the slot. A child arriving after cancellation is
    /// killed on the spot.
    fn install(&self, mut child: Child) -> Result<(), DownloadError> {
        // `kill` raises the flag before it takes the lock, so checking under
        // the lock either sees the flag or leaves the child for `kill` to find.
        let mut slot = self.child.lock();
        if self.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DownloadError::Extraction("download cancelled".to_string()));
        }
        *slot = Some(child);
        Ok(())
    }

    fn take(&self) -> Option<Child> {
        self.child.lock().take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Best-effort kill of the running process.
    pub fn kill(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().as_mut() {
            match child.kill() {
                Ok(()) => debug!(pid = child.id(), "killed extractor process"),
                Err(err) => warn!(pid = child.id(), error = %err, "failed to kill extractor process"),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    binary: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_BIN)
    }
}

impl Extractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg_location: None,
        }
    }

    pub fn with_ffmpeg_location(mut self, location: Option<PathBuf>) -> Self {
        self.ffmpeg_location = location;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        if let Some(location) = &self.ffmpeg_location {
            command.arg("--ffmpeg-location").arg(location);
        }
        command
    }

    /// Runs `yt-dlp --dump-single-json` for `url` and returns the raw
    /// metadata. Blocking.
    pub fn fetch_info(&self, url: &str) -> Result<Value, MetadataError> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| MetadataError::Launch {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(MetadataError::Extractor {
                status: output.status.to_string(),
                stderr: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Arguments for a download of `url` into `workdir` following `plan`.
    pub fn download_args(&self, plan: &ExtractionPlan, url: &str, workdir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--newline",
            "--progress",
            "--no-simulate",
            "--no-warnings",
            "--no-playlist",
            "--progress-template",
            DOWNLOAD_TEMPLATE,
            "--progress-template",
            POSTPROCESS_TEMPLATE,
            "--print",
            RESULT_TEMPLATE,
            "--format",
            plan.selector.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.push("--output".into());
        args.push(workdir.join(OUTPUT_TEMPLATE).into_os_string());

        match &plan.post_process {
            PostProcess::ExtractAudio { codec, quality } => {
                args.extend(
                    ["--extract-audio", "--audio-format", *codec, "--audio-quality", *quality]
                        .into_iter()
                        .map(OsString::from),
                );
            }
            PostProcess::Merge {
                container,
                ffmpeg_args,
            } => {
                args.extend(
                    [
                        "--merge-output-format",
                        *container,
                        "--postprocessor-args",
                        *ffmpeg_args,
                    ]
                    .into_iter()
                    .map(OsString::from),
                );
            }
        }

        args.push("--".into());
        args.push(url.into());
        args
    }

    /// Downloads and transcodes `url` into `workdir`, reporting every hook
    /// line through `on_event`. Blocking; run it on a worker thread.
    pub fn download(
        &self,
        plan: &ExtractionPlan,
        url: &str,
        workdir: &Path,
        slot: &ProcessSlot,
        mut on_event: impl FnMut(ExtractorEvent),
    ) -> Result<ExtractedInfo, DownloadError> {
        let mut child = self
            .command()
            .args(self.download_args(plan, url, workdir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                DownloadError::Extraction(format!(
                    "failed to launch {}: {err}",
                    self.binary.display()
                ))
            })?;

        let (sender, lines) = mpsc::channel();
        let readers = [
            spawn_line_reader(child.stdout.take(), OutputStream::Stdout, sender.clone()),
            spawn_line_reader(child.stderr.take(), OutputStream::Stderr, sender),
        ];
        slot.install(child)?;

        let mut info = ExtractedInfo::default();
        let mut stderr = String::new();
        for (stream, line) in lines {
            match parse_event(&line) {
                Some(ExtractorEvent::Finished(finished)) => {
                    info = finished.clone();
                    on_event(ExtractorEvent::Finished(finished));
                }
                Some(event) => on_event(event),
                None if stream == OutputStream::Stderr => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                None => trace!(line = %line, "ignoring extractor output"),
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = wait_for_exit(slot)?;

        if slot.is_cancelled() {
            return Err(DownloadError::Extraction("download cancelled".to_string()));
        }
        if !status.success() {
            let detail = stderr_tail(&stderr);
            return Err(DownloadError::Extraction(if detail.is_empty() {
                format!("{} exited with {status}", self.binary.display())
            } else {
                detail
            }));
        }
        Ok(info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forwards every line of `source` into `sender` from its own thread, so
/// neither pipe can fill up while the other is being read.
fn spawn_line_reader<R: Read + Send + 'static>(
    source: Option<R>,
    stream: OutputStream,
    sender: mpsc::Sender<(OutputStream, String)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let Some(source) = source else {
            return;
        };
        for line in BufReader::new(source).lines() {
            match line {
                Ok(line) => {
                    if sender.send((stream, line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(?stream, error = %err, "failed to read extractor output");
                    break;
                }
            }
        }
    })
}

fn wait_for_exit(slot: &ProcessSlot) -> Result<ExitStatus, DownloadError> {
    let Some(mut child) = slot.take() else {
        return Err(DownloadError::Extraction(
            "extractor process vanished".to_string(),
        ));
    };
    child
        .wait()
        .map_err(|err| DownloadError::Extraction(format!("waiting for extractor: {err}")))
}

/// Last few non-empty stderr lines, which is where yt-dlp puts its `ERROR:`.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
