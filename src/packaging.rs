//! Names the finished file and streams it back to the client.
//!
//! The working directory travels inside the response body stream, so it is
//! removed only once hyper drops the body: after the last byte was written or
//! when the client went away mid-transfer.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::{
    error::DownloadError,
    formats::{MediaFormat, Resolution},
    orchestrator::{CompletedDownload, DEFAULT_TITLE},
    workdir::WorkDir,
};

const SAFE_PUNCTUATION: &[char] = &['-', '_'];
const AUDIO_TAG: &str = "audio";

/// Keeps letters, digits, `-` and `_` from `title`.
pub fn safe_title(title: &str) -> String {
    title_or_default(
        title
            .chars()
            .filter(|c| c.is_alphanumeric() || SAFE_PUNCTUATION.contains(c))
            .collect(),
    )
}

/// Like [`safe_title`] but ASCII only, for the plain `filename` parameter.
fn ascii_title(title: &str) -> String {
    title_or_default(
        title
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || SAFE_PUNCTUATION.contains(c))
            .collect(),
    )
}

fn title_or_default(safe: String) -> String {
    if safe.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        safe
    }
}

fn tagged_name(stem: &str, format: MediaFormat, resolution: Resolution) -> String {
    let tag = match format {
        MediaFormat::Mp4 => resolution.as_str(),
        MediaFormat::Mp3 => AUDIO_TAG,
    };
    format!("{stem}_{tag}.{}", format.extension())
}

/// `<safe title>_<resolution>.mp4` or `<safe title>_audio.mp3`.
pub fn output_filename(title: &str, format: MediaFormat, resolution: Resolution) -> String {
    tagged_name(&safe_title(title), format, resolution)
}

/// Attachment header carrying an ASCII name for old clients and the original
/// title, percent-encoded, for everyone else.
pub fn content_disposition(title: &str, format: MediaFormat, resolution: Resolution) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}.{}",
        tagged_name(&ascii_title(title), format, resolution),
        urlencoding::encode(title),
        format.extension()
    )
}

/// Byte stream that owns the job's working directory until it is dropped.
struct WorkDirStream<S> {
    inner: S,
    _workdir: WorkDir,
}

impl<S: Stream + Unpin> Stream for WorkDirStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Builds the file response for a completed job. On error the working
/// directory is removed as `download` is dropped.
pub async fn into_response(download: CompletedDownload) -> Result<Response, DownloadError> {
    let CompletedDownload {
        workdir,
        output,
        title,
        format,
        resolution,
    } = download;

    let safe_name = output_filename(&title, format, resolution);
    let safe_path = workdir.path().join(&safe_name);
    if safe_path != output {
        tokio::fs::copy(&output, &safe_path)
            .await
            .map_err(|err| DownloadError::Extraction(format!("failed to stage output: {err}")))?;
    }

    let file = File::open(&safe_path)
        .await
        .map_err(|err| DownloadError::Extraction(format!("failed to open output: {err}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| DownloadError::Extraction(format!("failed to open output: {err}")))?
        .len();

    info!(file = %safe_name, size, "streaming download");
    let stream = WorkDirStream {
        inner: ReaderStream::new(file),
        _workdir: workdir,
    };
    let mut response = Body::from_stream(stream).into_response();

    let headers = response.headers_mut();
    let content_type = HeaderValue::from_str(&format.mime_type())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    let disposition = HeaderValue::from_str(&content_disposition(&title, format, resolution))
        .map_err(|err| DownloadError::Extraction(format!("invalid file name header: {err}")))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok(response)
}
