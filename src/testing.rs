//! Test helpers: a shell script standing in for `yt-dlp`.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const STUB_TITLE: &str = "Stub Title: Part 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    /// Emits progress for a video and an audio stream, then writes the output.
    Success,
    /// Never finishes on its own.
    Hang,
    /// Exits non-zero with a yt-dlp style error.
    Fail,
    /// Exits cleanly without producing a file.
    NoOutput,
}

const STUB_HEADER: &str = r#"#!/usr/bin/env bash
set -eu
output=""
ext="mp4"
info=0
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
    --audio-format|--merge-output-format)
      shift
      ext="$1"
      ;;
    --dump-single-json)
      info=1
      ;;
  esac
  shift
done
"#;

const INFO_JSON: &str = r#"{
  "id": "abc123",
  "title": "Stub Title: Part 1",
  "formats": [
    {"format_id": "140", "ext": "m4a", "resolution": "audio only", "filesize": 2048, "format": "140 - audio only", "url": "https://rr1.googlevideo.com/140", "video_ext": "none", "acodec": "mp4a.40.2", "format_note": "medium"},
    {"format_id": "136", "ext": "mp4", "resolution": "1280x720", "filesize": 9000, "format": "136 - 1280x720 (720p)", "url": "https://rr1.googlevideo.com/136", "video_ext": "mp4", "acodec": "none", "format_note": "720p"},
    {"format_id": "22", "ext": "mp4", "resolution": "1280x720", "filesize": null, "format": "22 - 1280x720 (720p)", "url": "https://rr1.googlevideo.com/22", "video_ext": "mp4", "acodec": "mp4a.40.2", "format_note": "720p"},
    {"format_id": "18", "ext": "mp4", "resolution": "640x360", "filesize": 4000, "format": "18 - 640x360 (360p)", "url": "https://rr1.googlevideo.com/18", "video_ext": "mp4", "acodec": "mp4a.40.2", "format_note": "360p"},
    {"format_id": "95", "ext": "mp4", "resolution": "1280x720", "format": "95 - 1280x720", "url": "https://manifest.googlevideo.com/api/95", "video_ext": "mp4", "acodec": "mp4a.40.2", "format_note": "480p"},
    {"format_id": "248", "ext": "webm", "resolution": "1920x1080", "format": "248 - 1920x1080 (1080p)", "url": "https://rr1.googlevideo.com/248", "video_ext": "webm", "acodec": "none", "format_note": "1080p"}
  ]
}"#;

// Hook lines go to stderr, the way yt-dlp routes them once `--print` is set.
const SUCCESS_BODY: &str = r#"
if [[ $info -eq 1 ]]; then
  cat <<'JSON'
__INFO_JSON__
JSON
  exit 0
fi
echo "[youtube] abc123: Downloading webpage"
if [[ "$ext" == "mp3" ]]; then
  echo '[progress] {"status":"downloading","downloaded_bytes":512,"total_bytes":2048,"speed":1048576,"eta":2,"filename":"/w/Stub.f140.m4a"}' >&2
  echo '[progress] {"status":"downloading","downloaded_bytes":2048,"total_bytes":2048,"speed":1048576,"eta":0,"filename":"/w/Stub.f140.m4a"}' >&2
  echo '[progress] {"status":"finished","downloaded_bytes":2048,"total_bytes":2048,"filename":"/w/Stub.f140.m4a"}' >&2
  echo '[postprocess] {"status":"started","postprocessor":"ExtractAudio"}' >&2
else
  echo '[progress] {"status":"downloading","downloaded_bytes":100,"total_bytes":1000,"speed":2097152,"eta":9,"filename":"/w/Stub.f136.mp4"}' >&2
  echo '[progress] {"status":"downloading","downloaded_bytes":1000,"total_bytes":1000,"speed":2097152,"eta":0,"filename":"/w/Stub.f136.mp4"}' >&2
  echo '[progress] {"status":"downloading","downloaded_bytes":50,"total_bytes":null,"total_bytes_estimate":100,"filename":"/w/Stub.f140.m4a"}' >&2
  echo '[postprocess] {"status":"started","postprocessor":"Merger"}' >&2
fi
title_token='%(title)s'
ext_token='%(ext)s'
target="${output//"$title_token"/Stub Title: Part 1}"
target="${target//"$ext_token"/$ext}"
mkdir -p "$(dirname "$target")"
printf 'media-bytes-%s' "$ext" > "$target"
echo '[postprocess] {"status":"started","postprocessor":"MoveFiles"}' >&2
echo "[result] {\"id\":\"abc123\",\"title\":\"Stub Title: Part 1\",\"ext\":\"$ext\"}"
exit 0
"#;

const HANG_BODY: &str = r#"
echo '[progress] {"status":"downloading","downloaded_bytes":1,"total_bytes":1000,"filename":"/w/Stub.f136.mp4"}'
exec sleep 30
"#;

const FAIL_BODY: &str = r#"
echo "ERROR: [youtube] abc123: Video unavailable" >&2
exit 1
"#;

const NO_OUTPUT_BODY: &str = r#"
echo '[progress] {"status":"downloading","downloaded_bytes":1000,"total_bytes":1000,"filename":"/w/Stub.f136.mp4"}'
echo '[result] {"id":"abc123","title":"Stub Title: Part 1","ext":"webm"}'
exit 0
"#;

/// Writes an executable `yt-dlp` stand-in into `dir` and returns its path.
pub fn install_ytdlp_stub(dir: &Path, mode: StubMode) -> io::Result<PathBuf> {
    let script_path = dir.join("yt-dlp");
    let body = match mode {
        StubMode::Success => SUCCESS_BODY.replace("__INFO_JSON__", INFO_JSON),
        StubMode::Hang => HANG_BODY.to_string(),
        StubMode::Fail => FAIL_BODY.to_string(),
        StubMode::NoOutput => NO_OUTPUT_BODY.to_string(),
    };
    install_script(&script_path, &format!("{STUB_HEADER}{body}"))?;
    Ok(script_path)
}

/// Writes `contents` to `path` and marks it executable.
pub fn install_script(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Polls until `dir` has no entries left. Working directories dropped inside
/// a runtime are removed on the blocking pool, so removal lags the drop.
pub async fn wait_until_empty(dir: &Path) {
    for _ in 0..200 {
        if fs::read_dir(dir).map(|mut entries| entries.next().is_none()).unwrap_or(true) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("{} still has entries", dir.display());
}
