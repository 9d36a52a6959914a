//! HTTP and WebSocket surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path as AxumPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, header},
    response::Response,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    catalog::{self, AvailableResolutions, FormatListing, ResolutionOption},
    config::Settings,
    error::{ApiError, ApiResult, MetadataError},
    extractor::Extractor,
    orchestrator::{DownloadRequest, Orchestrator},
    packaging,
    sessions::SessionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionRegistry>, orchestrator: Orchestrator) -> Self {
        Self {
            sessions,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            settings.throttle,
            settings.queue_capacity,
        ));
        let extractor = Extractor::new(settings.ytdlp_bin.clone())
            .with_ffmpeg_location(settings.ffmpeg_location.clone());
        let orchestrator = Orchestrator::new(extractor, sessions.clone(), settings.download_timeout)
            .with_temp_root(settings.temp_root.clone());
        Self::new(sessions, orchestrator)
    }
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/youtube-download/{session_id}", post(download_video))
        .route("/youtube-video/info/{video_id}", get(video_info))
        .route("/youtube-video/formats/{video_id}", get(video_formats))
        .route("/available-resolutions", get(available_resolutions))
        .route("/health", get(health))
        .route("/ws/{session_id}", get(progress_socket))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the configured frontend origins. The download file
/// name is exposed so browsers can read it.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) if origin != "*" => Some(value),
            _ => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([header::CONTENT_DISPOSITION])
}

async fn download_video(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let completed = state.orchestrator.run(&session_id, request).await?;
    Ok(packaging::into_response(completed).await?)
}

#[derive(Debug, Serialize)]
struct VideoInfo {
    info: Value,
    allow_resolutions: Vec<ResolutionOption>,
}

async fn video_info(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<VideoInfo>> {
    let info = fetch_info(&state, &video_id)
        .await
        .map_err(|err| ApiError::metadata("info", err))?;
    let allow_resolutions = catalog::allow_resolutions(&info);
    Ok(Json(VideoInfo {
        info,
        allow_resolutions,
    }))
}

async fn video_formats(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<FormatListing>> {
    let info = fetch_info(&state, &video_id)
        .await
        .map_err(|err| ApiError::metadata("formats", err))?;
    Ok(Json(catalog::format_listing(&info)))
}

async fn fetch_info(state: &AppState, video_id: &str) -> Result<Value, MetadataError> {
    let extractor = state.orchestrator.extractor().clone();
    let url = catalog::video_url(video_id);
    tokio::task::spawn_blocking(move || extractor.fetch_info(&url))
        .await
        .map_err(|err| MetadataError::Worker(err.to_string()))?
}

async fn available_resolutions() -> Json<AvailableResolutions> {
    Json(catalog::available_resolutions())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn progress_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions, session_id))
}

/// Owns the socket for one session: forwards queued progress records and
/// watches the client side for close or errors.
async fn handle_socket(socket: WebSocket, sessions: Arc<SessionRegistry>, session_id: String) {
    let session_id = session_id.as_str();
    let mut handle = sessions.open(session_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            record = handle.recv() => {
                let Some(record) = record else {
                    debug!(session_id, "progress channel superseded");
                    break;
                };
                let payload = match serde_json::to_string(&record) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(session_id, error = %err, "could not encode progress record");
                        continue;
                    }
                };
                if let Err(err) = sender.send(Message::Text(payload.into())).await {
                    debug!(session_id, error = %err, "progress send failed");
                    break;
                }
                debug!(session_id, progress = record.progress, phase = %record.phase, "progress sent");
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(session_id, error = %err, "websocket receive failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    sessions.release(&handle);
    if let Err(err) = sender.close().await {
        debug!(session_id, error = %err, "websocket close failed");
    }
    info!(session_id, "progress channel disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::{PHASE_COMPLETED, ProgressRecord},
        sessions::ThrottlePolicy,
        testing::{STUB_TITLE, StubMode, install_ytdlp_stub, wait_until_empty},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use std::{path::Path, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestServer {
        _dir: TempDir,
        temp_root: std::path::PathBuf,
        state: AppState,
    }

    fn test_server(mode: StubMode, timeout: Duration) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let bin = install_ytdlp_stub(dir.path(), mode).unwrap();
        let temp_root = dir.path().join("jobs");
        std::fs::create_dir_all(&temp_root).unwrap();
        let sessions = Arc::new(SessionRegistry::new(
            ThrottlePolicy {
                min_interval: Duration::ZERO,
                min_delta: 0.0,
            },
            64,
        ));
        let orchestrator = Orchestrator::new(Extractor::new(bin), sessions.clone(), timeout)
            .with_temp_root(Some(temp_root.clone()));
        TestServer {
            _dir: dir,
            temp_root,
            state: AppState::new(sessions, orchestrator),
        }
    }

    fn app(server: &TestServer) -> Router {
        router(
            server.state.clone(),
            &["http://localhost:5173".to_string()],
        )
    }

    fn leftover_jobs(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn download_request(session: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/youtube-download/{session}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn available_resolutions_lists_tiers() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(get_request("/available-resolutions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"resolutions": ["360p", "480p", "720p", "1080p"], "default": "360p"})
        );
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server).oneshot(get_request("/health")).await.unwrap();
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn info_returns_raw_metadata_and_direct_resolutions() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(get_request("/youtube-video/info/abc123"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["info"]["title"], STUB_TITLE);
        assert_eq!(
            body["allow_resolutions"],
            json!([
                {"resolution": "360p", "is_audio": true, "download_url": "https://rr1.googlevideo.com/18"},
                {"resolution": "720p", "is_audio": true, "download_url": "https://rr1.googlevideo.com/22"},
            ])
        );
    }

    #[tokio::test]
    async fn formats_flattens_extractor_formats() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(get_request("/youtube-video/formats/abc123"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["title"], STUB_TITLE);
        let formats = body["formats"].as_array().unwrap();
        assert_eq!(formats.len(), 6);
        assert_eq!(
            formats[0],
            json!({"format_id": "140", "ext": "m4a", "resolution": "audio only", "filesize": 2048, "format": "140 - audio only"})
        );
        assert_eq!(formats[2]["filesize"], Value::Null);
    }

    #[tokio::test]
    async fn metadata_failure_renders_json_error() {
        let server = test_server(StubMode::Fail, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(get_request("/youtube-video/info/abc123"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Failed to get video info: "), "{message}");
        assert!(message.contains("Video unavailable"), "{message}");
    }

    #[tokio::test]
    async fn download_streams_file_and_removes_workdir() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(download_request(
                "s1",
                r#"{"url": "https://www.youtube.com/watch?v=abc123", "resolution": "720p", "format": "mp4"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"StubTitlePart1_720p.mp4\""));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"media-bytes-mp4");
        wait_until_empty(&server.temp_root).await;
    }

    #[tokio::test]
    async fn audio_download_uses_audio_name() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(download_request(
                "s1",
                r#"{"url": "https://www.youtube.com/watch?v=abc123", "format": "mp3"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap();
        assert!(disposition.contains("filename=\"StubTitlePart1_audio.mp3\""));
    }

    #[tokio::test]
    async fn download_timeout_maps_to_408() {
        let server = test_server(StubMode::Hang, Duration::from_millis(300));
        let response = app(&server)
            .oneshot(download_request(
                "s1",
                r#"{"url": "u", "resolution": "360p", "format": "mp4"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(leftover_jobs(&server.temp_root), 0);
    }

    #[tokio::test]
    async fn download_failure_maps_to_500() {
        let server = test_server(StubMode::Fail, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(download_request(
                "s1",
                r#"{"url": "u", "resolution": "360p", "format": "mp4"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Download failed: "), "{message}");
        assert_eq!(leftover_jobs(&server.temp_root), 0);
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let response = app(&server)
            .oneshot(download_request(
                "s1",
                r#"{"url": "u", "resolution": "360p", "format": "flac"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(leftover_jobs(&server.temp_root), 0);
    }

    #[tokio::test]
    async fn cors_allows_configured_origin_and_exposes_disposition() {
        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = app(&server).oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert!(
            headers[header::ACCESS_CONTROL_EXPOSE_HEADERS]
                .to_str()
                .unwrap()
                .contains("content-disposition")
        );

        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://evil.example")
            .body(Body::empty())
            .unwrap();
        let response = app(&server).oneshot(request).await.unwrap();
        assert!(
            !response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }

    #[tokio::test]
    async fn websocket_receives_progress_until_completion() {
        use tokio_tungstenite::connect_async;

        let server = test_server(StubMode::Success, Duration::from_secs(10));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = app(&server);
        tokio::spawn(async move {
            axum::serve(listener, service).await.unwrap();
        });

        let (mut socket, _) = connect_async(format!("ws://{addr}/ws/live"))
            .await
            .unwrap();
        let sessions = server.state.sessions.clone();
        wait_until(|| sessions.is_connected("live")).await;

        let completed = server
            .state
            .orchestrator
            .run(
                "live",
                DownloadRequest {
                    url: "https://www.youtube.com/watch?v=abc123".into(),
                    resolution: "720p".into(),
                    format: crate::formats::MediaFormat::Mp4,
                },
            )
            .await
            .unwrap();
        drop(completed);

        let mut records = Vec::new();
        while let Some(msg) = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
        {
            let msg = msg.unwrap();
            if !msg.is_text() {
                continue;
            }
            let record: ProgressRecord = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let done = record.phase == PHASE_COMPLETED;
            records.push(record);
            if done {
                break;
            }
        }
        let progress: Vec<f64> = records.iter().map(|record| record.progress).collect();
        assert_eq!(progress, [5.0, 50.0, 75.0, 99.0, 100.0]);

        socket.close(None).await.unwrap();
        wait_until(|| !sessions.is_connected("live")).await;
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}
