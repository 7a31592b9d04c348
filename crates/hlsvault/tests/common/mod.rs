#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use hlsvault_engine::{DownloadOrchestrator, EngineConfig, EngineEvent, TaskId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A scripted failure served before the real body.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Status(u16),
    RetryAfter(u16, u64),
    /// Hold the response this long, then serve the body.
    Stall(Duration),
}

#[derive(Default)]
struct Route {
    body: Bytes,
    faults: VecDeque<Fault>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

/// Local HTTP origin serving playlists, keys and segments.
pub struct TestServer {
    pub base: String,
    state: Arc<ServerState>,
    join: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            state,
            join,
        }
    }

    /// `host:port` key the engine uses for this server.
    pub fn host(&self) -> String {
        self.base.trim_start_matches("http://").to_string()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn route(&self, path: &str, body: impl Into<Bytes>) {
        self.state.routes.lock().insert(
            path.to_string(),
            Route {
                body: body.into(),
                ..Route::default()
            },
        );
    }

    pub fn fail_first(&self, path: &str, faults: &[Fault]) {
        if let Some(route) = self.state.routes.lock().get_mut(path) {
            route.faults.extend(faults.iter().copied());
        }
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        if let Some(route) = self.state.routes.lock().get_mut(path) {
            route.delay = Some(delay);
        }
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().get(path).map_or(0, Vec::len)
    }

    /// When each request for `path` arrived, oldest first.
    pub fn hit_times(&self, path: &str) -> Vec<Instant> {
        self.state.hits.lock().get(path).cloned().unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    state
        .hits
        .lock()
        .entry(path.clone())
        .or_default()
        .push(Instant::now());

    let (body, fault, delay) = {
        let mut routes = state.routes.lock();
        let Some(route) = routes.get_mut(&path) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        (route.body.clone(), route.faults.pop_front(), route.delay)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    match fault {
        Some(Fault::Status(code)) => {
            return StatusCode::from_u16(code).unwrap().into_response();
        }
        Some(Fault::RetryAfter(code, secs)) => {
            return (
                StatusCode::from_u16(code).unwrap(),
                [(RETRY_AFTER, secs.to_string())],
            )
                .into_response();
        }
        Some(Fault::Stall(stall)) => tokio::time::sleep(stall).await,
        None => {}
    }

    if let Some((start, end)) = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range)
    {
        let end = end.min(body.len().saturating_sub(1));
        let slice = body.slice(start..=end);
        return (
            StatusCode::PARTIAL_CONTENT,
            [(CONTENT_RANGE, format!("bytes {start}-{end}/{}", body.len()))],
            slice,
        )
            .into_response();
    }
    (StatusCode::OK, body).into_response()
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

pub fn segment_body(index: usize) -> Vec<u8> {
    format!("segment-{index:02}-payload|").into_bytes()
}

/// A VOD media playlist listing `names` in order.
pub fn media_playlist(names: &[String], key_line: Option<&str>) -> String {
    let mut out = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    if let Some(key_line) = key_line {
        out.push_str(key_line);
        out.push('\n');
    }
    for name in names {
        out.push_str("#EXTINF:4.0,\n");
        out.push_str(name);
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Serve `count` plain segments under `dir` plus their playlist. Returns the
/// expected merged output.
pub fn serve_vod(server: &TestServer, dir: &str, count: usize) -> Vec<u8> {
    let names: Vec<String> = (0..count).map(|i| format!("seg{i}.bin")).collect();
    let mut expected = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let body = segment_body(i);
        expected.extend_from_slice(&body);
        server.route(&format!("{dir}/{name}"), body);
    }
    server.route(&format!("{dir}/index.m3u8"), media_playlist(&names, None));
    expected
}

pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.http.use_system_proxy = false;
    config.paths.output_dir = root.join("out");
    config.paths.temp_dir = root.join("segments");
    config.paths.state_dir = root.join("state");
    config.concurrency.max_workers_per_task = 3;
    config.retry.base_delay_ms = 10;
    config.retry.connect_base_delay_ms = 5;
    config.retry.max_delay_ms = 100;
    config.retry.use_jitter = false;
    config.timeouts.initial_timeout_ms = 5_000;
    config.timeouts.min_timeout_ms = 1_000;
    config
}

pub fn engine(config: EngineConfig) -> DownloadOrchestrator {
    let engine = DownloadOrchestrator::new(config).unwrap();
    engine.start().unwrap();
    engine
}

/// Collect events for `task_id` until the run reports an outcome.
pub async fn events_until_completed(
    rx: &mut broadcast::Receiver<EngineEvent>,
    task_id: &TaskId,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let collect = async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.task_id() != Some(task_id.as_str()) {
                continue;
            }
            let done = matches!(event, EngineEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .expect("task did not finish in time");
    seen
}
