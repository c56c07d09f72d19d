//! HTTP range fetcher against a local test server
//!
//! The server is a minimal HTTP/1.1 responder on a tokio `TcpListener`,
//! closing the connection after every response.

use sqlite_web_vfs::{FetchError, HttpRangeFetcher, RangeFetcher, RemoteFile, VfsConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SIZE: usize = 10_000;

#[derive(Default)]
struct ServerState {
    /// Requests seen, keyed by "METHOD /path"
    requests: parking_lot::Mutex<HashMap<String, u32>>,
    /// 503s still to hand out on /flaky.db
    flaky_failures: AtomicU32,
}

impl ServerState {
    fn count(&self, key: &str) -> u32 {
        self.requests.lock().get(key).copied().unwrap_or(0)
    }
}

fn body() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 241) as u8).collect()
}

async fn start_server(flaky_failures: u32) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::default());
    state.flaky_failures.store(flaky_failures, Ordering::SeqCst);

    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = Arc::clone(&server_state);
            tokio::spawn(async move {
                let _ = serve(stream, state).await;
            });
        }
    });

    (addr, state)
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8_lossy(&raw).to_string();
    let mut lines = request.lines();
    let mut first = lines.next().unwrap_or_default().split_whitespace();
    let method = first.next().unwrap_or_default().to_string();
    let path = first.next().unwrap_or_default().to_string();
    let range = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| parse_range(value.trim()));

    *state
        .requests
        .lock()
        .entry(format!("{} {}", method, path))
        .or_insert(0) += 1;

    let data = body();
    let head = method == "HEAD";
    let response = match path.as_str() {
        "/missing.db" => respond(404, &[], b"", head),
        "/flaky.db"
            if state
                .flaky_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok() =>
        {
            respond(503, &[], b"busy", head)
        }
        "/no-head.db" if head => respond(405, &[], b"", true),
        "/no-range.db" => respond(200, &[], &data, head),
        "/data.db" | "/flaky.db" | "/no-head.db" => match range {
            Some((start, _)) if start >= SIZE => respond(
                416,
                &[("Content-Range", format!("bytes */{}", SIZE))],
                b"",
                head,
            ),
            Some((start, end)) => {
                let end = end.min(SIZE - 1);
                respond(
                    206,
                    &[("Content-Range", format!("bytes {}-{}/{}", start, end, SIZE))],
                    &data[start..=end],
                    head,
                )
            }
            None => respond(200, &[], &data, head),
        },
        _ => respond(404, &[], b"", head),
    };

    stream.write_all(&response).await?;
    stream.shutdown().await
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn respond(status: u16, headers: &[(&str, String)], body: &[u8], head: bool) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    if !head {
        bytes.extend_from_slice(body);
    }
    bytes
}

fn fetcher(max_retries: u32) -> HttpRangeFetcher {
    let config = VfsConfig {
        max_retries,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..VfsConfig::default()
    };
    HttpRangeFetcher::new(&config).unwrap()
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_head_reports_size() {
    let (addr, state) = start_server(0).await;
    let fetcher = fetcher(2);

    let size = fetcher.object_size(&url(addr, "/data.db")).await.unwrap();
    assert_eq!(size, SIZE as u64);
    assert_eq!(state.count("HEAD /data.db"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_size_probe_when_head_refused() {
    let (addr, state) = start_server(0).await;
    let fetcher = fetcher(2);

    let size = fetcher.object_size(&url(addr, "/no-head.db")).await.unwrap();
    assert_eq!(size, SIZE as u64);
    assert_eq!(state.count("HEAD /no-head.db"), 1);
    assert_eq!(state.count("GET /no-head.db"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_range_fetch_and_tail() {
    let (addr, _state) = start_server(0).await;
    let fetcher = fetcher(2);
    let data = body();
    let file = RemoteFile::new(url(addr, "/data.db"), SIZE as u64, true);

    let page = fetcher.fetch(&file, 4096, 4096).await.unwrap();
    assert_eq!(&page[..], &data[4096..8192]);

    let tail = fetcher.fetch(&file, 8192, 4096).await.unwrap();
    assert_eq!(tail.len(), SIZE - 8192);
    assert_eq!(&tail[..], &data[8192..]);

    let past = fetcher.fetch(&file, SIZE as u64, 4096).await.unwrap();
    assert!(past.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_are_retried() {
    let (addr, state) = start_server(2).await;
    let fetcher = fetcher(3);
    let data = body();
    let file = RemoteFile::new(url(addr, "/flaky.db"), SIZE as u64, true);

    let page = fetcher.fetch(&file, 0, 4096).await.unwrap();
    assert_eq!(&page[..], &data[..4096]);
    assert_eq!(state.count("GET /flaky.db"), 3);
    assert_eq!(fetcher.requests_sent(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_budget_exhausted() {
    let (addr, state) = start_server(10).await;
    let fetcher = fetcher(1);
    let file = RemoteFile::new(url(addr, "/flaky.db"), SIZE as u64, true);

    let err = fetcher.fetch(&file, 0, 4096).await.unwrap_err();
    assert!(matches!(err, FetchError::Unavailable { attempts: 2, .. }));
    assert_eq!(state.count("GET /flaky.db"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_not_found_is_not_retried() {
    let (addr, state) = start_server(0).await;
    let fetcher = fetcher(4);

    let err = fetcher
        .object_size(&url(addr, "/missing.db"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotFound(_)));
    assert_eq!(state.count("HEAD /missing.db"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_ignoring_range() {
    let (addr, _state) = start_server(0).await;
    let fetcher = fetcher(2);
    let data = body();
    let file = RemoteFile::new(url(addr, "/no-range.db"), SIZE as u64, true);

    let page = fetcher.fetch(&file, 100, 50).await.unwrap();
    assert_eq!(&page[..], &data[100..150]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_size_change_detected() {
    let (addr, _state) = start_server(0).await;
    let fetcher = fetcher(2);
    let file = RemoteFile::new(url(addr, "/data.db"), SIZE as u64 + 1, true);

    let err = fetcher.fetch(&file, 0, 4096).await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound(_)));
}
