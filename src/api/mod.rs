//! HTTP endpoints for remote viewers.
//!
//! A small blocking HTTP/1.1 server on `std::net`. Each connection gets its own
//! thread, so a long-lived stream response never delays other requests.
//!
//! Routes (GET only):
//! - `/`: viewer page embedding the stream and polling telemetry
//! - `/processed_video_feed`, `/video_feed`: `multipart/x-mixed-replace` JPEG stream
//! - `/telemetry`: one simulated telemetry sample as JSON
//! - `/health`: liveness plus stream counters

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::BufferRead;
use crate::stream::{StreamHub, CONTENT_TYPE};
use crate::telemetry::SimulatedTelemetry;

const MAX_REQUEST_BYTES: usize = 8192;
/// How long a stream writer waits for a part before rechecking shutdown.
const STREAM_POLL: Duration = Duration::from_millis(500);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>dronewatch</title>
<style>
body { font-family: sans-serif; background: #111; color: #eee; margin: 2em; }
#feed { max-width: 100%; border: 1px solid #444; }
table { margin-top: 1em; border-collapse: collapse; }
td { padding: 0.2em 1em 0.2em 0; }
</style>
</head>
<body>
<h1>Drone feed</h1>
<img id="feed" src="/processed_video_feed" alt="processed video feed">
<table id="telemetry"></table>
<script>
async function poll() {
  try {
    const data = await (await fetch('/telemetry')).json();
    document.getElementById('telemetry').innerHTML = Object.entries(data)
      .map(([k, v]) => `<tr><td>${k}</td><td>${v}</td></tr>`).join('');
  } catch (e) {}
}
poll();
setInterval(poll, 1000);
</script>
</body>
</html>
"#;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// A stream client that accepts no bytes for this long is disconnected.
    pub stream_write_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            stream_write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open streams end within one poll interval.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    hub: StreamHub,
    telemetry: SimulatedTelemetry,
}

#[derive(Clone)]
struct Shared {
    hub: StreamHub,
    telemetry: SimulatedTelemetry,
    shutdown: Arc<AtomicBool>,
    stream_write_timeout: Duration,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, hub: StreamHub, telemetry: SimulatedTelemetry) -> Self {
        Self {
            cfg,
            hub,
            telemetry,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Shared {
            hub: self.hub,
            telemetry: self.telemetry,
            shutdown: shutdown.clone(),
            stream_write_timeout: self.cfg.stream_write_timeout,
        };
        let join = std::thread::Builder::new()
            .name("stream-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared) {
                    log::error!("stream api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, shared: Shared) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared) {
                            log::debug!("request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!(
        "{} {} ({})",
        request.method,
        request.path,
        request.header("user-agent").unwrap_or("-")
    );
    if request.method != "GET" {
        return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
    }
    match request.path.as_str() {
        "/" | "/index.html" => {
            write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes())
        }
        "/processed_video_feed" | "/video_feed" => serve_stream(stream, shared),
        "/telemetry" => {
            let payload = serde_json::to_vec(&shared.telemetry.sample())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/health" => {
            let body = serde_json::json!({
                "status": "ok",
                "stream_clients": shared.hub.subscriber_count(),
                "parts_published": shared.hub.parts_published(),
                "stream_open": !shared.hub.is_closed(),
            });
            write_response(&mut stream, 200, "application/json", body.to_string().as_bytes())
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Write parts to the client until it disconnects, the producer ends or the
/// server shuts down.
fn serve_stream(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_write_timeout(Some(shared.stream_write_timeout))?;
    let subscription = shared.hub.subscribe();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    log::info!("stream client {} connected from {}", subscription.id(), peer);

    let mut sent = 0u64;
    let outcome = loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match subscription.recv_timeout(STREAM_POLL) {
            BufferRead::Item(part) => {
                if let Err(err) = stream.write_all(&part).and_then(|_| stream.flush()) {
                    break Err(err);
                }
                sent += 1;
            }
            BufferRead::TimedOut => continue,
            BufferRead::Closed => break Ok(()),
        }
    };
    match outcome {
        Ok(()) => log::info!(
            "stream client {} finished after {} parts",
            subscription.id(),
            sent
        ),
        Err(err) => log::info!(
            "stream client {} disconnected after {} parts ({})",
            subscription.id(),
            sent,
            err
        ),
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn request_roundtrip(raw: &'static [u8]) -> HttpRequest {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(raw).unwrap();
            stream
        });
        let (mut server_side, _) = listener.accept().unwrap();
        let request = read_request(&mut server_side).unwrap();
        drop(client.join().unwrap());
        request
    }

    #[test]
    fn parses_request_line_and_headers() {
        let request = request_roundtrip(
            b"GET /telemetry?fresh=1 HTTP/1.1\r\nHost: drone\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/telemetry");
        assert_eq!(request.header("host"), Some("drone"));
    }

    #[test]
    fn index_page_embeds_stream_and_telemetry() {
        assert!(INDEX_HTML.contains("/processed_video_feed"));
        assert!(INDEX_HTML.contains("/telemetry"));
    }
}
