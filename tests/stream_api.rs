use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use dronewatch::api::{ApiConfig, ApiHandle, ApiServer};
use dronewatch::ingest::SyntheticSource;
use dronewatch::stream::{
    spawn_producer, EncoderConfig, PlaceholderOverlay, ProducerHandle, StreamEncoder, StreamHub,
};
use dronewatch::SimulatedTelemetry;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

fn start_server() -> (ApiHandle, ProducerHandle) {
    let encoder = StreamEncoder::new(
        Box::new(SyntheticSource::new(64, 48).with_fps(30.0)),
        Box::new(PlaceholderOverlay::seeded(3)),
        EncoderConfig::default(),
    );
    let hub = StreamHub::new(4);
    let producer = spawn_producer(hub.clone(), encoder).expect("spawn producer");
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        hub,
        SimulatedTelemetry::default(),
    )
    .spawn()
    .expect("spawn api");
    (api, producer)
}

fn send(addr: SocketAddr, request: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(request.as_bytes())?;
    Ok(stream)
}

fn get(addr: SocketAddr, path: &str) -> Result<(String, String)> {
    let mut stream = send(
        addr,
        &format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path),
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default().to_string();
    let body = parts.next().unwrap_or_default().to_string();
    Ok((head, body))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read a stream response until `count` complete parts arrived; returns the
/// response head and the JPEG payloads.
fn read_parts(stream: &mut TcpStream, count: usize) -> Result<(String, Vec<Vec<u8>>)> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        anyhow::ensure!(n > 0, "stream closed early");
        data.extend_from_slice(&buf[..n]);
        let Some(head_end) = find(&data, b"\r\n\r\n") else {
            continue;
        };
        let body = &data[head_end + 4..];
        let starts: Vec<usize> = body
            .windows(PART_HEADER.len())
            .enumerate()
            .filter(|(_, w)| *w == PART_HEADER)
            .map(|(i, _)| i)
            .collect();
        if starts.len() > count {
            let head = String::from_utf8_lossy(&data[..head_end]).to_string();
            let jpegs = starts
                .windows(2)
                .take(count)
                .map(|w| {
                    let part = &body[w[0]..w[1]];
                    assert!(part.ends_with(b"\r\n"), "part missing trailing CRLF");
                    part[PART_HEADER.len()..part.len() - 2].to_vec()
                })
                .collect();
            return Ok((head, jpegs));
        }
    }
}

#[test]
fn two_concurrent_clients_receive_well_formed_parts() {
    let (api, producer) = start_server();
    let addr = api.addr;

    let clients: Vec<_> = (0..2)
        .map(|_| {
            std::thread::spawn(move || {
                let mut stream = send(
                    addr,
                    "GET /processed_video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n",
                )
                .unwrap();
                read_parts(&mut stream, 3).unwrap()
            })
        })
        .collect();

    for client in clients {
        let (head, jpegs) = client.join().unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
        assert_eq!(jpegs.len(), 3);
        for jpeg in jpegs {
            let image = image::load_from_memory(&jpeg).expect("valid jpeg part");
            assert_eq!((image.width(), image.height()), (64, 48));
        }
    }

    producer.stop().unwrap();
    api.stop().unwrap();
}

#[test]
fn video_feed_alias_streams_too() {
    let (api, producer) = start_server();
    let mut stream = send(
        api.addr,
        "GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .unwrap();
    let (_, jpegs) = read_parts(&mut stream, 1).unwrap();
    assert_eq!(jpegs.len(), 1);
    producer.stop().unwrap();
    api.stop().unwrap();
}

#[test]
fn stream_response_ends_when_producer_stops() {
    let (api, producer) = start_server();
    let mut stream = send(
        api.addr,
        "GET /processed_video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .unwrap();
    read_parts(&mut stream, 1).unwrap();

    producer.stop().unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("server closes the stream");
    api.stop().unwrap();
}

#[test]
fn telemetry_returns_expected_fields() {
    let (api, producer) = start_server();
    let (head, body) = get(api.addr, "/telemetry").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: application/json"));

    let json: Value = serde_json::from_str(&body).unwrap();
    for key in [
        "latitude", "longitude", "altitude", "x", "y", "z", "time", "date", "location",
    ] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
    let latitude = json["latitude"].as_f64().unwrap();
    assert!((12.9..=12.95).contains(&latitude));
    assert_eq!(json["location"], "Bangalore, India");

    producer.stop().unwrap();
    api.stop().unwrap();
}

#[test]
fn index_health_and_errors() {
    let (api, producer) = start_server();

    let (head, body) = get(api.addr, "/").unwrap();
    assert!(head.contains("text/html"));
    assert!(body.contains("/processed_video_feed"));

    let (head, body) = get(api.addr, "/health").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");

    let (head, body) = get(api.addr, "/nope").unwrap();
    assert!(head.starts_with("HTTP/1.1 404"));
    assert_eq!(body, r#"{"error":"not_found"}"#);

    let mut stream = send(
        api.addr,
        "POST /telemetry HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 405"));

    producer.stop().unwrap();
    api.stop().unwrap();
}

#[test]
fn client_that_stops_reading_is_disconnected() {
    let hub = StreamHub::new(2);
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream_write_timeout: Duration::from_millis(200),
        },
        hub.clone(),
        SimulatedTelemetry::default(),
    )
    .spawn()
    .expect("spawn api");

    // connects, then never reads a byte
    let _stalled = send(
        api.addr,
        "GET /processed_video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "client never subscribed");
        std::thread::sleep(Duration::from_millis(10));
    }

    // large parts fill the socket buffers, after which writes stall
    let deadline = Instant::now() + Duration::from_secs(20);
    while hub.subscriber_count() > 0 {
        assert!(Instant::now() < deadline, "stalled client was never dropped");
        hub.publish(vec![0u8; 1 << 20]);
        std::thread::sleep(Duration::from_millis(10));
    }

    hub.close();
    api.stop().unwrap();
}
