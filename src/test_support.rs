//! Synthetic measurement peers on loopback listeners for unit tests.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::registry::{parse, Server};

async fn listen<F, Fut>(handler: F) -> String
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });
    host
}

/// Answer every `PING <t>` line with `PONG <t>` after `delay`.
pub async fn spawn_ping_peer(delay: Duration) -> String {
    listen(move |stream| answer_pings(stream, delay)).await
}

async fn answer_pings(stream: TcpStream, delay: Duration) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let stamp = line.trim_start_matches("PING ").to_string();
        tokio::time::sleep(delay).await;
        if wr.write_all(format!("PONG {}\n", stamp).as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Stream `chunk` bytes every `interval` on each connection, for as long as
/// `active` lasts, while discarding whatever the client sends.
pub async fn spawn_download_peer(chunk: usize, interval: Duration, active: Duration) -> String {
    listen(move |stream| stream_payload(stream, chunk, interval, active)).await
}

async fn stream_payload(stream: TcpStream, chunk: usize, interval: Duration, active: Duration) {
    let (mut rd, mut wr) = stream.into_split();
    tokio::spawn(async move {
        let mut sink = [0u8; 4096];
        while let Ok(n) = rd.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    let payload = vec![b'x'; chunk];
    let start = Instant::now();
    let mut tick: u32 = 0;
    loop {
        tick += 1;
        let due = start + interval * tick;
        if due.duration_since(start) > active {
            // Keep the connection open but idle.
            std::future::pending::<()>().await;
        }
        tokio::time::sleep_until(due).await;
        if wr.write_all(&payload).await.is_err() {
            return;
        }
    }
}

/// Read `frame_size`-byte upload frames and acknowledge each on schedule,
/// one ack every `interval`. With `reply` unset the ack reports the full
/// frame; otherwise `reply` is sent verbatim.
pub async fn spawn_upload_peer(
    frame_size: usize,
    interval: Duration,
    reply: Option<&'static str>,
) -> String {
    listen(move |stream| ack_uploads(stream, frame_size, interval, reply)).await
}

async fn ack_uploads(
    mut stream: TcpStream,
    frame_size: usize,
    interval: Duration,
    reply: Option<&'static str>,
) {
    let mut frame = vec![0u8; frame_size];
    let start = Instant::now();
    let mut tick: u32 = 0;
    loop {
        if stream.read_exact(&mut frame).await.is_err() {
            return;
        }
        tick += 1;
        tokio::time::sleep_until(start + interval * tick).await;
        let ack = match reply {
            Some(text) => text.to_string(),
            None => format!("OK {} {}\n", frame_size, tick),
        };
        if stream.write_all(ack.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// A server entry pointing at `host`.
pub fn server_at(id: &str, host: &str) -> Server {
    Server {
        id: id.to_string(),
        name: format!("server-{}", id),
        country: "Loopback".to_string(),
        sponsor: "Test".to_string(),
        host: host.to_string(),
        url: parse::upload_url(host),
        lat: None,
        lon: None,
        distance_km: None,
        latency_ms: None,
        download_mbps: None,
        upload_mbps: None,
    }
}
