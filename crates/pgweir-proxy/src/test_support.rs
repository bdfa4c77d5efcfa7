//! Shared helpers for the end-to-end tests: a scripted fake PostgreSQL
//! backend, client-side frame helpers and a one-backend proxy core.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use pgweir_common::config::{BackendEntry, PoolMode, RoutingConfig, RoutingDefaults};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::ProxyCore;

pub struct FakeBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl FakeBackend {
    /// Total connections the backend has accepted.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Minimal scripted PostgreSQL server. Startup gets AuthenticationOk +
/// ReadyForQuery 'I'. Each simple query gets CommandComplete + ReadyForQuery
/// whose status tracks BEGIN/COMMIT/ROLLBACK; the literal query "FAIL"
/// reports a failed transaction ('E').
pub async fn spawn_fake_backend() -> FakeBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_one(stream));
        }
    });
    FakeBackend { addr, connections }
}

async fn serve_one(mut stream: TcpStream) {
    // Startup: length-prefixed, no type byte.
    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len.saturating_sub(4)];
    if stream.read_exact(&mut body).await.is_err() {
        return;
    }
    // AuthenticationOk, then ReadyForQuery 'I'.
    let mut greeting = vec![b'R', 0, 0, 0, 8, 0, 0, 0, 0];
    greeting.extend_from_slice(&[b'Z', 0, 0, 0, 5, b'I']);
    if stream.write_all(&greeting).await.is_err() {
        return;
    }

    let mut in_txn = false;
    loop {
        let mut head = [0u8; 5];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let ty = head[0];
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        match ty {
            b'Q' => {
                let sql = String::from_utf8_lossy(&payload)
                    .trim_end_matches('\0')
                    .trim()
                    .to_uppercase();
                let status = if sql.starts_with("BEGIN") {
                    in_txn = true;
                    b'T'
                } else if sql.starts_with("COMMIT") || sql.starts_with("ROLLBACK") {
                    in_txn = false;
                    b'I'
                } else if sql == "FAIL" {
                    b'E'
                } else if in_txn {
                    b'T'
                } else {
                    b'I'
                };
                let mut out = Vec::new();
                let tag = b"OK\0";
                out.push(b'C');
                out.put_u32((4 + tag.len()) as u32);
                out.extend_from_slice(tag);
                out.extend_from_slice(&[b'Z', 0, 0, 0, 5, status]);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
            b'X' => return,
            _ => {}
        }
    }
}

/// StartupMessage with user and database parameters.
pub fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u32(crate::protocol::frame::PROTOCOL_VERSION);
    for (k, v) in [("user", user), ("database", database)] {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut out = Vec::new();
    out.put_u32((4 + body.len()) as u32);
    out.extend_from_slice(&body);
    out
}

/// Simple query frame `Q`.
pub fn query_frame(sql: &str) -> Vec<u8> {
    let mut out = vec![b'Q'];
    out.put_u32((4 + sql.len() + 1) as u32);
    out.extend_from_slice(sql.as_bytes());
    out.push(0);
    out
}

/// Read one typed frame from the client side; `None` on EOF.
pub async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await.ok()?;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    let mut frame = head.to_vec();
    frame.resize(1 + len, 0);
    stream.read_exact(&mut frame[5..]).await.ok()?;
    Some(frame)
}

/// Read typed frames up to and including the next ReadyForQuery.
pub async fn read_until_ready(stream: &mut TcpStream) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(stream).await.expect("eof before ReadyForQuery");
        let done = frame[0] == b'Z';
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

pub fn assert_ready_status(frame: &[u8], status: u8) {
    assert_eq!(
        crate::protocol::frame::ready_for_query_status(frame),
        Some(status),
        "expected ReadyForQuery {:?}, got frame type {:?}",
        status as char,
        frame[0] as char
    );
}

/// Proxy core with one backend "b1" pointing at the fake backend.
pub fn test_core(
    backend: &FakeBackend,
    pool_size: u32,
    pool_mode: PoolMode,
    idle_timeout_sec: u32,
    lifetime_sec: u32,
    wait_timeout_sec: u32,
) -> Arc<ProxyCore> {
    let entry = BackendEntry {
        name: "b1".into(),
        host: backend.addr.ip().to_string(),
        port: backend.addr.port(),
        pool_size,
        pool_mode: Some(pool_mode),
        server_idle_timeout_sec: idle_timeout_sec,
        server_lifetime_sec: lifetime_sec,
        query_wait_timeout_sec: wait_timeout_sec,
    };
    let routing = RoutingConfig {
        defaults: RoutingDefaults::default(),
        rules: Vec::new(),
    };
    ProxyCore::new(vec![entry], &routing).unwrap()
}

/// Poll a condition for up to two seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
