//! Direct accept path for single-process mode

use std::sync::Arc;

use anyhow::Context;
use pgweir_common::config::ListenConfig;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::core::ProxyCore;
use crate::session::Session;

pub async fn run_listener(listen: &ListenConfig, core: Arc<ProxyCore>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", listen.host, listen.port))?;
    info!(
        "listening on {}:{} (connect with psql -h <host> -p {} -U <user> -d <db>)",
        listen.host, listen.port, listen.port
    );
    serve(listener, core).await
}

/// Accept loop over an already-bound listener; one session task per client.
pub async fn serve(listener: TcpListener, core: Arc<ProxyCore>) -> anyhow::Result<()> {
    let _reaper = core.spawn_idle_reaper();
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        debug!("new connection from {}", peer_addr);
        let core = Arc::clone(&core);
        tokio::spawn(Session::new(core, socket).run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use pgweir_common::config::PoolMode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_proxy(core: Arc<ProxyCore>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, core));
        addr
    }

    /// Scenario: SSL refusal followed by a plaintext startup relayed to a
    /// freshly dialed backend, responses streamed back through the first
    /// ReadyForQuery, then a query round-trip.
    #[tokio::test]
    async fn test_ssl_refusal_and_plaintext_startup() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 0, PoolMode::Session, 0, 0, 0);
        let proxy = spawn_proxy(core).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(&[0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f])
            .await
            .unwrap();
        let mut reply = [0u8; 1];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], b'N');

        client
            .write_all(&startup_message("alice", "shop"))
            .await
            .unwrap();
        let frames = read_until_ready(&mut client).await;
        assert_eq!(frames.first().map(|f| f[0]), Some(b'R'));
        assert_ready_status(frames.last().unwrap(), b'I');

        client.write_all(&query_frame("SELECT 1")).await.unwrap();
        let frames = read_until_ready(&mut client).await;
        assert!(frames.iter().any(|f| f[0] == b'C'));
        assert_eq!(backend.connections(), 1);
    }

    /// Scenario: transaction pooling returns the backend at COMMIT and a
    /// second session reuses it, counters moving 1,0 -> 0,1 -> 1,0.
    #[tokio::test]
    async fn test_transaction_mode_return_and_reuse() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 2, PoolMode::Transaction, 0, 0, 0);
        let proxy = spawn_proxy(core.clone()).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;
        assert_eq!(core.capacity.counters("b1"), Some((1, 0)));

        s1.write_all(&query_frame("BEGIN")).await.unwrap();
        assert_ready_status(read_until_ready(&mut s1).await.last().unwrap(), b'T');
        // Mid-transaction the backend stays attached.
        s1.write_all(&query_frame("SELECT 1")).await.unwrap();
        assert_ready_status(read_until_ready(&mut s1).await.last().unwrap(), b'T');
        assert_eq!(core.capacity.counters("b1"), Some((1, 0)));

        s1.write_all(&query_frame("COMMIT")).await.unwrap();
        assert_ready_status(read_until_ready(&mut s1).await.last().unwrap(), b'I');
        wait_for(|| core.capacity.counters("b1") == Some((0, 1))).await;

        // Same (user, database): the pooled connection is spliced with the
        // cached startup response replayed.
        let mut s2 = TcpStream::connect(proxy).await.unwrap();
        s2.write_all(&startup_message("alice", "shop")).await.unwrap();
        let frames = read_until_ready(&mut s2).await;
        assert_eq!(frames.first().map(|f| f[0]), Some(b'R'));
        wait_for(|| core.capacity.counters("b1") == Some((1, 0))).await;
        assert_eq!(backend.connections(), 1);

        s2.write_all(&query_frame("SELECT 2")).await.unwrap();
        assert!(read_until_ready(&mut s2).await.iter().any(|f| f[0] == b'C'));
    }

    /// Scenario: capacity exhausted, a second session parks; the first
    /// session's disconnect frees the slot and wakes it for a fresh dial.
    #[tokio::test]
    async fn test_capacity_exhaustion_release_wakes_waiter() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 1, PoolMode::Session, 0, 0, 0);
        let proxy = spawn_proxy(core.clone()).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;

        let mut s2 = TcpStream::connect(proxy).await.unwrap();
        s2.write_all(&startup_message("alice", "shop")).await.unwrap();
        wait_for(|| core.wait_queue.len() == 1).await;

        // Session mode never pools: disconnect releases, no put.
        drop(s1);
        let frames = read_until_ready(&mut s2).await;
        assert_ready_status(frames.last().unwrap(), b'I');
        assert_eq!(backend.connections(), 2);
        assert_eq!(core.capacity.counters("b1"), Some((1, 0)));
    }

    /// Scenario: wait timeout delivers a single 53300 ErrorResponse and
    /// closes the socket.
    #[tokio::test]
    async fn test_wait_timeout_sends_53300() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 1, PoolMode::Session, 0, 0, 1);
        let proxy = spawn_proxy(core).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;

        let mut s2 = TcpStream::connect(proxy).await.unwrap();
        s2.write_all(&startup_message("alice", "shop")).await.unwrap();
        let frame = read_frame(&mut s2).await.expect("error response");
        let parsed = crate::protocol::error_response::parse_error_response(&frame).unwrap();
        assert_eq!(parsed.severity, "FATAL");
        assert_eq!(parsed.sqlstate, "53300");
        // Nothing further: the proxy closed the socket.
        assert!(read_frame(&mut s2).await.is_none());
    }

    /// Scenario: statement pooling returns after every statement and one
    /// backend connection serves consecutive statements.
    #[tokio::test]
    async fn test_statement_mode_returns_after_each_statement() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 1, PoolMode::Statement, 0, 0, 0);
        let proxy = spawn_proxy(core.clone()).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;

        s1.write_all(&query_frame("SELECT 1")).await.unwrap();
        read_until_ready(&mut s1).await;
        wait_for(|| core.capacity.counters("b1") == Some((0, 1))).await;

        s1.write_all(&query_frame("SELECT 2")).await.unwrap();
        read_until_ready(&mut s1).await;
        wait_for(|| core.capacity.counters("b1") == Some((0, 1))).await;
        assert_eq!(backend.connections(), 1);
    }

    /// A ReadyForQuery 'E' in statement mode discards the backend instead of
    /// pooling a connection stuck in a failed transaction.
    #[tokio::test]
    async fn test_statement_mode_discards_failed_transaction() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 2, PoolMode::Statement, 0, 0, 0);
        let proxy = spawn_proxy(core.clone()).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;

        s1.write_all(&query_frame("FAIL")).await.unwrap();
        assert_ready_status(read_until_ready(&mut s1).await.last().unwrap(), b'E');
        wait_for(|| core.capacity.counters("b1") == Some((0, 0))).await;

        // The next statement dials a fresh backend.
        s1.write_all(&query_frame("SELECT 1")).await.unwrap();
        read_until_ready(&mut s1).await;
        wait_for(|| backend.connections() == 2).await;
    }

    /// Scenario: an idle connection past its idle timeout is not reused; the
    /// expired socket is drained and a fresh one dialed.
    #[tokio::test]
    async fn test_idle_expiry_forces_fresh_connect() {
        let backend = spawn_fake_backend().await;
        let core = test_core(&backend, 2, PoolMode::Transaction, 1, 0, 0);
        let proxy = spawn_proxy(core.clone()).await;

        let mut s1 = TcpStream::connect(proxy).await.unwrap();
        s1.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s1).await;
        s1.write_all(&query_frame("COMMIT")).await.unwrap();
        read_until_ready(&mut s1).await;
        wait_for(|| core.capacity.counters("b1") == Some((0, 1))).await;
        drop(s1);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let mut s2 = TcpStream::connect(proxy).await.unwrap();
        s2.write_all(&startup_message("alice", "shop")).await.unwrap();
        read_until_ready(&mut s2).await;
        assert_eq!(backend.connections(), 2);
        wait_for(|| core.capacity.counters("b1") == Some((1, 0))).await;
    }
}
