//! Per-client session: one tokio task owning the client socket.
//!
//! Lifecycle: read the first client frame (refusing SSL/GSSENC with `N`),
//! resolve the backend from (user, database), attach a backend connection
//! (reused from the idle cache, freshly dialed, or waited for), then relay
//! complete typed frames in both directions. On each backend ReadyForQuery
//! the pool mode decides whether the backend goes back to the idle cache;
//! a detached session re-attaches on the next client frame.
//!
//! Frames are forwarded atomically as whole units; a write to one side is
//! awaited before more is read from the other, which bounds per-session
//! memory to roughly one frame per direction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pgweir_common::config::{PoolMode, ResolvedBackend};

use crate::core::ProxyCore;
use crate::errors::{sqlstate, SessionError};
use crate::pool::{wait_queue, BackendLease, PoolKey};
use crate::protocol::error_response::build_error_response;
use crate::protocol::frame;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A backend connection currently attached to (in use by) a session.
struct AttachedBackend {
    stream: TcpStream,
    buf: BytesMut,
    /// Server reply to the StartupMessage, through the first ReadyForQuery.
    startup_response: Bytes,
    created_at: Instant,
    lease: BackendLease,
}

/// What ended one relay round.
enum RelayOutcome {
    /// Client EOF: close the backend, release its slot.
    ClientClosed,
    /// Backend EOF mid-attachment: fatal.
    BackendClosed,
    /// Return point reached: park the backend in the idle cache.
    ReturnToPool,
    /// ReadyForQuery 'E' in statement mode: the backend is inside a failed
    /// transaction, close it instead of pooling it.
    Discard,
}

pub struct Session {
    id: u64,
    core: Arc<ProxyCore>,
    client: TcpStream,
    client_buf: BytesMut,
    /// The client's StartupMessage, replayed verbatim on every fresh dial.
    startup_frame: Bytes,
}

impl Session {
    pub fn new(core: Arc<ProxyCore>, client: TcpStream) -> Self {
        let _ = client.set_nodelay(true);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            core,
            client,
            client_buf: BytesMut::with_capacity(8 * 1024),
            startup_frame: Bytes::new(),
        }
    }

    /// Construct a session from a dispatcher handoff: `initial` holds the
    /// bytes the dispatcher already read. A leading SSLRequest is consumed
    /// without a reply since the dispatcher already sent the `N`.
    pub fn from_handoff(core: Arc<ProxyCore>, client: TcpStream, initial: &[u8]) -> Self {
        let mut session = Self::new(core, client);
        session.client_buf.extend_from_slice(initial);
        if initial.len() >= 8 && frame::is_ssl_request(&initial[..8]) {
            let _ = session.client_buf.split_to(8);
        }
        session
    }

    pub async fn run(mut self) {
        debug!("session {}: started", self.id);
        match self.run_inner().await {
            Ok(()) => info!("session {}: closed", self.id),
            Err(e @ (SessionError::ClientEof | SessionError::BackendEof)) => {
                info!("session {}: closed, {}", self.id, e)
            }
            Err(e) => warn!("session {}: closed with error: {}", self.id, e),
        }
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        let Some((user, database)) = self.read_startup().await? else {
            return Ok(());
        };

        let Some(resolved) = self.core.router.resolve(&user, &database) else {
            info!(
                "session {}: no route for user={} database={}",
                self.id, user, database
            );
            return Ok(());
        };
        info!(
            "session {}: user={} database={} -> backend={} ({:?})",
            self.id, user, database, resolved.name, resolved.pool_mode
        );

        let key = PoolKey::new(&resolved.name, &user, &database);
        let mut backend = self.attach_backend(&resolved, &key, true).await?;

        loop {
            match self.relay(&mut backend, resolved.pool_mode).await? {
                RelayOutcome::ClientClosed => {
                    // Never pooled on client EOF, in any mode; dropping the
                    // lease releases the slot and wakes a waiter.
                    debug!("session {}: client disconnected", self.id);
                    drop(backend);
                    return Ok(());
                }
                RelayOutcome::BackendClosed => {
                    drop(backend);
                    return Err(SessionError::BackendEof);
                }
                RelayOutcome::Discard => {
                    debug!(
                        "session {}: discarding backend in failed transaction",
                        self.id
                    );
                    drop(backend);
                }
                RelayOutcome::ReturnToPool => {
                    debug!("session {}: returning backend {} to pool", self.id, key.backend);
                    let AttachedBackend {
                        stream,
                        startup_response,
                        created_at,
                        lease,
                        ..
                    } = backend;
                    self.core.idle.put(
                        key.clone(),
                        stream,
                        startup_response,
                        created_at,
                        resolved.server_idle_timeout_sec,
                        resolved.server_lifetime_sec,
                    );
                    lease.put_into_pool();
                    self.core.wait_queue.wake_for_key(&key);
                }
            }

            // Detached: park until the client speaks again.
            if !self.wait_for_client_frame().await? {
                debug!("session {}: client finished while detached", self.id);
                return Ok(());
            }
            backend = self.attach_backend(&resolved, &key, false).await?;
        }
    }

    /// Startup phase. Replies `N` to SSLRequest/GSSENCRequest and keeps
    /// reading; a CancelRequest or pre-startup EOF ends the session cleanly.
    async fn read_startup(&mut self) -> Result<Option<(String, String)>, SessionError> {
        loop {
            if let Some(f) = frame::try_extract_startup(&mut self.client_buf)? {
                if frame::is_ssl_request(&f) || frame::is_gssenc_request(&f) {
                    debug!("session {}: refusing TLS/GSS negotiation", self.id);
                    self.client.write_all(b"N").await?;
                    continue;
                }
                if frame::is_cancel_request(&f) {
                    debug!("session {}: cancel request, closing", self.id);
                    return Ok(None);
                }
                let Some(user) = frame::startup_parameter(&f, "user") else {
                    warn!("session {}: startup without user parameter", self.id);
                    return Ok(None);
                };
                let database =
                    frame::startup_parameter(&f, "database").unwrap_or_else(|| user.clone());
                self.startup_frame = f;
                return Ok(Some((user, database)));
            }
            let n = self.client.read_buf(&mut self.client_buf).await?;
            if n == 0 {
                debug!("session {}: client eof before startup", self.id);
                return Ok(None);
            }
        }
    }

    /// Acquire a backend connection: reuse from the idle cache, dial fresh
    /// under a capacity slot, or park in the wait queue and retry on wake.
    /// `first_attach` is true only for the session's first backend, the one
    /// whose startup response the client still needs to see.
    async fn attach_backend(
        &mut self,
        resolved: &ResolvedBackend,
        key: &PoolKey,
        first_attach: bool,
    ) -> Result<AttachedBackend, SessionError> {
        loop {
            self.drain_expired(resolved, key);

            if let Some(idle_conn) = self.core.idle.take(
                key,
                Instant::now(),
                resolved.server_idle_timeout_sec,
                resolved.server_lifetime_sec,
            ) {
                if !self.core.capacity.take_from_pool(&resolved.name) {
                    warn!(
                        "session {}: idle cache and capacity counters disagree for {}",
                        self.id, resolved.name
                    );
                }
                let lease = BackendLease::new(
                    Arc::clone(&self.core.capacity),
                    Arc::clone(&self.core.wait_queue),
                    &resolved.name,
                );
                debug!("session {}: reusing pooled backend {}", self.id, resolved.name);
                if first_attach {
                    // The cached startup exchange stands in for the one the
                    // client never had.
                    self.client.write_all(&idle_conn.startup_response).await?;
                }
                return Ok(AttachedBackend {
                    stream: idle_conn.stream,
                    buf: BytesMut::with_capacity(8 * 1024),
                    startup_response: idle_conn.startup_response,
                    created_at: idle_conn.created_at,
                    lease,
                });
            }

            if self.core.capacity.acquire(&resolved.name) {
                let lease = BackendLease::new(
                    Arc::clone(&self.core.capacity),
                    Arc::clone(&self.core.wait_queue),
                    &resolved.name,
                );
                return self.dial_backend(resolved, lease, first_attach).await;
            }

            debug!(
                "session {}: backend {} at capacity, waiting",
                self.id, resolved.name
            );
            let ticket = self.core.wait_queue.enqueue(key.clone());
            match tokio::time::timeout(
                wait_queue::wait_timeout(resolved.query_wait_timeout_sec),
                ticket.rx,
            )
            .await
            {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // The queue dropped us without a wake; nothing to retry.
                    self.send_error(
                        sqlstate::TOO_MANY_CONNECTIONS,
                        "sorry, too many clients already",
                    )
                    .await;
                    return Err(SessionError::WaitTimeout);
                }
                Err(_) => {
                    self.core.wait_queue.remove(ticket.id);
                    info!(
                        "session {}: wait for backend {} timed out",
                        self.id, resolved.name
                    );
                    self.send_error(
                        sqlstate::TOO_MANY_CONNECTIONS,
                        "sorry, too many clients already",
                    )
                    .await;
                    return Err(SessionError::WaitTimeout);
                }
            }
        }
    }

    /// Close expired idle entries for this key, releasing their slots.
    fn drain_expired(&self, resolved: &ResolvedBackend, key: &PoolKey) {
        while let Some(expired) = self.core.idle.take_one_expired(
            key,
            Instant::now(),
            resolved.server_idle_timeout_sec,
            resolved.server_lifetime_sec,
        ) {
            debug!(
                "session {}: closing expired idle connection to {}",
                self.id, resolved.name
            );
            drop(expired);
            self.core.capacity.release(&resolved.name);
            self.core.wait_queue.wake_for_backend(&resolved.name);
        }
    }

    /// Dial a fresh backend connection, replay the client's StartupMessage
    /// and collect the server's response through ReadyForQuery 'I'. Client
    /// frames arriving meanwhile (auth responses) are forwarded unaltered.
    async fn dial_backend(
        &mut self,
        resolved: &ResolvedBackend,
        lease: BackendLease,
        forward_to_client: bool,
    ) -> Result<AttachedBackend, SessionError> {
        info!(
            "session {}: connecting to backend {} at {}:{}",
            self.id, resolved.name, resolved.host, resolved.port
        );
        let mut stream = match self.connect(resolved).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "session {}: backend connect failed for {}: {}",
                    self.id, resolved.name, e
                );
                self.send_error(sqlstate::CONNECTION_FAILURE, "could not connect to backend")
                    .await;
                drop(lease);
                return Err(SessionError::BackendConnect(e));
            }
        };
        stream.write_all(&self.startup_frame).await?;

        let mut response = BytesMut::new();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            tokio::select! {
                n = stream.read_buf(&mut buf) => {
                    if n? == 0 {
                        // Propagate whatever arrived (already forwarded
                        // frame-by-frame below) and give up.
                        return Err(SessionError::BackendEof);
                    }
                    while let Some(f) = frame::try_extract_message(&mut buf)? {
                        response.extend_from_slice(&f);
                        if forward_to_client {
                            self.client.write_all(&f).await?;
                        }
                        if frame::ready_for_query_status(&f) == Some(b'I') {
                            debug!(
                                "session {}: backend {} ready ({} startup bytes cached)",
                                self.id, resolved.name, response.len()
                            );
                            return Ok(AttachedBackend {
                                stream,
                                buf,
                                startup_response: response.freeze(),
                                created_at: Instant::now(),
                                lease,
                            });
                        }
                    }
                }
                // Only the first attach has an auth conversation to relay;
                // on a re-attach, buffered client frames are queries that
                // must wait until the backend is ready.
                n = self.client.read_buf(&mut self.client_buf), if forward_to_client => {
                    if n? == 0 {
                        return Err(SessionError::ClientEof);
                    }
                    while let Some(f) = frame::try_extract_message(&mut self.client_buf)? {
                        stream.write_all(&f).await?;
                    }
                }
            }
        }
    }

    async fn connect(&self, resolved: &ResolvedBackend) -> std::io::Result<TcpStream> {
        // First IPv4 address wins, like the original resolver behavior.
        let mut addrs =
            tokio::net::lookup_host((resolved.host.as_str(), resolved.port)).await?;
        let addr = addrs
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no IPv4 address for {}", resolved.host),
                )
            })?;
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Forward whole frames both ways until a return point, an EOF, or an
    /// error. The triggering ReadyForQuery is forwarded to the client before
    /// the outcome is reported, so return-to-pool always happens after it.
    async fn relay(
        &mut self,
        backend: &mut AttachedBackend,
        pool_mode: PoolMode,
    ) -> Result<RelayOutcome, SessionError> {
        // Frames the client pipelined while we were attaching go out first.
        while let Some(f) = frame::try_extract_message(&mut self.client_buf)? {
            backend.stream.write_all(&f).await?;
        }

        loop {
            tokio::select! {
                n = self.client.read_buf(&mut self.client_buf) => {
                    if n? == 0 {
                        return Ok(RelayOutcome::ClientClosed);
                    }
                    while let Some(f) = frame::try_extract_message(&mut self.client_buf)? {
                        backend.stream.write_all(&f).await?;
                    }
                }
                n = backend.stream.read_buf(&mut backend.buf) => {
                    if n? == 0 {
                        return Ok(RelayOutcome::BackendClosed);
                    }
                    while let Some(f) = frame::try_extract_message(&mut backend.buf)? {
                        self.client.write_all(&f).await?;
                        if let Some(status) = frame::ready_for_query_status(&f) {
                            match pool_mode {
                                PoolMode::Statement if status == b'E' => {
                                    return Ok(RelayOutcome::Discard);
                                }
                                PoolMode::Statement => return Ok(RelayOutcome::ReturnToPool),
                                PoolMode::Transaction if status == b'I' => {
                                    return Ok(RelayOutcome::ReturnToPool);
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Detached wait: true once a complete typed frame is buffered, false on
    /// client EOF or a lone Terminate (no point re-attaching for it).
    async fn wait_for_client_frame(&mut self) -> Result<bool, SessionError> {
        loop {
            if frame::has_complete_message(&self.client_buf)? {
                if frame::message_type(&self.client_buf) == b'X' {
                    return Ok(false);
                }
                return Ok(true);
            }
            let n = self.client.read_buf(&mut self.client_buf).await?;
            if n == 0 {
                return Ok(false);
            }
        }
    }

    async fn send_error(&mut self, code: &str, message: &str) {
        let response = build_error_response(code, message);
        // Best effort; the session is closing either way.
        let _ = self.client.write_all(&response).await;
    }
}
