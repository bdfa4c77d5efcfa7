//! Dispatcher + worker architecture.
//!
//! A single acceptor reads just enough of each new client connection to
//! route it (the first packet: an optional SSLRequest plus the
//! StartupMessage), then hands the raw socket and the already-read bytes to
//! the worker process owning the target backend over a pre-established unix
//! socketpair. Each worker runs its own pools; a backend name is owned by
//! exactly one worker.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use pgweir_common::config::{ListenConfig, WorkerEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::ProxyCore;
use crate::fd_passing::{self, RecvState};
use crate::protocol::frame;
use crate::router::Router;
use crate::session::Session;

/// Set in a worker child's environment; its value is the worker index.
pub const ENV_WORKER_INDEX: &str = "PGWEIR_WORKER_INDEX";

/// The worker's end of the dispatcher socketpair is inherited on this
/// descriptor.
pub const WORKER_SOCKET_FD: RawFd = 3;

pub struct WorkerPlan {
    pub streams: Vec<UnixStream>,
    pub children: Vec<std::process::Child>,
}

/// Spawn one worker process per worker entry by re-executing the current
/// binary with the socketpair end on fd 3.
pub fn spawn_workers(config_path: &Path, worker_count: usize) -> anyhow::Result<WorkerPlan> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let config_abs = std::fs::canonicalize(config_path)
        .with_context(|| format!("cannot canonicalize {}", config_path.display()))?;

    let mut streams = Vec::with_capacity(worker_count);
    let mut children = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let (parent, child) = std::os::unix::net::UnixStream::pair()
            .with_context(|| format!("socketpair for worker {index}"))?;
        let child_fd = child.as_raw_fd();
        let mut cmd = std::process::Command::new(&exe);
        cmd.env(ENV_WORKER_INDEX, index.to_string())
            .env("PGWEIR_CONFIG", &config_abs);
        unsafe {
            // After fork, before exec: pin the socketpair end to fd 3. The
            // dup has O_CLOEXEC clear, so it survives the exec while the
            // original (CLOEXEC) end does not. dup2 onto itself would keep
            // the flag, so that case clears it directly.
            cmd.pre_exec(move || {
                if child_fd == WORKER_SOCKET_FD {
                    let flags = libc::fcntl(child_fd, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, WORKER_SOCKET_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child_proc = cmd
            .spawn()
            .with_context(|| format!("spawning worker {index}"))?;
        info!("spawned worker {} (pid {})", index, child_proc.id());
        drop(child);
        parent.set_nonblocking(true)?;
        streams.push(UnixStream::from_std(parent)?);
        children.push(child_proc);
    }
    Ok(WorkerPlan { streams, children })
}

/// In a worker child: recover the inherited socketpair end.
pub fn worker_socket() -> anyhow::Result<UnixStream> {
    let sock = unsafe { std::os::unix::net::UnixStream::from_raw_fd(WORKER_SOCKET_FD) };
    sock.set_nonblocking(true)
        .context("worker socket set_nonblocking")?;
    UnixStream::from_std(sock).context("worker socket registration")
}

/// Backend name -> worker index (later worker entries win, matching config
/// order).
pub fn backend_to_worker(workers: &[WorkerEntry]) -> HashMap<String, usize> {
    let mut map = HashMap::new();
    for (index, worker) in workers.iter().enumerate() {
        for name in &worker.backends {
            map.insert(name.clone(), index);
        }
    }
    map
}

pub async fn run_dispatcher(
    listen: &ListenConfig,
    router: Arc<Router>,
    streams: Vec<UnixStream>,
    map: HashMap<String, usize>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", listen.host, listen.port))?;
    info!(
        "dispatcher listening on {}:{} (workers={})",
        listen.host,
        listen.port,
        streams.len()
    );
    serve_dispatcher(listener, router, streams, map).await
}

/// Dispatcher accept loop over an already-bound listener.
pub async fn serve_dispatcher(
    listener: TcpListener,
    router: Arc<Router>,
    streams: Vec<UnixStream>,
    map: HashMap<String, usize>,
) -> anyhow::Result<()> {
    let workers: Arc<Vec<Mutex<UnixStream>>> =
        Arc::new(streams.into_iter().map(Mutex::new).collect());
    let map = Arc::new(map);
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        debug!("dispatcher: new connection from {}", peer_addr);
        let router = Arc::clone(&router);
        let workers = Arc::clone(&workers);
        let map = Arc::clone(&map);
        tokio::spawn(async move {
            if let Err(e) = dispatch_one(socket, router, workers, map).await {
                warn!("dispatcher: connection failed: {}", e);
            }
        });
    }
}

/// Peek the first client packet, refuse SSL once, route, and hand the
/// socket to the owning worker. The dispatcher's copy of the fd closes when
/// `client` drops; the worker holds the duplicate.
async fn dispatch_one(
    mut client: TcpStream,
    router: Arc<Router>,
    workers: Arc<Vec<Mutex<UnixStream>>>,
    map: Arc<HashMap<String, usize>>,
) -> anyhow::Result<()> {
    client.set_nodelay(true).ok();
    let mut buf = BytesMut::with_capacity(1024);
    let mut ssl_refused = false;
    let packet = loop {
        // Refuse SSL as soon as the request is visible. The 8 bytes stay in
        // the buffer: they belong to the handoff payload.
        if !ssl_refused && buf.len() >= 8 && frame::is_ssl_request(&buf[..8]) {
            client.write_all(b"N").await?;
            ssl_refused = true;
            debug!("dispatcher: refused SSL, waiting for startup");
        }
        let need = frame::first_client_packet_length(&buf)?;
        if need > 0 {
            break buf.split_to(need);
        }
        if client.read_buf(&mut buf).await? == 0 {
            debug!("dispatcher: client left before startup");
            return Ok(());
        }
    };

    let startup = if packet.len() >= 8 && frame::is_ssl_request(&packet[..8]) {
        &packet[8..]
    } else {
        &packet[..]
    };
    let Some(user) = frame::startup_parameter(startup, "user") else {
        info!("dispatcher: startup without user, closing");
        return Ok(());
    };
    let database = frame::startup_parameter(startup, "database").unwrap_or_else(|| user.clone());

    let Some(resolved) = router.resolve(&user, &database) else {
        info!(
            "dispatcher: no route for user={} database={}",
            user, database
        );
        return Ok(());
    };
    let mut index = map.get(&resolved.name).copied().unwrap_or(0);
    if index >= workers.len() {
        warn!(
            "dispatcher: backend {} mapped to missing worker {}, using 0",
            resolved.name, index
        );
        index = 0;
    }
    info!(
        "dispatcher: user={} database={} -> backend={} worker={}",
        user, database, resolved.name, index
    );

    let mut sock = workers[index].lock().await;
    fd_passing::send_fd_with_payload(&mut sock, client.as_raw_fd(), &packet).await?;
    Ok(())
}

/// Worker receive loop: each handoff becomes a session seeded with the
/// dispatcher's replay bytes. Ends when the dispatcher closes the pair.
pub async fn run_worker_loop(sock: UnixStream, core: Arc<ProxyCore>) -> anyhow::Result<()> {
    let _reaper = core.spawn_idle_reaper();
    let mut state = RecvState::new();
    loop {
        match fd_passing::recv_fd_with_payload(&sock, &mut state).await? {
            None => {
                info!("worker: dispatcher closed, shutting down");
                return Ok(());
            }
            Some((fd, payload)) => {
                debug!("worker: received client fd, payload_len={}", payload.len());
                let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd.into_raw_fd()) };
                if let Err(e) = std_stream.set_nonblocking(true) {
                    warn!("worker: set_nonblocking on handoff fd failed: {}", e);
                    continue;
                }
                match TcpStream::from_std(std_stream) {
                    Ok(stream) => {
                        tokio::spawn(Session::from_handoff(Arc::clone(&core), stream, &payload).run());
                    }
                    Err(e) => warn!("worker: cannot register handoff fd: {}", e),
                }
            }
        }
    }
}
