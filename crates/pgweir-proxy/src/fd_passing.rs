//! Socket handoff between the dispatcher and a worker.
//!
//! Wire format per handoff: one `sendmsg` carrying a 4-byte big-endian
//! payload length, the first payload bytes, and `SCM_RIGHTS` ancillary data
//! with exactly one file descriptor. Any payload bytes the kernel did not
//! take in that call stream afterwards as ordinary socket data. The receive
//! side keeps a small state record (pending fd, expected length, partial
//! payload) across polls, because the header+fd and the payload tail can
//! arrive in separate reads.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;

/// Cap on a single handoff payload (the first client packet).
pub const MAX_PAYLOAD: usize = 1024 * 1024;

fn nix_to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn sendmsg_once(sock: RawFd, fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::empty(), None).map_err(nix_to_io)
}

/// Dispatcher side: hand `fd` plus `payload` to the worker on `sock`.
pub async fn send_fd_with_payload(
    sock: &mut UnixStream,
    fd: RawFd,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "handoff payload exceeds 1 MiB",
        ));
    }
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);

    let sent = loop {
        sock.writable().await?;
        match sock.try_io(Interest::WRITABLE, || {
            sendmsg_once(sock.as_raw_fd(), fd, &bytes)
        }) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    };
    if sent < 4 {
        return Err(io::Error::other("fd handoff header truncated"));
    }
    // Whatever the kernel did not take with the ancillary data follows as
    // plain stream bytes.
    if sent < bytes.len() {
        sock.write_all(&bytes[sent..]).await?;
    }
    Ok(())
}

/// Partial-receive record carried across event-loop polls on the worker.
#[derive(Debug, Default)]
pub struct RecvState {
    pending_fd: Option<OwnedFd>,
    payload_len: usize,
    payload: Vec<u8>,
}

impl RecvState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One nonblocking step of the receive state machine. `Ok(Some(..))` when a
/// full handoff is assembled, `Ok(None)` on orderly EOF (dispatcher gone),
/// `WouldBlock` when the socket has nothing more right now.
fn recv_step(sock: RawFd, state: &mut RecvState) -> io::Result<Option<(OwnedFd, Vec<u8>)>> {
    if state.pending_fd.is_none() {
        let mut len_buf = [0u8; 4];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(&mut len_buf)];
        let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
            .map_err(nix_to_io)?;
        if msg.bytes == 0 {
            return Ok(None);
        }
        if msg.bytes != 4 {
            return Err(io::Error::other("short fd handoff header"));
        }
        let mut received_fd = None;
        for cmsg in msg.cmsgs().map_err(nix_to_io)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for fd in fds {
                    // Closed on drop if anything below fails.
                    received_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        let Some(fd) = received_fd else {
            return Err(io::Error::other("fd handoff without SCM_RIGHTS"));
        };
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(io::Error::other("fd handoff payload exceeds 1 MiB"));
        }
        state.pending_fd = Some(fd);
        state.payload_len = payload_len;
        state.payload.clear();
        state.payload.reserve(payload_len);
    }

    while state.payload.len() < state.payload_len {
        let mut buf = [0u8; 4096];
        let want = (state.payload_len - state.payload.len()).min(buf.len());
        let n = nix::unistd::read(sock, &mut buf[..want]).map_err(nix_to_io)?;
        if n == 0 {
            *state = RecvState::new();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside fd handoff payload",
            ));
        }
        state.payload.extend_from_slice(&buf[..n]);
    }

    let fd = state.pending_fd.take().expect("fd set above");
    state.payload_len = 0;
    Ok(Some((fd, std::mem::take(&mut state.payload))))
}

/// Worker side: receive the next `(fd, payload)` handoff, tolerating partial
/// reads. `None` once the dispatcher closes its end.
pub async fn recv_fd_with_payload(
    sock: &UnixStream,
    state: &mut RecvState,
) -> io::Result<Option<(OwnedFd, Vec<u8>)>> {
    loop {
        sock.readable().await?;
        match sock.try_io(Interest::READABLE, || recv_step(sock.as_raw_fd(), state)) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
