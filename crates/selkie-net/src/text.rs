//! Delimiter- and size-based demand reads.
//!
//! TigerStyle: Demand-driven reads, one pending request, explicit usage errors.
//!
//! Text connections never push data at their owner: a service issues
//! `read(fd, n | delim, session)` and the connection replies once the
//! request is satisfiable, reading from the socket only while a request is
//! parked. At most one read may be pending; a second is a usage error.

use std::rc::Rc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use selkie_core::constants::NET_RECV_CHUNK_BYTES;
use selkie_core::error::Error;
use selkie_core::{Buffer, SocketEvent};

use crate::connection::{
    enqueue_send, finish, writer_loop, ConnCommand, ConnShared, ReadKind, ReadRequest,
};
use crate::socket::SocketManager;

/// Take the satisfying prefix of the receive buffer, if present.
///
/// Delimiter reads strip the delimiter from the returned payload.
pub(crate) fn try_satisfy(rbuf: &mut BytesMut, kind: &ReadKind) -> Option<Vec<u8>> {
    match kind {
        ReadKind::Exact(n) => {
            if rbuf.len() >= *n {
                Some(rbuf.split_to(*n).to_vec())
            } else {
                None
            }
        }
        ReadKind::Until(delim) => {
            debug_assert!(!delim.is_empty(), "empty read delimiter");
            rbuf.windows(delim.len())
                .position(|w| w == delim.as_slice())
                .map(|pos| {
                    let mut taken = rbuf.split_to(pos + delim.len()).to_vec();
                    taken.truncate(pos);
                    taken
                })
        }
    }
}

/// Drive a text-framed connection.
pub(crate) async fn run(
    mgr: Rc<SocketManager>,
    shared: Rc<ConnShared>,
    stream: TcpStream,
    accepted: bool,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    if let Ok(peer) = stream.peer_addr() {
        *shared.addr.borrow_mut() = peer.to_string();
    }
    shared.touch();
    let open_event = if accepted {
        SocketEvent::Accept
    } else {
        SocketEvent::Connect
    };
    shared.deliver_event(open_event, 0, Buffer::from(shared.addr.borrow().as_str()));

    let (rd, wr) = stream.into_split();
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let writer = tokio::task::spawn_local(writer_loop(
        shared.clone(),
        wr,
        wire_rx,
        cmd_tx.clone(),
    ));

    let mut rd = rd;
    let mut rbuf = BytesMut::with_capacity(NET_RECV_CHUNK_BYTES);
    let mut pending: Option<ReadRequest> = None;
    let mut io_err = None;

    'main: loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                None | Some(ConnCommand::Close) => break 'main,
                Some(ConnCommand::Send(buf)) => {
                    if !enqueue_send(&shared, &wire_tx, buf) {
                        break 'main;
                    }
                }
                Some(ConnCommand::Read(req)) => {
                    if pending.is_some() {
                        let err = Error::DoubleRead { fd: shared.fd };
                        shared.reply_error(req.session, "read", &err.to_string());
                    } else if let Some(data) = try_satisfy(&mut rbuf, &req.kind) {
                        shared.reply(req.session, Buffer::from(data));
                    } else {
                        pending = Some(req);
                    }
                }
                Some(ConnCommand::SetNoDelay) => {
                    let _ = rd.as_ref().set_nodelay(true);
                }
            },
            n = rd.read_buf(&mut rbuf), if pending.is_some() => match n {
                Ok(0) => break 'main,
                Ok(_) => {
                    shared.touch();
                    let req = pending.take().expect("guarded by pending.is_some()");
                    if let Some(data) = try_satisfy(&mut rbuf, &req.kind) {
                        shared.reply(req.session, Buffer::from(data));
                    } else {
                        pending = Some(req);
                    }
                }
                Err(e) => {
                    io_err = Some(e);
                    break 'main;
                }
            },
        }
    }

    writer.abort();
    finish(&mgr, &shared, io_err, pending.map(|r| r.session));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_read() {
        let mut rbuf = BytesMut::from(&b"abcdef"[..]);
        assert_eq!(
            try_satisfy(&mut rbuf, &ReadKind::Exact(4)).as_deref(),
            Some(b"abcd".as_ref())
        );
        assert_eq!(rbuf.as_ref(), b"ef");
        assert!(try_satisfy(&mut rbuf, &ReadKind::Exact(4)).is_none());
    }

    #[test]
    fn test_delimiter_read_strips_delimiter() {
        let mut rbuf = BytesMut::from(&b"PING\r\nPONG\r\n"[..]);
        let kind = ReadKind::Until(b"\r\n".to_vec());

        assert_eq!(try_satisfy(&mut rbuf, &kind).as_deref(), Some(b"PING".as_ref()));
        assert_eq!(try_satisfy(&mut rbuf, &kind).as_deref(), Some(b"PONG".as_ref()));
        assert!(try_satisfy(&mut rbuf, &kind).is_none());
        assert!(rbuf.is_empty());
    }

    #[test]
    fn test_delimiter_split_across_feeds() {
        let mut rbuf = BytesMut::from(&b"hal"[..]);
        let kind = ReadKind::Until(b"\r\n".to_vec());
        assert!(try_satisfy(&mut rbuf, &kind).is_none());

        rbuf.extend_from_slice(b"f\r\nrest");
        assert_eq!(try_satisfy(&mut rbuf, &kind).as_deref(), Some(b"half".as_ref()));
        assert_eq!(rbuf.as_ref(), b"rest");
    }
}
