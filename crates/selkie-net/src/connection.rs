//! Shared per-connection state and the command surface of connection
//!
//! TigerStyle: Bounded send queues with explicit limits, no silent drops.
//! drivers.
//!
//! Every connection is a worker-local task owning its TCP stream. The
//! socket manager talks to it through an unbounded command channel and a
//! small shared cell block (timeout, send-queue accounting, chunked-mode
//! switches). Events for the owning service are delivered through the
//! worker mailbox so they interleave with ordinary messages in FIFO order.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{error, warn};

use selkie_core::buffer::flag;
use selkie_core::constants::NET_SEND_QUEUE_WARN_COUNT;
use selkie_core::error::Error;
use selkie_core::{Buffer, Message, PType, SocketEvent};

use crate::socket::SocketManager;
use crate::stream;

/// Mailbox of the worker that owns a connection
pub(crate) type Deliver = mpsc::UnboundedSender<Message>;

/// Connection-closing reasons decided by runtime logic, as opposed to
/// errors reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogicError {
    Ok = 0,
    FrameTooLarge = 1,
    Timeout = 2,
    SendQueueOverflow = 3,
    Handshake = 4,
}

impl LogicError {
    pub fn text(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FrameTooLarge => "frame too large",
            Self::Timeout => "timeout",
            Self::SendQueueOverflow => "send_queue_overflow",
            Self::Handshake => "handshake failed",
        }
    }
}

/// One demand read on a text-framed connection
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub kind: ReadKind,
    pub session: i32,
}

/// What a demand read waits for
#[derive(Debug, Clone)]
pub enum ReadKind {
    /// Exactly `n` bytes
    Exact(usize),
    /// Up to and excluding the delimiter
    Until(Vec<u8>),
}

/// Commands accepted by a connection driver
pub(crate) enum ConnCommand {
    Send(Arc<Buffer>),
    Read(ReadRequest),
    Close,
    SetNoDelay,
}

/// State shared between the socket manager and one connection driver.
///
/// Single-threaded by construction (manager and driver live on the same
/// worker), so plain cells suffice.
pub(crate) struct ConnShared {
    pub fd: u32,
    pub owner: u32,
    pub ptype: PType,
    pub mailbox: Deliver,
    pub addr: RefCell<String>,
    pub last_recv_ms: Cell<u64>,
    pub timeout_secs: Cell<u64>,
    pub queue_depth: Cell<usize>,
    pub queue_limit: Cell<usize>,
    pub chunk_recv: Cell<bool>,
    pub chunk_send: Cell<bool>,
    pub logic_error: Cell<LogicError>,
}

impl ConnShared {
    pub fn new(fd: u32, owner: u32, ptype: PType, queue_limit: usize, mailbox: Deliver) -> Self {
        Self {
            fd,
            owner,
            ptype,
            mailbox,
            addr: RefCell::new(String::new()),
            last_recv_ms: Cell::new(selkie_core::time::monotonic_ms()),
            timeout_secs: Cell::new(0),
            queue_depth: Cell::new(0),
            queue_limit: Cell::new(queue_limit),
            chunk_recv: Cell::new(false),
            chunk_send: Cell::new(false),
            logic_error: Cell::new(LogicError::Ok),
        }
    }

    /// Record receive activity for the timeout sweep
    pub fn touch(&self) {
        self.last_recv_ms.set(selkie_core::time::monotonic_ms());
    }

    /// Deliver a socket event to the owning service
    pub fn deliver_event(&self, event: SocketEvent, session: i32, body: Buffer) {
        let msg =
            Message::socket_event(self.fd, self.owner, self.ptype, event, session, Arc::new(body));
        let _ = self.mailbox.send(msg);
    }

    /// Reply to a parked read with payload data
    pub fn reply(&self, session: i32, body: Buffer) {
        self.deliver_event(SocketEvent::Data, session, body);
    }

    /// Fail a sessioned operation with an error reply
    pub fn reply_error(&self, session: i32, header: &str, text: &str) {
        if session == 0 {
            return;
        }
        let msg = Message {
            sender: self.fd,
            receiver: self.owner,
            session,
            ptype: PType::Error,
            subtype: 0,
            header: header.into(),
            data: Arc::new(Buffer::from(text)),
        };
        let _ = self.mailbox.send(msg);
    }
}

/// Push a buffer onto the wire queue, enforcing the soft and hard limits.
///
/// Returns false when the hard limit was crossed; the caller must then tear
/// the connection down with `logic_error = SendQueueOverflow` already set.
pub(crate) fn enqueue_send(
    shared: &ConnShared,
    wire_tx: &mpsc::UnboundedSender<Arc<Buffer>>,
    buf: Arc<Buffer>,
) -> bool {
    let depth = shared.queue_depth.get() + 1;
    shared.queue_depth.set(depth);

    if depth >= NET_SEND_QUEUE_WARN_COUNT {
        warn!(fd = format_args!("{:08X}", shared.fd), depth, "network send queue too long");
    }
    if depth > shared.queue_limit.get() {
        error!(
            error = %Error::SendQueueOverflow {
                fd: shared.fd,
                depth,
                limit: shared.queue_limit.get(),
            },
            "closing connection"
        );
        shared.logic_error.set(LogicError::SendQueueOverflow);
        return false;
    }

    wire_tx.send(buf).is_ok()
}

/// Drain the wire queue onto a plain TCP write half.
///
/// Used by the stream and text drivers; the WebSocket driver has its own
/// sink-based writer. A buffer flagged `CLOSE_AFTER_SEND` shuts the write
/// side down after draining and asks the main loop to close.
pub(crate) async fn writer_loop(
    shared: Rc<ConnShared>,
    mut wr: OwnedWriteHalf,
    mut wire_rx: mpsc::UnboundedReceiver<Arc<Buffer>>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
) {
    while let Some(buf) = wire_rx.recv().await {
        let close_after = buf.has_flag(flag::CLOSE_AFTER_SEND);
        let result = stream::write_buffer(&mut wr, &shared, buf).await;
        shared
            .queue_depth
            .set(shared.queue_depth.get().saturating_sub(1));

        match result {
            Ok(()) if close_after => {
                let _ = wr.shutdown().await;
                let _ = cmd_tx.send(ConnCommand::Close);
                return;
            }
            Ok(()) => {}
            Err(_) => {
                let _ = cmd_tx.send(ConnCommand::Close);
                return;
            }
        }
    }
}

/// Tear a connection down: deliver `error` (when there is one to report)
/// then `close` to the owner, fail any parked read, and release the fd.
pub(crate) fn finish(
    mgr: &Rc<SocketManager>,
    shared: &ConnShared,
    io_err: Option<std::io::Error>,
    pending_read: Option<i32>,
) {
    let addr = shared.addr.borrow().clone();
    let lerr = shared.logic_error.get();

    if lerr != LogicError::Ok {
        let body = serde_json::json!({
            "addr": addr,
            "logic_errcode": lerr as u8,
            "errmsg": lerr.text(),
        })
        .to_string();
        shared.deliver_event(SocketEvent::Error, 0, Buffer::from(body));
    } else if let Some(e) = io_err {
        let body = serde_json::json!({
            "addr": addr,
            "errcode": e.raw_os_error().unwrap_or(0),
            "errmsg": e.to_string(),
        })
        .to_string();
        shared.deliver_event(SocketEvent::Error, 0, Buffer::from(body));
    }

    if let Some(session) = pending_read {
        shared.reply_error(session, "closed", "socket closed while read pending");
    }

    shared.deliver_event(SocketEvent::Close, 0, Buffer::from(addr));
    mgr.remove_connection(shared.fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_limit(limit: usize) -> (ConnShared, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnShared::new(0x0001_0001, 1, PType::Socket, limit, tx), rx)
    }

    #[test]
    fn test_enqueue_send_overflow_at_limit() {
        let (shared, _rx) = shared_with_limit(4);
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel();

        for _ in 0..4 {
            assert!(enqueue_send(&shared, &wire_tx, Arc::new(Buffer::from("x"))));
        }
        // The fifth write crosses the hard limit
        assert!(!enqueue_send(&shared, &wire_tx, Arc::new(Buffer::from("x"))));
        assert_eq!(shared.logic_error.get(), LogicError::SendQueueOverflow);

        // Only the accepted writes reached the wire queue
        let mut queued = 0;
        while wire_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[test]
    fn test_reply_error_drops_session_zero() {
        let (shared, mut rx) = shared_with_limit(4);
        shared.reply_error(0, "closed", "ignored");
        assert!(rx.try_recv().is_err());

        shared.reply_error(9, "closed", "gone");
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.session, 9);
        assert_eq!(msg.ptype, PType::Error);
        assert_eq!(msg.text(), "gone");
    }
}
