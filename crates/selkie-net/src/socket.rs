//! Per-worker socket manager.
//!
//! TigerStyle: Single-owner tables, explicit fd lifetimes.
//!
//! Owns the tables of listeners and connections living on one worker,
//! allocates fds, runs the coarse timeout sweep, and forwards commands to
//! connection drivers. Nothing here is shared across workers except the
//! process-wide fd sentry.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use selkie_core::constants::{
    NET_SEND_QUEUE_COUNT_MAX, NET_TIMEOUT_SWEEP_INTERVAL_SECS, SOCKET_COUNT_MAX,
};
use selkie_core::error::{Error, Result};
use selkie_core::{Buffer, Message, PType};

use crate::connection::{ConnCommand, ConnShared, Deliver, LogicError, ReadKind, ReadRequest};
use crate::{stream, text, ws};

/// Worker mailbox sender used for socket event delivery
pub type Mailbox = mpsc::UnboundedSender<Message>;

/// Process-wide guard against fd reuse while a socket is alive
#[derive(Debug, Default)]
pub struct FdSentry {
    inuse: Mutex<HashSet<u32>>,
}

impl FdSentry {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_lock(&self, fd: u32) -> bool {
        self.inuse.lock().expect("fd sentry lock poisoned").insert(fd)
    }

    fn unlock(&self, fd: u32) {
        let removed = self.inuse.lock().expect("fd sentry lock poisoned").remove(&fd);
        debug_assert!(removed, "fd released twice");
    }

    /// Number of live fds across all workers
    pub fn live_count(&self) -> usize {
        self.inuse.lock().expect("fd sentry lock poisoned").len()
    }
}

struct ListenerEntry {
    owner: u32,
    ptype: PType,
    inner: TcpListener,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

struct ConnEntry {
    shared: Rc<ConnShared>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
}

/// Table of one worker's listeners and connections
pub struct SocketManager {
    weak: Weak<SocketManager>,
    worker_id: u8,
    mailbox: Deliver,
    sentry: Arc<FdSentry>,
    counter: Cell<u32>,
    listeners: RefCell<HashMap<u32, Rc<ListenerEntry>>>,
    conns: RefCell<HashMap<u32, ConnEntry>>,
}

impl SocketManager {
    pub fn new(worker_id: u8, mailbox: Mailbox, sentry: Arc<FdSentry>) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            worker_id,
            mailbox,
            sentry,
            counter: Cell::new(0),
            listeners: RefCell::new(HashMap::new()),
            conns: RefCell::new(HashMap::new()),
        })
    }

    fn rc(&self) -> Rc<Self> {
        self.weak.upgrade().expect("socket manager dropped")
    }

    /// Allocate a worker-tagged fd that is unique process-wide
    fn uuid(&self) -> Result<u32> {
        for _ in 0..=SOCKET_COUNT_MAX {
            let c = self.counter.get();
            self.counter.set(c.wrapping_add(1));
            let fd = ((self.worker_id as u32) << 16) | (c % SOCKET_COUNT_MAX + 1);
            if self.sentry.try_lock(fd) {
                return Ok(fd);
            }
        }
        Err(Error::FdExhausted {
            worker: self.worker_id,
        })
    }

    /// Bind a listener; connections it accepts belong to `owner` and use
    /// the framing of `ptype`
    pub async fn listen(&self, host: &str, port: u16, owner: u32, ptype: PType) -> Result<u32> {
        let inner = TcpListener::bind((host, port)).await?;
        let fd = self.uuid()?;
        self.listeners.borrow_mut().insert(
            fd,
            Rc::new(ListenerEntry {
                owner,
                ptype,
                inner,
                accept_task: RefCell::new(None),
            }),
        );
        debug!(fd = format_args!("{fd:08X}"), host, port, "listening");
        Ok(fd)
    }

    /// Local address of a listener (useful with port 0)
    pub fn listen_addr(&self, listen_fd: u32) -> Option<std::net::SocketAddr> {
        self.listeners
            .borrow()
            .get(&listen_fd)
            .and_then(|l| l.inner.local_addr().ok())
    }

    /// Accept a single connection from a listener, owned by `owner`
    pub async fn accept_once(&self, listen_fd: u32, owner: u32) -> Result<u32> {
        let entry = self
            .listeners
            .borrow()
            .get(&listen_fd)
            .cloned()
            .ok_or(Error::socket(listen_fd, "accept on unknown listener"))?;
        let (stream, _) = entry.inner.accept().await?;
        self.create_conn(stream, owner, entry.ptype, true)
    }

    /// Accept continuously, delivering `accept` events to the listener's
    /// owner for every inbound connection
    pub fn start_accept(&self, listen_fd: u32) -> Result<()> {
        let entry = self
            .listeners
            .borrow()
            .get(&listen_fd)
            .cloned()
            .ok_or(Error::socket(listen_fd, "accept on unknown listener"))?;

        let mgr = self.rc();
        let task = tokio::task::spawn_local(async move {
            loop {
                match entry.inner.accept().await {
                    Ok((stream, _)) => {
                        if let Err(e) = mgr.create_conn(stream, entry.owner, entry.ptype, true) {
                            warn!(error = %e, "accepted connection rejected");
                        }
                    }
                    Err(e) => {
                        warn!(fd = format_args!("{listen_fd:08X}"), error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        if let Some(listener) = self.listeners.borrow().get(&listen_fd) {
            *listener.accept_task.borrow_mut() = Some(task);
        }
        Ok(())
    }

    /// Open an outbound connection for `owner`
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        owner: u32,
        ptype: PType,
        timeout_ms: u64,
    ) -> Result<u32> {
        let connecting = TcpStream::connect((host, port));
        let stream = if timeout_ms > 0 {
            tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), connecting)
                .await
                .map_err(|_| Error::socket(0, format!("connect {host}:{port} timed out")))??
        } else {
            connecting.await?
        };
        self.create_conn(stream, owner, ptype, false)
    }

    fn create_conn(
        &self,
        stream: TcpStream,
        owner: u32,
        ptype: PType,
        accepted: bool,
    ) -> Result<u32> {
        let fd = self.uuid()?;
        let shared = Rc::new(ConnShared::new(
            fd,
            owner,
            ptype,
            NET_SEND_QUEUE_COUNT_MAX,
            self.mailbox.clone(),
        ));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        self.conns.borrow_mut().insert(
            fd,
            ConnEntry {
                shared: shared.clone(),
                cmd_tx: cmd_tx.clone(),
            },
        );

        let mgr = self.rc();
        match ptype {
            PType::Socket => {
                tokio::task::spawn_local(stream::run(mgr, shared, stream, accepted, cmd_tx, cmd_rx));
            }
            PType::Text => {
                tokio::task::spawn_local(text::run(mgr, shared, stream, accepted, cmd_tx, cmd_rx));
            }
            PType::Ws => {
                tokio::task::spawn_local(ws::run(mgr, shared, stream, accepted, cmd_tx, cmd_rx));
            }
            other => {
                self.conns.borrow_mut().remove(&fd);
                self.sentry.unlock(fd);
                return Err(Error::socket(
                    fd,
                    format!("no framing for protocol type {}", other.as_u8()),
                ));
            }
        }
        Ok(fd)
    }

    /// Issue a demand read; failures reply on the session
    pub fn read(&self, fd: u32, owner: u32, kind: ReadKind, session: i32) {
        let cmd_tx = self.conns.borrow().get(&fd).map(|c| c.cmd_tx.clone());
        match cmd_tx {
            Some(tx) => {
                let _ = tx.send(ConnCommand::Read(ReadRequest { kind, session }));
            }
            None => self.respond_error(fd, owner, session, "closed", "read an invalid socket"),
        }
    }

    /// Queue a buffer for sending
    pub fn write(&self, fd: u32, buf: Buffer) -> bool {
        match self.conns.borrow().get(&fd) {
            Some(conn) => conn.cmd_tx.send(ConnCommand::Send(Arc::new(buf))).is_ok(),
            None => false,
        }
    }

    /// Queue a buffer with extra flag bits (framing, close-after-send, ws
    /// frame kind)
    pub fn write_flagged(&self, fd: u32, mut buf: Buffer, flags: u8) -> bool {
        buf.set_flag(flags);
        self.write(fd, buf)
    }

    /// Close a connection or listener
    pub fn close(&self, fd: u32) -> bool {
        if let Some(conn) = self.conns.borrow().get(&fd) {
            let _ = conn.cmd_tx.send(ConnCommand::Close);
            return true;
        }
        if let Some(listener) = self.listeners.borrow_mut().remove(&fd) {
            if let Some(task) = listener.accept_task.borrow_mut().take() {
                task.abort();
            }
            self.sentry.unlock(fd);
            return true;
        }
        false
    }

    /// Set the receive-idle timeout in seconds; 0 disables
    pub fn settimeout(&self, fd: u32, secs: u64) -> bool {
        match self.conns.borrow().get(&fd) {
            Some(conn) => {
                conn.shared.timeout_secs.set(secs);
                true
            }
            None => false,
        }
    }

    /// Enable TCP_NODELAY
    pub fn setnodelay(&self, fd: u32) -> bool {
        match self.conns.borrow().get(&fd) {
            Some(conn) => conn.cmd_tx.send(ConnCommand::SetNoDelay).is_ok(),
            None => false,
        }
    }

    /// Switch chunked framing per direction: "r", "w", "rw"/"wr", "none"
    pub fn set_enable_chunked(&self, fd: u32, flags: &str) -> bool {
        let (recv, send) = match flags.to_ascii_lowercase().as_str() {
            "none" => (false, false),
            "r" => (true, false),
            "w" => (false, true),
            "rw" | "wr" => (true, true),
            other => {
                warn!(flags = other, "unsupported chunked flag; use 'r' 'w' 'rw' 'none'");
                return false;
            }
        };
        match self.conns.borrow().get(&fd) {
            Some(conn) => {
                conn.shared.chunk_recv.set(recv);
                conn.shared.chunk_send.set(send);
                true
            }
            None => false,
        }
    }

    /// Override the hard send-queue limit of one connection
    pub fn set_send_queue_limit(&self, fd: u32, limit: usize) -> bool {
        match self.conns.borrow().get(&fd) {
            Some(conn) => {
                conn.shared.queue_limit.set(limit.max(1));
                true
            }
            None => false,
        }
    }

    /// Remote address of a connection
    pub fn getaddress(&self, fd: u32) -> Option<String> {
        self.conns
            .borrow()
            .get(&fd)
            .map(|c| c.shared.addr.borrow().clone())
    }

    /// Number of live connections on this worker
    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    /// Close everything owned by a departing service
    pub fn close_owned(&self, owner: u32) {
        let conn_fds: Vec<u32> = self
            .conns
            .borrow()
            .iter()
            .filter(|(_, c)| c.shared.owner == owner)
            .map(|(fd, _)| *fd)
            .collect();
        let listener_fds: Vec<u32> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(_, l)| l.owner == owner)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in conn_fds.into_iter().chain(listener_fds) {
            self.close(fd);
        }
    }

    /// Close everything; used at worker shutdown
    pub fn shutdown(&self) {
        let fds: Vec<u32> = self
            .conns
            .borrow()
            .keys()
            .chain(self.listeners.borrow().keys())
            .copied()
            .collect();
        for fd in fds {
            self.close(fd);
        }
    }

    /// Run the coarse sweep closing receive-idle connections
    pub fn start_sweep(&self) -> JoinHandle<()> {
        let mgr = self.rc();
        tokio::task::spawn_local(async move {
            let interval = std::time::Duration::from_secs(NET_TIMEOUT_SWEEP_INTERVAL_SECS);
            loop {
                tokio::time::sleep(interval).await;
                let now = selkie_core::time::monotonic_ms();
                let expired: Vec<_> = mgr
                    .conns
                    .borrow()
                    .values()
                    .filter(|c| {
                        let secs = c.shared.timeout_secs.get();
                        secs > 0 && now.saturating_sub(c.shared.last_recv_ms.get()) > secs * 1000
                    })
                    .map(|c| (c.shared.clone(), c.cmd_tx.clone()))
                    .collect();
                for (shared, cmd_tx) in expired {
                    warn!(
                        error = %Error::ConnectionTimeout { fd: shared.fd },
                        "closing idle connection"
                    );
                    shared.logic_error.set(LogicError::Timeout);
                    let _ = cmd_tx.send(ConnCommand::Close);
                }
            }
        })
    }

    /// Remove a finished connection and release its fd; called by drivers
    pub(crate) fn remove_connection(&self, fd: u32) {
        if self.conns.borrow_mut().remove(&fd).is_some() {
            self.sentry.unlock(fd);
        }
    }

    fn respond_error(&self, fd: u32, owner: u32, session: i32, header: &str, text: &str) {
        if session == 0 {
            return;
        }
        let msg = Message {
            sender: fd,
            receiver: owner,
            session,
            ptype: PType::Error,
            subtype: 0,
            header: header.into(),
            data: Arc::new(Buffer::from(text)),
        };
        let _ = self.mailbox.send(msg);
    }
}
