//! The API surface a behavior sees.
//!
//! TigerStyle: One explicit API surface per service, errors as values.
//!
//! A `ServiceContext` borrows the identity of one service on its worker:
//! messaging and calls through the router, timers and sleeps on the worker
//! wheel, sockets on the worker's socket manager, and the service's own
//! accounting. Contexts are worker-local and cheap to clone.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use selkie_core::buffer::flag;
use selkie_core::error::{Error, Result};
use selkie_core::time::monotonic_ms;
use selkie_core::{Buffer, Message, PType, ServiceConfig};
use selkie_net::ReadKind;

use crate::protocol::ProtocolEntry;
use crate::service::ServiceCell;
use crate::worker::{Ctrl, WorkerShared};

/// How a call failed, as seen by the calling task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The remote side replied with an error
    Remote(String),
    /// The target service exited before replying
    TargetExited,
    /// The reply did not arrive in time; a late reply will be dropped
    Timeout,
    /// The runtime dropped the waker (service torn down mid-call)
    Closed,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(text) => write!(f, "remote error: {text}"),
            Self::TargetExited => write!(f, "target exited"),
            Self::Timeout => write!(f, "timeout"),
            Self::Closed => write!(f, "call dropped"),
        }
    }
}

impl std::error::Error for CallError {}

/// A successful reply
#[derive(Debug)]
pub struct Reply {
    /// The raw reply envelope
    pub message: Message,
    /// Payload decoded by the protocol's codec, when it has one
    pub value: Option<Value>,
}

/// Per-service handle onto the runtime
#[derive(Clone)]
pub struct ServiceContext {
    cell: Rc<ServiceCell>,
    worker: Rc<WorkerShared>,
}

impl ServiceContext {
    pub(crate) fn new(cell: Rc<ServiceCell>, worker: Rc<WorkerShared>) -> Self {
        Self { cell, worker }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn id(&self) -> u32 {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Worker hosting this service
    pub fn worker_id(&self) -> u8 {
        self.worker.id
    }

    /// Accumulated dispatch time of this service in microseconds
    pub fn cpu_micros(&self) -> u64 {
        self.cell.cpu_micros.get()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Fire a message at a service; `to == 0` resolves `header` as a
    /// unique name
    pub fn send(
        &self,
        to: u32,
        ptype: PType,
        data: Buffer,
        header: &str,
        session: i32,
    ) -> Result<()> {
        self.worker
            .router
            .send(self.id(), to, Arc::new(data), header, session, ptype)
            .map(|_| ())
    }

    /// Fire a structured payload, fire-and-forget
    pub fn send_json(&self, to: u32, value: &Value) -> Result<()> {
        let data = self.cell.protocols.pack(PType::Lua, value)?;
        self.send(to, PType::Lua, data, "", 0)
    }

    /// Request/response: send and suspend until the reply arrives
    pub async fn call(
        &self,
        ptype: PType,
        to: u32,
        data: Buffer,
        header: &str,
    ) -> std::result::Result<Reply, CallError> {
        self.do_call(ptype, to, data, header, None).await
    }

    /// `call` racing a timer; the loser is cancelled
    pub async fn call_timeout(
        &self,
        ptype: PType,
        to: u32,
        data: Buffer,
        header: &str,
        timeout_ms: u64,
    ) -> std::result::Result<Reply, CallError> {
        self.do_call(ptype, to, data, header, Some(timeout_ms)).await
    }

    /// Structured request/response over `PType::Lua`
    pub async fn call_json(
        &self,
        to: u32,
        value: &Value,
    ) -> std::result::Result<Value, CallError> {
        let data = self
            .cell
            .protocols
            .pack(PType::Lua, value)
            .map_err(|e| CallError::Remote(e.to_string()))?;
        let reply = self.call(PType::Lua, to, data, "").await?;
        reply.value.ok_or(CallError::Remote("reply not decodable".into()))
    }

    async fn do_call(
        &self,
        ptype: PType,
        to: u32,
        data: Buffer,
        header: &str,
        timeout_ms: Option<u64>,
    ) -> std::result::Result<Reply, CallError> {
        let session = self.cell.sessions.next_session();
        let (tx, mut rx) = oneshot::channel();

        // Register against the resolved receiver, not the raw address: a
        // name-addressed call (`to == 0`) must watch the real target so
        // its exit fails the pending session. No await separates send and
        // register, so the reply cannot race the registration.
        let receiver = match self
            .worker
            .router
            .send(self.id(), to, Arc::new(data), header, session, ptype)
        {
            Ok(receiver) => receiver,
            Err(e) => return Err(CallError::Remote(e.to_string())),
        };
        self.cell.sessions.register(session, receiver, tx);

        let msg = match timeout_ms {
            None => rx.await.map_err(|_| CallError::Closed)?,
            Some(ms) => {
                tokio::select! {
                    reply = &mut rx => reply.map_err(|_| CallError::Closed)?,
                    _ = self.sleep(ms) => {
                        self.cell.sessions.cancel(session);
                        return Err(CallError::Timeout);
                    }
                }
            }
        };

        if msg.ptype == PType::Error {
            if msg.header == "exit" {
                return Err(CallError::TargetExited);
            }
            return Err(CallError::Remote(msg.text().into_owned()));
        }
        let value = self
            .cell
            .protocols
            .unpack(msg.ptype, msg.bytes())
            .ok()
            .flatten();
        Ok(Reply { message: msg, value })
    }

    /// Reply to a request. `session` is the (negative) session of the
    /// incoming message; zero is a no-op.
    pub fn response(&self, ptype: PType, to: u32, session: i32, data: Buffer) {
        if session == 0 {
            return;
        }
        if let Err(e) = self
            .worker
            .router
            .send(self.id(), to, Arc::new(data), "", session, ptype)
        {
            warn!(service = %self.name(), error = %e, "response dropped");
        }
    }

    /// Reply with a structured payload
    pub fn response_json(&self, to: u32, session: i32, value: &Value) {
        match self.cell.protocols.pack(PType::Lua, value) {
            Ok(data) => self.response(PType::Lua, to, session, data),
            Err(e) => warn!(service = %self.name(), error = %e, "response pack failed"),
        }
    }

    /// Make a pending session inert; a late reply is dropped. Idempotent.
    pub fn cancel_session(&self, session: i32) {
        self.cell.sessions.cancel(session);
    }

    /// Run a task on behalf of this service; its poll time accrues to the
    /// service's CPU cost
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        crate::worker::spawn_timed(self.cell.clone(), fut);
    }

    /// Fan a message to every service on every worker
    pub fn broadcast(&self, ptype: PType, data: Buffer, header: &str) {
        self.worker
            .router
            .broadcast(self.id(), Arc::new(data), header, ptype);
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Create a service; `worker_hint > 0` pins it, otherwise round-robin
    pub async fn new_service(&self, cfg: ServiceConfig, worker_hint: u8) -> Result<u32> {
        let rx = self.worker.router.new_service(cfg, worker_hint)?;
        rx.await
            .map_err(|_| Error::internal("service creation reply dropped"))?
    }

    /// Remove a service by id
    pub fn remove_service(&self, id: u32) -> Result<()> {
        self.worker.router.remove_service(id, 0, 0)
    }

    /// Resolve a unique service name
    pub fn query_service(&self, name: &str) -> Option<u32> {
        self.worker.router.query_service(name)
    }

    /// Run a text admin command (`<worker-id> <cmd> [args…]`) and await
    /// its reply
    pub async fn runcmd(&self, cmdline: &str) -> std::result::Result<String, CallError> {
        let session = self.cell.sessions.next_session();
        let (tx, rx) = oneshot::channel();
        self.cell.sessions.register(session, 0, tx);

        if let Err(e) = self.worker.router.runcmd(self.id(), cmdline, session) {
            self.cell.sessions.discard(session);
            return Err(CallError::Remote(e.to_string()));
        }

        let msg = rx.await.map_err(|_| CallError::Closed)?;
        if msg.ptype == PType::Error {
            return Err(CallError::Remote(msg.text().into_owned()));
        }
        Ok(msg.text().into_owned())
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.worker.router.set_env(name, value);
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.worker.router.get_env(name)
    }

    /// Begin graceful removal of this service
    pub fn quit(&self) {
        if self.cell.quitting.replace(true) {
            return;
        }
        let _ = self.worker.ctrl_tx.send(Ctrl::Remove {
            id: self.id(),
            reply_to: 0,
            session: 0,
        });
    }

    /// Stop the whole server
    pub fn abort(&self) {
        self.worker.router.stop();
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Schedule the timer callback every `interval_ms`, `times` times
    /// (`times <= 0` means forever); returns the timer id
    pub fn repeated(&self, interval_ms: u64, times: i32) -> u32 {
        let id = self.worker.timers.borrow_mut().repeated(
            interval_ms,
            times,
            self.id(),
            monotonic_ms(),
        );
        self.worker.timer_notify.notify_one();
        id
    }

    /// Cancel a timer; allowed from inside its own fire
    pub fn remove_timer(&self, id: u32) {
        self.worker.timers.borrow_mut().remove(id);
    }

    /// Suspend the calling task for `ms` milliseconds
    pub async fn sleep(&self, ms: u64) {
        let (tx, rx) = oneshot::channel();
        self.worker
            .timers
            .borrow_mut()
            .wake_after(ms, self.id(), tx, monotonic_ms());
        self.worker.timer_notify.notify_one();
        let _ = rx.await;
    }

    // =========================================================================
    // Sockets
    // =========================================================================

    /// Bind a listener whose connections belong to this service
    pub async fn listen(&self, host: &str, port: u16, ptype: PType) -> Result<u32> {
        self.worker.sockets.listen(host, port, self.id(), ptype).await
    }

    /// Local address of a listener
    pub fn listen_addr(&self, listen_fd: u32) -> Option<std::net::SocketAddr> {
        self.worker.sockets.listen_addr(listen_fd)
    }

    /// Accept one connection, returning its fd
    pub async fn accept(&self, listen_fd: u32) -> Result<u32> {
        self.worker.sockets.accept_once(listen_fd, self.id()).await
    }

    /// Accept continuously; each connection arrives as an `accept` event
    pub fn start_accept(&self, listen_fd: u32) -> Result<()> {
        self.worker.sockets.start_accept(listen_fd)
    }

    /// Open an outbound connection; `timeout_ms == 0` waits forever
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        ptype: PType,
        timeout_ms: u64,
    ) -> Result<u32> {
        self.worker
            .sockets
            .connect(host, port, self.id(), ptype, timeout_ms)
            .await
    }

    /// Demand read on a text connection; suspends until satisfied
    pub async fn read(&self, fd: u32, kind: ReadKind) -> std::result::Result<Vec<u8>, CallError> {
        let session = self.cell.sessions.next_session();
        let (tx, rx) = oneshot::channel();
        self.cell.sessions.register(session, 0, tx);
        self.worker.sockets.read(fd, self.id(), kind, session);

        let msg = rx.await.map_err(|_| CallError::Closed)?;
        if msg.ptype == PType::Error {
            return Err(CallError::Remote(msg.text().into_owned()));
        }
        Ok(msg.bytes().to_vec())
    }

    /// Queue raw bytes for sending
    pub fn write(&self, fd: u32, data: Buffer) -> bool {
        self.worker.sockets.write(fd, data)
    }

    /// Queue a buffer with extra flag bits (framing, ws frame kind, …)
    pub fn write_flagged(&self, fd: u32, data: Buffer, flags: u8) -> bool {
        self.worker.sockets.write_flagged(fd, data, flags)
    }

    /// Queue a buffer and close the connection once it has drained
    pub fn write_then_close(&self, fd: u32, data: Buffer) -> bool {
        self.worker
            .sockets
            .write_flagged(fd, data, flag::CLOSE_AFTER_SEND)
    }

    /// Close a connection or listener
    pub fn close_socket(&self, fd: u32) -> bool {
        self.worker.sockets.close(fd)
    }

    /// Receive-idle timeout in seconds; 0 disables
    pub fn settimeout(&self, fd: u32, secs: u64) -> bool {
        self.worker.sockets.settimeout(fd, secs)
    }

    pub fn setnodelay(&self, fd: u32) -> bool {
        self.worker.sockets.setnodelay(fd)
    }

    /// Chunked framing per direction: "r", "w", "rw", "none"
    pub fn set_enable_chunked(&self, fd: u32, flags: &str) -> bool {
        self.worker.sockets.set_enable_chunked(fd, flags)
    }

    pub fn set_send_queue_limit(&self, fd: u32, limit: usize) -> bool {
        self.worker.sockets.set_send_queue_limit(fd, limit)
    }

    pub fn getaddress(&self, fd: u32) -> Option<String> {
        self.worker.sockets.getaddress(fd)
    }

    // =========================================================================
    // Protocols & memory
    // =========================================================================

    /// Install a protocol codec for this service
    pub fn register_protocol(&self, ptype: PType, entry: ProtocolEntry) {
        self.cell.protocols.register(ptype, entry);
    }

    /// Account an allocation against the service's memory limit
    pub fn track_alloc(&self, bytes: u64) -> Result<()> {
        self.cell.track_alloc(bytes)
    }

    /// Account a release
    pub fn track_dealloc(&self, bytes: u64) {
        self.cell.track_dealloc(bytes)
    }

    /// Currently accounted memory in bytes
    pub fn mem_used(&self) -> u64 {
        self.cell.mem.used.get()
    }
}
