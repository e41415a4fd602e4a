//! Process-global message routing.
//!
//! TigerStyle: Routing by bit extraction, one shared directory, explicit fan-out.
//!
//! The router maps service ids to workers (a bit extraction, no table),
//! owns the unique-name directory (the only shared mutable directory in
//! the process), fans broadcasts out to every worker, and places new
//! services round-robin. Everything else lives on exactly one worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tracing::{info, warn};

use selkie_core::env::EnvStore;
use selkie_core::error::{Error, Result};
use selkie_core::{worker_of_service, Buffer, Message, PType, ServiceConfig};
use selkie_net::FdSentry;

use crate::service::BehaviorFactory;
use crate::worker::{Ctrl, WorkerHandle};

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Init,
        }
    }
}

/// Process-global directory and fan-out
pub struct Router {
    workers: Vec<WorkerHandle>,
    unique: RwLock<HashMap<String, u32>>,
    behaviors: HashMap<String, BehaviorFactory>,
    env: EnvStore,
    fd_sentry: Arc<FdSentry>,
    state: AtomicU8,
    round_robin: AtomicU32,
    service_count: AtomicU32,
}

impl Router {
    pub(crate) fn new(
        workers: Vec<WorkerHandle>,
        behaviors: HashMap<String, BehaviorFactory>,
    ) -> Self {
        debug_assert!(!workers.is_empty());
        Self {
            workers,
            unique: RwLock::new(HashMap::new()),
            behaviors,
            env: EnvStore::new(),
            fd_sentry: Arc::new(FdSentry::new()),
            state: AtomicU8::new(ServerState::Init as u8),
            round_robin: AtomicU32::new(0),
            service_count: AtomicU32::new(0),
        }
    }

    fn worker(&self, id: u8) -> Result<&WorkerHandle> {
        if id == 0 || id as usize > self.workers.len() {
            return Err(Error::WorkerNotFound { worker: id });
        }
        Ok(&self.workers[id as usize - 1])
    }

    /// Route a message to its receiver's worker without copying the
    /// payload. `to == 0` resolves `header` as a unique name first; the
    /// resolved receiver id is returned so callers waiting on a reply can
    /// watch the real target.
    ///
    /// Non-zero sessions are negated on delivery: requests arrive at the
    /// receiver negative, and a reply sent back through here restores the
    /// caller's positive id.
    pub fn send(
        &self,
        sender: u32,
        to: u32,
        data: Arc<Buffer>,
        header: &str,
        session: i32,
        ptype: PType,
    ) -> Result<u32> {
        let receiver = if to == 0 {
            self.query_service(header)
                .ok_or_else(|| Error::UniqueServiceNotFound {
                    name: header.into(),
                })?
        } else {
            to
        };

        let handle = self.worker(worker_of_service(receiver))?;
        let msg = Message {
            sender,
            receiver,
            session: -session,
            ptype,
            subtype: 0,
            header: header.into(),
            data,
        };
        handle
            .mailbox_tx
            .send(msg)
            .map_err(|_| Error::internal("worker mailbox closed"))?;
        Ok(receiver)
    }

    /// Internal reply path: the session is delivered as-is
    pub(crate) fn respond(&self, to: u32, header: &str, session: i32, text: &str, ptype: PType) {
        if to == 0 || session == 0 {
            return;
        }
        let Ok(handle) = self.worker(worker_of_service(to)) else {
            warn!(to = format_args!("{to:08X}"), "response to unroutable service");
            return;
        };
        let msg = Message {
            sender: 0,
            receiver: to,
            session,
            ptype,
            subtype: 0,
            header: header.into(),
            data: Arc::new(Buffer::from(text)),
        };
        let _ = handle.mailbox_tx.send(msg);
    }

    /// Fan one message (shared payload) to every worker; each delivers it
    /// to all local services except the sender
    pub fn broadcast(&self, sender: u32, data: Arc<Buffer>, header: &str, ptype: PType) {
        for handle in &self.workers {
            let msg = Message {
                sender,
                receiver: 0,
                session: 0,
                ptype,
                subtype: 0,
                header: header.into(),
                data: data.clone(),
            };
            let _ = handle.mailbox_tx.send(msg);
        }
    }

    /// Tell every worker that a service exited, failing calls that were
    /// waiting on it
    pub(crate) fn notify_exit(&self, dead: u32) {
        self.broadcast(dead, Arc::new(Buffer::new()), "exit", PType::System);
    }

    /// Create a service and start it immediately; `worker_hint > 0` pins
    /// the worker, otherwise placement is round-robin
    pub fn new_service(
        &self,
        cfg: ServiceConfig,
        worker_hint: u8,
    ) -> Result<oneshot::Receiver<Result<u32>>> {
        self.create_service(cfg, worker_hint, true)
    }

    pub(crate) fn create_service(
        &self,
        cfg: ServiceConfig,
        worker_hint: u8,
        start_now: bool,
    ) -> Result<oneshot::Receiver<Result<u32>>> {
        let count = self.workers.len();
        let wid = if worker_hint >= 1 && (worker_hint as usize) <= count {
            worker_hint
        } else {
            (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % count) as u8 + 1
        };

        let (tx, rx) = oneshot::channel();
        self.worker(wid)?
            .ctrl_tx
            .send(Ctrl::Create {
                cfg,
                start_now,
                completion: Some(tx),
            })
            .map_err(|_| Error::internal("worker control channel closed"))?;
        Ok(rx)
    }

    /// Remove a service; the reply (if requested) is sent upon unregister
    pub fn remove_service(&self, id: u32, reply_to: u32, session: i32) -> Result<()> {
        self.worker(worker_of_service(id))?
            .ctrl_tx
            .send(Ctrl::Remove {
                id,
                reply_to,
                session,
            })
            .map_err(|_| Error::internal("worker control channel closed"))
    }

    /// Post `StartAll` to every worker (bootstrap phase 2)
    pub(crate) fn start_all(&self) -> Vec<oneshot::Receiver<()>> {
        self.workers
            .iter()
            .map(|handle| {
                let (tx, rx) = oneshot::channel();
                let _ = handle.ctrl_tx.send(Ctrl::StartAll { completion: tx });
                rx
            })
            .collect()
    }

    /// Register a unique name; fails atomically if the name exists
    pub fn set_unique_service(&self, name: &str, id: u32) -> bool {
        let mut unique = self.unique.write().expect("unique registry poisoned");
        if unique.contains_key(name) {
            return false;
        }
        unique.insert(name.to_string(), id);
        true
    }

    /// Resolve a unique name
    pub fn query_service(&self, name: &str) -> Option<u32> {
        self.unique
            .read()
            .expect("unique registry poisoned")
            .get(name)
            .copied()
    }

    /// Unregister a name, but only while it still maps to `id`
    pub(crate) fn remove_unique(&self, name: &str, id: u32) {
        let mut unique = self.unique.write().expect("unique registry poisoned");
        if unique.get(name) == Some(&id) {
            unique.remove(name);
        }
    }

    /// Text admin channel: `<worker-id> <cmd> [args…]`, reply on `session`
    pub fn runcmd(&self, from: u32, cmdline: &str, session: i32) -> Result<()> {
        let mut parts = cmdline.splitn(2, |c: char| c.is_whitespace());
        let worker: u8 = parts
            .next()
            .and_then(|t| t.trim().parse().ok())
            .ok_or_else(|| Error::InvalidConfiguration {
                field: "cmdline".into(),
                reason: format!("expected '<worker-id> <cmd>', got '{cmdline}'"),
            })?;
        let rest = parts.next().unwrap_or("").trim().to_string();
        self.worker(worker)?
            .ctrl_tx
            .send(Ctrl::Command {
                from,
                cmdline: rest,
                session,
            })
            .map_err(|_| Error::internal("worker control channel closed"))
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.env.set(name, value);
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.env.get(name)
    }

    /// Move to `Stopping` and tell every worker; idempotent
    pub fn stop(&self) {
        let prev = ServerState::from_u8(
            self.state
                .swap(ServerState::Stopping as u8, Ordering::SeqCst),
        );
        if matches!(prev, ServerState::Stopping | ServerState::Stopped) {
            self.state.store(prev as u8, Ordering::SeqCst);
            return;
        }
        info!("server stopping");
        for handle in &self.workers {
            let _ = handle.ctrl_tx.send(Ctrl::Stop);
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_running(&self) {
        let _ = self.state.compare_exchange(
            ServerState::Init as u8,
            ServerState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn set_stopped(&self) {
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Live services across all workers
    pub fn service_count(&self) -> u32 {
        self.service_count.load(Ordering::Relaxed)
    }

    pub(crate) fn service_created(&self) {
        self.service_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn service_removed(&self) {
        self.service_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn behavior(&self, name: &str) -> Option<BehaviorFactory> {
        self.behaviors.get(name).cloned()
    }

    pub(crate) fn fd_sentry(&self) -> Arc<FdSentry> {
        self.fd_sentry.clone()
    }
}
