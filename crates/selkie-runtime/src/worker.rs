//! Worker threads.
//!
//! TigerStyle: One thread per worker, bounded batches, explicit control tasks.
//!
//! Each worker is one OS thread running a current-thread tokio runtime and
//! a `LocalSet`, multiplexing its mailbox, a control channel, the timer
//! wheel, and its socket manager's completions. Services are pinned to the
//! worker that created them; the worker drains its mailbox in bounded
//! batches so socket completions and timers are not starved.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use selkie_core::constants::{MAILBOX_BATCH_COUNT_MAX, SERVICE_SEQ_COUNT_MAX};
use selkie_core::error::{Error, Result};
use selkie_core::time::monotonic_ms;
use selkie_core::{Message, PType, ServiceConfig};
use selkie_net::SocketManager;

use crate::context::ServiceContext;
use crate::router::Router;
use crate::service::{ServiceBehavior, ServiceCell};
use crate::session::Resume;
use crate::timer::TimerWheel;

/// Control tasks posted to a worker by the router or the server
pub(crate) enum Ctrl {
    /// Construct a service on this worker
    Create {
        cfg: ServiceConfig,
        start_now: bool,
        completion: Option<oneshot::Sender<Result<u32>>>,
    },
    /// Start every constructed-but-unstarted service (bootstrap phase 2)
    StartAll { completion: oneshot::Sender<()> },
    /// Unlink and destroy a service
    Remove { id: u32, reply_to: u32, session: i32 },
    /// Text admin command, already stripped of the worker-id token
    Command {
        from: u32,
        cmdline: String,
        session: i32,
    },
    /// Server stop: run exit callbacks; the worker ends once empty
    Stop,
}

/// The router's address of one worker
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub id: u8,
    pub mailbox_tx: mpsc::UnboundedSender<Message>,
    pub ctrl_tx: mpsc::UnboundedSender<Ctrl>,
}

/// Worker-local state shared between the event loop, contexts, and tasks
pub(crate) struct WorkerShared {
    pub id: u8,
    pub router: Arc<Router>,
    pub services: RefCell<HashMap<u32, Rc<ServiceCell>>>,
    pub timers: RefCell<TimerWheel>,
    pub timer_notify: Notify,
    pub sockets: Rc<SocketManager>,
    pub ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    pub next_seq: Cell<u32>,
    pub stopping: Cell<bool>,
}

/// Spawn a worker thread
pub(crate) fn spawn_worker(
    id: u8,
    router: Arc<Router>,
    mailbox_tx: mpsc::UnboundedSender<Message>,
    mailbox_rx: mpsc::UnboundedReceiver<Message>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("selkie-worker-{id}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("worker runtime build failed");
            let local = LocalSet::new();
            rt.block_on(local.run_until(worker_main(
                id, router, mailbox_tx, mailbox_rx, ctrl_tx, ctrl_rx,
            )));
        })
        .expect("worker thread spawn failed")
}

async fn worker_main(
    id: u8,
    router: Arc<Router>,
    mailbox_tx: mpsc::UnboundedSender<Message>,
    mut mailbox_rx: mpsc::UnboundedReceiver<Message>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
) {
    let shared = Rc::new(WorkerShared {
        id,
        sockets: SocketManager::new(id, mailbox_tx, router.fd_sentry()),
        router,
        services: RefCell::new(HashMap::new()),
        timers: RefCell::new(TimerWheel::new()),
        timer_notify: Notify::new(),
        ctrl_tx,
        next_seq: Cell::new(0),
        stopping: Cell::new(false),
    });
    let _sweep = shared.sockets.start_sweep();
    debug!(worker = id, "worker running");

    loop {
        if shared.stopping.get() && shared.services.borrow().is_empty() {
            break;
        }
        let sleep_ms = shared
            .timers
            .borrow()
            .next_deadline()
            .map(|d| d.saturating_sub(monotonic_ms()));

        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => match ctrl {
                None => break,
                Some(ctrl) => handle_ctrl(&shared, ctrl).await,
            },
            msg = mailbox_rx.recv() => match msg {
                None => break,
                Some(msg) => {
                    deliver_message(&shared, msg);
                    // Bounded batch so I/O completions are not starved
                    for _ in 1..MAILBOX_BATCH_COUNT_MAX {
                        match mailbox_rx.try_recv() {
                            Ok(msg) => deliver_message(&shared, msg),
                            Err(_) => break,
                        }
                    }
                }
            },
            _ = shared.timer_notify.notified() => {
                // A task armed an earlier timer; recompute the deadline
            },
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms.unwrap_or(3_600_000))),
                if sleep_ms.is_some() =>
            {
                fire_timers(&shared);
            },
        }
    }

    shared.sockets.shutdown();
    debug!(worker = id, "worker stopped");
}

async fn handle_ctrl(shared: &Rc<WorkerShared>, ctrl: Ctrl) {
    match ctrl {
        Ctrl::Create {
            cfg,
            start_now,
            completion,
        } => {
            let result = create_service(shared, &cfg, start_now).await;
            if let Err(e) = &result {
                error!(worker = shared.id, service = %cfg.name, error = %e, "service creation failed");
            }
            if let Some(tx) = completion {
                let _ = tx.send(result);
            }
        }
        Ctrl::StartAll { completion } => {
            let cells: Vec<_> = shared.services.borrow().values().cloned().collect();
            for cell in cells {
                start_service(shared, cell);
            }
            let _ = completion.send(());
        }
        Ctrl::Remove {
            id,
            reply_to,
            session,
        } => remove_service(shared, id, reply_to, session).await,
        Ctrl::Command {
            from,
            cmdline,
            session,
        } => run_command(shared, from, &cmdline, session),
        Ctrl::Stop => {
            if !shared.stopping.replace(true) {
                let cells: Vec<_> = shared.services.borrow().values().cloned().collect();
                for cell in cells {
                    let ctx = ServiceContext::new(cell.clone(), shared.clone());
                    let behavior = cell.behavior.clone();
                    spawn_timed(cell, async move {
                        behavior.exit(&ctx).await;
                    });
                }
            }
        }
    }
}

fn alloc_service_id(shared: &WorkerShared) -> Result<u32> {
    let services = shared.services.borrow();
    for _ in 0..=SERVICE_SEQ_COUNT_MAX {
        let seq = shared.next_seq.get() % SERVICE_SEQ_COUNT_MAX + 1;
        shared.next_seq.set(shared.next_seq.get().wrapping_add(1));
        let id = ((shared.id as u32) << 24) | seq;
        if !services.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(Error::internal("service table exhausted"))
}

/// Construct a service on this worker.
///
/// `init` runs inline and must not suspend on other services; a failing
/// unique service stops the whole server, while a unique-name collision
/// only fails this creation.
async fn create_service(
    shared: &Rc<WorkerShared>,
    cfg: &ServiceConfig,
    start_now: bool,
) -> Result<u32> {
    cfg.validate()?;
    let factory = shared
        .router
        .behavior(&cfg.file)
        .ok_or_else(|| Error::init_failed(&cfg.name, format!("unknown behavior '{}'", cfg.file)))?;

    let id = alloc_service_id(shared)?;
    let init_result = match factory(cfg) {
        Ok(behavior) => {
            let behavior: Rc<dyn ServiceBehavior> = behavior.into();
            let cell = Rc::new(ServiceCell::new(id, cfg, behavior));
            shared.services.borrow_mut().insert(id, cell.clone());
            let ctx = ServiceContext::new(cell.clone(), shared.clone());
            cell.behavior.clone().init(&ctx, cfg).await.map(|_| cell)
        }
        Err(e) => Err(e),
    };

    let cell = match init_result {
        Ok(cell) => cell,
        Err(e) => {
            shared.services.borrow_mut().remove(&id);
            if cfg.unique {
                error!(service = %cfg.name, "unique service failed to initialize; stopping server");
                shared.router.stop();
            }
            return Err(Error::init_failed(&cfg.name, e.to_string()));
        }
    };

    if cfg.unique && !shared.router.set_unique_service(&cfg.name, id) {
        shared.services.borrow_mut().remove(&id);
        return Err(Error::DuplicateUniqueName {
            name: cfg.name.clone(),
        });
    }

    cell.ok.set(true);
    shared.router.service_created();
    info!("[WORKER {}] new service [{}:{:08X}]", shared.id, cfg.name, id);

    if start_now {
        start_service(shared, cell);
    }
    Ok(id)
}

/// Run the start callback, then release any messages that queued up while
/// the service was unstarted. Spawned so start may freely suspend.
fn start_service(shared: &Rc<WorkerShared>, cell: Rc<ServiceCell>) {
    if !cell.ok.get() || cell.started.get() || cell.busy.replace(true) {
        return;
    }
    let shared = shared.clone();
    let run_cell = cell.clone();
    let fut = async move {
        let ctx = ServiceContext::new(run_cell.clone(), shared.clone());
        if let Err(e) = run_cell.behavior.clone().start(&ctx).await {
            error!(service = %run_cell.name, error = %e, "start failed");
        }
        run_cell.started.set(true);
        run_cell.busy.set(false);
        let backlog: Vec<Message> = run_cell.backlog.borrow_mut().drain(..).collect();
        for msg in backlog {
            dispatch_to(&shared, run_cell.clone(), msg);
        }
    };
    spawn_timed(cell, fut);
}

async fn remove_service(shared: &Rc<WorkerShared>, id: u32, reply_to: u32, session: i32) {
    let cell = shared.services.borrow_mut().remove(&id);
    let Some(cell) = cell else {
        if session != 0 {
            shared.router.respond(
                reply_to,
                "remove",
                session,
                &Error::ServiceNotFound { id }.to_string(),
                PType::Error,
            );
        }
        return;
    };

    if cell.unique {
        shared.router.remove_unique(&cell.name, id);
    }
    shared.router.service_removed();

    // Reply upon unregister; destroy has not necessarily finished
    if reply_to != 0 && session != 0 {
        shared.router.respond(
            reply_to,
            "",
            session,
            &format!("{id:08X} removed"),
            PType::Text,
        );
    }

    shared.router.notify_exit(id);
    shared.sockets.close_owned(id);
    shared.timers.borrow_mut().remove_owned(id);

    let ctx = ServiceContext::new(cell.clone(), shared.clone());
    cell.behavior.clone().destroy(&ctx).await;
    info!(
        "[WORKER {}] destroy service [{}:{:08X}]",
        shared.id, cell.name, id
    );
}

fn run_command(shared: &Rc<WorkerShared>, from: u32, cmdline: &str, session: i32) {
    let mut parts = cmdline.split_whitespace();
    let cmd = parts.next().unwrap_or("");
    let services = shared.services.borrow();

    let reply: Option<String> = match cmd {
        "services" => Some(
            services
                .values()
                .map(|c| format!("{:08X} {}", c.id, c.name))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        "mem" => Some(
            services
                .values()
                .map(|c| format!("{:08X} {} {}/{}", c.id, c.name, c.mem.used.get(), c.mem.limit))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        "cpu" => Some(
            services
                .values()
                .map(|c| format!("{:08X} {} {}us", c.id, c.name, c.cpu_micros.get()))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    };
    drop(services);

    match reply {
        Some(text) => shared.router.respond(from, "", session, &text, PType::Text),
        None => shared.router.respond(
            from,
            "runcmd",
            session,
            &format!("unknown command '{cmd}'"),
            PType::Error,
        ),
    }
}

fn fire_timers(shared: &Rc<WorkerShared>) {
    let due = shared.timers.borrow_mut().fire_due(monotonic_ms());
    for d in due {
        let cell = shared.services.borrow().get(&d.owner).cloned();
        let Some(cell) = cell else { continue };
        let ctx = ServiceContext::new(cell.clone(), shared.clone());
        let behavior = cell.behavior.clone();
        spawn_timed(cell, async move {
            behavior.timer(&ctx, d.id, d.is_last).await;
        });
    }
}

/// Route one mailbox message: broadcast fan-out, session resume, or
/// behavior dispatch.
pub(crate) fn deliver_message(shared: &Rc<WorkerShared>, msg: Message) {
    if msg.receiver == 0 {
        if msg.ptype == PType::System && msg.header == "exit" {
            for cell in shared.services.borrow().values() {
                cell.sessions.fail_watching(msg.sender);
            }
        }
        let cells: Vec<_> = shared.services.borrow().values().cloned().collect();
        for cell in cells {
            if cell.id != msg.sender {
                dispatch_to(shared, cell, msg.clone());
            }
        }
        return;
    }

    let cell = shared.services.borrow().get(&msg.receiver).cloned();
    match cell {
        Some(cell) => dispatch_to(shared, cell, msg),
        None => {
            if msg.session < 0 {
                shared.router.respond(
                    msg.sender,
                    "dispatch",
                    -msg.session,
                    &Error::ServiceNotFound { id: msg.receiver }.to_string(),
                    PType::Error,
                );
            } else {
                debug!(
                    receiver = format_args!("{:08X}", msg.receiver),
                    "message for unknown service dropped"
                );
            }
        }
    }
}

fn dispatch_to(shared: &Rc<WorkerShared>, cell: Rc<ServiceCell>, msg: Message) {
    // A positive session is a reply to one of this service's pending
    // calls; it resumes the suspended task instead of dispatching.
    if msg.session > 0 {
        let session = msg.session;
        if cell.sessions.resume(msg) == Resume::UnknownSession {
            warn!(
                service = %cell.name,
                error = %Error::SessionNotFound { session },
                "reply dropped"
            );
        }
        return;
    }

    if !cell.started.get() || (cell.serial && cell.busy.get()) {
        cell.backlog.borrow_mut().push_back(msg);
        return;
    }
    spawn_dispatch(shared, cell, msg);
}

fn spawn_dispatch(shared: &Rc<WorkerShared>, cell: Rc<ServiceCell>, msg: Message) {
    if cell.serial {
        cell.busy.set(true);
    }
    let shared = shared.clone();
    let run_cell = cell.clone();
    let fut = async move {
        run_dispatch(&shared, &run_cell, msg).await;
        if run_cell.serial {
            loop {
                let next = run_cell.backlog.borrow_mut().pop_front();
                match next {
                    Some(msg) => run_dispatch(&shared, &run_cell, msg).await,
                    None => break,
                }
            }
            run_cell.busy.set(false);
        }
    };
    spawn_timed(cell, fut);
}

async fn run_dispatch(shared: &Rc<WorkerShared>, cell: &Rc<ServiceCell>, msg: Message) {
    let sender = msg.sender;
    let session = msg.session;
    let ctx = ServiceContext::new(cell.clone(), shared.clone());

    if let Err(e) = cell.behavior.clone().message(&ctx, msg).await {
        // A request expecting a reply gets the failure echoed back with
        // the session restored to the caller's positive id.
        if session < 0 && sender != 0 {
            shared
                .router
                .respond(sender, "dispatch", -session, &e.to_string(), PType::Error);
        } else {
            error!(service = %cell.name, error = %e, "dispatch failed");
        }
    }
}

/// Spawn a service task whose poll time accrues to the service's CPU cost
pub(crate) fn spawn_timed(cell: Rc<ServiceCell>, fut: impl Future<Output = ()> + 'static) {
    tokio::task::spawn_local(TimedRun {
        cell,
        inner: Box::pin(fut),
    });
}

struct TimedRun {
    cell: Rc<ServiceCell>,
    inner: Pin<Box<dyn Future<Output = ()>>>,
}

impl Future for TimedRun {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let started = Instant::now();
        let this = self.as_mut().get_mut();
        let result = this.inner.as_mut().poll(cx);
        let cost = started.elapsed().as_micros() as u64;
        this.cell.cpu_micros.set(this.cell.cpu_micros.get() + cost);
        result
    }
}
