//! Service identity and the behavior contract.
//!
//! TigerStyle: Explicit lifecycle hooks, bounded memory, serial execution.
//!
//! A service is one actor: an id, a name, a behavior implementing the five
//! lifecycle callbacks, per-service sessions and protocol codecs, and
//! memory/CPU accounting. Behaviors run on the owning worker's thread and
//! need not be `Send`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use selkie_core::constants::SERVICE_MEM_REPORT_BYTES_DEFAULT;
use selkie_core::error::{Error, Result};
use selkie_core::{Message, ServiceConfig};

use crate::context::ServiceContext;
use crate::protocol::ProtocolRegistry;
use crate::session::SessionMap;

/// The callback contract between a service and the runtime.
///
/// Dispatch is strictly serial per service: no two callbacks of one
/// service ever overlap in wall time. A callback that awaits (a call, a
/// sleep, a socket read) suspends and yields the worker; by default the
/// service may then start its next message on a new task, unless created
/// with `serial: true`.
#[async_trait(?Send)]
pub trait ServiceBehavior: 'static {
    /// Construction-time setup. Failure aborts creation; a failed unique
    /// service stops the server. Runs inline on the worker loop and must
    /// not wait on other services (no calls, no sleeps).
    async fn init(&self, _ctx: &ServiceContext, _cfg: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    /// Runs once, after the bootstrap batch on this worker finished
    /// construction; for dynamically created services, before the first
    /// message.
    async fn start(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// One incoming message. Errors are caught at the worker boundary and
    /// converted to an `Error` reply when the message expected one.
    async fn message(&self, ctx: &ServiceContext, msg: Message) -> Result<()>;

    /// A stop was requested. The service stays alive until it calls
    /// `ctx.quit()`; the default does so immediately.
    async fn exit(&self, ctx: &ServiceContext) {
        ctx.quit();
    }

    /// Runs last, after the service was unlinked from its worker. Like
    /// `init`, it must not wait on other services.
    async fn destroy(&self, _ctx: &ServiceContext) {}

    /// One timer expiration
    async fn timer(&self, _ctx: &ServiceContext, _id: u32, _is_last: bool) {}
}

/// Creates behavior instances on the owning worker's thread.
///
/// The factory itself crosses threads; the behavior it builds does not.
pub type BehaviorFactory =
    Arc<dyn Fn(&ServiceConfig) -> Result<Box<dyn ServiceBehavior>> + Send + Sync>;

/// Memory accounting of one service
pub struct MemStats {
    pub used: Cell<u64>,
    pub limit: u64,
    report: Cell<u64>,
}

impl MemStats {
    fn new(limit: u64) -> Self {
        Self {
            used: Cell::new(0),
            limit,
            report: Cell::new(SERVICE_MEM_REPORT_BYTES_DEFAULT),
        }
    }
}

/// Runtime state of one service, owned by its worker
pub(crate) struct ServiceCell {
    pub id: u32,
    pub name: String,
    pub unique: bool,
    pub serial: bool,
    pub behavior: Rc<dyn ServiceBehavior>,
    pub sessions: SessionMap,
    pub protocols: ProtocolRegistry,
    pub mem: MemStats,
    pub cpu_micros: Cell<u64>,
    pub started: Cell<bool>,
    pub ok: Cell<bool>,
    pub quitting: Cell<bool>,
    pub busy: Cell<bool>,
    pub backlog: RefCell<VecDeque<Message>>,
}

impl ServiceCell {
    pub fn new(id: u32, cfg: &ServiceConfig, behavior: Rc<dyn ServiceBehavior>) -> Self {
        Self {
            id,
            name: cfg.name.clone(),
            unique: cfg.unique,
            serial: cfg.serial,
            behavior,
            sessions: SessionMap::new(),
            protocols: ProtocolRegistry::with_defaults(),
            mem: MemStats::new(cfg.memlimit.max(0) as u64),
            cpu_micros: Cell::new(0),
            started: Cell::new(false),
            ok: Cell::new(false),
            quitting: Cell::new(false),
            busy: Cell::new(false),
            backlog: RefCell::new(VecDeque::new()),
        }
    }

    /// Account an allocation; fails when it would cross the memory limit
    pub fn track_alloc(&self, bytes: u64) -> Result<()> {
        let used = self.mem.used.get() + bytes;
        if self.mem.limit > 0 && used > self.mem.limit {
            error!(
                service = %self.name,
                used,
                limit = self.mem.limit,
                "allocation over memory limit"
            );
            return Err(Error::MemoryLimitExceeded {
                service: self.id,
                used,
                limit: self.mem.limit,
            });
        }
        self.mem.used.set(used);
        if used > self.mem.report.get() {
            self.mem.report.set(self.mem.report.get() * 2);
            warn!(
                service = %self.name,
                used_mb = used as f64 / (1024.0 * 1024.0),
                "memory watermark crossed"
            );
        }
        Ok(())
    }

    /// Account a release
    pub fn track_dealloc(&self, bytes: u64) {
        self.mem.used.set(self.mem.used.get().saturating_sub(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_with_limit(limit: i64) -> ServiceCell {
        struct Nop;
        #[async_trait(?Send)]
        impl ServiceBehavior for Nop {
            async fn message(&self, _ctx: &ServiceContext, _msg: Message) -> Result<()> {
                Ok(())
            }
        }
        let cfg = ServiceConfig::new("probe", "probe").with_memlimit(limit);
        ServiceCell::new((1 << 24) | 1, &cfg, Rc::new(Nop))
    }

    #[test]
    fn test_mem_limit_enforced() {
        let cell = cell_with_limit(100);
        cell.track_alloc(60).unwrap();
        cell.track_alloc(40).unwrap();
        // Next allocation would cross the limit and must fail
        let err = cell.track_alloc(1).unwrap_err();
        assert!(matches!(err, Error::MemoryLimitExceeded { used: 101, .. }));
        // used is unchanged by the failed allocation
        assert_eq!(cell.mem.used.get(), 100);
    }

    #[test]
    fn test_mem_unlimited_when_zero() {
        let cell = cell_with_limit(0);
        cell.track_alloc(u32::MAX as u64).unwrap();
        cell.track_dealloc(5);
        assert_eq!(cell.mem.used.get(), u32::MAX as u64 - 5);
    }

    #[test]
    fn test_report_watermark_doubles() {
        let cell = cell_with_limit(0);
        cell.track_alloc(SERVICE_MEM_REPORT_BYTES_DEFAULT + 1).unwrap();
        assert_eq!(cell.mem.report.get(), SERVICE_MEM_REPORT_BYTES_DEFAULT * 2);
    }
}
