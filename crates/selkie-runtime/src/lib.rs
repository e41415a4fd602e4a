//! Worker scheduling, routing, and sessions for the selkie actor runtime.
//!
//! TigerStyle: Services pinned to workers, strictly serial dispatch.
//!
//! A fixed pool of worker threads hosts many lightweight services that
//! communicate only by asynchronous messages. Each worker runs one event
//! loop multiplexing its mailbox, control tasks, a timer wheel, and its
//! socket manager; services are pinned to the worker that created them and
//! dispatched strictly serially.

pub mod context;
pub mod protocol;
pub mod router;
pub mod server;
pub mod service;
pub mod session;
pub mod timer;
mod worker;

pub use context::{CallError, Reply, ServiceContext};
pub use protocol::{ProtocolEntry, ProtocolRegistry};
pub use router::{Router, ServerState};
pub use server::{Server, ServerBuilder};
pub use service::{BehaviorFactory, ServiceBehavior};
pub use timer::TimerWheel;

pub use selkie_core::{Buffer, Error, Message, NodeConfig, PType, Result, ServiceConfig, SocketEvent};
pub use selkie_net::ReadKind;
