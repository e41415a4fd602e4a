//! Core types for the selkie actor runtime.
//!
//! TigerStyle: Explicit types and limits shared by every crate.
//!
//! Shared by the network layer, the runtime, and the node binary: the
//! buffer and message envelope, the error taxonomy, runtime limits, the
//! environment store, and node/service configuration.

pub mod buffer;
pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod message;
pub mod time;

pub use buffer::Buffer;
pub use config::{NodeConfig, ServiceConfig};
pub use env::EnvStore;
pub use error::{Error, Result};
pub use message::{worker_of_fd, worker_of_service, Message, PType, SocketEvent};
