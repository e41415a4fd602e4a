//! Per-worker TCP/WebSocket layer for the selkie actor runtime.
//!
//! TigerStyle: Every socket owned by exactly one worker.
//!
//! Every socket lives on the worker that opened it. Connections are
//! worker-local tasks in one of three framing modes: length-prefixed
//! stream frames (with an optional chunked extension for large messages),
//! delimiter/size demand reads, and RFC 6455 WebSocket frames.

mod connection;
mod socket;
mod stream;
mod text;
mod ws;

pub use connection::{LogicError, ReadKind, ReadRequest};
pub use socket::{FdSentry, Mailbox, SocketManager};
