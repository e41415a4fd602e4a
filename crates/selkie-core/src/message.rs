//! Message envelope and wire protocol tags.
//!
//! TigerStyle: Closed enums over raw wire tags, explicit envelopes.

use std::sync::Arc;

use crate::buffer::Buffer;

/// Wire protocol of a message payload.
///
/// The reserved values are part of the external contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PType {
    /// Runtime notifications (service exit, admin traffic)
    System = 1,
    /// Raw text payload, delimiter-framed on sockets
    Text = 2,
    /// Arbitrary structured payload (JSON-encoded)
    Lua = 3,
    /// Length-prefixed socket frames
    Socket = 4,
    /// Error reply carrying the failure text
    Error = 5,
    /// WebSocket frames
    Ws = 6,
    /// Debug/admin channel
    Debug = 7,
}

impl PType {
    /// Decode a wire tag
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::System),
            2 => Some(Self::Text),
            3 => Some(Self::Lua),
            4 => Some(Self::Socket),
            5 => Some(Self::Error),
            6 => Some(Self::Ws),
            7 => Some(Self::Debug),
            _ => None,
        }
    }

    /// Wire tag of this protocol
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Subtype of socket-event messages delivered to a connection's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketEvent {
    /// Outbound connection established
    Connect = 1,
    /// Inbound connection accepted
    Accept = 2,
    /// One framed payload
    Data = 3,
    /// Connection closed
    Close = 4,
    /// Socket or logic error; always followed by `Close`
    Error = 5,
    /// WebSocket ping received
    Ping = 6,
    /// WebSocket pong received
    Pong = 7,
}

impl SocketEvent {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::Accept),
            3 => Some(Self::Data),
            4 => Some(Self::Close),
            5 => Some(Self::Error),
            6 => Some(Self::Ping),
            7 => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Message envelope.
///
/// `sender`/`receiver` are service ids (or an fd in the sender slot of
/// socket events). Session discipline: a positive session on a request
/// means a reply is expected; the router negates non-zero sessions on
/// delivery, so requests arrive negative and replies sent back through the
/// router arrive positive. Zero is fire-and-forget.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: u32,
    pub receiver: u32,
    pub session: i32,
    pub ptype: PType,
    pub subtype: u8,
    pub header: String,
    pub data: Arc<Buffer>,
}

impl Message {
    /// Create a message with the given routing fields and payload
    pub fn new(
        sender: u32,
        receiver: u32,
        session: i32,
        ptype: PType,
        header: impl Into<String>,
        data: Arc<Buffer>,
    ) -> Self {
        Self {
            sender,
            receiver,
            session,
            ptype,
            subtype: 0,
            header: header.into(),
            data,
        }
    }

    /// Create a socket-event message (sender slot carries the fd)
    pub fn socket_event(
        fd: u32,
        owner: u32,
        ptype: PType,
        event: SocketEvent,
        session: i32,
        data: Arc<Buffer>,
    ) -> Self {
        Self {
            sender: fd,
            receiver: owner,
            session,
            ptype,
            subtype: event.as_u8(),
            header: String::new(),
            data,
        }
    }

    /// Unread payload bytes
    pub fn bytes(&self) -> &[u8] {
        self.data.data()
    }

    /// Payload as UTF-8, lossily
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        self.data.as_text()
    }

    /// Worker that owns the receiver (high 8 bits of the service id)
    pub fn receiver_worker(&self) -> u8 {
        (self.receiver >> 24) as u8
    }
}

/// Extract the owning worker from a service id
pub fn worker_of_service(id: u32) -> u8 {
    (id >> 24) as u8
}

/// Extract the owning worker from a socket fd
pub fn worker_of_fd(fd: u32) -> u8 {
    (fd >> 16) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptype_round_trip() {
        for v in 1..=7u8 {
            let p = PType::from_u8(v).unwrap();
            assert_eq!(p.as_u8(), v);
        }
        assert!(PType::from_u8(0).is_none());
        assert!(PType::from_u8(8).is_none());
    }

    #[test]
    fn test_id_routing() {
        let id = (3u32 << 24) | 42;
        assert_eq!(worker_of_service(id), 3);
        let fd = (7u32 << 16) | 9;
        assert_eq!(worker_of_fd(fd), 7);
    }

    #[test]
    fn test_socket_event_envelope() {
        let msg = Message::socket_event(
            0x0001_0003,
            0x0100_0001,
            PType::Socket,
            SocketEvent::Accept,
            0,
            Arc::new(Buffer::from("127.0.0.1:9000")),
        );
        assert_eq!(msg.sender, 0x0001_0003);
        assert_eq!(msg.subtype, SocketEvent::Accept.as_u8());
        assert_eq!(msg.text(), "127.0.0.1:9000");
        assert_eq!(msg.receiver_worker(), 1);
    }
}
