//! Length-prefixed framing.
//!
//! TigerStyle: Explicit length prefixes, bounded frame sizes.
//!
//! Each frame is `[len: u16 big-endian][payload]`. In chunked mode the high
//! bit of the length word marks "more follows": a logical message larger
//! than `FRAME_SIZE_BYTES_MAX` is split into chunks and reassembled on the
//! read side into exactly one delivered message.

use std::rc::Rc;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use selkie_core::buffer::flag;
use selkie_core::constants::{FRAME_SIZE_BYTES_MAX, NET_RECV_CHUNK_BYTES};
use selkie_core::error::Error;
use selkie_core::{Buffer, SocketEvent};

use crate::connection::{
    enqueue_send, finish, writer_loop, ConnCommand, ConnShared, LogicError,
};
use crate::socket::SocketManager;

/// Continuation marker in the length word
const CHUNK_MORE_BIT: u16 = 0x8000;

/// Encode the length word for a frame
pub(crate) fn encode_prefix(len: usize, more: bool) -> [u8; 2] {
    debug_assert!(len <= FRAME_SIZE_BYTES_MAX);
    let mut word = len as u16;
    if more {
        word |= CHUNK_MORE_BIT;
    }
    word.to_be_bytes()
}

/// Try to decode one logical message from the receive buffer.
///
/// `pending` accumulates chunk payloads between calls. Returns `Ok(None)`
/// when more bytes are needed.
pub(crate) fn decode_message(
    rbuf: &mut BytesMut,
    chunked: bool,
    pending: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, LogicError> {
    loop {
        if rbuf.len() < 2 {
            return Ok(None);
        }
        let word = u16::from_be_bytes([rbuf[0], rbuf[1]]);
        let more = word & CHUNK_MORE_BIT != 0;
        let len = (word & !CHUNK_MORE_BIT) as usize;

        if more && !chunked {
            return Err(LogicError::FrameTooLarge);
        }
        if rbuf.len() < 2 + len {
            return Ok(None);
        }

        rbuf.advance(2);
        let payload = rbuf.split_to(len);

        if !chunked {
            return Ok(Some(payload.to_vec()));
        }

        pending.extend_from_slice(&payload);
        if !more {
            return Ok(Some(std::mem::take(pending)));
        }
        // A continuation chunk; keep scanning the buffer.
    }
}

/// Write one buffer, honoring the framing flag and chunked mode.
///
/// The fast path prepends the length word into the buffer's head room when
/// the buffer is uniquely owned, yielding a single contiguous write.
pub(crate) async fn write_buffer<W: AsyncWrite + Unpin>(
    wr: &mut W,
    shared: &ConnShared,
    buf: Arc<Buffer>,
) -> std::io::Result<()> {
    if !buf.has_flag(flag::NEEDS_FRAMING) {
        return wr.write_all(buf.data()).await;
    }

    let len = buf.data().len();
    if !shared.chunk_send.get() {
        if len > FRAME_SIZE_BYTES_MAX {
            let err = Error::FrameTooLarge {
                size: len,
                limit: FRAME_SIZE_BYTES_MAX,
            };
            shared.logic_error.set(LogicError::FrameTooLarge);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            ));
        }
        let prefix = encode_prefix(len, false);

        let mut buf = buf;
        if let Some(owned) = Arc::get_mut(&mut buf) {
            if owned.prepend(&prefix).is_ok() {
                return wr.write_all(owned.data()).await;
            }
        }
        wr.write_all(&prefix).await?;
        return wr.write_all(buf.data()).await;
    }

    // Chunked: split into maximal chunks, continuation bit on all but the
    // last. An empty payload still emits one empty final chunk.
    let data = buf.data();
    let mut offset = 0;
    loop {
        let chunk = (data.len() - offset).min(FRAME_SIZE_BYTES_MAX);
        let more = offset + chunk < data.len();
        wr.write_all(&encode_prefix(chunk, more)).await?;
        wr.write_all(&data[offset..offset + chunk]).await?;
        offset += chunk;
        if !more {
            return Ok(());
        }
    }
}

/// Drive a length-prefixed connection: continuous frame reads, queued
/// writes, commands from the socket manager.
pub(crate) async fn run(
    mgr: Rc<SocketManager>,
    shared: Rc<ConnShared>,
    stream: TcpStream,
    accepted: bool,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    if let Ok(peer) = stream.peer_addr() {
        *shared.addr.borrow_mut() = peer.to_string();
    }
    shared.touch();
    let open_event = if accepted {
        SocketEvent::Accept
    } else {
        SocketEvent::Connect
    };
    shared.deliver_event(open_event, 0, Buffer::from(shared.addr.borrow().as_str()));

    let (rd, wr) = stream.into_split();
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let writer = tokio::task::spawn_local(writer_loop(
        shared.clone(),
        wr,
        wire_rx,
        cmd_tx.clone(),
    ));

    let mut rd = rd;
    let mut rbuf = BytesMut::with_capacity(NET_RECV_CHUNK_BYTES);
    let mut pending = Vec::new();
    let mut io_err = None;

    'main: loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                None | Some(ConnCommand::Close) => break 'main,
                Some(ConnCommand::Send(buf)) => {
                    if !enqueue_send(&shared, &wire_tx, buf) {
                        break 'main;
                    }
                }
                Some(ConnCommand::Read(req)) => {
                    shared.reply_error(req.session, "read", "demand read unsupported on stream socket");
                }
                Some(ConnCommand::SetNoDelay) => {
                    let _ = rd.as_ref().set_nodelay(true);
                }
            },
            n = rd.read_buf(&mut rbuf) => match n {
                Ok(0) => break 'main, // peer closed; close event only
                Ok(_) => {
                    shared.touch();
                    loop {
                        match decode_message(&mut rbuf, shared.chunk_recv.get(), &mut pending) {
                            Ok(Some(payload)) => {
                                shared.deliver_event(SocketEvent::Data, 0, Buffer::from(payload));
                            }
                            Ok(None) => break,
                            Err(lerr) => {
                                shared.logic_error.set(lerr);
                                break 'main;
                            }
                        }
                    }
                }
                Err(e) => {
                    io_err = Some(e);
                    break 'main;
                }
            },
        }
    }

    writer.abort();
    finish(&mgr, &shared, io_err, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rbuf: &mut BytesMut, bytes: &[u8]) {
        rbuf.extend_from_slice(bytes);
    }

    #[test]
    fn test_decode_simple_frame() {
        let mut rbuf = BytesMut::new();
        let mut pending = Vec::new();
        feed(&mut rbuf, &[0x00, 0x04]);
        feed(&mut rbuf, b"ping");

        let msg = decode_message(&mut rbuf, false, &mut pending).unwrap();
        assert_eq!(msg.as_deref(), Some(b"ping".as_ref()));
        assert!(rbuf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame_waits() {
        let mut rbuf = BytesMut::new();
        let mut pending = Vec::new();
        feed(&mut rbuf, &[0x00, 0x04, b'p', b'i']);
        assert!(decode_message(&mut rbuf, false, &mut pending)
            .unwrap()
            .is_none());

        feed(&mut rbuf, b"ng");
        let msg = decode_message(&mut rbuf, false, &mut pending).unwrap();
        assert_eq!(msg.as_deref(), Some(b"ping".as_ref()));
    }

    #[test]
    fn test_decode_chunked_reassembles_one_message() {
        // Two continuation chunks plus a final one
        let mut rbuf = BytesMut::new();
        let mut pending = Vec::new();
        let word = (3u16 | 0x8000).to_be_bytes();
        feed(&mut rbuf, &word);
        feed(&mut rbuf, b"abc");
        feed(&mut rbuf, &word);
        feed(&mut rbuf, b"def");
        feed(&mut rbuf, &2u16.to_be_bytes());
        feed(&mut rbuf, b"gh");

        let msg = decode_message(&mut rbuf, true, &mut pending).unwrap();
        assert_eq!(msg.as_deref(), Some(b"abcdefgh".as_ref()));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_decode_continuation_without_chunked_mode_fails() {
        let mut rbuf = BytesMut::new();
        let mut pending = Vec::new();
        feed(&mut rbuf, &(4u16 | 0x8000).to_be_bytes());
        feed(&mut rbuf, b"oops");

        let err = decode_message(&mut rbuf, false, &mut pending).unwrap_err();
        assert_eq!(err, LogicError::FrameTooLarge);
    }

    #[tokio::test]
    async fn test_write_chunked_round_trips_large_payload() {
        // A megabyte survives the chunked split/reassemble cycle intact
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = ConnShared::new(0x0001_0001, 1, selkie_core::PType::Socket, 1024, tx);
        shared.chunk_send.set(true);
        drop(rx);

        let mut frame = Buffer::from(payload.as_slice());
        frame.set_flag(flag::NEEDS_FRAMING);

        let mut wire = Vec::new();
        write_buffer(&mut wire, &shared, Arc::new(frame))
            .await
            .unwrap();
        assert!(wire.len() > payload.len());

        let mut rbuf = BytesMut::from(wire.as_slice());
        let mut pending = Vec::new();
        let msg = decode_message(&mut rbuf, true, &mut pending)
            .unwrap()
            .expect("complete message");
        assert_eq!(msg, payload);
        assert!(rbuf.is_empty());
    }

    #[tokio::test]
    async fn test_write_unchunked_uses_head_room() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = ConnShared::new(0x0001_0001, 1, selkie_core::PType::Socket, 1024, tx);

        let mut frame = Buffer::from("hello");
        frame.set_flag(flag::NEEDS_FRAMING);

        let mut wire = Vec::new();
        write_buffer(&mut wire, &shared, Arc::new(frame))
            .await
            .unwrap();
        assert_eq!(wire, b"\x00\x05hello");
    }

    #[tokio::test]
    async fn test_write_oversize_unchunked_fails() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = ConnShared::new(0x0001_0001, 1, selkie_core::PType::Socket, 1024, tx);

        let mut frame = Buffer::from(vec![0u8; FRAME_SIZE_BYTES_MAX + 1]);
        frame.set_flag(flag::NEEDS_FRAMING);

        let mut wire = Vec::new();
        let err = write_buffer(&mut wire, &shared, Arc::new(frame)).await;
        assert!(err.is_err());
        assert_eq!(shared.logic_error.get(), LogicError::FrameTooLarge);
    }
}
