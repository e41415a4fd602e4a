//! WebSocket framing over RFC 6455.
//!
//! TigerStyle: Library framing, explicit per-frame event mapping.
//!
//! Server side accepts the upgrade, client side performs it; masking and
//! control-frame bookkeeping are the library's. Every frame is delivered as
//! one message to the owning service with the matching event subtype.

use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};
use tracing::debug;

use selkie_core::buffer::flag;
use selkie_core::error::Error;
use selkie_core::{Buffer, SocketEvent};

use crate::connection::{enqueue_send, finish, ConnCommand, ConnShared, LogicError};
use crate::socket::SocketManager;

fn to_ws_message(buf: &Buffer) -> WsMessage {
    let data = buf.data();
    if buf.has_flag(flag::WS_PING) {
        WsMessage::Ping(Bytes::copy_from_slice(data))
    } else if buf.has_flag(flag::WS_PONG) {
        WsMessage::Pong(Bytes::copy_from_slice(data))
    } else if buf.has_flag(flag::WS_TEXT) {
        WsMessage::Text(Utf8Bytes::from(
            String::from_utf8_lossy(data).into_owned(),
        ))
    } else {
        WsMessage::Binary(Bytes::copy_from_slice(data))
    }
}

async fn writer_loop(
    shared: Rc<ConnShared>,
    mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut wire_rx: mpsc::UnboundedReceiver<Arc<Buffer>>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
) {
    while let Some(buf) = wire_rx.recv().await {
        let close_after = buf.has_flag(flag::CLOSE_AFTER_SEND);
        let result = sink.send(to_ws_message(&buf)).await;
        shared
            .queue_depth
            .set(shared.queue_depth.get().saturating_sub(1));

        match result {
            Ok(()) if close_after => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = cmd_tx.send(ConnCommand::Close);
                return;
            }
            Ok(()) => {}
            Err(_) => {
                let _ = cmd_tx.send(ConnCommand::Close);
                return;
            }
        }
    }
}

/// Drive a WebSocket connection.
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
    let _ = stream.set_nodelay(true);
    shared.touch();

    let handshake = if accepted {
        accept_async(stream).await
    } else {
        let url = format!("ws://{}/", shared.addr.borrow());
        client_async(url, stream).await.map(|(ws, _resp)| ws)
    };

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            let err = Error::Handshake {
                reason: e.to_string(),
            };
            debug!(fd = format_args!("{:08X}", shared.fd), error = %err, "ws handshake failed");
            shared.logic_error.set(LogicError::Handshake);
            finish(&mgr, &shared, None, None);
            return;
        }
    };

    let open_event = if accepted {
        SocketEvent::Accept
    } else {
        SocketEvent::Connect
    };
    shared.deliver_event(open_event, 0, Buffer::from(shared.addr.borrow().as_str()));

    let (sink, mut src) = ws.split();
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let writer = tokio::task::spawn_local(writer_loop(
        shared.clone(),
        sink,
        wire_rx,
        cmd_tx.clone(),
    ));

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
                    shared.reply_error(req.session, "read", "demand read unsupported on ws socket");
                }
                Some(ConnCommand::SetNoDelay) => {} // applied before the handshake
            },
            frame = src.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    shared.touch();
                    let mut body = Buffer::from(text.as_bytes());
                    body.set_flag(flag::WS_TEXT);
                    shared.deliver_event(SocketEvent::Data, 0, body);
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    shared.touch();
                    shared.deliver_event(SocketEvent::Data, 0, Buffer::from(data.as_ref()));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    // The library queues the pong; surface the ping itself
                    shared.touch();
                    shared.deliver_event(SocketEvent::Ping, 0, Buffer::from(data.as_ref()));
                }
                Some(Ok(WsMessage::Pong(data))) => {
                    shared.touch();
                    shared.deliver_event(SocketEvent::Pong, 0, Buffer::from(data.as_ref()));
                }
                Some(Ok(WsMessage::Close(_))) | None => break 'main,
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    io_err = Some(std::io::Error::other(e.to_string()));
                    break 'main;
                }
            },
        }
    }

    writer.abort();
    finish(&mgr, &shared, io_err, None);
}
