//! WebSocket transport.
//!
//! Text frames carry text packets, binary frames carry binary packets, one
//! packet per frame. Packets sent before the connection is open are
//! buffered and replayed; an orderly client-initiated close sends an
//! Engine.IO CLOSE packet before the websocket close frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error};

use crate::observable::Observable;
use crate::packet::{Packet, PacketType};
use crate::parser::{self, Frame};
use crate::transport::{self, TransportArg, TransportCtx, TransportKind, TransportState};
use crate::worker;

pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<TransportCtx>,
    events: Observable<TransportArg>,
    state: Mutex<TransportState>,
    send_buffer: Mutex<VecDeque<Packet>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Clone for WebSocketTransport {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl WebSocketTransport {
    pub(crate) fn new(ctx: Arc<TransportCtx>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                events: Observable::new(),
                state: Mutex::new(TransportState::Initial),
                send_buffer: Mutex::new(VecDeque::new()),
                out_tx: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &Observable<TransportArg> {
        &self.inner.events
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.lock().unwrap() == TransportState::Open
    }

    pub fn open(&self) {
        if self.is_open() {
            return;
        }
        let this = self.clone();
        worker::spawn(async move { this.run().await });
    }

    pub fn close(&self, client_initiated: bool) {
        if *self.inner.state.lock().unwrap() == TransportState::Closed {
            return;
        }
        if client_initiated {
            self.send(Packet::close());
        }
        self.common_cleanup(transport::CLOSE, TransportArg::None);
    }

    /// Send a packet, or buffer it until the connection opens.
    pub fn send(&self, packet: Packet) {
        let state = *self.inner.state.lock().unwrap();
        match state {
            TransportState::Initial => {
                self.inner.send_buffer.lock().unwrap().push_back(packet);
            }
            TransportState::Open => {
                let message = match parser::encode_packet(&packet) {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(bin) => Message::Binary(bin),
                };
                if let Some(tx) = &*self.inner.out_tx.lock().unwrap() {
                    tx.send(message).ok();
                }
            }
            _ => {}
        }
    }

    /// Replay everything buffered before the connection opened.
    pub fn flush(&self) {
        if !self.is_open() {
            return;
        }
        let packets: Vec<Packet> = self.inner.send_buffer.lock().unwrap().drain(..).collect();
        for packet in packets {
            self.send(packet);
        }
    }

    async fn run(&self) {
        let url = self.inner.ctx.build_url(TransportKind::Websocket);
        debug!("websocket connection to {url}");
        let mut request = match url.clone().into_client_request() {
            Ok(request) => request,
            Err(e) => return self.handle_error(format!("Invalid websocket request: {e}")),
        };
        for (key, value) in &self.inner.ctx.config.headers {
            let name = HeaderName::try_from(key.as_str());
            let value = HeaderValue::from_str(value);
            if let (Ok(name), Ok(value)) = (name, value) {
                request.headers_mut().insert(name, value);
            }
        }

        let ws_config = self.inner.ctx.config.websocket.clone();
        let stream = match connect_async_with_config(request, ws_config, false).await {
            Ok((stream, _response)) => stream,
            Err(e) => return self.on_ws_failure(e),
        };

        *self.inner.state.lock().unwrap() = TransportState::Open;
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.inner.out_tx.lock().unwrap() = Some(tx);
        let (mut sink, mut source) = stream.split();

        worker::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            sink.close().await.ok();
        });

        self.inner
            .events
            .emit(transport::WEBSOCKET_CONN_OPEN, &TransportArg::None);

        while let Some(item) = source.next().await {
            match item {
                Ok(Message::Text(text)) => match parser::decode_packet_str(&text) {
                    Ok(packet) => self.on_packet(packet),
                    Err(e) => {
                        return self.handle_error(format!("Error while decoding packet: {e}"))
                    }
                },
                Ok(Message::Binary(bin)) => match parser::decode_packet_bin(&bin) {
                    Ok(packet) => self.on_packet(packet),
                    Err(e) => {
                        return self.handle_error(format!("Error while decoding packet: {e}"))
                    }
                },
                Ok(Message::Close(_)) => return self.close(false),
                Ok(_) => {}
                Err(e) => return self.on_ws_failure(e),
            }
            if *self.inner.state.lock().unwrap() != TransportState::Open {
                return;
            }
        }
        if self.is_open() {
            self.close_abruptly("WebSocket stream ended unexpectedly.".to_owned());
        }
    }

    fn on_packet(&self, packet: Packet) {
        if packet.ptype == PacketType::Open {
            match transport::open_handshake(&self.inner.ctx, &packet) {
                Ok(handshake) => {
                    self.inner
                        .events
                        .emit(transport::HANDSHAKE, &TransportArg::Handshake(handshake));
                    self.inner
                        .events
                        .emit(transport::OPEN, &TransportArg::Packet(packet));
                    self.flush();
                }
                Err(e) => self.handle_error(format!("Error while parsing handshake data: {e}")),
            }
        } else {
            self.inner
                .events
                .emit(transport::PACKET, &TransportArg::Packet(packet));
        }
    }

    fn on_ws_failure(&self, e: tungstenite::Error) {
        match e {
            tungstenite::Error::Io(_)
            | tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed => {
                self.close_abruptly(format!("WebSocket connection failure: {e}"));
            }
            other => self.handle_error(format!("An error occurred: {other}")),
        }
    }

    fn close_abruptly(&self, message: String) {
        error!("abrupt close: {message}");
        *self.inner.state.lock().unwrap() = TransportState::AbruptlyClosed;
        self.inner.out_tx.lock().unwrap().take();
        self.inner
            .events
            .emit(transport::ABRUPT_CLOSE, &TransportArg::Reason(message));
        self.inner.events.remove_all();
    }

    fn handle_error(&self, reason: String) {
        error!("transport error: {reason}");
        self.common_cleanup(transport::ERROR, TransportArg::Reason(reason));
    }

    fn common_cleanup(&self, event: &str, arg: TransportArg) {
        *self.inner.state.lock().unwrap() = TransportState::Closed;
        self.inner.events.emit(event, &arg);
        self.inner.events.remove_all();
        if let Some(tx) = self.inner.out_tx.lock().unwrap().take() {
            tx.send(Message::Close(None)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::packet::Data;

    fn transport() -> WebSocketTransport {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        WebSocketTransport::new(TransportCtx::new(config))
    }

    #[test]
    fn packets_buffer_until_the_connection_opens() {
        let t = transport();
        t.send(Packet::message("early"));
        t.send(Packet::new(PacketType::Ping, "probe"));
        assert_eq!(t.inner.send_buffer.lock().unwrap().len(), 2);
    }

    #[test]
    fn close_removes_listeners() {
        let t = transport();
        t.events().on(transport::PACKET, |_| {});
        t.close(false);
        assert_eq!(t.events().listener_count(transport::PACKET), 0);
        assert!(!t.is_open());
    }

    #[test]
    fn transferred_packets_keep_fifo_order() {
        // On upgrade the session drains the polling buffer into the new
        // transport; order must survive the hand-off.
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        let ctx = TransportCtx::new(config);
        let polling = crate::transport::polling::PollingTransport::new(ctx.clone());
        polling.send(Packet::message("one"));
        polling.send(Packet::message("two"));

        let ws = WebSocketTransport::new(ctx);
        for packet in polling.take_buffered() {
            ws.send(packet);
        }
        let buffered = ws.inner.send_buffer.lock().unwrap();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0], Packet::message("one"));
        assert_eq!(buffered[1], Packet::message("two"));
    }

    #[test]
    fn inbound_packets_are_emitted() {
        let t = transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        t.events().on(transport::PACKET, move |arg| {
            if let TransportArg::Packet(p) = arg {
                seen2.lock().unwrap().push(p.clone());
            }
        });
        t.on_packet(Packet::message("hello"));
        t.on_packet(Packet::new(PacketType::Pong, "probe"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].data, Data::Text("hello".to_owned()));
        assert_eq!(seen[1].ptype, PacketType::Pong);
    }
}
