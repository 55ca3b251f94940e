//! HTTP long-polling transport.
//!
//! Two independent logical channels run against the same URL: the poll
//! channel (one in-flight GET whose response body is the next payload) and
//! the write channel (one in-flight POST carrying the queued outgoing
//! packets as a single payload). An availability flag gates each channel; a
//! second attempt while a channel is busy is silently skipped and the
//! packets wait in the send buffer for the next cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error};

use crate::observable::Observable;
use crate::packet::{Packet, PacketType};
use crate::parser;
use crate::transport::{self, TransportArg, TransportCtx, TransportKind, TransportState};
use crate::worker;

const BINARY_MEDIA_TYPE: &str = "application/octet-stream";
const TEXT_MEDIA_TYPE: &str = "text/plain; charset=UTF-8";

pub struct PollingTransport {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<TransportCtx>,
    events: Observable<TransportArg>,
    state: Mutex<TransportState>,
    send_buffer: Mutex<VecDeque<Packet>>,
    // true = no request of that kind in flight. The write channel starts
    // unavailable and opens when the OPEN packet arrives.
    poll_available: AtomicBool,
    write_available: AtomicBool,
    paused: AtomicBool,
    // Held for the duration of each POST; pause() waits on it.
    write_gate: tokio::sync::Mutex<()>,
}

impl Clone for PollingTransport {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PollingTransport {
    pub(crate) fn new(ctx: Arc<TransportCtx>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                events: Observable::new(),
                state: Mutex::new(TransportState::Initial),
                send_buffer: Mutex::new(VecDeque::new()),
                poll_available: AtomicBool::new(true),
                write_available: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                write_gate: tokio::sync::Mutex::new(()),
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
        if !self.is_open() {
            self.poll();
        }
    }

    pub fn close(&self, client_initiated: bool) {
        if client_initiated {
            self.send(Packet::close());
        }
        self.on_close();
    }

    /// Enqueue a packet. The whole buffer is drained into one POST as soon
    /// as the write channel is free.
    pub fn send(&self, packet: Packet) {
        if *self.inner.state.lock().unwrap() == TransportState::Closed {
            return;
        }
        self.inner.send_buffer.lock().unwrap().push_back(packet);
        self.try_write();
    }

    /// Force a write cycle for anything still buffered.
    pub fn flush(&self) {
        if !self.inner.send_buffer.lock().unwrap().is_empty() {
            self.send(Packet::noop());
        }
    }

    /// Wait until no POST is in flight, then keep the write channel closed
    /// so no further POST leaves until [`unpause`](Self::unpause).
    pub async fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        let _gate = self.inner.write_gate.lock().await;
    }

    pub fn unpause(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Packets enqueued but not yet handed to a POST. Drained by the
    /// session when it migrates to an upgraded transport.
    pub fn take_buffered(&self) -> Vec<Packet> {
        self.inner.send_buffer.lock().unwrap().drain(..).collect()
    }

    fn poll(&self) {
        if *self.inner.state.lock().unwrap() == TransportState::Closed {
            return;
        }
        if !self.inner.poll_available.swap(false, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        worker::spawn(async move { this.run_poll().await });
    }

    fn try_write(&self) {
        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.write_available.swap(false, Ordering::SeqCst) {
            return;
        }
        let packets: Vec<Packet> = self.inner.send_buffer.lock().unwrap().drain(..).collect();
        if packets.is_empty() {
            self.inner.write_available.store(true, Ordering::SeqCst);
            return;
        }
        let this = self.clone();
        worker::spawn(async move { this.run_write(packets).await });
    }

    async fn run_poll(&self) {
        let url = self.inner.ctx.build_url(TransportKind::Polling);
        debug!("poll request to {url}");
        let mut request = self.inner.ctx.config.http.get(&url);
        for (key, value) in &self.inner.ctx.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.classify_failure("poll", e),
        };
        if !response.status().is_success() {
            return self.handle_error(format!(
                "Poll request failed with status {}.",
                response.status()
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        if content_type.starts_with(BINARY_MEDIA_TYPE) {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return self.handle_error(format!("Error while reading poll response: {e}"))
                }
            };
            match parser::decode_payload_bin(&body) {
                Ok(packets) => self.deliver(packets),
                Err(e) => return self.handle_error(format!("Error while decoding payload: {e}")),
            }
        } else if content_type.starts_with("text/plain") {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    return self.handle_error(format!("Error while reading poll response: {e}"))
                }
            };
            match parser::decode_payload_str(&body) {
                Ok(packets) => self.deliver(packets),
                Err(e) => return self.handle_error(format!("Error while decoding payload: {e}")),
            }
        }

        if *self.inner.state.lock().unwrap() != TransportState::AbruptlyClosed {
            self.inner.poll_available.store(true, Ordering::SeqCst);
            self.on_poll_complete();
        }
    }

    async fn run_write(&self, packets: Vec<Packet>) {
        let _gate = self.inner.write_gate.lock().await;
        if self.inner.paused.load(Ordering::SeqCst) {
            // Paused between the drain and here; put the packets back for
            // whoever drains the buffer next.
            let mut buffer = self.inner.send_buffer.lock().unwrap();
            for packet in packets.into_iter().rev() {
                buffer.push_front(packet);
            }
            drop(buffer);
            self.inner.write_available.store(true, Ordering::SeqCst);
            return;
        }

        let (body, binary) = parser::encode_payload(&packets);
        let url = self.inner.ctx.build_url(TransportKind::Polling);
        debug!("post request with {} packet(s) to {url}", packets.len());
        let content_type = if binary {
            BINARY_MEDIA_TYPE
        } else {
            TEXT_MEDIA_TYPE
        };
        let mut request = self
            .inner
            .ctx
            .config
            .http
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        for (key, value) in &self.inner.ctx.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Err(e) => self.classify_failure("post", e),
            Ok(response) if !response.status().is_success() => {
                self.handle_error(format!(
                    "Post request failed with status {}.",
                    response.status()
                ));
            }
            Ok(_) => {
                if *self.inner.state.lock().unwrap() != TransportState::AbruptlyClosed {
                    self.inner.write_available.store(true, Ordering::SeqCst);
                    self.on_write_complete();
                }
            }
        }
    }

    fn deliver(&self, packets: Vec<Packet>) {
        for packet in packets {
            self.on_packet(packet);
        }
    }

    fn on_packet(&self, packet: Packet) {
        if packet.ptype == PacketType::Open {
            match transport::open_handshake(&self.inner.ctx, &packet) {
                Ok(handshake) => {
                    *self.inner.state.lock().unwrap() = TransportState::Open;
                    self.inner
                        .events
                        .emit(transport::HANDSHAKE, &TransportArg::Handshake(handshake));
                    self.inner
                        .events
                        .emit(transport::OPEN, &TransportArg::Packet(packet));
                    self.inner.write_available.store(true, Ordering::SeqCst);
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

    fn on_poll_complete(&self) {
        self.poll();
    }

    fn on_write_complete(&self) {
        if *self.inner.state.lock().unwrap() == TransportState::Closed {
            self.inner.write_available.store(false, Ordering::SeqCst);
            self.inner.send_buffer.lock().unwrap().clear();
            return;
        }
        if self.is_open() {
            self.flush();
        }
    }

    fn on_close(&self) {
        *self.inner.state.lock().unwrap() = TransportState::Closed;
        self.inner.poll_available.store(false, Ordering::SeqCst);
        self.inner.write_available.store(false, Ordering::SeqCst);
        self.inner.send_buffer.lock().unwrap().clear();
        self.inner.events.emit(transport::CLOSE, &TransportArg::None);
        self.inner.events.remove_all();
    }

    fn classify_failure(&self, op: &str, e: reqwest::Error) {
        // A refused or timed-out connection may succeed on a later retry;
        // everything else is unrecoverable.
        if e.is_connect() || e.is_timeout() {
            self.close_abruptly(format!("Connection exception during {op} request: {e}"));
        } else {
            self.handle_error(format!("An error occurred during {op} request: {e}"));
        }
    }

    fn close_abruptly(&self, message: String) {
        error!("abrupt close: {message}");
        *self.inner.state.lock().unwrap() = TransportState::AbruptlyClosed;
        self.inner.send_buffer.lock().unwrap().clear();
        self.inner.poll_available.store(true, Ordering::SeqCst);
        self.inner.write_available.store(true, Ordering::SeqCst);
        self.inner
            .events
            .emit(transport::ABRUPT_CLOSE, &TransportArg::Reason(message));
        self.inner.events.remove_all();
    }

    fn handle_error(&self, reason: String) {
        error!("transport error: {reason}");
        *self.inner.state.lock().unwrap() = TransportState::Closed;
        self.inner.poll_available.store(false, Ordering::SeqCst);
        self.inner.write_available.store(false, Ordering::SeqCst);
        self.inner.send_buffer.lock().unwrap().clear();
        self.inner
            .events
            .emit(transport::ERROR, &TransportArg::Reason(reason));
        self.inner.events.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn transport() -> PollingTransport {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        PollingTransport::new(TransportCtx::new(config))
    }

    #[test]
    fn send_buffers_until_open() {
        // The write channel only opens once the OPEN packet arrives, so
        // nothing leaves before that.
        let t = transport();
        t.send(Packet::message("a"));
        t.send(Packet::message("b"));
        assert_eq!(
            t.take_buffered(),
            vec![Packet::message("a"), Packet::message("b")]
        );
    }

    #[test]
    fn send_after_close_is_dropped() {
        let t = transport();
        t.close(false);
        t.send(Packet::message("late"));
        assert!(t.take_buffered().is_empty());
    }

    #[tokio::test]
    async fn pause_keeps_the_write_channel_shut() {
        let t = transport();
        t.pause().await;
        // Even with the channel marked free, a paused transport must not
        // start a POST.
        t.inner.write_available.store(true, Ordering::SeqCst);
        t.send(Packet::message("x"));
        assert_eq!(t.take_buffered(), vec![Packet::message("x")]);
        assert!(t.inner.write_available.load(Ordering::SeqCst));
    }

    #[test]
    fn unpause_restores_the_flag() {
        let t = transport();
        t.inner.paused.store(true, Ordering::SeqCst);
        t.unpause();
        assert!(!t.inner.paused.load(Ordering::SeqCst));
    }

    #[test]
    fn close_clears_buffer_and_listeners() {
        let t = transport();
        t.events().on(transport::PACKET, |_| {});
        t.send(Packet::message("a"));
        t.close(false);
        assert!(t.take_buffered().is_empty());
        assert_eq!(t.events().listener_count(transport::PACKET), 0);
        assert!(!t.is_open());
    }

    #[test]
    fn open_packet_opens_the_transport() {
        let t = transport();
        let packet = Packet::new(
            PacketType::Open,
            r#"{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#,
        );
        t.on_packet(packet);
        assert!(t.is_open());
        assert!(t.inner.write_available.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_open_packet_is_a_terminal_error() {
        let t = transport();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        t.events().on(transport::ERROR, move |arg| {
            *seen2.lock().unwrap() = arg.reason().map(str::to_owned);
        });
        t.on_packet(Packet::new(PacketType::Open, "{not json"));
        assert!(seen.lock().unwrap().is_some());
        assert!(!t.is_open());
    }
}
