//! The Engine.IO client session.
//!
//! An [`EngineSocket`] owns the current transport and implements the client
//! state machine on top of it: handshake, ping/pong liveness, the probe
//! protocol that upgrades an open session from polling to websocket without
//! losing buffered packets, and the orderly/abrupt close distinction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::errors::Error;
use crate::handshake::HandshakeData;
use crate::observable::Observable;
use crate::packet::{Data, Packet, PacketType};
use crate::transport::{
    self, PollingTransport, TransportArg, TransportCtx, TransportKind, WebSocketTransport,
};
use crate::worker;

/// Emitted with the payload of every inbound MESSAGE packet. When Socket.IO
/// runs on top, this data is the encoded Socket.IO packet.
pub const MESSAGE: &str = "message";
/// Emitted once the handshake completed and the session is usable.
pub const OPEN: &str = "open";
/// Emitted when the connection is lost to a transient failure.
pub const ABRUPT_CLOSE: &str = "abrupt_close";
/// Emitted when a PING packet is written.
pub const PING: &str = "ping";
/// Emitted when a PONG packet is received.
pub const PONG: &str = "pong";
/// Emitted when an orderly close completes.
pub const CLOSE: &str = "close";
/// Emitted on an unrecoverable error.
pub const ERROR: &str = "error";
/// Emitted after the session migrated to the websocket transport.
pub const UPGRADE: &str = "upgrade";
/// Emitted when an upgrade probe is about to start.
pub const UPGRADE_ATTEMPT: &str = "upgrade_attempt";
/// Emitted when the upgrade probe failed; the session stays on polling.
pub const UPGRADE_FAIL: &str = "upgrade_fail";

/// Argument passed to [`EngineSocket`] event callbacks.
#[derive(Debug, Clone)]
pub enum EngineArg {
    None,
    /// MESSAGE payload.
    Data(Data),
    Reason(String),
}

impl EngineArg {
    pub fn reason(&self) -> Option<&str> {
        match self {
            EngineArg::Reason(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub(crate) enum AnyTransport {
    Polling(PollingTransport),
    WebSocket(WebSocketTransport),
}

impl AnyTransport {
    fn open(&self) {
        match self {
            AnyTransport::Polling(t) => t.open(),
            AnyTransport::WebSocket(t) => t.open(),
        }
    }

    fn close(&self, client_initiated: bool) {
        match self {
            AnyTransport::Polling(t) => t.close(client_initiated),
            AnyTransport::WebSocket(t) => t.close(client_initiated),
        }
    }

    fn send(&self, packet: Packet) {
        match self {
            AnyTransport::Polling(t) => t.send(packet),
            AnyTransport::WebSocket(t) => t.send(packet),
        }
    }

    fn flush(&self) {
        match self {
            AnyTransport::Polling(t) => t.flush(),
            AnyTransport::WebSocket(t) => t.flush(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            AnyTransport::Polling(t) => t.is_open(),
            AnyTransport::WebSocket(t) => t.is_open(),
        }
    }

    fn events(&self) -> &Observable<TransportArg> {
        match self {
            AnyTransport::Polling(t) => t.events(),
            AnyTransport::WebSocket(t) => t.events(),
        }
    }
}

/// An Engine.IO client session.
pub struct EngineSocket {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<TransportCtx>,
    events: Observable<EngineArg>,
    transport: Mutex<Option<AnyTransport>>,
    session_id: Mutex<Option<String>>,
    ping_interval: Mutex<Duration>,
    ping_timeout: Mutex<Duration>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    ping_timeout_task: Mutex<Option<JoinHandle<()>>>,
    // Bumped by every ping cycle and every cleanup; a timeout task fires
    // only if its epoch is still current.
    ping_epoch: AtomicU64,
}

impl Clone for EngineSocket {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl EngineSocket {
    /// Create a session for `url`, taking scheme, host, port and URL query
    /// entries into the configuration.
    pub fn new(url: &Url, mut config: Config) -> Self {
        config.apply_url(url);
        Self {
            inner: Arc::new(Inner {
                ctx: TransportCtx::new(config),
                events: Observable::new(),
                transport: Mutex::new(None),
                session_id: Mutex::new(None),
                ping_interval: Mutex::new(Duration::ZERO),
                ping_timeout: Mutex::new(Duration::ZERO),
                ping_task: Mutex::new(None),
                ping_timeout_task: Mutex::new(None),
                ping_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn events(&self) -> &Observable<EngineArg> {
        &self.inner.events
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.current_transport().map_or(false, |t| t.is_open())
    }

    /// Open the first configured transport.
    pub fn open(&self) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }
        let kind = *self
            .inner
            .ctx
            .config
            .transports
            .first()
            .ok_or(Error::NoTransports)?;
        let transport = match kind {
            TransportKind::Polling => {
                AnyTransport::Polling(PollingTransport::new(self.inner.ctx.clone()))
            }
            TransportKind::Websocket => {
                AnyTransport::WebSocket(WebSocketTransport::new(self.inner.ctx.clone()))
            }
        };
        self.register_transport_events(&transport);
        *self.inner.transport.lock().unwrap() = Some(transport.clone());
        transport.open();
        Ok(())
    }

    /// Initiate an orderly close.
    pub fn close(&self) {
        self.close_internal(true);
    }

    pub fn send(&self, data: &str) {
        if let Some(transport) = self.current_transport() {
            transport.send(Packet::message(data));
        }
    }

    pub fn send_binary(&self, data: impl Into<Data>) {
        if let Some(transport) = self.current_transport() {
            transport.send(Packet::new(PacketType::Message, data));
        }
    }

    fn current_transport(&self) -> Option<AnyTransport> {
        self.inner.transport.lock().unwrap().clone()
    }

    fn register_transport_events(&self, transport: &AnyTransport) {
        let events = transport.events();

        let this = self.clone();
        events.once(transport::OPEN, move |_| {
            this.inner.events.emit(OPEN, &EngineArg::None);
        });
        let this = self.clone();
        events.once(transport::HANDSHAKE, move |arg| {
            if let TransportArg::Handshake(handshake) = arg {
                this.on_handshake(handshake.clone());
            }
        });
        let this = self.clone();
        events.once(transport::ABRUPT_CLOSE, move |arg| {
            this.common_cleanup(ABRUPT_CLOSE, arg.reason().map(str::to_owned));
        });
        let this = self.clone();
        events.once(transport::ERROR, move |arg| {
            this.common_cleanup(ERROR, arg.reason().map(str::to_owned));
        });
        let this = self.clone();
        events.once(transport::CLOSE, move |_| {
            this.common_cleanup(CLOSE, None);
        });
        let this = self.clone();
        events.on(transport::PACKET, move |arg| {
            if let TransportArg::Packet(packet) = arg {
                this.on_packet(packet);
            }
        });
    }

    fn on_packet(&self, packet: &Packet) {
        match packet.ptype {
            PacketType::Message => {
                self.inner
                    .events
                    .emit(MESSAGE, &EngineArg::Data(packet.data.clone()));
            }
            PacketType::Pong => self.on_pong(),
            PacketType::Close => self.close_internal(false),
            PacketType::Open | PacketType::Noop | PacketType::Ping | PacketType::Upgrade => {}
        }
    }

    fn on_handshake(&self, handshake: HandshakeData) {
        debug!(
            "handshake complete, sid={} pingInterval={}ms pingTimeout={}ms",
            handshake.sid, handshake.ping_interval, handshake.ping_timeout
        );
        *self.inner.session_id.lock().unwrap() = Some(handshake.sid.clone());
        *self.inner.ping_interval.lock().unwrap() = Duration::from_millis(handshake.ping_interval);
        *self.inner.ping_timeout.lock().unwrap() = Duration::from_millis(handshake.ping_timeout);
        self.do_ping();

        // Probe only when both the server offers a websocket upgrade and
        // the configuration allows one.
        let offered = handshake
            .upgrades
            .iter()
            .any(|u| u == TransportKind::Websocket.name());
        let allowed = self
            .inner
            .ctx
            .config
            .transports
            .contains(&TransportKind::Websocket);
        if offered && allowed {
            let this = self.clone();
            worker::submit(move || this.probe_websocket());
        }
    }

    fn do_ping(&self) {
        let interval = *self.inner.ping_interval.lock().unwrap();
        let timeout = *self.inner.ping_timeout.lock().unwrap();
        let epoch = self.inner.ping_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let this = self.clone();
        *self.inner.ping_task.lock().unwrap() = worker::schedule(
            move || {
                if let Some(transport) = this.current_transport() {
                    transport.send(Packet::ping());
                }
                this.inner.events.emit(PING, &EngineArg::None);
            },
            interval,
        );

        let this = self.clone();
        *self.inner.ping_timeout_task.lock().unwrap() = worker::schedule(
            move || {
                if this.inner.ping_epoch.load(Ordering::SeqCst) == epoch {
                    this.common_cleanup(
                        ERROR,
                        Some("Didn't receive pong packet in time.".to_owned()),
                    );
                }
            },
            interval + timeout,
        );
    }

    fn on_pong(&self) {
        if let Some(task) = self.inner.ping_timeout_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.events.emit(PONG, &EngineArg::None);
        self.do_ping();
    }

    /// Probe process: open an auxiliary websocket transport against the
    /// same session, send `PING("probe")`, and migrate only on
    /// `PONG("probe")`. Any other outcome discards the probe transport and
    /// resumes the polling transport.
    fn probe_websocket(&self) {
        let polling = match self.current_transport() {
            Some(AnyTransport::Polling(polling)) => polling,
            _ => return,
        };
        self.inner.events.emit(UPGRADE_ATTEMPT, &EngineArg::None);

        let ws = WebSocketTransport::new(self.inner.ctx.clone());
        let ws_events = ws.events().clone();

        let probe_ws = ws.clone();
        let open_handle = ws_events.once(transport::WEBSOCKET_CONN_OPEN, move |_| {
            probe_ws.send(Packet::new(PacketType::Ping, "probe"));
        });

        let fail = {
            let this = self.clone();
            let polling = polling.clone();
            let ws = ws.clone();
            Arc::new(move |arg: &TransportArg| {
                ws.events().remove_all();
                polling.unpause();
                let reason = arg.reason().unwrap_or("Probe transport failed.").to_owned();
                this.inner.events.emit(UPGRADE_FAIL, &EngineArg::Reason(reason));
            })
        };
        let on_abrupt = fail.clone();
        let abrupt_handle = ws_events.once(transport::ABRUPT_CLOSE, move |arg| (*on_abrupt)(arg));
        let on_error = fail.clone();
        let error_handle = ws_events.once(transport::ERROR, move |arg| (*on_error)(arg));

        // Keep the one-shot handles removable from inside the Fn closure.
        let handles = Arc::new((open_handle, abrupt_handle, error_handle));

        let this = self.clone();
        let probe_ws = ws.clone();
        ws_events.once(transport::PACKET, move |arg| {
            let packet = match arg {
                TransportArg::Packet(packet) => packet.clone(),
                _ => return,
            };
            let probe_ok = packet.ptype == PacketType::Pong && packet.data == Data::from("probe");
            if probe_ok {
                let this = this.clone();
                let ws = probe_ws.clone();
                let polling = polling.clone();
                let handles = handles.clone();
                worker::spawn(async move {
                    // Drain the in-flight POST before the transports swap.
                    polling.pause().await;
                    ws.send(Packet::empty(PacketType::Upgrade));
                    polling.events().remove_all();
                    // The paused transport may still deliver packets its
                    // last poll already carried; forward them.
                    let session = this.clone();
                    polling.events().on(transport::PACKET, move |arg| {
                        if let TransportArg::Packet(packet) = arg {
                            if packet.ptype == PacketType::Message {
                                session
                                    .inner
                                    .events
                                    .emit(MESSAGE, &EngineArg::Data(packet.data.clone()));
                            }
                        }
                    });
                    handles.0.remove();
                    handles.1.remove();
                    handles.2.remove();

                    let upgraded = AnyTransport::WebSocket(ws.clone());
                    *this.inner.transport.lock().unwrap() = Some(upgraded.clone());
                    this.register_transport_events(&upgraded);
                    upgraded.flush();
                    // Buffered outgoing packets of the old transport go out
                    // first, in order.
                    for packet in polling.take_buffered() {
                        upgraded.send(packet);
                    }
                    this.inner.events.emit(UPGRADE, &EngineArg::None);
                });
            } else {
                probe_ws.events().remove_all();
                probe_ws.close(false);
                this.inner.events.emit(
                    UPGRADE_FAIL,
                    &EngineArg::Reason(format!(
                        "Transport was open but didn't receive a PONG[probe] packet. Instead, received: {packet:?}"
                    )),
                );
            }
        });

        ws.open();
    }

    fn close_internal(&self, client_initiated: bool) {
        let transport = self.inner.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.close(client_initiated);
        }
    }

    /// Tear the session down: drop the transport, forget the session id (so
    /// a future open gets a fresh one), cancel the ping timers and emit the
    /// terminating event.
    fn common_cleanup(&self, event: &str, reason: Option<String>) {
        *self.inner.transport.lock().unwrap() = None;
        self.inner.ctx.remove_query("sid");
        *self.inner.session_id.lock().unwrap() = None;
        self.inner.ping_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.inner.ping_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.inner.ping_timeout_task.lock().unwrap().take() {
            task.abort();
        }
        let arg = match reason {
            Some(reason) => EngineArg::Reason(reason),
            None => EngineArg::None,
        };
        self.inner.events.emit(event, &arg);
        self.inner.events.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn engine(transports: Vec<TransportKind>) -> EngineSocket {
        let url = Url::parse("http://localhost:39154").unwrap();
        let mut config = Config::default();
        config.transports = transports;
        EngineSocket::new(&url, config)
    }

    fn handshake(upgrades: Vec<String>) -> HandshakeData {
        HandshakeData {
            sid: "session-1".to_owned(),
            upgrades,
            ping_interval: 60_000,
            ping_timeout: 60_000,
        }
    }

    #[test]
    fn open_without_transports_is_an_error() {
        let engine = engine(vec![]);
        assert!(matches!(engine.open(), Err(Error::NoTransports)));
    }

    #[test]
    fn handshake_records_session_and_schedules_ping() {
        let engine = engine(vec![TransportKind::Polling]);
        engine.on_handshake(handshake(vec![]));

        assert_eq!(engine.session_id().as_deref(), Some("session-1"));
        assert!(engine.inner.ping_task.lock().unwrap().is_some());
        assert!(engine.inner.ping_timeout_task.lock().unwrap().is_some());
        engine.common_cleanup(CLOSE, None);
    }

    #[test]
    fn cleanup_unbinds_the_session() {
        let engine = engine(vec![TransportKind::Polling]);
        engine.inner.ctx.set_query("sid", "session-1");
        engine.on_handshake(handshake(vec![]));

        let (tx, rx) = mpsc::channel();
        engine.events().on(CLOSE, move |_| tx.send(()).unwrap());
        engine.common_cleanup(CLOSE, None);

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(engine.session_id(), None);
        assert!(engine
            .inner
            .ctx
            .query
            .lock()
            .unwrap()
            .get("sid")
            .is_none());
        // A later open must not see stale listeners.
        assert_eq!(engine.events().listener_count(CLOSE), 0);
    }

    #[test]
    fn pong_cancels_the_timeout_and_restarts_the_cycle() {
        let engine = engine(vec![TransportKind::Polling]);
        engine.on_handshake(handshake(vec![]));
        let epoch_before = engine.inner.ping_epoch.load(Ordering::SeqCst);

        engine.on_pong();
        let epoch_after = engine.inner.ping_epoch.load(Ordering::SeqCst);
        assert_eq!(epoch_after, epoch_before + 1);
        assert!(engine.inner.ping_timeout_task.lock().unwrap().is_some());
        engine.common_cleanup(CLOSE, None);
    }

    #[test]
    fn open_against_a_closed_port_closes_abruptly() {
        // Nothing listens on the port, so the first poll gets a refused
        // connection, which is reconnect-eligible.
        let engine = engine(vec![TransportKind::Polling]);
        let (tx, rx) = mpsc::channel();
        engine.events().on(ABRUPT_CLOSE, move |_| {
            tx.send(()).ok();
        });
        engine.open().unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!engine.is_open());
    }

    #[test]
    fn failed_probe_emits_upgrade_fail_and_resumes_polling() {
        let engine = engine(vec![TransportKind::Polling, TransportKind::Websocket]);
        let polling = PollingTransport::new(engine.inner.ctx.clone());
        *engine.inner.transport.lock().unwrap() = Some(AnyTransport::Polling(polling));

        let (tx, rx) = mpsc::channel();
        engine.events().on(UPGRADE_FAIL, move |_| {
            tx.send(()).ok();
        });
        engine.probe_websocket();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        // Still on the polling transport.
        assert!(matches!(
            engine.current_transport(),
            Some(AnyTransport::Polling(_))
        ));
    }
}
