//! The manager: one shared Engine.IO session, many sockets.
//!
//! A manager owns one [`EngineSocket`], the Socket.IO encoder/decoder pair
//! and a `namespace -> Socket` map. Engine events are re-emitted on the
//! manager's observable, where every socket filters for itself; decoded
//! packets fan out the same way. After an abrupt close the manager drives
//! the randomized exponential backoff that re-opens the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use engineio_client::socket as engine;
use engineio_client::{worker, Data, EngineArg, EngineSocket};
use tracing::{debug, error};
use url::Url;

use crate::config::ClientConfig;
use crate::io;
use crate::packet::{Packet, DEFAULT_NAMESPACE};
use crate::parser::{self, Decoder};
use crate::socket::Socket;
use crate::state::State;

pub const OPEN: &str = "open";
pub const ERROR: &str = "error";
pub const CLOSE: &str = "close";
pub const ABRUPT_CLOSE: &str = "abrupt_close";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
/// Carries every decoded Socket.IO packet; sockets filter by namespace.
pub const PACKET: &str = "packet";
pub const UPGRADE: &str = "upgrade";
pub const UPGRADE_ATTEMPT: &str = "upgrade_attempt";
pub const UPGRADE_FAIL: &str = "upgrade_fail";
pub const RECONNECT_FAIL: &str = "reconnect_failed";
pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";

/// Argument passed to manager event callbacks.
#[derive(Debug, Clone)]
pub enum ManagerArg {
    None,
    Packet(Packet),
    Reason(String),
    Attempt { attempt: u32, delay: Duration },
}

impl ManagerArg {
    pub fn reason(&self) -> Option<&str> {
        match self {
            ManagerArg::Reason(reason) => Some(reason),
            _ => None,
        }
    }
}

pub(crate) type ManagerEvents = engineio_client::Observable<ManagerArg>;

/// Manages a group of sockets over one engine session.
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    sockets: Mutex<HashMap<String, Socket>>,
    state: Mutex<State>,
    config: ClientConfig,
    engine: EngineSocket,
    events: ManagerEvents,
    decoder: Mutex<Decoder>,
    backoff: Mutex<Backoff>,
    connection_path: String,
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Manager {
    pub(crate) fn new(url: &Url, config: ClientConfig) -> Self {
        let engine = EngineSocket::new(url, config.engine.clone());
        let connection_path = io::connection_path(url, &config.engine.path);
        let backoff = Backoff::new(&config);
        Self {
            inner: Arc::new(Inner {
                sockets: Mutex::new(HashMap::new()),
                state: Mutex::new(State::Initial),
                config,
                engine,
                events: ManagerEvents::new(),
                decoder: Mutex::new(Decoder::new()),
                backoff: Mutex::new(backoff),
                connection_path,
            }),
        }
    }

    pub(crate) fn events(&self) -> &ManagerEvents {
        &self.inner.events
    }

    /// Whether two handles refer to the same manager.
    pub(crate) fn same_manager(&self, other: &Manager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.lock().unwrap() == State::Open
    }

    pub fn is_opening(&self) -> bool {
        *self.inner.state.lock().unwrap() == State::Opening
    }

    /// The socket for `namespace`, created on first use.
    pub(crate) fn create_socket(&self, namespace: &str) -> Socket {
        let namespace = normalize_namespace(namespace);
        self.inner
            .sockets
            .lock()
            .unwrap()
            .entry(namespace.clone())
            .or_insert_with(|| Socket::new(namespace, self.clone()))
            .clone()
    }

    pub(crate) fn has_socket(&self, namespace: &str) -> bool {
        self.inner
            .sockets
            .lock()
            .unwrap()
            .contains_key(&normalize_namespace(namespace))
    }

    /// Remove a socket; closing the engine once the last one is gone.
    pub(crate) fn disconnect_socket(&self, socket: &Socket) {
        let mut sockets = self.inner.sockets.lock().unwrap();
        sockets.remove(socket.namespace());
        if sockets.is_empty() {
            drop(sockets);
            io::remove_manager(&self.inner.connection_path);
            let engine = self.inner.engine.clone();
            worker::submit(move || engine.close());
        }
    }

    /// Open the underlying engine session.
    pub(crate) fn open(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != State::Initial && *state != State::AbruptlyClosed {
                return;
            }
            *state = State::Opening;
        }

        let events = self.inner.engine.events();
        let this = self.clone();
        events.once(engine::OPEN, move |_| this.on_open());
        let this = self.clone();
        events.once(engine::ABRUPT_CLOSE, move |arg| {
            this.on_abrupt_close(arg.reason().map(str::to_owned));
        });
        let this = self.clone();
        events.once(engine::ERROR, move |arg| {
            this.common_cleanup(ERROR, arg.reason().map(str::to_owned));
        });
        let this = self.clone();
        events.once(engine::CLOSE, move |_| this.common_cleanup(CLOSE, None));

        if let Err(e) = self.inner.engine.open() {
            error!("failed to open engine session: {e}");
            self.common_cleanup(ERROR, Some(e.to_string()));
        }
    }

    fn on_open(&self) {
        *self.inner.state.lock().unwrap() = State::Open;

        let events = self.inner.engine.events();
        let this = self.clone();
        events.on(engine::MESSAGE, move |arg| {
            if let EngineArg::Data(data) = arg {
                this.on_data(data.clone());
            }
        });
        let this = self.clone();
        events.once(engine::ERROR, move |arg| {
            this.common_cleanup(ERROR, arg.reason().map(str::to_owned));
        });
        for (engine_event, event) in [
            (engine::PING, PING),
            (engine::PONG, PONG),
            (engine::UPGRADE, UPGRADE),
            (engine::UPGRADE_ATTEMPT, UPGRADE_ATTEMPT),
            (engine::UPGRADE_FAIL, UPGRADE_FAIL),
        ] {
            let this = self.clone();
            events.on(engine_event, move |arg| {
                let arg = match arg.reason() {
                    Some(reason) => ManagerArg::Reason(reason.to_owned()),
                    None => ManagerArg::None,
                };
                this.inner.events.emit(event, &arg);
            });
        }

        // Bind every socket to the fresh session.
        let session_id = self.inner.engine.session_id();
        for socket in self.inner.sockets.lock().unwrap().values() {
            socket.assign_session_id(session_id.clone());
        }
        self.inner.backoff.lock().unwrap().reset();
        self.inner.events.emit(OPEN, &ManagerArg::None);
    }

    fn unregister_engine_events(&self) {
        let events = self.inner.engine.events();
        for event in [
            engine::MESSAGE,
            engine::CLOSE,
            engine::PING,
            engine::PONG,
            engine::ERROR,
            engine::UPGRADE,
            engine::UPGRADE_ATTEMPT,
            engine::UPGRADE_FAIL,
        ] {
            events.remove_all_for_event(event);
        }
    }

    fn on_abrupt_close(&self, reason: Option<String>) {
        *self.inner.state.lock().unwrap() = State::AbruptlyClosed;
        self.unregister_engine_events();
        let arg = match reason {
            Some(reason) => ManagerArg::Reason(reason),
            None => ManagerArg::None,
        };
        self.inner.events.emit(ABRUPT_CLOSE, &arg);
        if self.inner.config.reconnect {
            self.try_reconnect();
        }
    }

    fn common_cleanup(&self, event: &str, reason: Option<String>) {
        *self.inner.state.lock().unwrap() = State::Closed;
        self.unregister_engine_events();
        io::remove_manager(&self.inner.connection_path);
        let arg = match reason {
            Some(reason) => ManagerArg::Reason(reason),
            None => ManagerArg::None,
        };
        self.inner.events.emit(event, &arg);
        self.inner.events.remove_all();
        self.inner.sockets.lock().unwrap().clear();
    }

    /// Feed inbound engine MESSAGE data to the decoder on the worker, then
    /// fan the decoded packet out to the sockets.
    fn on_data(&self, data: Data) {
        let this = self.clone();
        worker::submit(move || {
            let result = match data {
                Data::Text(text) => this.inner.decoder.lock().unwrap().decode_str(&text),
                Data::Binary(bin) => this.inner.decoder.lock().unwrap().decode_bin(bin),
                Data::None => Ok(None),
            };
            match result {
                Ok(Some(packet)) => {
                    debug!("decoded packet for namespace {}", packet.namespace);
                    this.inner.events.emit(PACKET, &ManagerArg::Packet(packet));
                }
                Ok(None) => {}
                Err(e) => {
                    error!("error while decoding packet: {e}");
                    this.common_cleanup(ERROR, Some(format!("Error while decoding packet: {e}")));
                }
            }
        });
    }

    /// Encode on the worker; the primary frame and every attachment each go
    /// out as their own engine MESSAGE.
    pub(crate) fn send_packet(&self, packet: Packet) {
        let this = self.clone();
        worker::submit(move || match parser::encode(&packet) {
            Ok((primary, attachments)) => {
                this.inner.engine.send(&primary);
                for attachment in attachments {
                    this.inner.engine.send_binary(attachment);
                }
            }
            Err(e) => error!("error while encoding packet: {e}"),
        });
    }

    fn try_reconnect(&self) {
        let next = {
            let mut backoff = self.inner.backoff.lock().unwrap();
            if backoff.should_reconnect() {
                Some(backoff.next_delay())
            } else {
                backoff.reset();
                None
            }
        };
        match next {
            None => {
                self.inner.events.emit(
                    RECONNECT_FAIL,
                    &ManagerArg::Reason("Maximum number of attempts has been reached!".to_owned()),
                );
            }
            Some((attempt, delay)) => {
                debug!("scheduling reconnect attempt {attempt} in {delay:?}");
                let this = self.clone();
                worker::schedule(
                    move || {
                        this.inner
                            .events
                            .emit(RECONNECT_ATTEMPT, &ManagerArg::Attempt { attempt, delay });
                        this.open();
                    },
                    delay,
                );
            }
        }
    }
}

fn normalize_namespace(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_owned()
    } else if !namespace.starts_with('/') {
        format!("/{namespace}")
    } else {
        namespace.to_owned()
    }
}

/// Randomized exponential backoff for reconnect scheduling.
struct Backoff {
    attempts: u32,
    max_attempts: u32,
    base: Duration,
    max_delay: Duration,
    factor: f64,
}

impl Backoff {
    fn new(config: &ClientConfig) -> Self {
        let base = config.reconnect_delay.max(Duration::from_millis(100));
        let factor = if (0.0..=1.0).contains(&config.randomization_factor) {
            config.randomization_factor
        } else {
            0.5
        };
        Self {
            attempts: 0,
            max_attempts: config.max_reconnect_attempts,
            base,
            max_delay: config.max_reconnect_delay,
            factor,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn should_reconnect(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The attempt number and its jittered delay. The exponential base is
    /// capped at `max_delay` before the jitter applies; the result is
    /// clamped to `[0, max_delay]`.
    fn next_delay(&mut self) -> (u32, Duration) {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential = base_ms
            .saturating_mul(2u64.saturating_pow(self.attempts.min(32)))
            .min(max_ms);
        self.attempts += 1;

        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * base_ms as f64 * self.factor;
        let delay = (exponential as f64 + jitter).clamp(0.0, max_ms as f64);
        (self.attempts, Duration::from_millis(delay as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: ClientConfig) -> Manager {
        let url = Url::parse("http://localhost:39155").unwrap();
        Manager::new(&url, config)
    }

    #[test]
    fn create_socket_normalizes_namespaces() {
        let manager = manager(ClientConfig::default());
        let root = manager.create_socket("");
        assert_eq!(root.namespace(), "/");
        let chat = manager.create_socket("chat");
        assert_eq!(chat.namespace(), "/chat");
        assert!(manager.has_socket("/chat"));
        assert!(manager.has_socket("chat"));
    }

    #[test]
    fn create_socket_is_idempotent_per_namespace() {
        let manager = manager(ClientConfig::default());
        let a = manager.create_socket("/room");
        let b = manager.create_socket("/room");
        assert_eq!(a.namespace(), b.namespace());
        assert_eq!(manager.inner.sockets.lock().unwrap().len(), 1);
    }

    #[test]
    fn backoff_bases_double_up_to_the_cap() {
        let config = ClientConfig::default();
        let mut backoff = Backoff::new(&config);
        let expected_bases = [500u64, 1000, 2000, 4000, 8000, 10000, 10000, 10000];
        for (n, base) in expected_bases.iter().enumerate() {
            let (attempt, delay) = backoff.next_delay();
            assert_eq!(attempt as usize, n + 1);
            let ms = delay.as_millis() as i64;
            // Jitter stays within base +/- 250ms, clamped to [0, 10000].
            let lo = (*base as i64 - 250).max(0);
            let hi = (*base as i64 + 250).min(10_000);
            assert!(ms >= lo && ms <= hi, "attempt {attempt}: {ms} not in [{lo}, {hi}]");
        }
    }

    #[test]
    fn backoff_floors_the_base_delay() {
        let mut config = ClientConfig::default();
        config.reconnect_delay = Duration::from_millis(10);
        let backoff = Backoff::new(&config);
        assert_eq!(backoff.base, Duration::from_millis(100));
    }

    #[test]
    fn backoff_clamps_the_randomization_factor() {
        let mut config = ClientConfig::default();
        config.randomization_factor = 7.5;
        let backoff = Backoff::new(&config);
        assert_eq!(backoff.factor, 0.5);
    }

    #[test]
    fn backoff_honors_max_attempts() {
        let mut config = ClientConfig::default();
        config.max_reconnect_attempts = 2;
        let mut backoff = Backoff::new(&config);
        assert!(backoff.should_reconnect());
        backoff.next_delay();
        backoff.next_delay();
        assert!(!backoff.should_reconnect());
        backoff.reset();
        assert!(backoff.should_reconnect());
    }

    #[test]
    fn decoded_packets_fan_out_as_packet_events() {
        let manager = manager(ClientConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        manager.events().on(PACKET, move |arg| {
            if let ManagerArg::Packet(packet) = arg {
                seen2.lock().unwrap().push(packet.clone());
            }
        });

        manager.on_data(Data::Text("2[\"greet\",\"hi\"]".to_owned()));
        // Decoding runs on the worker; wait for it to drain.
        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].namespace, "/");
    }
}
