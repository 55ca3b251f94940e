//! The Socket.IO client socket: the per-namespace public API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use engineio_client::{Handle, Observable};
use tracing::debug;

use crate::errors::Error;
use crate::manager::{self, Manager, ManagerArg};
use crate::packet::{Packet, Type, DEFAULT_NAMESPACE};
use crate::state::State;
use crate::value::Value;

/// Emitted once a CONNECT packet for this namespace arrived.
pub const CONNECT: &str = "connect";
/// Emitted on an unrecoverable error.
pub const ERROR: &str = "error";
/// Emitted when the server sends an ERROR packet for this namespace.
pub const ERROR_PACKET: &str = "error_packet";
/// Emitted when the socket disconnects orderly, from either side.
pub const DISCONNECT: &str = "disconnect";
pub const PING: &str = manager::PING;
pub const PONG: &str = manager::PONG;
pub const ABRUPT_CLOSE: &str = manager::ABRUPT_CLOSE;
pub const CLOSE: &str = manager::CLOSE;
/// Carries the attempt number and the scheduled delay in milliseconds.
pub const RECONNECT_ATTEMPT: &str = manager::RECONNECT_ATTEMPT;
pub const RECONNECT_FAIL: &str = manager::RECONNECT_FAIL;
pub const UPGRADE: &str = manager::UPGRADE;
pub const UPGRADE_ATTEMPT: &str = manager::UPGRADE_ATTEMPT;
pub const UPGRADE_FAIL: &str = manager::UPGRADE_FAIL;

/// Argument passed to socket event callbacks: the event data plus, when the
/// server asked for an acknowledgement, a sender to answer it with.
#[derive(Debug, Clone)]
pub struct SocketArgs {
    pub data: Vec<Value>,
    pub ack: Option<AckSender>,
}

impl SocketArgs {
    fn empty() -> Self {
        Self {
            data: Vec::new(),
            ack: None,
        }
    }

    fn with(data: Vec<Value>) -> Self {
        Self { data, ack: None }
    }
}

/// Callback fired when the server acknowledges an emit.
pub type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Answers a server-requested acknowledgement.
///
/// Handed to event callbacks when the inbound packet carries an ack id;
/// calling [`send`](Self::send) returns an ACK (or BINARY_ACK) packet with
/// the matching id.
#[derive(Clone)]
pub struct AckSender {
    socket: Socket,
    id: i64,
}

impl AckSender {
    pub fn send(&self, args: Vec<Value>) {
        let binary = args.iter().any(Value::contains_binary);
        let ptype = if binary { Type::BinaryAck } else { Type::Ack };
        let packet = Packet::new(
            ptype,
            self.socket.namespace().to_owned(),
            self.id,
            Some(Value::Array(args)),
        );
        self.socket.send_through_manager(packet);
    }
}

impl std::fmt::Debug for AckSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckSender").field("id", &self.id).finish()
    }
}

/// A Socket.IO client socket bound to one namespace.
///
/// Cheap to clone; clones share the same connection state.
pub struct Socket {
    inner: Arc<Inner>,
}

struct Inner {
    namespace: String,
    manager: Mutex<Option<Manager>>,
    socket_id: Mutex<Option<String>>,
    state: Mutex<State>,
    next_ack_id: AtomicI64,
    acks: Mutex<HashMap<i64, AckCallback>>,
    outgoing: Mutex<Vec<Packet>>,
    events: Observable<SocketArgs>,
    manager_handles: Mutex<Vec<Handle<ManagerArg>>>,
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Socket {
    pub(crate) fn new(namespace: String, manager: Manager) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace,
                manager: Mutex::new(Some(manager)),
                socket_id: Mutex::new(None),
                state: Mutex::new(State::Initial),
                next_ack_id: AtomicI64::new(0),
                acks: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(Vec::new()),
                events: Observable::new(),
                manager_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Session id of the underlying engine connection, assigned on open.
    pub fn id(&self) -> Option<String> {
        self.inner.socket_id.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.lock().unwrap() == State::Open
    }

    /// Alias for [`open`](Self::open).
    pub fn connect(&self) -> Result<(), Error> {
        self.open()
    }

    /// Connect this socket's namespace, opening the shared connection if
    /// no other socket did yet.
    ///
    /// A closed socket cannot be reopened; construct a fresh one instead.
    pub fn open(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                State::Closed => return Err(Error::ClosedSocket),
                State::Opening | State::Open => return Ok(()),
                _ => *state = State::Opening,
            }
        }
        let manager = match self.manager() {
            Some(manager) => manager,
            None => return Err(Error::ClosedSocket),
        };
        self.register_manager_events(&manager);

        if manager.is_opening() {
            // The connect packet goes out from the OPEN callback.
        } else if manager.is_open() {
            // Multiplexing: another socket already opened the connection,
            // so the OPEN event this socket would react to already fired.
            self.on_manager_open();
            if self.inner.namespace == DEFAULT_NAMESPACE {
                self.handle_connect();
            }
        } else {
            manager.open();
        }
        Ok(())
    }

    /// Alias for [`disconnect`](Self::disconnect).
    pub fn close(&self) {
        self.disconnect_internal();
    }

    /// Send a DISCONNECT packet, detach from the manager and release every
    /// internal reference. Terminal.
    pub fn disconnect(&self) {
        self.disconnect_internal();
    }

    /// Register a callback for `event`; server events, plus the lifecycle
    /// events named by the constants of this module.
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(&SocketArgs) + Send + Sync + 'static,
    ) -> Handle<SocketArgs> {
        self.inner.events.on(event, callback)
    }

    /// Like [`on`](Self::on), but the callback fires at most once.
    pub fn once(
        &self,
        event: &str,
        callback: impl Fn(&SocketArgs) + Send + Sync + 'static,
    ) -> Handle<SocketArgs> {
        self.inner.events.once(event, callback)
    }

    /// Remove every callback registered for `event`.
    pub fn off(&self, event: &str) {
        self.inner.events.remove_all_for_event(event);
    }

    /// Alias for `emit("message", args)`.
    pub fn send(&self, args: Vec<Value>) {
        self.emit("message", args);
    }

    /// Emit an event with arguments. Chooses a binary packet automatically
    /// when any argument contains a byte sequence.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        self.emit_internal(event, args, None);
    }

    /// Like [`emit`](Self::emit), with a callback fired when the server
    /// acknowledges this exact emit.
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        ack: impl FnOnce(Vec<Value>) + Send + 'static,
    ) {
        self.emit_internal(event, args, Some(Box::new(ack)));
    }

    fn emit_internal(&self, event: &str, args: Vec<Value>, ack: Option<AckCallback>) {
        let state = *self.inner.state.lock().unwrap();
        if state == State::Closed {
            return;
        }

        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(event.to_owned()));
        data.extend(args);

        let binary = data.iter().any(Value::contains_binary);
        let ptype = if binary { Type::BinaryEvent } else { Type::Event };
        // An ack id is allocated if and only if a callback was supplied.
        let id = match &ack {
            Some(_) => self.inner.next_ack_id.fetch_add(1, Ordering::SeqCst),
            None => -1,
        };
        if let Some(callback) = ack {
            self.inner.acks.lock().unwrap().insert(id, callback);
        }

        let packet = Packet::new(
            ptype,
            self.inner.namespace.clone(),
            id,
            Some(Value::Array(data)),
        );
        if state == State::Open {
            self.send_through_manager(packet);
        } else {
            self.inner.outgoing.lock().unwrap().push(packet);
        }
    }

    fn manager(&self) -> Option<Manager> {
        self.inner.manager.lock().unwrap().clone()
    }

    pub(crate) fn manager_ref(&self) -> Option<Manager> {
        self.manager()
    }

    fn send_through_manager(&self, packet: Packet) {
        if let Some(manager) = self.manager() {
            manager.send_packet(packet);
        }
    }

    fn register_manager_events(&self, manager: &Manager) {
        let events = manager.events();
        let mut handles = self.inner.manager_handles.lock().unwrap();

        let this = self.clone();
        handles.push(events.on(manager::OPEN, move |_| this.on_manager_open()));
        let this = self.clone();
        handles.push(events.on(manager::PACKET, move |arg| {
            if let ManagerArg::Packet(packet) = arg {
                this.on_packet(packet);
            }
        }));
        let this = self.clone();
        handles.push(events.on(manager::CLOSE, move |arg| {
            this.common_closing_cleanup(CLOSE, reason_args(arg));
        }));
        let this = self.clone();
        handles.push(events.on(manager::ERROR, move |arg| {
            this.common_closing_cleanup(ERROR, reason_args(arg));
        }));
        for event in [
            ABRUPT_CLOSE,
            RECONNECT_ATTEMPT,
            RECONNECT_FAIL,
            PING,
            PONG,
            UPGRADE,
            UPGRADE_ATTEMPT,
            UPGRADE_FAIL,
        ] {
            let this = self.clone();
            handles.push(events.on(event, move |arg| {
                this.inner
                    .events
                    .emit(event, &SocketArgs::with(reason_args(arg)));
            }));
        }
    }

    fn on_manager_open(&self) {
        // The default namespace is implied by the connection itself, so no
        // CONNECT packet is sent for it.
        if self.inner.namespace != DEFAULT_NAMESPACE {
            self.send_through_manager(Packet::connect(self.inner.namespace.clone()));
        }
    }

    fn on_packet(&self, packet: &Packet) {
        if packet.namespace != self.inner.namespace {
            return;
        }
        match packet.ptype {
            Type::Connect => self.handle_connect(),
            Type::Disconnect => self.disconnect_internal(),
            Type::Error => {
                let data = packet.data.clone().map(|d| vec![d]).unwrap_or_default();
                self.inner.events.emit(ERROR_PACKET, &SocketArgs::with(data));
            }
            Type::Event | Type::BinaryEvent => self.handle_event(packet),
            Type::Ack | Type::BinaryAck => self.handle_ack(packet),
        }
    }

    fn handle_connect(&self) {
        *self.inner.state.lock().unwrap() = State::Open;
        let buffered: Vec<Packet> = self.inner.outgoing.lock().unwrap().drain(..).collect();
        for packet in buffered {
            self.send_through_manager(packet);
        }
        self.inner.events.emit(CONNECT, &SocketArgs::empty());
    }

    fn handle_event(&self, packet: &Packet) {
        let items = match &packet.data {
            Some(Value::Array(items)) => items.clone(),
            _ => return,
        };
        let mut items = items.into_iter();
        let event = match items.next() {
            Some(Value::String(event)) => event,
            _ => {
                debug!("dropping event packet without a string event name");
                return;
            }
        };
        let data: Vec<Value> = items.collect();
        let ack = packet.should_be_acknowledged().then(|| AckSender {
            socket: self.clone(),
            id: packet.id,
        });
        self.inner.events.emit(&event, &SocketArgs { data, ack });
    }

    fn handle_ack(&self, packet: &Packet) {
        let callback = self.inner.acks.lock().unwrap().remove(&packet.id);
        if let Some(callback) = callback {
            let args = match &packet.data {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => Vec::new(),
            };
            callback(args);
        }
    }

    pub(crate) fn assign_session_id(&self, id: Option<String>) {
        *self.inner.socket_id.lock().unwrap() = id;
    }

    fn disconnect_internal(&self) {
        if *self.inner.state.lock().unwrap() == State::Closed {
            return;
        }
        if let Some(manager) = self.manager() {
            manager.send_packet(Packet::disconnect(self.inner.namespace.clone()));
            manager.disconnect_socket(self);
        }
        self.common_closing_cleanup(DISCONNECT, Vec::new());
    }

    /// Terminal teardown: emit the final event, then release the manager
    /// back-reference, the buffers and every listener this socket put on
    /// the manager.
    fn common_closing_cleanup(&self, event: &str, data: Vec<Value>) {
        *self.inner.state.lock().unwrap() = State::Closed;
        self.inner.events.emit(event, &SocketArgs::with(data));
        self.inner.events.remove_all();
        *self.inner.manager.lock().unwrap() = None;
        self.inner.outgoing.lock().unwrap().clear();
        self.inner.acks.lock().unwrap().clear();
        for handle in self.inner.manager_handles.lock().unwrap().drain(..) {
            handle.remove();
        }
    }
}

fn reason_args(arg: &ManagerArg) -> Vec<Value> {
    match arg {
        ManagerArg::Reason(reason) => vec![Value::String(reason.clone())],
        ManagerArg::Attempt { attempt, delay } => vec![
            Value::from(*attempt as i64),
            Value::from(delay.as_millis() as i64),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    fn socket_on(port: u16, namespace: &str) -> Socket {
        let url = Url::parse(&format!("http://localhost:{port}")).unwrap();
        let mut config = ClientConfig::default();
        config.reconnect = false;
        Manager::new(&url, config).create_socket(namespace)
    }

    #[test]
    fn emit_buffers_until_connected() {
        let socket = socket_on(39160, "/chat");
        socket.emit("greet", vec![Value::from("hi")]);
        let outgoing = socket.inner.outgoing.lock().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].ptype, Type::Event);
        assert_eq!(outgoing[0].namespace, "/chat");
        assert_eq!(outgoing[0].id, -1);
    }

    #[test]
    fn emit_with_binary_args_uses_a_binary_packet() {
        let socket = socket_on(39161, "/");
        socket.emit("upload", vec![Value::from(vec![1u8, 2, 3])]);
        socket.emit("plain", vec![Value::from("text")]);
        let outgoing = socket.inner.outgoing.lock().unwrap();
        assert_eq!(outgoing[0].ptype, Type::BinaryEvent);
        assert_eq!(outgoing[1].ptype, Type::Event);
    }

    #[test]
    fn ack_ids_are_allocated_only_when_asked_for() {
        let socket = socket_on(39162, "/");
        socket.emit("no-ack", vec![Value::from(1i64)]);
        socket.emit_with_ack("first", vec![], |_| {});
        socket.emit_with_ack("second", vec![], |_| {});
        let outgoing = socket.inner.outgoing.lock().unwrap();
        assert_eq!(outgoing[0].id, -1);
        assert_eq!(outgoing[1].id, 0);
        assert_eq!(outgoing[2].id, 1);
        assert_eq!(socket.inner.acks.lock().unwrap().len(), 2);
    }

    #[test]
    fn connect_packet_opens_the_socket_and_flushes() {
        let socket = socket_on(39163, "/");
        socket.emit("early", vec![]);
        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        socket.on(CONNECT, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        socket.on_packet(&Packet::connect("/"));
        assert!(socket.is_open());
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert!(socket.inner.outgoing.lock().unwrap().is_empty());
    }

    #[test]
    fn inbound_events_carry_data_and_ack_sender() {
        let socket = socket_on(39164, "/");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        socket.on("greet", move |args| {
            seen2
                .lock()
                .unwrap()
                .push((args.data.clone(), args.ack.is_some()));
        });

        let mut with_ack = Packet::new(
            Type::Event,
            "/",
            5,
            Some(Value::Array(vec![
                Value::from("greet"),
                Value::from("hello"),
            ])),
        );
        socket.on_packet(&with_ack);
        with_ack.id = -1;
        socket.on_packet(&with_ack);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, vec![Value::from("hello")]);
        assert!(seen[0].1);
        assert!(!seen[1].1);
    }

    #[test]
    fn packets_for_other_namespaces_are_ignored() {
        let socket = socket_on(39165, "/chat");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        socket.on("ev", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let packet = Packet::new(
            Type::Event,
            "/other",
            -1,
            Some(Value::Array(vec![Value::from("ev")])),
        );
        socket.on_packet(&packet);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn acks_fire_once_by_id() {
        let socket = socket_on(39166, "/");
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = fired.clone();
        socket.emit_with_ack("op", vec![], move |args| {
            f.lock().unwrap().push(args);
        });

        let ack = Packet::new(
            Type::Ack,
            "/",
            0,
            Some(Value::Array(vec![Value::from("done")])),
        );
        socket.on_packet(&ack);
        socket.on_packet(&ack);
        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0], vec![Value::from("done")]);
    }

    #[test]
    fn server_disconnect_closes_the_socket() {
        let socket = socket_on(39167, "/");
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        socket.on(DISCONNECT, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        socket.on_packet(&Packet::disconnect("/"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(socket.open(), Err(Error::ClosedSocket)));
        assert!(socket.manager().is_none());
    }

    #[test]
    fn close_removes_every_listener_it_put_on_the_manager() {
        let url = Url::parse("http://localhost:39168").unwrap();
        let mut config = ClientConfig::default();
        config.reconnect = false;
        let manager = Manager::new(&url, config);
        let socket = manager.create_socket("/chat");

        let before = manager.events().listener_count(manager::PACKET);
        socket.open().unwrap();
        assert_eq!(manager.events().listener_count(manager::PACKET), before + 1);

        socket.close();
        assert_eq!(manager.events().listener_count(manager::PACKET), before);
        assert!(socket.inner.manager_handles.lock().unwrap().is_empty());
    }

    #[test]
    fn error_packet_surfaces_as_error_packet_event() {
        let socket = socket_on(39169, "/");
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        socket.on(ERROR_PACKET, move |args| {
            *s.lock().unwrap() = args.data.first().cloned();
        });
        let packet = Packet::new(Type::Error, "/", -1, Some(Value::from("denied")));
        socket.on_packet(&packet);
        assert_eq!(*seen.lock().unwrap(), Some(Value::from("denied")));
    }
}
