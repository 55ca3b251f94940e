//! Engine.IO transports and the plumbing they share.

pub mod polling;
pub mod ws;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::config::Config;
use crate::errors::Error;
use crate::handshake::HandshakeData;
use crate::packet::{Data, Packet};

pub use polling::PollingTransport;
pub use ws::WebSocketTransport;

/// Emitted once the transport received the OPEN packet with handshake data.
pub const OPEN: &str = "open";
/// Emitted for every decoded inbound packet except the initial OPEN.
pub const PACKET: &str = "packet";
/// Emitted when the connection is lost to a transient network failure.
pub const ABRUPT_CLOSE: &str = "abrupt_close";
/// Emitted on an orderly close, initiated by either side.
pub const CLOSE: &str = "close";
/// Emitted on an unrecoverable failure.
pub const ERROR: &str = "error";
/// Emitted with the parsed handshake data, just before [`OPEN`].
pub const HANDSHAKE: &str = "handshake";
/// Emitted by the websocket transport when the raw connection opens, before
/// any handshake. The upgrade probe keys off this.
pub const WEBSOCKET_CONN_OPEN: &str = "websocket_conn_open";

/// The two Engine.IO transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    Websocket,
}

impl TransportKind {
    /// Wire name used in the `transport` query parameter.
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::Websocket => "websocket",
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::Websocket),
            other => Err(Error::UnknownTransport(other.to_owned())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    Initial,
    Open,
    Closed,
    AbruptlyClosed,
}

/// Argument passed to transport event callbacks.
#[derive(Debug, Clone)]
pub enum TransportArg {
    None,
    Packet(Packet),
    Handshake(HandshakeData),
    Reason(String),
}

impl TransportArg {
    pub fn reason(&self) -> Option<&str> {
        match self {
            TransportArg::Reason(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Connection context shared between a session and its transports.
///
/// The query map is shared mutable state: the transport inserts `sid` when
/// the handshake arrives and the session removes it again on cleanup, so a
/// later open obtains a fresh session.
pub(crate) struct TransportCtx {
    pub config: Config,
    pub query: Mutex<BTreeMap<String, String>>,
}

impl TransportCtx {
    pub fn new(config: Config) -> Arc<Self> {
        let query = Mutex::new(config.query.clone());
        Arc::new(Self { config, query })
    }

    pub fn set_query(&self, key: &str, value: &str) {
        self.query
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn remove_query(&self, key: &str) {
        self.query.lock().unwrap().remove(key);
    }

    /// `scheme://host:port<path>?<query>&transport=<name>`
    pub fn build_url(&self, kind: TransportKind) -> String {
        let scheme = match kind {
            TransportKind::Polling => match self.config.scheme.as_str() {
                "ws" => "http",
                "wss" => "https",
                other => other,
            },
            TransportKind::Websocket => match self.config.scheme.as_str() {
                "https" | "wss" => "wss",
                _ => "ws",
            },
        };
        format!(
            "{}://{}:{}{}?{}&transport={}",
            scheme,
            self.config.hostname,
            self.config.port,
            self.config.path,
            query_string(&self.query.lock().unwrap()),
            kind.name()
        )
    }
}

// Form-urlencoding with `+` remapped to `%20` and `! ' ( ) ~` left bare.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'!')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'~');

pub(crate) fn encode_query_component(value: &str) -> String {
    utf8_percent_encode(value, QUERY_COMPONENT).to_string()
}

pub(crate) fn query_string(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                encode_query_component(key),
                encode_query_component(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Handle the first OPEN packet: parse the handshake and bind the session
/// id to every subsequent request.
pub(crate) fn open_handshake(
    ctx: &TransportCtx,
    packet: &Packet,
) -> Result<HandshakeData, Error> {
    let text = match &packet.data {
        Data::Text(text) => text.clone(),
        Data::Binary(bin) => String::from_utf8(bin.to_vec())?,
        Data::None => String::new(),
    };
    let handshake = HandshakeData::parse(&text)?;
    ctx.set_query("sid", &handshake.sid);
    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_round_trip() {
        for kind in [TransportKind::Polling, TransportKind::Websocket] {
            assert_eq!(kind.name().parse::<TransportKind>().unwrap(), kind);
        }
        assert!(matches!(
            "carrier-pigeon".parse::<TransportKind>(),
            Err(Error::UnknownTransport(_))
        ));
    }

    #[test]
    fn query_encoding_rules() {
        assert_eq!(encode_query_component("a b"), "a%20b");
        assert_eq!(encode_query_component("it's(ok)!~"), "it's(ok)!~");
        assert_eq!(encode_query_component("k&v=1"), "k%26v%3D1");
        assert_eq!(encode_query_component("héllo"), "h%C3%A9llo");
    }

    #[test]
    fn build_url_for_both_transports() {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        config.port = 3000;
        config.path = "/socket.io/".to_owned();
        let ctx = TransportCtx::new(config);

        assert_eq!(
            ctx.build_url(TransportKind::Polling),
            "http://localhost:3000/socket.io/?EIO=3&transport=polling"
        );
        assert_eq!(
            ctx.build_url(TransportKind::Websocket),
            "ws://localhost:3000/socket.io/?EIO=3&transport=websocket"
        );

        ctx.set_query("sid", "abc123");
        assert_eq!(
            ctx.build_url(TransportKind::Polling),
            "http://localhost:3000/socket.io/?EIO=3&sid=abc123&transport=polling"
        );
        ctx.remove_query("sid");
        assert_eq!(
            ctx.build_url(TransportKind::Polling),
            "http://localhost:3000/socket.io/?EIO=3&transport=polling"
        );
    }

    #[test]
    fn secure_schemes_upgrade_to_wss() {
        let mut config = Config::default();
        config.scheme = "https".to_owned();
        config.hostname = "example.com".to_owned();
        config.port = 443;
        let ctx = TransportCtx::new(config);
        assert!(ctx
            .build_url(TransportKind::Websocket)
            .starts_with("wss://example.com:443"));
        assert!(ctx
            .build_url(TransportKind::Polling)
            .starts_with("https://example.com:443"));
    }

    #[test]
    fn open_handshake_sets_sid_query() {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        let ctx = TransportCtx::new(config);
        let packet = Packet::new(
            crate::packet::PacketType::Open,
            r#"{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#,
        );
        let handshake = open_handshake(&ctx, &packet).unwrap();
        assert_eq!(handshake.sid, "s1");
        assert_eq!(
            ctx.query.lock().unwrap().get("sid").map(String::as_str),
            Some("s1")
        );
    }
}
