//! Engine.IO connection configuration.

use std::collections::BTreeMap;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

use crate::transport::TransportKind;

/// Configures an Engine.IO connection.
///
/// Plain value, cloned before being handed to a session so later mutations
/// by the caller do not leak into an open connection. The session shares the
/// query map with its transports and maintains the `sid` entry itself.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol scheme, `http` by default. `https`/`wss` pick the secure
    /// websocket scheme on upgrade.
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    /// Request path, `/engine.io/` by default.
    pub path: String,
    /// Transports to use, in order. The first one opens the session; a
    /// later `websocket` entry enables the upgrade probe.
    pub transports: Vec<TransportKind>,
    /// Query entries added to every request. Always carries `EIO`.
    pub query: BTreeMap<String, String>,
    /// Headers added to every request.
    pub headers: BTreeMap<String, String>,
    /// HTTP client used for polling requests.
    pub http: reqwest::Client,
    /// Optional protocol configuration for websocket connections.
    pub websocket: Option<WebSocketConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut query = BTreeMap::new();
        query.insert("EIO".to_owned(), crate::PROTOCOL_VERSION.to_owned());
        Self {
            scheme: "http".to_owned(),
            hostname: String::new(),
            port: 80,
            path: "/engine.io/".to_owned(),
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            query,
            headers: BTreeMap::new(),
            http: reqwest::Client::new(),
            websocket: None,
        }
    }
}

impl Config {
    /// Take scheme, host, port and query entries from a connection URL.
    /// The URL path is deliberately ignored; request paths come from
    /// configuration, the URL path means something else to the layers
    /// above.
    pub fn apply_url(&mut self, url: &Url) {
        self.scheme = url.scheme().to_owned();
        if let Some(host) = url.host_str() {
            self.hostname = host.to_owned();
        }
        self.port = url.port().unwrap_or(match url.scheme() {
            "https" | "wss" => 443,
            _ => 80,
        });
        for (key, value) in url.query_pairs() {
            self.query.insert(key.into_owned(), value.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_protocol_version() {
        let config = Config::default();
        assert_eq!(config.query.get("EIO").map(String::as_str), Some("3"));
        assert_eq!(config.path, "/engine.io/");
        assert_eq!(
            config.transports,
            vec![TransportKind::Polling, TransportKind::Websocket]
        );
    }

    #[test]
    fn apply_url_fills_host_port_and_query() {
        let url = Url::parse("https://example.com/chat?token=abc&flag=").unwrap();
        let mut config = Config::default();
        config.apply_url(&url);
        assert_eq!(config.scheme, "https");
        assert_eq!(config.hostname, "example.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.query.get("token").map(String::as_str), Some("abc"));
        assert_eq!(config.query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn apply_url_keeps_explicit_port() {
        let url = Url::parse("http://localhost:3000").unwrap();
        let mut config = Config::default();
        config.apply_url(&url);
        assert_eq!(config.port, 3000);
    }
}
