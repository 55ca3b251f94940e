//! Builder for Socket.IO client sockets.
//!
//! The path component of the URL handed to [`of`] is the *namespace*, not
//! the request path: `io::of("http://localhost/chat")` connects to
//! `http://localhost/socket.io/` and joins the `/chat` namespace. Use
//! [`IO::path`] for a non-default request path.
//!
//! Sockets for the same host and path share one [`Manager`] (and therefore
//! one connection) unless multiplexing is disabled; the shared managers
//! live in a process-wide registry keyed by `host[:port]<path>`.

use std::sync::OnceLock;

use dashmap::DashMap;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

use crate::config::ClientConfig;
use crate::errors::Error;
use crate::manager::Manager;
use crate::packet::DEFAULT_NAMESPACE;
use crate::socket::Socket;
use engineio_client::TransportKind;

static MANAGERS: OnceLock<DashMap<String, Manager>> = OnceLock::new();

fn managers() -> &'static DashMap<String, Manager> {
    MANAGERS.get_or_init(DashMap::new)
}

/// Called by a manager when it closes. A closed manager can't be re-opened,
/// and a multiplexed socket must never end up bound to one.
pub(crate) fn remove_manager(connection_path: &str) {
    if let Some(managers) = MANAGERS.get() {
        managers.remove(connection_path);
    }
}

/// `host[:port]<path>`; the registry key managers are shared under. The
/// port appears only when the URL names one explicitly.
pub(crate) fn connection_path(url: &Url, path: &str) -> String {
    let mut out = url.host_str().unwrap_or_default().to_owned();
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(path);
    out
}

/// Start building a socket for `url`.
pub fn of(url: &str) -> Result<IO, Error> {
    of_with(url, &ClientConfig::default())
}

/// Start building a socket for `url` from an existing configuration. The
/// configuration is cloned, so the caller's copy stays untouched.
pub fn of_with(url: &str, config: &ClientConfig) -> Result<IO, Error> {
    let url = Url::parse(url).map_err(|e| Error::InvalidUrl(url.to_owned(), e))?;
    Ok(IO {
        url,
        config: config.clone(),
    })
}

/// Fluent socket configurator; terminal operation is [`socket`](IO::socket).
pub struct IO {
    url: Url,
    config: ClientConfig,
}

impl IO {
    /// Request path for the connection, `/socket.io/` by default. Leading
    /// and trailing slashes are added when missing.
    pub fn path(mut self, path: &str) -> Self {
        let mut path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        if !path.ends_with('/') {
            path.push('/');
        }
        self.config.engine.path = path;
        self
    }

    /// Add a query entry to every request. Keeps an existing entry with the
    /// same key.
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.config
            .engine
            .query
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
        self
    }

    /// Add a header to every request. Keeps an existing entry with the same
    /// key.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.config
            .engine
            .headers
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
        self
    }

    /// Give this socket its own connection instead of sharing one with
    /// other sockets on the same host and path.
    pub fn no_multiplex(mut self) -> Self {
        self.config.multiplex = false;
        self
    }

    /// Disable automatic reconnection after abrupt connection loss.
    pub fn no_reconnect(mut self) -> Self {
        self.config.reconnect = false;
        self
    }

    pub fn polling_only(mut self) -> Self {
        self.config.engine.transports = vec![TransportKind::Polling];
        self
    }

    pub fn websocket_only(mut self) -> Self {
        self.config.engine.transports = vec![TransportKind::Websocket];
        self
    }

    /// Replace the HTTP client used for polling requests, e.g. to supply
    /// TLS credentials or timeouts.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.config.engine.http = client;
        self
    }

    /// Protocol configuration for websocket connections.
    pub fn websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.config.engine.websocket = Some(config);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create the socket. With multiplexing on, sockets for the same host
    /// and path share one manager; a manager is created privately when the
    /// namespace is already taken or multiplexing is off.
    pub fn socket(&self) -> Socket {
        let connection_path = connection_path(&self.url, &self.config.engine.path);
        let namespace = match self.url.path() {
            "" => DEFAULT_NAMESPACE,
            path => path,
        }
        .to_owned();

        let existing = managers()
            .get(&connection_path)
            .map(|entry| entry.value().clone());
        let namespace_taken = existing
            .as_ref()
            .map(|manager| manager.has_socket(&namespace))
            .unwrap_or(false);

        let manager = if namespace_taken || !self.config.multiplex {
            Manager::new(&self.url, self.config.clone())
        } else if let Some(manager) = existing {
            manager
        } else {
            managers()
                .entry(connection_path)
                .or_insert_with(|| Manager::new(&self.url, self.config.clone()))
                .value()
                .clone()
        };
        manager.create_socket(&namespace)
    }
}
