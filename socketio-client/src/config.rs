//! Socket.IO client configuration.

use std::time::Duration;

use engineio_client::Config;

/// Configures a Socket.IO client on top of the Engine.IO
/// [`Config`](engineio_client::Config).
///
/// Plain value; the builder clones it before handing it to a manager so
/// later mutations do not leak into an active session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Engine.IO connection settings. The request path defaults to
    /// `/socket.io/` here.
    pub engine: Config,
    /// Share one connection between sockets on different namespaces.
    pub multiplex: bool,
    /// Reconnect automatically after an abrupt close.
    pub reconnect: bool,
    /// Give up after this many consecutive failed attempts.
    pub max_reconnect_attempts: u32,
    /// Base delay of the exponential backoff. Floored to 100ms at use.
    pub reconnect_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_reconnect_delay: Duration,
    /// Jitter as a fraction of the base delay. Values outside [0, 1] fall
    /// back to 0.5 at use.
    pub randomization_factor: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut engine = Config::default();
        engine.path = "/socket.io/".to_owned();
        Self {
            engine,
            multiplex: true,
            reconnect: true,
            max_reconnect_attempts: u32::MAX,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_millis(10_000),
            randomization_factor: 0.5,
        }
    }
}
