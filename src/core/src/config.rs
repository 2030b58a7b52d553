use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Primary bind address (default: 127.0.0.1:9810).
    pub bind: SocketAddr,
    /// Interval between server→client pings.
    pub heartbeat_interval: Duration,
    /// Close the connection after this duration without any message.
    pub idle_timeout: Duration,
    /// Circuit breaker sliding window.
    pub breaker_window: Duration,
    /// Invocations admitted per engram within the window.
    pub breaker_max_calls: usize,
    /// Messages kept per engram by the startup retention prune.
    pub message_retention: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9810),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(120),
            breaker_window: Duration::from_secs(10),
            breaker_max_calls: 3,
            message_retention: 500,
        }
    }
}
