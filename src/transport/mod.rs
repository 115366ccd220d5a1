//! Transport Layer
//!
//! The broker accepts MQTT over plain TCP, TLS, WebSocket and
//! WebSocket-over-TLS. Each transport presents the same byte stream
//! (`AsyncRead + AsyncWrite`) to the codec; everything transport-specific
//! is captured in [`ConnInfo`] at accept time.

mod websocket;

pub use websocket::WsStream;

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Transport metadata for an accepted connection
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Remote peer address
    pub remote_addr: SocketAddr,
    /// Transport tag: "tcp", "tls", "ws" or "wss"
    pub transport: &'static str,
    /// TLS server name indication, or the WebSocket Host header
    pub server_name: Option<String>,
}

impl ConnInfo {
    pub fn new(remote_addr: SocketAddr, transport: &'static str) -> Self {
        Self {
            remote_addr,
            transport,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, server_name: Option<String>) -> Self {
        self.server_name = server_name;
        self
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { tcp_nodelay: true }
    }
}

/// Configure an accepted TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)
}
