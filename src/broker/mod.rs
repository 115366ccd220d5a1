//! MQTT Broker Core
//!
//! Owns the listeners, the session registry, the retained store and the
//! authorization policy, and spawns a connection handler per accepted
//! transport connection.

mod connection;
mod limits;
mod tls;

pub use connection::ConnectionError;
pub use limits::{ConnectionLimits, LimitReached};
pub use tls::{load_tls_config, TlsConfig, TlsError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, DefaultAuthenticator};
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::inspect::AdminServer;
use crate::metrics::Metrics;
use crate::protocol::Publish;
use crate::retained::RetainedStore;
use crate::session::{events, SessionStore};
use crate::transport::{configure_stream, ConnInfo, TransportConfig, WsStream};

use self::connection::Connection;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT over TCP bind address
    pub bind_addr: Option<SocketAddr>,
    /// MQTT over TLS bind address (requires `tls`)
    pub tls_bind_addr: Option<SocketAddr>,
    /// MQTT over WebSocket bind address
    pub ws_bind_addr: Option<SocketAddr>,
    /// MQTT over WebSocket-over-TLS bind address (requires `tls`)
    pub wss_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Metrics and debug HTTP bind address
    pub admin_bind_addr: Option<SocketAddr>,
    /// TLS certificate configuration
    pub tls: Option<TlsConfig>,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// Live connections allowed per remote IP (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Live connections allowed per username (0 = unlimited)
    pub max_connections_per_user: usize,
    /// How long a fresh connection may take to present its CONNECT
    pub connect_timeout: Duration,
    /// Socket options for accepted connections
    pub transport: TransportConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: Some("0.0.0.0:1883".parse().unwrap()),
            tls_bind_addr: None,
            ws_bind_addr: None,
            wss_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            admin_bind_addr: None,
            tls: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_connections_per_ip: 0,
            max_connections_per_user: 0,
            connect_timeout: Duration::from_secs(30),
            transport: TransportConfig::default(),
        }
    }
}

/// State shared by every connection handler
pub(crate) struct BrokerState {
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) retained: Arc<RetainedStore>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) ip_limits: ConnectionLimits,
    pub(crate) user_limits: ConnectionLimits,
    pub(crate) started_at: Instant,
    pub(crate) max_packet_size: usize,
    pub(crate) connect_timeout: Duration,
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    state: Arc<BrokerState>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// A broker with the default policy: allow everything except writes to
    /// `$`-prefixed topics.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(DefaultAuthenticator))
    }

    /// A broker with a custom authorization policy
    pub fn with_authenticator(
        config: BrokerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let metrics = Arc::new(Metrics::new());
        let retained = Arc::new(RetainedStore::with_gauge(
            metrics.retained_messages.clone(),
        ));
        let sessions = SessionStore::new(authenticator.clone(), retained.clone(), metrics.clone());

        let state = Arc::new(BrokerState {
            sessions,
            retained,
            authenticator,
            metrics,
            ip_limits: ConnectionLimits::new(config.max_connections_per_ip),
            user_limits: ConnectionLimits::new(config.max_connections_per_user),
            started_at: Instant::now(),
            max_packet_size: config.max_packet_size,
            connect_timeout: config.connect_timeout,
        });

        Self {
            config,
            state,
            shutdown,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.state.sessions
    }

    pub fn retained(&self) -> &Arc<RetainedStore> {
        &self.state.retained
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.state.metrics
    }

    /// Publish a server-originated message into the routing fabric
    pub async fn publish(&self, mut pkt: Publish) {
        if pkt.received.is_none() {
            pkt.received = Some(SystemTime::now());
        }
        self.state.sessions.publish(pkt).await;
    }

    /// Publish a `$SYS/server/events/<name>` event
    pub async fn publish_event(&self, name: &str, metadata: &events::EventMetadata) {
        let event = events::event_packet(format!("$SYS/server/events/{}", name), metadata);
        self.state.sessions.publish(event).await;
    }

    /// Stop the listeners, the fan-out workers and the sweeper
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Bind all configured listeners and serve until shutdown
    pub async fn run(&self) -> std::io::Result<()> {
        self.state.sessions.start(&self.shutdown);

        let tls_acceptor = match &self.config.tls {
            Some(tls) => Some(
                load_tls_config(tls).map_err(|e| std::io::Error::other(e.to_string()))?,
            ),
            None => None,
        };

        if let Some(addr) = self.config.bind_addr {
            let listener = TcpListener::bind(addr).await?;
            info!("MQTT/TCP listening on {}", addr);
            self.spawn_tcp_listener(listener);
        }

        if let Some(addr) = self.config.tls_bind_addr {
            match &tls_acceptor {
                Some(acceptor) => {
                    let listener = TcpListener::bind(addr).await?;
                    info!("MQTT/TLS listening on {}", addr);
                    self.spawn_tls_listener(listener, acceptor.clone());
                }
                None => warn!("TLS listener configured without certificates, skipping"),
            }
        }

        if let Some(addr) = self.config.ws_bind_addr {
            let listener = TcpListener::bind(addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                addr, self.config.ws_path
            );
            self.spawn_ws_listener(listener);
        }

        if let Some(addr) = self.config.wss_bind_addr {
            match &tls_acceptor {
                Some(acceptor) => {
                    let listener = TcpListener::bind(addr).await?;
                    info!(
                        "MQTT/WSS listening on {} (path: {})",
                        addr, self.config.ws_path
                    );
                    self.spawn_wss_listener(listener, acceptor.clone());
                }
                None => warn!("WSS listener configured without certificates, skipping"),
            }
        }

        if let Some(addr) = self.config.admin_bind_addr {
            let admin = AdminServer::new(
                addr,
                self.state.metrics.clone(),
                self.state.sessions.clone(),
                self.state.retained.clone(),
            );
            info!("admin server listening on http://{}", addr);
            tokio::spawn(async move {
                if let Err(e) = admin.run().await {
                    error!("admin server failed: {}", e);
                }
            });
        }

        // Serve until shutdown is requested
        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    fn spawn_tcp_listener(&self, listener: TcpListener) {
        let state = self.state.clone();
        let transport_config = self.config.transport.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = configure_stream(&stream, &transport_config) {
                                debug!(remote_addr = %addr, "failed to configure socket: {}", e);
                            }
                            spawn_connection(
                                stream,
                                ConnInfo::new(addr, "tcp"),
                                state.clone(),
                                shutdown.subscribe(),
                            );
                        }
                        Err(e) => error!("failed to accept TCP connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_tls_listener(&self, listener: TcpListener, acceptor: TlsAcceptor) {
        let state = self.state.clone();
        let transport_config = self.config.transport.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = configure_stream(&stream, &transport_config) {
                                debug!(remote_addr = %addr, "failed to configure socket: {}", e);
                            }
                            let acceptor = acceptor.clone();
                            let state = state.clone();
                            let shutdown_rx = shutdown.subscribe();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        let server_name = stream
                                            .get_ref()
                                            .1
                                            .server_name()
                                            .map(|name| name.to_string());
                                        let info = ConnInfo::new(addr, "tls")
                                            .with_server_name(server_name);
                                        run_connection(stream, info, state, shutdown_rx).await;
                                    }
                                    Err(e) => {
                                        debug!(remote_addr = %addr, "TLS handshake failed: {}", e)
                                    }
                                }
                            });
                        }
                        Err(e) => error!("failed to accept TLS connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_ws_listener(&self, listener: TcpListener) {
        let state = self.state.clone();
        let transport_config = self.config.transport.clone();
        let ws_path = self.config.ws_path.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = configure_stream(&stream, &transport_config) {
                                debug!(remote_addr = %addr, "failed to configure socket: {}", e);
                            }
                            let state = state.clone();
                            let ws_path = ws_path.clone();
                            let shutdown_rx = shutdown.subscribe();
                            tokio::spawn(async move {
                                match WsStream::accept(stream, &ws_path).await {
                                    Ok((stream, host)) => {
                                        let info = ConnInfo::new(addr, "ws").with_server_name(host);
                                        run_connection(stream, info, state, shutdown_rx).await;
                                    }
                                    Err(e) => {
                                        debug!(remote_addr = %addr, "WebSocket handshake failed: {}", e)
                                    }
                                }
                            });
                        }
                        Err(e) => error!("failed to accept WebSocket connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_wss_listener(&self, listener: TcpListener, acceptor: TlsAcceptor) {
        let state = self.state.clone();
        let transport_config = self.config.transport.clone();
        let ws_path = self.config.ws_path.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = configure_stream(&stream, &transport_config) {
                                debug!(remote_addr = %addr, "failed to configure socket: {}", e);
                            }
                            let acceptor = acceptor.clone();
                            let state = state.clone();
                            let ws_path = ws_path.clone();
                            let shutdown_rx = shutdown.subscribe();
                            tokio::spawn(async move {
                                let stream = match acceptor.accept(stream).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        debug!(remote_addr = %addr, "TLS handshake failed: {}", e);
                                        return;
                                    }
                                };
                                let sni = stream
                                    .get_ref()
                                    .1
                                    .server_name()
                                    .map(|name| name.to_string());
                                match WsStream::accept(stream, &ws_path).await {
                                    Ok((stream, host)) => {
                                        let info = ConnInfo::new(addr, "wss")
                                            .with_server_name(sni.or(host));
                                        run_connection(stream, info, state, shutdown_rx).await;
                                    }
                                    Err(e) => {
                                        debug!(remote_addr = %addr, "WebSocket handshake failed: {}", e)
                                    }
                                }
                            });
                        }
                        Err(e) => error!("failed to accept WSS connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

/// Spawn a connection handler task tied to the shutdown channel
fn spawn_connection<S>(
    stream: S,
    info: ConnInfo,
    state: Arc<BrokerState>,
    shutdown_rx: broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    tokio::spawn(run_connection(stream, info, state, shutdown_rx));
}

async fn run_connection<S>(
    stream: S,
    info: ConnInfo,
    state: Arc<BrokerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let remote_addr = info.remote_addr;
    let mut conn = Connection::new(stream, info, state);
    tokio::select! {
        result = conn.run() => {
            if let Err(e) = result {
                debug!(remote_addr = %remote_addr, "connection ended: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            debug!(remote_addr = %remote_addr, "connection cancelled by shutdown");
        }
    }
}
