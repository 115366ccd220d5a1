//! MQTT Connection Handler
//!
//! Binds an accepted transport connection to a session: reads the CONNECT,
//! runs authentication, attaches the session, then drives the main loop
//! over socket reads, the session's outbound publish channel, the
//! keep-alive deadline and the optional auth revalidation ticker.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::AuthInfo;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnAck, ConnectReturnCode, DecodeError, EncodeError, Packet, Publish};
use crate::session::{events, Attached, Session};
use crate::transport::ConnInfo;

use super::BrokerState;

/// Read deadline stand-in when keep-alive is disabled
const IDLE_FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    /// CONNECT or keep-alive deadline missed
    Timeout,
    /// Protocol violation outside the codec
    Protocol(&'static str),
    /// CONNECT was answered with a non-zero return code
    Refused(ConnectReturnCode),
    /// Per-IP or per-user connection cap
    LimitReached,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "encode error: {}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            ConnectionError::Refused(code) => write!(f, "connect refused: {}", code),
            ConnectionError::LimitReached => write!(f, "connection limit reached"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

/// Connection handler, generic over the transport byte stream
pub(crate) struct Connection<S> {
    stream: S,
    info: ConnInfo,
    state: Arc<BrokerState>,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Username registered against the per-user limit, released on exit
    user_key: Option<String>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, info: ConnInfo, state: Arc<BrokerState>) -> Self {
        Self {
            stream,
            info,
            decoder: Decoder::new().with_max_packet_size(state.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            state,
            user_key: None,
        }
    }

    /// Run the connection to completion
    pub(crate) async fn run(&mut self) -> Result<(), ConnectionError> {
        let ip = self.info.remote_addr.ip().to_string();
        if self.state.ip_limits.connect(&ip).is_err() {
            debug!(remote_addr = %self.info.remote_addr, "per-IP connection limit reached");
            return Err(ConnectionError::LimitReached);
        }

        self.state.metrics.connection_opened();
        debug!(
            remote_addr = %self.info.remote_addr,
            transport = self.info.transport,
            "open connection"
        );

        let result = self.handle().await;

        debug!(remote_addr = %self.info.remote_addr, "close connection");
        self.state.metrics.connection_closed();
        self.state.ip_limits.disconnect(&ip);
        if let Some(username) = self.user_key.take() {
            self.state.user_limits.disconnect(&username);
        }
        let _ = self.stream.shutdown().await;

        result
    }

    async fn handle(&mut self) -> Result<(), ConnectionError> {
        let (session, attached, keep_alive) =
            match timeout(self.state.connect_timeout, self.read_connect()).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!(remote_addr = %self.info.remote_addr, "CONNECT timeout");
                    return Err(ConnectionError::Timeout);
                }
            };

        let epoch = attached.epoch;
        let result = self.run_connected(&session, attached, keep_alive).await;

        session.detach(epoch).await;
        self.server_event("session.disconnected", &session).await;

        result
    }

    /// Read the CONNECT packet, authenticate and attach the session.
    /// Any other first packet is a protocol violation.
    async fn read_connect(&mut self) -> Result<(Arc<Session>, Attached, u16), ConnectionError> {
        let connect = loop {
            match self.decoder.decode(&self.read_buf)? {
                Some((packet, consumed)) => {
                    self.read_buf.advance(consumed);
                    self.state
                        .metrics
                        .message_received(packet.packet_type().name(), consumed);
                    match packet {
                        Packet::Connect(connect) => break *connect,
                        _ => {
                            return Err(ConnectionError::Protocol("first packet was not CONNECT"))
                        }
                    }
                }
                None => {
                    let n = self.stream.read_buf(&mut self.read_buf).await?;
                    if n == 0 {
                        return Err(ConnectionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed before CONNECT",
                        )));
                    }
                }
            }
        };

        if let Err(code) = connect.validate() {
            warn!(remote_addr = %self.info.remote_addr, %code, "invalid CONNECT");
            self.state.metrics.connect_handled("invalid");
            return self.refuse(code).await;
        }

        // Client ids become topic levels in $SYS events, so keep them
        // topic-safe; empty ids get a synthesized one.
        let client_id = if connect.client_id.is_empty() {
            format!(
                "{}-{}",
                self.info.remote_addr,
                self.state.started_at.elapsed().as_nanos()
            )
            .replace('/', ".")
        } else {
            connect.client_id.replace('/', ".")
        };

        let mut auth = AuthInfo {
            remote_addr: self.info.remote_addr,
            transport: self.info.transport,
            server_name: self.info.server_name.clone(),
            client_id: client_id.clone(),
            username: connect.username.clone(),
            password: connect.password.clone(),
            metadata: None,
        };

        if let Err(code) = self.state.authenticator.connect(&mut auth).await {
            debug!(client_id = %client_id, %code, "rejected authentication");
            self.state.metrics.connect_handled("refused");
            return self.refuse(code).await;
        }

        if let Some(username) = &auth.username {
            if self.state.user_limits.connect(username).is_err() {
                debug!(client_id = %client_id, username = %username, "per-user connection limit reached");
                self.state.metrics.connect_handled("limit_reached");
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
            self.user_key = Some(username.clone());
        }

        let session = self.state.sessions.get_or_create(&client_id);
        let attached = match session.attach(auth, &connect).await {
            Ok(attached) => attached,
            Err(code) => {
                debug!(client_id = %client_id, %code, "attach refused");
                self.state.metrics.connect_handled("refused");
                return self.refuse(code).await;
            }
        };

        self.state.metrics.connect_handled("accepted");
        self.write_packet(&Packet::ConnAck(attached.connack.clone()))
            .await?;

        info!(
            client_id = %client_id,
            remote_addr = %self.info.remote_addr,
            transport = self.info.transport,
            "session connected"
        );
        self.server_event("session.connected", &session).await;

        // Replay unacknowledged packets from a resumed session
        for packet in session.pending() {
            self.write_packet(&packet).await?;
        }

        // Retained messages for subscriptions that survived the reconnect
        let filters: Vec<String> = session.subscriptions().into_keys().collect();
        if !filters.is_empty() {
            for pkt in self.state.retained.get(&filters) {
                session.publish_retained(&pkt).await;
            }
        }

        Ok((session, attached, connect.keep_alive))
    }

    /// Send a CONNACK carrying the refusal code, then fail the connection
    async fn refuse<T>(&mut self, code: ConnectReturnCode) -> Result<T, ConnectionError> {
        let connack = ConnAck {
            session_present: false,
            return_code: code,
        };
        self.write_packet(&Packet::ConnAck(connack)).await?;
        Err(ConnectionError::Refused(code))
    }

    /// The post-CONNECT main loop
    async fn run_connected(
        &mut self,
        session: &Arc<Session>,
        attached: Attached,
        keep_alive: u16,
    ) -> Result<(), ConnectionError> {
        let mut publish_rx = attached.publish_rx;

        // Read deadline is 1.5x the keep-alive interval; 0 disables it
        let idle_timeout = if keep_alive > 0 {
            Duration::from_millis(keep_alive as u64 * 1500)
        } else {
            IDLE_FOREVER
        };
        let mut deadline = tokio::time::Instant::now() + idle_timeout;

        let mut revalidate = self.state.authenticator.revalidation_interval().map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => return Ok(()),
                        Ok(_) => {
                            deadline = tokio::time::Instant::now() + idle_timeout;
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                self.state
                                    .metrics
                                    .message_received(packet.packet_type().name(), consumed);
                                if !self.handle_packet(session, packet).await? {
                                    // graceful DISCONNECT; the will is already cleared
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                pkt = publish_rx.recv() => {
                    match pkt {
                        Some(pkt) => self.write_publish(pkt).await?,
                        None => {
                            // A newer CONNECT for this client id took the session over
                            debug!(client_id = %session.client_id(), "connection taken over");
                            return Ok(());
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    info!(client_id = %session.client_id(), "keep-alive timeout");
                    return Err(ConnectionError::Timeout);
                }

                _ = tick(&mut revalidate) => {
                    if let Some(auth) = session.auth_info() {
                        if let Err(code) = self.state.authenticator.revalidate(&auth).await {
                            warn!(client_id = %session.client_id(), %code, "revalidation failed");
                            return Err(ConnectionError::Refused(code));
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one packet to the session. Returns false on a graceful
    /// DISCONNECT.
    async fn handle_packet(
        &mut self,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<bool, ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                return Err(ConnectionError::Protocol("duplicate CONNECT"));
            }
            Packet::Publish(publish) => {
                if let Some(response) = session.handle_publish(publish).await {
                    self.write_packet(&response).await?;
                }
            }
            Packet::PubAck(ack) => session.handle_puback(ack.packet_id),
            Packet::PubRec(rec) => {
                let pubrel = session.handle_pubrec(rec.packet_id);
                self.write_packet(&Packet::PubRel(pubrel)).await?;
            }
            Packet::PubRel(rel) => {
                let pubcomp = session.handle_pubrel(rel.packet_id);
                self.write_packet(&Packet::PubComp(pubcomp)).await?;
            }
            Packet::PubComp(comp) => session.handle_pubcomp(comp.packet_id),
            Packet::Subscribe(subscribe) => {
                let (suback, accepted) = session.handle_subscribe(&subscribe).await;
                self.write_packet(&Packet::SubAck(suback)).await?;
                // Retained replay follows the SUBACK
                if !accepted.is_empty() {
                    for pkt in self.state.retained.get(&accepted) {
                        session.publish_retained(&pkt).await;
                    }
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                let unsuback = session.handle_unsubscribe(&unsubscribe).await;
                self.write_packet(&Packet::UnsubAck(unsuback)).await?;
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect => {
                debug!(client_id = %session.client_id(), "disconnect");
                session.handle_disconnect();
                return Ok(false);
            }
            other => {
                warn!(
                    client_id = %session.client_id(),
                    packet_type = other.packet_type().name(),
                    "unexpected packet"
                );
            }
        }
        Ok(true)
    }

    async fn write_publish(&mut self, pkt: Publish) -> Result<(), ConnectionError> {
        if !pkt.retain && !pkt.dup {
            if let Some(received) = pkt.received {
                if let Ok(latency) = received.elapsed() {
                    self.state.metrics.publish_latency.observe(latency.as_secs_f64());
                }
            }
        }
        self.write_packet(&Packet::Publish(pkt)).await
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.state
            .metrics
            .message_sent(packet.packet_type().name(), self.write_buf.len());
        Ok(())
    }

    /// Publish a `$SYS/server/events/<name>` event into the fan-out
    async fn server_event(&self, name: &str, session: &Session) {
        let metadata = events::EventMetadata {
            remote_addr: Some(self.info.remote_addr.to_string()),
            client_id: Some(session.client_id().to_string()),
            username: session.auth_info().and_then(|a| a.username.clone()),
            topic: None,
        };
        let event = events::event_packet(format!("$SYS/server/events/{}", name), &metadata);
        self.state.sessions.publish(event).await;
    }
}

/// Await the next revalidation tick, or forever when revalidation is off
async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
