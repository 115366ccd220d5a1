//! Authentication and authorization
//!
//! Defines the pluggable [`Authenticator`] seam consulted on CONNECT, on
//! every SUBSCRIBE (which may rewrite the requested filter), on every
//! PUBLISH received from a client (ingress) and on every delivery attempt
//! toward a client (egress). Custom authenticators attach their own state
//! to [`AuthInfo::metadata`] as an opaque handle.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{ConnectReturnCode, QoS};
use crate::topic;


/// Identity of a connected client, attached to its session after CONNECT
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// Remote address of the transport connection
    pub remote_addr: SocketAddr,
    /// Transport tag: "tcp", "tls", "ws" or "wss"
    pub transport: &'static str,
    /// TLS server name indication or WebSocket host, when present
    pub server_name: Option<String>,
    /// Client identifier (post server-side synthesis)
    pub client_id: String,
    /// Username from CONNECT
    pub username: Option<String>,
    /// Password bytes from CONNECT
    pub password: Option<Bytes>,
    /// Opaque authenticator state (typically an ACL object)
    pub metadata: Option<Arc<dyn Any + Send + Sync>>,
}

impl AuthInfo {
    pub fn username_str(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }
}

/// A subscription refused by the authenticator; surfaces as SUBACK 0x80
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeRejected;

impl std::fmt::Display for SubscribeRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("subscription rejected")
    }
}

impl std::error::Error for SubscribeRejected {}

/// The authorization policy of the broker.
///
/// The default implementations allow everything except writes to
/// `$`-prefixed topics, which only the server may publish to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate credentials on CONNECT. Implementations may populate
    /// `info.metadata` with their own ACL state. An error is sent to the
    /// client as the CONNACK return code.
    async fn connect(&self, _info: &mut AuthInfo) -> Result<(), ConnectReturnCode> {
        Ok(())
    }

    /// Inspect and possibly rewrite a requested subscription. A client
    /// requesting `#` may for example be narrowed to `<username>/#`.
    async fn subscribe(
        &self,
        _info: &AuthInfo,
        filter: &str,
        qos: QoS,
    ) -> Result<(String, QoS), SubscribeRejected> {
        Ok((filter.to_string(), qos))
    }

    /// Whether a delivery on the topic may leave the server toward this
    /// session (egress)
    async fn can_read(&self, _info: &AuthInfo, _topic_parts: &[&str]) -> bool {
        true
    }

    /// Whether a publish on the topic may be accepted from this session
    /// (ingress, also checked for the will topic at CONNECT time)
    async fn can_write(&self, _info: &AuthInfo, topic_parts: &[&str]) -> bool {
        !topic_parts
            .first()
            .is_some_and(|part| part.starts_with(topic::INTERNAL_PREFIX))
    }

    /// Re-check the credentials of a long-lived connection. Only called when
    /// [`Authenticator::revalidation_interval`] returns an interval.
    async fn revalidate(&self, _info: &AuthInfo) -> Result<(), ConnectReturnCode> {
        Ok(())
    }

    /// How often to re-run [`Authenticator::revalidate`], if at all
    fn revalidation_interval(&self) -> Option<Duration> {
        None
    }
}

/// The policy used when no authenticator is configured: allow everything
/// except writes to `$`-prefixed topics.
#[derive(Debug, Default)]
pub struct DefaultAuthenticator;

#[async_trait]
impl Authenticator for DefaultAuthenticator {}
