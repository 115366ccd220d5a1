//! TetherMQ - Multi-transport MQTT v3.1.1 broker
//!
//! Accepts MQTT over TCP, TLS, WebSocket and WebSocket-over-TLS, keeps
//! per-client sessions with QoS 0/1/2 delivery guarantees, routes published
//! messages to matching subscribers, and enforces a pluggable authorization
//! policy on every publish, subscribe and delivery.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod inspect;
pub mod metrics;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod transport;

pub use auth::{AuthInfo, Authenticator, DefaultAuthenticator};
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use inspect::AdminServer;
pub use metrics::Metrics;
pub use protocol::{ConnectReturnCode, Packet, QoS};
pub use retained::RetainedStore;
pub use session::{Session, SessionStore};
