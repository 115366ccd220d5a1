//! MQTT sessions
//!
//! A [`Session`] carries the per-client state machine: subscriptions,
//! QoS 1/2 pending lists, the will message and the bounded outbound publish
//! channel the connection handler drains. Sessions survive reconnects when
//! the client asks for a persistent session, and a second CONNECT with the
//! same client id takes the session over from the previous connection.

pub mod events;
mod pending;
mod store;
mod subscriptions;

pub use pending::PendingList;
pub use store::SessionStore;
pub use subscriptions::SubscriptionList;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{AuthInfo, Authenticator};
use crate::metrics::Metrics;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubComp, PubRel, Publish, QoS, SubAck,
    SubackReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic;

use self::events::EventMetadata;

/// Capacity of each session's outbound publish channel
pub const PUBLISH_BUFFER_SIZE: usize = 64;

/// Pending lists larger than this are considered stuck behind a dead or
/// unresponsive peer and are cleared wholesale.
const PENDING_SOFT_CAP: usize = 2 * PUBLISH_BUFFER_SIZE;

/// How long a detached session is kept before the sweeper drops it
const SESSION_EXPIRY: Duration = Duration::from_secs(3600);

/// Per-session message counters
#[derive(Default)]
pub struct SessionStats {
    published: AtomicU64,
    delivered: AtomicU64,
}

impl SessionStats {
    /// Messages this client published into the broker
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages enqueued toward this client
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// The result of attaching a connection to a session
pub struct Attached {
    /// CONNACK to send, with the session-present flag filled in
    pub connack: ConnAck,
    /// Receiving end of the session's fresh outbound publish channel
    pub publish_rx: mpsc::Receiver<Publish>,
    /// Attach epoch; [`Session::detach`] ignores stale epochs after takeover
    pub epoch: u64,
}

struct SessionInner {
    auth: Option<Arc<AuthInfo>>,
    clean_start: bool,
    will: Option<Publish>,
    /// Last assigned packet identifier; wraps 65535 -> 1, 0 is reserved
    last_packet_id: u16,
    /// Sender half of the outbound channel; present iff a handler is attached
    publish_tx: Option<mpsc::Sender<Publish>>,
    epoch: u64,
    expires_at: Option<Instant>,
}

/// Per-client session state
pub struct Session {
    client_id: String,
    created_at: SystemTime,
    stats: SessionStats,
    /// The session store's fan-out entry point
    router: mpsc::Sender<Publish>,
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<Metrics>,
    subscriptions: SubscriptionList,
    pending_in: PendingList,
    pending_out: PendingList,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        client_id: &str,
        router: mpsc::Sender<Publish>,
        authenticator: Arc<dyn Authenticator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            created_at: SystemTime::now(),
            stats: SessionStats::default(),
            router,
            authenticator,
            subscriptions: SubscriptionList::with_gauge(metrics.subscriptions.clone()),
            pending_in: PendingList::with_gauge(metrics.pending_messages.clone()),
            pending_out: PendingList::with_gauge(metrics.pending_messages.clone()),
            metrics,
            inner: Mutex::new(SessionInner {
                auth: None,
                clean_start: true,
                will: None,
                last_packet_id: 0,
                publish_tx: None,
                epoch: 0,
                expires_at: None,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn auth_info(&self) -> Option<Arc<AuthInfo>> {
        self.inner.lock().auth.clone()
    }

    /// Filter-to-QoS view of the session's subscriptions
    pub fn subscriptions(&self) -> std::collections::HashMap<String, QoS> {
        self.subscriptions.subscriptions()
    }

    /// Whether a connection handler currently owns this session
    pub fn is_attached(&self) -> bool {
        self.inner.lock().publish_tx.is_some()
    }

    /// Whether the detached-session TTL has passed
    pub(crate) fn expired(&self) -> bool {
        self.inner
            .lock()
            .expires_at
            .is_some_and(|at| at <= Instant::now())
    }

    /// Push the expiry of a detached session forward. The store calls this
    /// under the registry lock so the sweeper cannot drop a session a
    /// handler is about to attach.
    pub(crate) fn touch_expiry(&self) {
        let mut inner = self.inner.lock();
        if inner.expires_at.is_some() {
            inner.expires_at = Some(Instant::now() + SESSION_EXPIRY);
        }
    }

    // ---- connection lifecycle ------------------------------------------------

    /// Bind a new connection to this session.
    ///
    /// Kicks a previous live connection by closing its outbound channel,
    /// resets all state when the client asked for a clean session, and
    /// installs the new will if its topic passes the write ACL.
    pub async fn attach(
        &self,
        auth: AuthInfo,
        connect: &Connect,
    ) -> Result<Attached, ConnectReturnCode> {
        // Authorize the will topic before taking the state lock
        let will = match &connect.will {
            Some(w) if topic::validate_topic(&w.topic).is_ok() => {
                let parts = topic::split(&w.topic);
                if self.authenticator.can_write(&auth, &parts).await {
                    Some(Publish {
                        retain: w.retain,
                        qos: w.qos,
                        topic: w.topic.clone(),
                        payload: w.payload.clone(),
                        ..Default::default()
                    })
                } else {
                    debug!(client_id = %self.client_id, topic = %w.topic, "will refused");
                    None
                }
            }
            Some(_) => None,
            None => None,
        };
        let will_topic = will.as_ref().map(|w| w.topic.clone());

        let auth = Arc::new(auth);
        let (tx, rx) = mpsc::channel(PUBLISH_BUFFER_SIZE);

        let (kicked_will, session_present, epoch) = {
            let mut inner = self.inner.lock();

            if let Some(prev) = &inner.auth {
                if prev.username != auth.username {
                    return Err(ConnectReturnCode::IdentifierRejected);
                }
            }

            // A live predecessor loses its connection; dropping its sender
            // ends the old handler's receive loop.
            let kicked_will = if inner.publish_tx.take().is_some() {
                debug!(client_id = %self.client_id, "kicking old connection");
                inner.will.take()
            } else {
                None
            };

            let mut session_present = false;
            if inner.auth.is_some() {
                if connect.clean_start {
                    debug!(client_id = %self.client_id, "clean old session");
                    self.clear(&mut inner);
                } else {
                    session_present = true;
                }
            }

            inner.auth = Some(auth);
            inner.clean_start = connect.clean_start;
            inner.will = will;
            inner.expires_at = None;
            inner.publish_tx = Some(tx);
            inner.epoch += 1;

            (kicked_will, session_present, inner.epoch)
        };

        if let Some(will) = kicked_will {
            self.deliver_will(will).await;
        }

        if let Some(topic) = will_topic {
            self.publish_event("session.set_will", Some(topic)).await;
        }

        Ok(Attached {
            connack: ConnAck {
                session_present,
                return_code: ConnectReturnCode::Accepted,
            },
            publish_rx: rx,
            epoch,
        })
    }

    /// Release the session when a connection ends.
    ///
    /// Delivers the will (unless a DISCONNECT cleared it), closes the
    /// outbound channel and starts the expiry clock; clean sessions expire
    /// immediately. A stale epoch, left over after a takeover, is a no-op.
    pub async fn detach(&self, epoch: u64) {
        let will = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.publish_tx = None;
            let will = inner.will.take();
            if inner.clean_start {
                self.clear(&mut inner);
                inner.expires_at = Some(Instant::now());
            } else {
                inner.expires_at = Some(Instant::now() + SESSION_EXPIRY);
            }
            will
        };
        if let Some(will) = will {
            self.deliver_will(will).await;
        }
    }

    fn clear(&self, inner: &mut SessionInner) {
        self.subscriptions.clear();
        self.pending_in.clear();
        self.pending_out.clear();
        inner.auth = None;
        inner.will = None;
        inner.last_packet_id = 0;
    }

    async fn deliver_will(&self, mut will: Publish) {
        debug!(client_id = %self.client_id, topic = %will.topic, "delivering will");
        will.received = Some(SystemTime::now());
        let _ = self.router.send(will).await;
    }

    // ---- egress --------------------------------------------------------------

    /// Attempt to enqueue an outbound copy of the packet.
    ///
    /// The session must be subscribed to the topic and pass the read ACL.
    /// The effective QoS is the minimum of the publish QoS and the maximum
    /// subscribed QoS; forwarded copies clear the retain flag.
    pub async fn publish(&self, pkt: &Publish, topic_parts: &[&str]) {
        self.forward(pkt, topic_parts, false).await;
    }

    /// Replay a retained message to this session; keeps retain=true
    pub async fn publish_retained(&self, pkt: &Publish) {
        let parts = topic::split(&pkt.topic);
        self.forward(pkt, &parts, pkt.retain).await;
    }

    async fn forward(&self, pkt: &Publish, topic_parts: &[&str], retain: bool) {
        let Some(sub_qos) = self.subscriptions.matched_qos(topic_parts) else {
            return;
        };
        let Some(auth) = self.auth_info() else {
            return;
        };
        if !self.authenticator.can_read(&auth, topic_parts).await {
            debug!(client_id = %self.client_id, topic = %pkt.topic, "dropping unauthorized delivery");
            return;
        }

        let mut forward = Publish {
            dup: false,
            qos: sub_qos.min(pkt.qos),
            retain,
            topic: pkt.topic.clone(),
            packet_id: None,
            payload: pkt.payload.clone(),
            received: pkt.received,
        };

        let tx = {
            let mut inner = self.inner.lock();
            if forward.qos != QoS::AtMostOnce {
                let id = self.next_packet_id(&mut inner);
                forward.packet_id = Some(id);
                self.pending_out.add(id, Packet::Publish(forward.clone()));
                if self.pending_out.len() > PENDING_SOFT_CAP {
                    warn!(client_id = %self.client_id, "outbound pending list overflow, clearing");
                    self.pending_out.clear();
                }
            }
            inner.publish_tx.clone()
        };

        let Some(tx) = tx else {
            return;
        };
        match tx.try_send(forward) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(pkt)) => {
                warn!(client_id = %self.client_id, topic = %pkt.topic, "dropping message, buffer full");
                self.metrics.message_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// The next free packet identifier; in-flight identifiers are skipped so
    /// none is reused before its handshake completes.
    fn next_packet_id(&self, inner: &mut SessionInner) -> u16 {
        loop {
            inner.last_packet_id = match inner.last_packet_id {
                u16::MAX => 1,
                n => n + 1,
            };
            if !self.pending_out.contains(inner.last_packet_id) {
                return inner.last_packet_id;
            }
        }
    }

    /// Pending packets to replay on reconnect; PUBLISH copies are marked as
    /// duplicates.
    pub fn pending(&self) -> Vec<Packet> {
        self.pending_out
            .packets()
            .into_iter()
            .map(|packet| match packet {
                Packet::Publish(mut publish) => {
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                other => other,
            })
            .collect()
    }

    // ---- ingress -------------------------------------------------------------

    /// Handle a PUBLISH received from this client.
    ///
    /// Returns the ack to send back (none for QoS 0). A duplicate QoS 2
    /// publish is acknowledged again but not redelivered; an unauthorized
    /// publish is dropped silently apart from a `$SYS` event.
    pub async fn handle_publish(&self, mut pkt: Publish) -> Option<Packet> {
        pkt.received = Some(SystemTime::now());
        let response = pkt.response();

        if pkt.qos == QoS::ExactlyOnce {
            let id = pkt.packet_id.unwrap_or_default();
            if !self.pending_in.add(id, Packet::Publish(pkt.clone())) {
                debug!(client_id = %self.client_id, packet_id = id, "suppressing duplicate publish");
                return response;
            }
            if self.pending_in.len() > PENDING_SOFT_CAP {
                warn!(client_id = %self.client_id, "inbound pending list overflow, clearing");
                self.pending_in.clear();
            }
        }

        let parts = topic::split(&pkt.topic);
        let allowed = match self.auth_info() {
            Some(auth) => self.authenticator.can_write(&auth, &parts).await,
            None => false,
        };

        if allowed {
            self.stats.published.fetch_add(1, Ordering::Relaxed);
            pkt.dup = false;
            let _ = self.router.send(pkt).await;
        } else {
            debug!(client_id = %self.client_id, topic = %pkt.topic, "dropping unauthorized publish");
            self.publish_event("session.publish.refused", Some(pkt.topic.clone()))
                .await;
        }

        response
    }

    /// PUBACK completes an outbound QoS 1 flow
    pub fn handle_puback(&self, packet_id: u16) {
        self.pending_out.remove(packet_id);
    }

    /// PUBREC moves an outbound QoS 2 flow to its PUBREL stage
    pub fn handle_pubrec(&self, packet_id: u16) -> PubRel {
        let response = PubRel { packet_id };
        self.pending_out.add(packet_id, Packet::PubRel(response));
        response
    }

    /// PUBREL releases an inbound QoS 2 flow
    pub fn handle_pubrel(&self, packet_id: u16) -> PubComp {
        self.pending_in.remove(packet_id);
        PubComp { packet_id }
    }

    /// PUBCOMP completes an outbound QoS 2 flow
    pub fn handle_pubcomp(&self, packet_id: u16) {
        self.pending_out.remove(packet_id);
    }

    /// Handle SUBSCRIBE: run each filter through the authenticator (which
    /// may rewrite it), record accepted subscriptions and build the SUBACK.
    /// Returns the accepted filters so the caller can replay retained
    /// messages after sending the SUBACK.
    pub async fn handle_subscribe(&self, pkt: &Subscribe) -> (SubAck, Vec<String>) {
        let mut response = pkt.response();
        let mut accepted_filters = Vec::new();

        for (i, request) in pkt.filters.iter().enumerate() {
            let Some(auth) = self.auth_info() else {
                continue;
            };
            match self
                .authenticator
                .subscribe(&auth, &request.filter, request.qos)
                .await
            {
                Ok((accepted, qos)) => {
                    if self.subscriptions.add(&accepted, qos) {
                        if accepted != request.filter {
                            debug!(
                                client_id = %self.client_id,
                                topic = %accepted,
                                topic_original = %request.filter,
                                "subscribe"
                            );
                        } else {
                            debug!(client_id = %self.client_id, topic = %accepted, "subscribe");
                        }
                    }
                    // The client sees the accepted QoS, never the rewrite
                    response.return_codes[i] = SubackReturnCode::Granted(qos);
                    self.publish_event("session.subscribed", Some(accepted.clone()))
                        .await;
                    accepted_filters.push(accepted);
                }
                Err(_) => {
                    self.publish_event(
                        "session.subscribe_rejected",
                        Some(request.filter.clone()),
                    )
                    .await;
                }
            }
        }

        (response, accepted_filters)
    }

    /// Handle UNSUBSCRIBE: filters are run through the same rewrite as
    /// SUBSCRIBE so clients remove what they actually subscribed to.
    pub async fn handle_unsubscribe(&self, pkt: &Unsubscribe) -> UnsubAck {
        for filter in &pkt.filters {
            let Some(auth) = self.auth_info() else {
                continue;
            };
            let accepted = match self.authenticator.subscribe(&auth, filter, QoS::AtMostOnce).await
            {
                Ok((accepted, _)) => accepted,
                Err(_) => continue,
            };
            if self.subscriptions.remove(&accepted) {
                debug!(client_id = %self.client_id, topic = %accepted, "unsubscribe");
                self.publish_event("session.unsubscribed", Some(accepted)).await;
            }
        }
        pkt.response()
    }

    /// DISCONNECT clears the will; the connection closes right after
    pub fn handle_disconnect(&self) {
        self.inner.lock().will = None;
    }

    // ---- events --------------------------------------------------------------

    /// Publish a `$SYS/session/<client_id>/<name>` event into the fan-out
    pub async fn publish_event(&self, name: &str, topic: Option<String>) {
        let metadata = {
            let inner = self.inner.lock();
            let auth = inner.auth.as_deref();
            EventMetadata {
                remote_addr: auth.map(|a| a.remote_addr.to_string()),
                client_id: Some(self.client_id.clone()),
                username: auth.and_then(|a| a.username.clone()),
                topic,
            }
        };
        let event = events::event_packet(
            format!("$SYS/session/{}/{}", self.client_id, name),
            &metadata,
        );
        // Events are best-effort; never stall the session on a full fan-out
        let _ = self.router.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::auth::DefaultAuthenticator;
    use crate::protocol::{FilterRequest, PubRec};

    fn new_session() -> (Arc<Session>, mpsc::Receiver<Publish>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        let session = Arc::new(Session::new(
            "test-client",
            router_tx,
            Arc::new(DefaultAuthenticator),
            Arc::new(Metrics::new()),
        ));
        (session, router_rx)
    }

    fn auth_info(username: Option<&str>) -> AuthInfo {
        AuthInfo {
            remote_addr: "127.0.0.1:12345".parse().unwrap(),
            transport: "tcp",
            server_name: None,
            client_id: "test-client".to_string(),
            username: username.map(|u| u.to_string()),
            password: None,
            metadata: None,
        }
    }

    fn connect(clean_start: bool) -> Connect {
        Connect {
            client_id: "test-client".to_string(),
            clean_start,
            ..Default::default()
        }
    }

    fn publish(topic: &str, qos: QoS, packet_id: Option<u16>) -> Publish {
        Publish {
            qos,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::from_static(b"data"),
            ..Default::default()
        }
    }

    async fn subscribe(session: &Session, filter: &str, qos: QoS) {
        let (suback, _) = session
            .handle_subscribe(&Subscribe {
                packet_id: 1,
                filters: vec![FilterRequest {
                    filter: filter.to_string(),
                    qos,
                }],
            })
            .await;
        assert_eq!(suback.return_codes, vec![SubackReturnCode::Granted(qos)]);
    }

    #[tokio::test]
    async fn test_session_present_across_reconnects() {
        let (session, _router_rx) = new_session();

        let attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        assert!(!attached.connack.session_present);
        session.detach(attached.epoch).await;

        let attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        assert!(attached.connack.session_present);
        session.detach(attached.epoch).await;

        let attached = session.attach(auth_info(None), &connect(true)).await.unwrap();
        assert!(!attached.connack.session_present);
    }

    #[tokio::test]
    async fn test_attach_rejects_username_change() {
        let (session, _router_rx) = new_session();

        let attached = session
            .attach(auth_info(Some("alice")), &connect(false))
            .await
            .unwrap();
        session.detach(attached.epoch).await;

        let result = session.attach(auth_info(Some("eve")), &connect(false)).await;
        assert!(matches!(result, Err(ConnectReturnCode::IdentifierRejected)));
    }

    #[tokio::test]
    async fn test_takeover_closes_old_channel() {
        let (session, _router_rx) = new_session();

        let mut old = session.attach(auth_info(None), &connect(false)).await.unwrap();
        let _new = session.attach(auth_info(None), &connect(false)).await.unwrap();

        // The old handler's channel ends; a stale detach is a no-op
        assert_eq!(old.publish_rx.recv().await, None);
        session.detach(old.epoch).await;
        assert!(session.is_attached());
    }

    #[tokio::test]
    async fn test_publish_assigns_fresh_packet_ids() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "foo/#", QoS::ExactlyOnce).await;

        let pkt = publish("foo/bar", QoS::AtLeastOnce, None);
        let parts = topic::split(&pkt.topic);
        session.publish(&pkt, &parts).await;
        session.publish(&pkt, &parts).await;

        let first = attached.publish_rx.recv().await.unwrap();
        let second = attached.publish_rx.recv().await.unwrap();
        assert_eq!(first.packet_id, Some(1));
        assert_eq!(second.packet_id, Some(2));
        assert_eq!(first.qos, QoS::AtLeastOnce);
        assert!(!first.retain);

        // Both stay pending until acknowledged
        assert_eq!(session.pending().len(), 2);
        session.handle_puback(1);
        session.handle_puback(2);
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_publish_ignores_unmatched_topics() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "foo/#", QoS::AtMostOnce).await;

        let pkt = publish("bar/baz", QoS::AtMostOnce, None);
        let parts = topic::split(&pkt.topic);
        session.publish(&pkt, &parts).await;

        assert!(attached.publish_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outbound_qos2_flow() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "#", QoS::ExactlyOnce).await;

        let pkt = publish("topic", QoS::ExactlyOnce, None);
        let parts = topic::split(&pkt.topic);
        session.publish(&pkt, &parts).await;

        let sent = attached.publish_rx.recv().await.unwrap();
        let id = sent.packet_id.unwrap();

        // PUBREC swaps the pending PUBLISH for a PUBREL
        let pubrel = session.handle_pubrec(id);
        assert_eq!(pubrel.packet_id, id);
        assert_eq!(session.pending(), vec![Packet::PubRel(pubrel)]);

        session.handle_pubcomp(id);
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_pending_replay_marks_duplicates() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "#", QoS::AtLeastOnce).await;

        let pkt = publish("topic", QoS::AtLeastOnce, None);
        let parts = topic::split(&pkt.topic);
        session.publish(&pkt, &parts).await;
        let _ = attached.publish_rx.recv().await;

        match &session.pending()[0] {
            Packet::Publish(replay) => {
                assert!(replay.dup);
                assert_eq!(replay.packet_id, Some(1));
            }
            other => panic!("expected pending PUBLISH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_qos2_duplicate_suppression() {
        let (session, mut router_rx) = new_session();
        let _attached = session.attach(auth_info(None), &connect(false)).await.unwrap();

        let pkt = publish("x", QoS::ExactlyOnce, Some(7));
        let response = session.handle_publish(pkt.clone()).await;
        assert_eq!(response, Some(Packet::PubRec(PubRec { packet_id: 7 })));

        // The duplicate is acknowledged again but not routed again
        let response = session.handle_publish(pkt).await;
        assert_eq!(response, Some(Packet::PubRec(PubRec { packet_id: 7 })));

        assert_eq!(router_rx.recv().await.unwrap().topic, "x");
        assert!(router_rx.try_recv().is_err());

        // PUBREL releases the flow
        let pubcomp = session.handle_pubrel(7);
        assert_eq!(pubcomp.packet_id, 7);
        let response = session
            .handle_publish(publish("x", QoS::ExactlyOnce, Some(7)))
            .await;
        assert_eq!(response, Some(Packet::PubRec(PubRec { packet_id: 7 })));
        assert!(router_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unauthorized_publish_dropped() {
        let (session, mut router_rx) = new_session();
        let _attached = session.attach(auth_info(None), &connect(false)).await.unwrap();

        // The default policy refuses client writes to $-topics
        let response = session
            .handle_publish(publish("$SYS/forged", QoS::AtMostOnce, None))
            .await;
        assert_eq!(response, None);

        // Only the refusal event reaches the fan-out
        let routed = router_rx.recv().await.unwrap();
        assert_eq!(
            routed.topic,
            "$SYS/session/test-client/session.publish.refused"
        );
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clean_start_purity() {
        let (session, _router_rx) = new_session();
        let attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "a/b", QoS::AtLeastOnce).await;

        let pkt = publish("a/b", QoS::AtLeastOnce, None);
        let parts = topic::split(&pkt.topic);
        session.publish(&pkt, &parts).await;
        assert_eq!(session.pending().len(), 1);
        session.detach(attached.epoch).await;

        let attached = session.attach(auth_info(None), &connect(true)).await.unwrap();
        assert!(!attached.connack.session_present);
        assert!(session.subscriptions().is_empty());
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_detach_delivers_will() {
        let (session, mut router_rx) = new_session();

        let mut connect = connect(false);
        connect.will = Some(crate::protocol::Will {
            topic: "wills/test".to_string(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        let attached = session.attach(auth_info(None), &connect).await.unwrap();

        // The set_will event precedes the will itself
        let event = router_rx.recv().await.unwrap();
        assert_eq!(event.topic, "$SYS/session/test-client/session.set_will");

        session.detach(attached.epoch).await;
        let will = router_rx.recv().await.unwrap();
        assert_eq!(will.topic, "wills/test");
        assert_eq!(will.payload, Bytes::from_static(b"gone"));
    }

    #[tokio::test]
    async fn test_disconnect_clears_will() {
        let (session, mut router_rx) = new_session();

        let mut connect = connect(false);
        connect.will = Some(crate::protocol::Will {
            topic: "wills/test".to_string(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        let attached = session.attach(auth_info(None), &connect).await.unwrap();
        let _ = router_rx.recv().await; // set_will event

        session.handle_disconnect();
        session.detach(attached.epoch).await;
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_will_requires_write_permission() {
        let (session, mut router_rx) = new_session();

        // $-topics are not writable, so the will is refused at attach
        let mut connect = connect(false);
        connect.will = Some(crate::protocol::Will {
            topic: "$SYS/forged".to_string(),
            payload: Bytes::from_static(b"nope"),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        let attached = session.attach(auth_info(None), &connect).await.unwrap();
        session.detach(attached.epoch).await;
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_replay_keeps_retain_flag() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "status", QoS::AtMostOnce).await;

        let mut retained = publish("status", QoS::AtMostOnce, None);
        retained.retain = true;
        session.publish_retained(&retained).await;

        let sent = attached.publish_rx.recv().await.unwrap();
        assert!(sent.retain);
    }

    #[tokio::test]
    async fn test_full_channel_drops_messages() {
        let (session, _router_rx) = new_session();
        let mut attached = session.attach(auth_info(None), &connect(false)).await.unwrap();
        subscribe(&session, "#", QoS::AtMostOnce).await;

        let pkt = publish("flood", QoS::AtMostOnce, None);
        let parts = topic::split(&pkt.topic);
        for _ in 0..(PUBLISH_BUFFER_SIZE + 10) {
            session.publish(&pkt, &parts).await;
        }

        // The channel holds at most its capacity; the rest were dropped
        // without blocking the publisher.
        let mut received = 0;
        while attached.publish_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, PUBLISH_BUFFER_SIZE);
    }
}
