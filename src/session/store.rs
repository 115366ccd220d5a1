//! Session registry and publish fan-out
//!
//! The store owns every session by client id. Published messages enter a
//! bounded channel drained by a pool of workers sized to the logical core
//! count; each worker offers one packet to every session. A background
//! sweeper drops detached sessions whose expiry has passed.
//!
//! `get_or_create` and the sweeper serialize on the registry mutex so the
//! sweeper can never drop a session a handler is about to attach.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::auth::Authenticator;
use crate::metrics::Metrics;
use crate::protocol::Publish;
use crate::retained::RetainedStore;
use crate::topic;

use super::Session;

/// Capacity of the fan-out input channel
const FANOUT_BUFFER_SIZE: usize = 1024;

/// How often the sweeper scans for expired sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Registry of all live sessions and the routing fabric between them
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    fanout_tx: mpsc::Sender<Publish>,
    /// Held until `start` hands it to the worker pool
    fanout_rx: Mutex<Option<mpsc::Receiver<Publish>>>,
    authenticator: Arc<dyn Authenticator>,
    retained: Arc<RetainedStore>,
    metrics: Arc<Metrics>,
}

impl SessionStore {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        retained: Arc<RetainedStore>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (fanout_tx, fanout_rx) = mpsc::channel(FANOUT_BUFFER_SIZE);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            fanout_tx,
            fanout_rx: Mutex::new(Some(fanout_rx)),
            authenticator,
            retained,
            metrics,
        })
    }

    /// Spawn the fan-out worker pool and the expiry sweeper. The tasks stop
    /// when the shutdown channel fires.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let Some(fanout_rx) = self.fanout_rx.lock().take() else {
            return;
        };
        let fanout_rx = Arc::new(tokio::sync::Mutex::new(fanout_rx));
        for _ in 0..num_cpus() {
            tokio::spawn(
                self.clone()
                    .fanout_worker(fanout_rx.clone(), shutdown.subscribe()),
            );
        }
        tokio::spawn(self.clone().sweeper(shutdown.subscribe()));
    }

    /// Get the session for a client id, creating it if absent
    pub fn get_or_create(&self, client_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        let session = match sessions.entry(client_id.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                session.touch_expiry();
                session
            }
            Entry::Vacant(entry) => entry
                .insert(Arc::new(Session::new(
                    client_id,
                    self.fanout_tx.clone(),
                    self.authenticator.clone(),
                    self.metrics.clone(),
                )))
                .clone(),
        };
        self.metrics.sessions.set(sessions.len() as i64);
        session
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(client_id).cloned()
    }

    pub fn delete(&self, client_id: &str) {
        let mut sessions = self.sessions.lock();
        sessions.remove(client_id);
        self.metrics.sessions.set(sessions.len() as i64);
    }

    /// Snapshot of every session in the registry
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Route a publish to every matching session
    pub async fn publish(&self, pkt: Publish) {
        let _ = self.fanout_tx.send(pkt).await;
    }

    async fn fanout_worker(
        self: Arc<Self>,
        fanout_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Publish>>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let pkt = tokio::select! {
                pkt = async { fanout_rx.lock().await.recv().await } => match pkt {
                    Some(pkt) => pkt,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            self.dispatch(pkt).await;
        }
    }

    /// Offer a packet to every session; the retained store sees it first so
    /// the routed copies carry retain=false.
    async fn dispatch(&self, mut pkt: Publish) {
        self.retained.retain(&mut pkt);
        let topic_parts = topic::split(&pkt.topic);
        for session in self.all() {
            session.publish(&pkt, &topic_parts).await;
        }
    }

    async fn sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown.recv() => break,
            }
        }
    }

    fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired());
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!(dropped, "swept expired sessions");
        }
        self.metrics.sessions.set(sessions.len() as i64);
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
