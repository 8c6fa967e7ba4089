//! Component H: the mesh event bus & RPC router (§4.H).
//!
//! Services register an endpoint and are looked up by name for
//! location-transparent in-process RPC; events are published under
//! hierarchical dotted names and delivered to subscribers matching a
//! glob-style pattern, ordered per subscription but not across subscriptions.
//! The service map and per-subscriber channel shape are grounded on `ipc.rs`'s
//! `IpcManager` (`DashMap`-backed channel registry, broadcast-style fan-out),
//! generalized here from exact-topic `PluginChannel` delivery to dotted-glob
//! pattern matching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use crate::error::{ForgeError, ForgeResult};
use crate::model::MeshEvent;

/// A location-transparent handle to a registered service. Resolving the
/// actual transport (Unix socket, in-process call, etc.) for `endpoint` is
/// left to the caller; this crate only tracks the name-to-endpoint mapping.
#[derive(Debug, Clone)]
pub struct Connection {
    /// The service name this connection was resolved from.
    pub service: String,
    /// Transport-specific endpoint (e.g. a Unix socket path).
    pub endpoint: String,
}

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

/// The mesh event bus and RPC router.
pub struct Mesh {
    services: DashMap<String, String>,
    subscriptions: RwLock<Vec<Subscription>>,
    closed: AtomicBool,
}

impl Mesh {
    /// Construct an empty, open mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            subscriptions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> ForgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForgeError::BusClosed);
        }
        Ok(())
    }

    /// Advertise `name` as reachable at `endpoint`.
    pub fn register_service(&self, name: &str, endpoint: &str) -> ForgeResult<()> {
        self.check_open()?;
        self.services.insert(name.to_string(), endpoint.to_string());
        Ok(())
    }

    /// Resolve a ready-to-use connection handle for `service_name`.
    pub fn get_connection(&self, service_name: &str) -> ForgeResult<Connection> {
        self.check_open()?;
        let endpoint = self
            .services
            .get(service_name)
            .map(|e| e.clone())
            .ok_or_else(|| ForgeError::not_found(format!("service '{service_name}'")))?;
        Ok(Connection {
            service: service_name.to_string(),
            endpoint,
        })
    }

    /// Fire-and-forget publish. Delivery is ordered per subscriber channel;
    /// no ordering is promised across subscribers. A subscriber whose channel
    /// has been dropped is pruned lazily on the next publish.
    pub async fn publish_event(&self, event: MeshEvent) -> ForgeResult<()> {
        self.check_open()?;
        let mut guard = self.subscriptions.write().await;
        guard.retain(|sub| {
            if glob_match(&sub.pattern, &event.event_type) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
        Ok(())
    }

    /// Subscribe to events whose dotted type matches the glob-style `pattern`
    /// (e.g. `plugin.peer.*`). Returns a channel that yields matching events
    /// until `unsubscribe` is called for the same pattern or the bus closes.
    pub async fn subscribe(&self, pattern: &str) -> ForgeResult<mpsc::UnboundedReceiver<MeshEvent>> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.write().await.push(Subscription {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    /// Close every subscription channel registered under `pattern`.
    pub async fn unsubscribe(&self, pattern: &str) -> ForgeResult<()> {
        self.check_open()?;
        self.subscriptions.write().await.retain(|sub| sub.pattern != pattern);
        Ok(())
    }

    /// Terminate all subscriptions and connections; subsequent calls fail cleanly with `BusClosed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.write().await.clear();
        self.services.clear();
    }
}

/// Glob matching over dotted segments: `*` matches any run of characters
/// (including across `.` boundaries), everything else matches literally.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn inner(pattern: &[u8], candidate: &[u8]) -> bool {
        match (pattern.first(), candidate.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], candidate) || (!candidate.is_empty() && inner(pattern, &candidate[1..]))
            }
            (Some(p), Some(c)) if p == c => inner(&pattern[1..], &candidate[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}
