//! Pub/sub client: local handler registry plus topic-list sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::Endpoint;
use tether_rpc::{Rpc, RpcClient, RpcConfig};

use crate::msg::TopicMessage;

/// Stable handle for one subscription, unique within its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerF = dyn Fn(&str) + Send + Sync;

struct HandlerEntry {
    id: SubscriptionId,
    handler: Arc<HandlerF>,
}

/// Topic pub/sub client over an [`RpcClient`].
///
/// Subscriptions are local handler registrations; the server only sees the
/// key set, synced whenever it changes and after every (re)connect. A
/// publisher's own handlers observe its publishes through local dispatch;
/// the server never echoes a publish back to its origin.
pub struct DdsClient {
    client: RpcClient,
    shared: Arc<Shared>,
}

struct Shared {
    topics: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
    rpc: Mutex<Option<Rpc>>,
}

impl DdsClient {
    /// Create a client for the given endpoint. Reconnect is enabled with the
    /// default interval; call [`open`](Self::open) to start connecting.
    pub fn new(endpoint: Endpoint) -> Self {
        let client = RpcClient::new(endpoint, RpcConfig::default());
        client.set_reconnect(tether_core::DEFAULT_RECONNECT_MS);

        let shared = Arc::new(Shared {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            rpc: Mutex::new(None),
        });

        let hook = shared.clone();
        client.on_open(move |rpc| {
            tracing::debug!("dds client: connected");
            let dispatch = hook.clone();
            rpc.subscribe("publish", move |msg: TopicMessage| {
                dispatch_local(&dispatch, &msg);
            });
            *hook.rpc.lock() = Some(rpc);
            resync(&hook);
        });

        let hook = shared.clone();
        client.on_close(move || {
            tracing::debug!("dds client: disconnected");
            hook.rpc.lock().take();
        });

        Self { client, shared }
    }

    /// Start connecting.
    pub fn open(&self) {
        self.client.open();
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        self.client.close();
    }

    pub fn is_open(&self) -> bool {
        self.client.is_open()
    }

    /// Publish a sample: local subscribers are dispatched first, then the
    /// sample goes to the server for fan-out to other clients. While
    /// disconnected only local dispatch happens.
    pub fn publish(&self, topic: impl Into<String>, data: impl Into<String>) {
        let msg = TopicMessage::new(topic, data);
        dispatch_local(&self.shared, &msg);
        let rpc = self.shared.rpc.lock().clone();
        match rpc {
            Some(rpc) => rpc.cmd("publish").msg(&msg).call(),
            None => tracing::debug!(topic = %msg.topic, "dds client: offline, remote publish skipped"),
        }
    }

    /// Register a handler for a topic. The topic list is re-synced to the
    /// server only when this adds a new topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let is_new_topic = {
            let mut topics = self.shared.topics.lock();
            let is_new = !topics.contains_key(&topic);
            topics.entry(topic).or_default().push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });
            is_new
        };
        if is_new_topic {
            resync(&self.shared);
        }
        id
    }

    /// Drop every handler for a topic. Returns whether the topic existed.
    pub fn unsubscribe_topic(&self, topic: &str) -> bool {
        let removed = self.shared.topics.lock().remove(topic).is_some();
        if removed {
            resync(&self.shared);
        }
        removed
    }

    /// Drop a single handler. The topic list is re-synced only when its
    /// topic loses its last handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (found, topic_emptied) = {
            let mut topics = self.shared.topics.lock();
            let mut found = false;
            let mut emptied: Option<String> = None;
            for (topic, entries) in topics.iter_mut() {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                if entries.len() != before {
                    found = true;
                    if entries.is_empty() {
                        emptied = Some(topic.clone());
                    }
                    break;
                }
            }
            if let Some(topic) = &emptied {
                topics.remove(topic);
            }
            (found, emptied.is_some())
        };
        if topic_emptied {
            resync(&self.shared);
        }
        if !found {
            tracing::debug!(?id, "dds client: unsubscribe with unknown id");
        }
        found
    }

    /// Topics with at least one local handler.
    pub fn topic_names(&self) -> Vec<String> {
        self.shared.topics.lock().keys().cloned().collect()
    }
}

fn dispatch_local(shared: &Arc<Shared>, msg: &TopicMessage) {
    // Handlers run outside the lock so they can subscribe/unsubscribe.
    let handlers: Vec<Arc<HandlerF>> = {
        let topics = shared.topics.lock();
        topics
            .get(&msg.topic)
            .map(|entries| entries.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default()
    };
    tracing::trace!(topic = %msg.topic, handlers = handlers.len(), "dds client: dispatch");
    for handler in handlers {
        handler(&msg.data);
    }
}

/// Send the current topic key set to the server. A no-op while disconnected;
/// the on-open resync covers that case.
fn resync(shared: &Arc<Shared>) {
    let rpc = shared.rpc.lock().clone();
    let Some(rpc) = rpc else {
        tracing::trace!("dds client: resync deferred until connect");
        return;
    };
    let topic_list: Vec<String> = shared.topics.lock().keys().cloned().collect();
    tracing::debug!(topics = topic_list.len(), "dds client: sync topic list");
    rpc.cmd("update_topic_list").msg(&topic_list).retry(-1).call();
}
