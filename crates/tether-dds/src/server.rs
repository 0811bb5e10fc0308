//! Pub/sub fan-out server.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_rpc::{RpcConfig, RpcServer, WeakRpc};

use crate::msg::TopicMessage;

type TopicMap = Arc<Mutex<HashMap<String, Vec<TopicEntry>>>>;

struct TopicEntry {
    session_id: u64,
    rpc: WeakRpc,
}

/// Topic fan-out on top of an [`RpcServer`].
///
/// Each peer declares its topic set with `update_topic_list`; every `publish`
/// it sends is forwarded to the other sessions currently subscribed to that
/// topic. Subscriber sets key on session identity, so a reconnected peer is
/// a new subscriber and must re-declare its topics (its client does this on
/// reconnect).
pub struct DdsServer {
    server: RpcServer,
    topics: TopicMap,
}

impl DdsServer {
    pub async fn bind_tcp(addr: &str) -> io::Result<Self> {
        Ok(Self::with_server(
            RpcServer::bind_tcp(addr, RpcConfig::default()).await?,
        ))
    }

    #[cfg(feature = "tls")]
    pub async fn bind_tls(addr: &str, tls: tokio_rustls::TlsAcceptor) -> io::Result<Self> {
        Ok(Self::with_server(
            RpcServer::bind_tls(addr, tls, RpcConfig::default()).await?,
        ))
    }

    #[cfg(unix)]
    pub async fn bind_unix(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self::with_server(
            RpcServer::bind_unix(path, RpcConfig::default()).await?,
        ))
    }

    fn with_server(server: RpcServer) -> Self {
        let topics: TopicMap = Arc::new(Mutex::new(HashMap::new()));

        let map = topics.clone();
        server.on_session(move |session| {
            let id = session.id();
            let rpc = session.rpc();
            tracing::debug!(id, "dds server: session");

            {
                let map = map.clone();
                session.on_close(move || remove_session(&map, id));
            }
            {
                let map = map.clone();
                let weak = rpc.downgrade();
                rpc.subscribe("update_topic_list", move |topic_list: Vec<String>| {
                    update_topic_list(&map, id, &weak, topic_list);
                });
            }
            {
                let map = map.clone();
                rpc.subscribe("publish", move |msg: TopicMessage| {
                    fan_out(&map, id, &msg);
                });
            }
        });

        Self { server, topics }
    }

    /// Run the accept loop. Await it to drive the server inline, or spawn it
    /// on the runtime.
    pub async fn serve(&self) -> io::Result<()> {
        self.server.serve().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Topics that currently have at least one subscriber.
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    /// Number of sessions subscribed to a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }
}

/// Replace a session's topic membership with the received list. The list is
/// authoritative: topics the session no longer lists drop it immediately.
fn update_topic_list(map: &TopicMap, id: u64, rpc: &WeakRpc, topic_list: Vec<String>) {
    tracing::debug!(id, topics = topic_list.len(), "dds server: update topic list");
    let mut map = map.lock();
    for entries in map.values_mut() {
        entries.retain(|e| e.session_id != id);
    }
    for topic in topic_list {
        let entries = map.entry(topic).or_default();
        if !entries.iter().any(|e| e.session_id == id) {
            entries.push(TopicEntry {
                session_id: id,
                rpc: rpc.clone(),
            });
        }
    }
    map.retain(|_, entries| !entries.is_empty());
}

fn remove_session(map: &TopicMap, id: u64) {
    tracing::debug!(id, "dds server: removing session");
    let mut map = map.lock();
    for entries in map.values_mut() {
        entries.retain(|e| e.session_id != id);
    }
    map.retain(|_, entries| !entries.is_empty());
}

/// Forward a publish to every subscriber of the topic except its origin.
fn fan_out(map: &TopicMap, from_id: u64, msg: &TopicMessage) {
    let targets: Vec<_> = {
        let map = map.lock();
        match map.get(&msg.topic) {
            Some(entries) => entries
                .iter()
                .filter(|e| e.session_id != from_id)
                .filter_map(|e| e.rpc.upgrade())
                .collect(),
            None => Vec::new(),
        }
    };
    tracing::trace!(topic = %msg.topic, subscribers = targets.len(), "dds server: publish");
    for rpc in targets {
        rpc.cmd("publish").msg(msg).retry(-1).call();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_rpc::Rpc;

    fn dummy_rpc() -> Rpc {
        Rpc::new(RpcConfig::default(), |_frame| {})
    }

    fn topics_of(map: &TopicMap) -> Vec<String> {
        let mut names: Vec<String> = map.lock().keys().cloned().collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn topic_list_is_authoritative() {
        let map: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let rpc = dummy_rpc();
        let weak = rpc.downgrade();

        update_topic_list(&map, 1, &weak, vec!["a".into(), "b".into()]);
        assert_eq!(topics_of(&map), ["a", "b"]);

        // Shrinking the list drops the stale topic immediately.
        update_topic_list(&map, 1, &weak, vec!["b".into()]);
        assert_eq!(topics_of(&map), ["b"]);

        update_topic_list(&map, 1, &weak, Vec::new());
        assert!(topics_of(&map).is_empty());
    }

    #[tokio::test]
    async fn duplicate_topics_collapse_to_one_entry() {
        let map: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let rpc = dummy_rpc();
        update_topic_list(&map, 1, &rpc.downgrade(), vec!["t".into(), "t".into()]);
        assert_eq!(map.lock().get("t").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_reaps_session_from_every_topic() {
        let map: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let one = dummy_rpc();
        let two = dummy_rpc();
        update_topic_list(&map, 1, &one.downgrade(), vec!["a".into(), "b".into()]);
        update_topic_list(&map, 2, &two.downgrade(), vec!["b".into()]);

        remove_session(&map, 1);
        assert_eq!(topics_of(&map), ["b"]);
        assert_eq!(map.lock().get("b").unwrap().len(), 1);

        remove_session(&map, 2);
        assert!(topics_of(&map).is_empty());
    }

    #[tokio::test]
    async fn fan_out_excludes_origin_and_dead_sessions() {
        let map: TopicMap = Arc::new(Mutex::new(HashMap::new()));

        let origin = dummy_rpc();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let log = captured.clone();
        let live = Rpc::new(RpcConfig::default(), move |frame| {
            log.lock().push(frame);
        });
        let dead = dummy_rpc();

        update_topic_list(&map, 1, &origin.downgrade(), vec!["t".into()]);
        update_topic_list(&map, 2, &live.downgrade(), vec!["t".into()]);
        update_topic_list(&map, 3, &dead.downgrade(), vec!["t".into()]);
        drop(dead);

        fan_out(&map, 1, &TopicMessage::new("t", "x"));

        // Only the live non-origin subscriber saw an outbound frame.
        assert_eq!(captured.lock().len(), 1);
        assert_eq!(live.pending_count(), 1);
        assert_eq!(origin.pending_count(), 0);
    }
}
