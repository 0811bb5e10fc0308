//! Binding of one RPC connection to one framed channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::FramedChannel;

use crate::config::RpcConfig;
use crate::rpc::Rpc;

/// Identity source for sessions. A reconnected peer gets a new session and
/// therefore a new identity.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type CloseFn = Box<dyn FnOnce() + Send>;

/// One [`Rpc`] bound to one [`FramedChannel`].
///
/// The session owns the channel strongly; the channel's callbacks hold the
/// session weakly and upgrade when they fire, so dropping every strong
/// reference breaks the cycle deterministically. Callbacks that captured the
/// [`Rpc`] handle keep the connection state alive for as long as they exist,
/// so a response callback already in flight at close always runs against
/// live state.
pub struct RpcSession {
    id: u64,
    rpc: Rpc,
    channel: FramedChannel,
    closed: AtomicBool,
    on_close: Mutex<Vec<CloseFn>>,
}

impl RpcSession {
    /// Wire an RPC connection onto a channel. The channel must be in packed
    /// mode and not yet started; the caller starts it once its hooks are in
    /// place.
    pub fn bind(channel: FramedChannel, config: RpcConfig) -> Arc<RpcSession> {
        let sender = channel.clone();
        let rpc = Rpc::new(config, move |frame| sender.send(frame));

        let session = Arc::new(RpcSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            rpc,
            channel: channel.clone(),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Vec::new()),
        });
        tracing::debug!(id = session.id, "session: bound");

        let weak = Arc::downgrade(&session);
        channel.on_data(move |body| {
            if let Some(session) = weak.upgrade() {
                if let Err(e) = session.rpc.handle_frame(&body) {
                    tracing::warn!(id = session.id, error = %e, "session: protocol error, closing");
                    session.channel.close();
                }
            }
        });

        let weak = Arc::downgrade(&session);
        channel.on_close(move || {
            if let Some(session) = weak.upgrade() {
                session.handle_close();
            }
        });

        session
    }

    /// Construction-time identity, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handle to the session's RPC connection.
    pub fn rpc(&self) -> Rpc {
        self.rpc.clone()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Close the underlying channel; close callbacks fire once the channel
    /// has wound down.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Register a close subscriber. Subscribers run in registration order,
    /// after the pending-call table has been drained. Registering on an
    /// already-closed session runs the subscriber immediately.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        let mut slot = Some(Box::new(f) as CloseFn);
        {
            let mut subs = self.on_close.lock();
            // Checked under the lock: handle_close sets the flag before it
            // takes the subscriber list, so a subscriber lands in exactly one
            // of the two paths.
            if !self.closed.load(Ordering::Acquire) {
                if let Some(f) = slot.take() {
                    subs.push(f);
                }
            }
        }
        if let Some(f) = slot {
            f();
        }
    }

    fn handle_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(id = self.id, "session: closed");
        self.rpc.shutdown();
        let subs = {
            let mut guard = self.on_close.lock();
            std::mem::take(&mut *guard)
        };
        for f in subs {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tether_core::ChannelConfig;

    fn bound_pair() -> (Arc<RpcSession>, Arc<RpcSession>) {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        let sa = RpcSession::bind(a.clone(), RpcConfig::default());
        let sb = RpcSession::bind(b.clone(), RpcConfig::default());
        a.start();
        b.start();
        (sa, sb)
    }

    #[tokio::test]
    async fn call_across_channel_pair() {
        let (client, server) = bound_pair();
        server.rpc().subscribe("sum", |pair: Vec<u32>| -> u32 { pair.iter().sum() });

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .rpc()
            .cmd("sum")
            .msg(&vec![1u32, 2, 3])
            .rsp(move |total: u32| {
                let _ = tx.send(total);
            })
            .call();

        let total = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn sessions_have_distinct_ids() {
        let (a, b) = bound_pair();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn close_drains_pending_and_fires_subscribers_once() {
        let (client, _server) = bound_pair();

        let (err_tx, err_rx) = tokio::sync::oneshot::channel();
        client
            .rpc()
            .cmd("nobody-home")
            .timeout(60_000)
            .on_error(move |e| {
                let _ = err_tx.send(e.is_closed());
            })
            .call();

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        client.on_close(move || {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = close_tx.send(());
        });

        client.close();

        assert!(tokio::time::timeout(Duration::from_secs(5), err_rx)
            .await
            .unwrap()
            .unwrap());
        tokio::time::timeout(Duration::from_secs(5), close_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.rpc().pending_count(), 0);

        // Closing again must not re-run subscribers.
        client.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscriber_registered_after_close_runs_immediately() {
        let (client, _server) = bound_pair();
        client.close();
        client.channel.closed().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        client.on_close(move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn response_in_flight_at_close_still_delivered() {
        let (client, server) = bound_pair();
        let server_handle = server.clone();
        server.rpc().subscribe("once", move |_: ()| -> String {
            // Answer, then close shortly after: the response bytes precede
            // the close on the wire, so the client must deliver the response
            // callback before its close event.
            let s = server_handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                s.close();
            });
            String::from("made it")
        });

        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();
        let close_events = events_tx.clone();
        client.on_close(move || {
            let _ = close_events.send("closed");
        });
        client
            .rpc()
            .cmd("once")
            .msg(&())
            .rsp(move |s: String| {
                assert_eq!(s, "made it");
                let _ = events_tx.send("response");
            })
            .call();

        let first = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("response lost at close")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("close not observed")
            .unwrap();
        assert_eq!((first, second), ("response", "closed"));
    }

    #[tokio::test]
    async fn protocol_garbage_closes_session() {
        let (raw, peer) = FramedChannel::pair(ChannelConfig::packed());
        let session = RpcSession::bind(peer.clone(), RpcConfig::default());
        raw.start();
        peer.start();

        let (tx, rx) = tokio::sync::oneshot::channel();
        session.on_close(move || {
            let _ = tx.send(());
        });

        // Three bytes cannot hold an RPC header.
        raw.send(vec![1, 2, 3]);

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("session did not close on protocol error")
            .unwrap();
        assert!(!session.is_open());
    }
}
