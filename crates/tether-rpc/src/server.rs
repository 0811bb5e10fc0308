//! RPC server: an acceptor plus the set of live sessions.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::Acceptor;

use crate::config::RpcConfig;
use crate::session::RpcSession;

type SessionFn = Box<dyn Fn(&Arc<RpcSession>) + Send + Sync>;

/// Accepts connections and maintains one [`RpcSession`] per peer.
///
/// The server holds each session strongly until its channel closes; the
/// `on_session` hook runs before the session's channel starts reading, so
/// handlers subscribed from the hook see the connection from its first
/// request.
pub struct RpcServer {
    acceptor: Acceptor,
    shared: Arc<Shared>,
}

struct Shared {
    config: RpcConfig,
    sessions: Mutex<HashMap<u64, Arc<RpcSession>>>,
    on_session: Mutex<Option<SessionFn>>,
}

impl RpcServer {
    pub async fn bind_tcp(addr: &str, config: RpcConfig) -> io::Result<Self> {
        let acceptor = Acceptor::bind_tcp(addr, config.channel_config()).await?;
        Ok(Self::with_acceptor(acceptor, config))
    }

    #[cfg(feature = "tls")]
    pub async fn bind_tls(
        addr: &str,
        tls: tokio_rustls::TlsAcceptor,
        config: RpcConfig,
    ) -> io::Result<Self> {
        let acceptor = Acceptor::bind_tls(addr, tls, config.channel_config()).await?;
        Ok(Self::with_acceptor(acceptor, config))
    }

    #[cfg(unix)]
    pub async fn bind_unix(
        path: impl AsRef<std::path::Path>,
        config: RpcConfig,
    ) -> io::Result<Self> {
        let acceptor = Acceptor::bind_unix(path, config.channel_config()).await?;
        Ok(Self::with_acceptor(acceptor, config))
    }

    fn with_acceptor(acceptor: Acceptor, config: RpcConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            sessions: Mutex::new(HashMap::new()),
            on_session: Mutex::new(None),
        });

        let hook_shared = shared.clone();
        acceptor.on_channel(move |channel| {
            let session = RpcSession::bind(channel, hook_shared.config.clone());
            let id = session.id();
            hook_shared.sessions.lock().insert(id, session.clone());
            tracing::debug!(id, "rpc server: session open");

            let weak = Arc::downgrade(&hook_shared);
            session.on_close(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.sessions.lock().remove(&id);
                    tracing::debug!(id, "rpc server: session removed");
                }
            });

            let hook = hook_shared.on_session.lock();
            if let Some(f) = hook.as_ref() {
                f(&session);
            }
        });

        Self { acceptor, shared }
    }

    /// Install the per-session hook. Must be installed before
    /// [`serve`](Self::serve).
    pub fn on_session(&self, f: impl Fn(&Arc<RpcSession>) + Send + Sync + 'static) {
        *self.shared.on_session.lock() = Some(Box::new(f));
    }

    /// Run the accept loop. Await it to drive the server inline, or spawn it
    /// on the runtime.
    pub async fn serve(&self) -> io::Result<()> {
        self.acceptor.serve().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of currently live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }
}
