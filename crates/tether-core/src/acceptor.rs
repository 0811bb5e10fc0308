//! Inbound connection acceptance.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::channel::FramedChannel;
use crate::config::ChannelConfig;
use crate::endpoint::IoStream;

type ChannelFn = Box<dyn Fn(FramedChannel) + Send + Sync>;

/// A bound stream listener that produces a [`FramedChannel`] per inbound
/// connection.
///
/// The `on_channel` hook runs before the channel starts reading, so callbacks
/// installed from the hook observe the connection from its first byte.
pub struct Acceptor {
    shared: Arc<Shared>,
}

struct Shared {
    listener: Listener,
    config: ChannelConfig,
    on_channel: Mutex<Option<ChannelFn>>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(feature = "tls")]
    Tls(TcpListener, tokio_rustls::TlsAcceptor),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Acceptor {
    pub async fn bind_tcp(addr: &str, config: ChannelConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::with_listener(Listener::Tcp(listener), config))
    }

    /// Bind a TCP listener whose connections are wrapped in TLS before
    /// framing begins.
    #[cfg(feature = "tls")]
    pub async fn bind_tls(
        addr: &str,
        tls: tokio_rustls::TlsAcceptor,
        config: ChannelConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::with_listener(Listener::Tls(listener, tls), config))
    }

    #[cfg(unix)]
    pub async fn bind_unix(
        path: impl AsRef<std::path::Path>,
        config: ChannelConfig,
    ) -> io::Result<Self> {
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Self::with_listener(Listener::Unix(listener), config))
    }

    fn with_listener(listener: Listener, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                listener,
                config,
                on_channel: Mutex::new(None),
            }),
        }
    }

    /// Install the per-connection hook. Must be installed before
    /// [`serve`](Self::serve).
    pub fn on_channel(&self, f: impl Fn(FramedChannel) + Send + Sync + 'static) {
        *self.shared.on_channel.lock() = Some(Box::new(f));
    }

    /// The bound local address (TCP flavors only).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.shared.listener {
            Listener::Tcp(l) => l.local_addr(),
            #[cfg(feature = "tls")]
            Listener::Tls(l, _) => l.local_addr(),
            #[cfg(unix)]
            Listener::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix listeners have no socket address",
            )),
        }
    }

    /// Run the accept loop. Await it to drive the acceptor inline, or spawn
    /// it on the runtime. Returns only on a listener error.
    pub async fn serve(&self) -> io::Result<()> {
        loop {
            match &self.shared.listener {
                Listener::Tcp(listener) => {
                    let (stream, peer) = listener.accept().await?;
                    tracing::debug!(%peer, "acceptor: connection");
                    stream.set_nodelay(true).ok();
                    self.shared.handle(Box::new(stream));
                }
                #[cfg(feature = "tls")]
                Listener::Tls(listener, tls) => {
                    let (stream, peer) = listener.accept().await?;
                    tracing::debug!(%peer, "acceptor: connection, handshaking");
                    stream.set_nodelay(true).ok();
                    let tls = tls.clone();
                    let shared = self.shared.clone();
                    // Handshakes run off the accept loop so one slow client
                    // cannot stall other connections.
                    tokio::spawn(async move {
                        match tls.accept(stream).await {
                            Ok(stream) => shared.handle(Box::new(stream)),
                            Err(e) => {
                                tracing::debug!(%peer, error = %e, "acceptor: TLS handshake failed")
                            }
                        }
                    });
                }
                #[cfg(unix)]
                Listener::Unix(listener) => {
                    let (stream, _) = listener.accept().await?;
                    tracing::debug!("acceptor: unix connection");
                    self.shared.handle(Box::new(stream));
                }
            }
        }
    }
}

impl Shared {
    fn handle(&self, stream: Box<dyn IoStream>) {
        let channel = FramedChannel::new(stream, self.config.clone());
        {
            let hook = self.on_channel.lock();
            match hook.as_ref() {
                Some(f) => f(channel.clone()),
                None => tracing::warn!("acceptor: connection accepted with no on_channel hook"),
            }
        }
        channel.start();
    }
}
