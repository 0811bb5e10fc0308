//! Outbound connections with automatic reconnect.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::FramedChannel;
use crate::config::ChannelConfig;
use crate::endpoint::Endpoint;

/// Default reconnect interval when reconnect is enabled without an explicit
/// interval.
pub const DEFAULT_RECONNECT_MS: u32 = 1000;

type OpenFn = Box<dyn FnMut(FramedChannel) + Send>;
type OpenFailedFn = Box<dyn FnMut(io::Error) + Send>;

/// Connects an [`Endpoint`] and hands the resulting [`FramedChannel`] to the
/// `on_open` hook; on connect failure fires `on_open_failed`.
///
/// Reconnect is edge-triggered: a single driver task owns the connect loop,
/// so at most one attempt is outstanding. After a successful open, the next
/// attempt is scheduled only once the channel has closed.
pub struct Connector {
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: Endpoint,
    config: ChannelConfig,
    /// Reconnect interval in milliseconds; 0 disables reconnect.
    reconnect_ms: AtomicU32,
    cancelled: AtomicBool,
    /// True while the driver task is running.
    running: AtomicBool,
    current: Mutex<Option<FramedChannel>>,
    on_open: Mutex<Option<OpenFn>>,
    on_open_failed: Mutex<Option<OpenFailedFn>>,
}

impl Connector {
    pub fn new(endpoint: Endpoint, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                config,
                reconnect_ms: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                current: Mutex::new(None),
                on_open: Mutex::new(None),
                on_open_failed: Mutex::new(None),
            }),
        }
    }

    /// Called with the fresh channel on every successful (re)connect, before
    /// the channel starts reading. Install before [`open`](Self::open).
    pub fn on_open(&self, f: impl FnMut(FramedChannel) + Send + 'static) {
        *self.shared.on_open.lock() = Some(Box::new(f));
    }

    /// Called on every failed connect attempt. Install before
    /// [`open`](Self::open).
    pub fn on_open_failed(&self, f: impl FnMut(io::Error) + Send + 'static) {
        *self.shared.on_open_failed.lock() = Some(Box::new(f));
    }

    /// Enable automatic reconnect with the given base interval. 0 disables.
    pub fn set_reconnect(&self, ms: u32) {
        self.shared.reconnect_ms.store(ms, Ordering::Release);
    }

    /// Disable any further reconnect attempts.
    pub fn cancel_reconnect(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Start connecting. Spawns the driver task; a no-op if one is already
    /// running.
    pub fn open(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            tracing::debug!(endpoint = %self.shared.endpoint, "connector: already open");
            return;
        }
        self.shared.cancelled.store(false, Ordering::Release);
        tokio::spawn(drive(self.shared.clone()));
    }

    /// Close the current channel (if any) and stop reconnecting.
    pub fn close(&self) {
        self.cancel_reconnect();
        let channel = self.shared.current.lock().clone();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .current
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_open())
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        match shared.endpoint.connect().await {
            Ok(stream) => {
                tracing::debug!(endpoint = %shared.endpoint, "connector: open");
                let channel = FramedChannel::new(stream, shared.config.clone());
                *shared.current.lock() = Some(channel.clone());
                {
                    let mut hook = shared.on_open.lock();
                    if let Some(f) = hook.as_mut() {
                        f(channel.clone());
                    }
                }
                channel.start();
                channel.closed().await;
                shared.current.lock().take();
                tracing::debug!(endpoint = %shared.endpoint, "connector: channel closed");
            }
            Err(e) => {
                tracing::debug!(endpoint = %shared.endpoint, error = %e, "connector: connect failed");
                let mut hook = shared.on_open_failed.lock();
                if let Some(f) = hook.as_mut() {
                    f(e);
                }
            }
        }

        let ms = shared.reconnect_ms.load(Ordering::Acquire);
        if ms == 0 || shared.cancelled.load(Ordering::Acquire) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
        if shared.cancelled.load(Ordering::Acquire) {
            break;
        }
    }
    shared.running.store(false, Ordering::Release);
}
