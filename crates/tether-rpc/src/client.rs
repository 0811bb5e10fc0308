//! RPC client: a connector plus one session at a time.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{Connector, Endpoint};

use crate::config::RpcConfig;
use crate::rpc::Rpc;
use crate::session::RpcSession;

type OpenFn = Box<dyn FnMut(Rpc) + Send>;
type CloseFn = Box<dyn FnMut() + Send>;

/// Connects to an RPC server and maintains one [`RpcSession`] at a time.
///
/// Every successful (re)connect produces a fresh session with an empty
/// pending-call table and fires `on_open` again with the new [`Rpc`] handle;
/// handles from a previous connection stay closed. Reconnect policy lives in
/// the underlying [`Connector`].
pub struct RpcClient {
    connector: Connector,
    shared: Arc<Shared>,
}

struct Shared {
    config: RpcConfig,
    session: Mutex<Option<Arc<RpcSession>>>,
    on_open: Mutex<Option<OpenFn>>,
    on_close: Mutex<Option<CloseFn>>,
}

impl RpcClient {
    pub fn new(endpoint: Endpoint, config: RpcConfig) -> Self {
        let connector = Connector::new(endpoint, config.channel_config());
        let shared = Arc::new(Shared {
            config,
            session: Mutex::new(None),
            on_open: Mutex::new(None),
            on_close: Mutex::new(None),
        });

        let hook_shared = shared.clone();
        connector.on_open(move |channel| {
            let session = RpcSession::bind(channel, hook_shared.config.clone());
            *hook_shared.session.lock() = Some(session.clone());

            let weak = Arc::downgrade(&hook_shared);
            session.on_close(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.session.lock().take();
                    let mut hook = shared.on_close.lock();
                    if let Some(f) = hook.as_mut() {
                        f();
                    }
                }
            });

            let mut hook = hook_shared.on_open.lock();
            if let Some(f) = hook.as_mut() {
                f(session.rpc());
            }
        });

        Self { connector, shared }
    }

    /// Called with a fresh [`Rpc`] handle on every successful (re)connect,
    /// before any inbound frame is read. Install before [`open`](Self::open).
    pub fn on_open(&self, f: impl FnMut(Rpc) + Send + 'static) {
        *self.shared.on_open.lock() = Some(Box::new(f));
    }

    /// Called when the current session closes. Install before
    /// [`open`](Self::open).
    pub fn on_close(&self, f: impl FnMut() + Send + 'static) {
        *self.shared.on_close.lock() = Some(Box::new(f));
    }

    /// Called on every failed connect attempt. Install before
    /// [`open`](Self::open).
    pub fn on_open_failed(&self, f: impl FnMut(io::Error) + Send + 'static) {
        self.connector.on_open_failed(f);
    }

    /// Start connecting.
    pub fn open(&self) {
        self.connector.open();
    }

    /// Close the current session and stop reconnecting.
    pub fn close(&self) {
        self.connector.close();
    }

    /// Enable automatic reconnect with the given base interval. 0 disables.
    pub fn set_reconnect(&self, ms: u32) {
        self.connector.set_reconnect(ms);
    }

    pub fn cancel_reconnect(&self) {
        self.connector.cancel_reconnect();
    }

    /// Handle to the current connection, if one is open.
    pub fn rpc(&self) -> Option<Rpc> {
        self.shared.session.lock().as_ref().map(|s| s.rpc())
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_open())
    }
}
