//! The RPC connection object: sequence numbers, pending calls, timers,
//! retries, and the command handler table.
//!
//! An [`Rpc`] is pure protocol state over an injected send sink; it performs
//! no I/O of its own. [`RpcSession`](crate::RpcSession) wires one to a framed
//! channel, and tests wire two of them back to back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec;
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::proto::{self, FrameKind, ProtoError};

type SendFn = Box<dyn Fn(Vec<u8>) + Send + Sync>;
type HandlerFn = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;
type RspFn = Box<dyn FnOnce(Vec<u8>) -> Result<(), RpcError> + Send>;
type TimeoutFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(RpcError) + Send>;
type FinishFn = Box<dyn FnOnce(CallOutcome) + Send>;

enum CallOutcome {
    Response(Vec<u8>),
    Timeout,
    Error(RpcError),
}

struct PendingCall {
    cmd: String,
    /// The encoded request, kept for retransmission with the same seq.
    frame: Vec<u8>,
    /// Remaining retransmissions; `-1` means unlimited.
    retries_remaining: i32,
    timer: tokio::task::JoinHandle<()>,
    finish: FinishFn,
}

/// A bidirectional RPC connection.
///
/// Cheap to clone; clones share the connection state. Outbound calls go
/// through [`cmd`](Self::cmd); inbound requests are served by handlers
/// registered with [`subscribe`](Self::subscribe).
///
/// Every call reaches exactly one terminal outcome: the response callback,
/// the timeout callback, or the error callback. The pending entry is removed
/// before its terminal callback runs.
#[derive(Clone)]
pub struct Rpc {
    shared: Arc<Shared>,
}

/// Weak handle to an [`Rpc`], usable as a map value without keeping the
/// connection alive.
#[derive(Clone)]
pub struct WeakRpc {
    shared: Weak<Shared>,
}

impl WeakRpc {
    pub fn upgrade(&self) -> Option<Rpc> {
        self.shared.upgrade().map(|shared| Rpc { shared })
    }
}

struct Shared {
    config: RpcConfig,
    seq: AtomicU32,
    closed: AtomicBool,
    send: SendFn,
    pending: Mutex<HashMap<u32, PendingCall>>,
    handlers: Mutex<HashMap<String, HandlerFn>>,
}

impl Rpc {
    /// Create a connection over a send sink. The sink receives fully encoded
    /// RPC frame bodies; feed inbound bodies to
    /// [`handle_frame`](Self::handle_frame).
    pub fn new(config: RpcConfig, send: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                seq: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                send: Box::new(send),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakRpc {
        WeakRpc {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a handler for an inbound command, replacing any previous
    /// handler for the same command. The handler's return value is sent back
    /// as the response (a `()` return produces an empty response).
    ///
    /// Requests whose payload fails to decode are dropped without a response.
    pub fn subscribe<Req, Rsp, F>(&self, cmd: impl Into<String>, handler: F)
    where
        Req: for<'de> facet::Facet<'de> + 'static,
        Rsp: facet::Facet<'static> + 'static,
        F: Fn(Req) -> Rsp + Send + Sync + 'static,
    {
        let cmd = cmd.into();
        let cmd_in_log = cmd.clone();
        let erased: HandlerFn = Box::new(move |payload| match codec::from_slice::<Req>(payload) {
            Ok(req) => Some(codec::to_vec(&handler(req))),
            Err(e) => {
                tracing::warn!(cmd = %cmd_in_log, error = %e, "rpc: dropping request with undecodable payload");
                None
            }
        });
        self.shared.handlers.lock().insert(cmd, erased);
    }

    /// Remove a command handler. Returns whether one was registered.
    pub fn unsubscribe(&self, cmd: &str) -> bool {
        self.shared.handlers.lock().remove(cmd).is_some()
    }

    /// Start building a call.
    pub fn cmd(&self, name: impl Into<String>) -> CallBuilder<'_> {
        CallBuilder::new(self, name.into(), false)
    }

    /// Start building a keepalive ping. The peer answers with an empty
    /// response; timeout and retry rules apply as to any other call.
    pub fn ping(&self) -> CallBuilder<'_> {
        CallBuilder::new(self, String::new(), true)
    }

    /// Send a request without installing a pending entry: no response is
    /// expected, so no timeout, retry, or callback applies. The peer's
    /// response (if any) matches no pending call and is dropped.
    pub fn notify<T: facet::Facet<'static>>(&self, cmd: &str, msg: &T) {
        if self.is_closed() {
            tracing::trace!(cmd, "rpc: notify on closed connection dropped");
            return;
        }
        let seq = self.next_seq();
        (self.shared.send)(proto::encode(
            seq,
            FrameKind::Request,
            false,
            cmd,
            &codec::to_vec(msg),
        ));
    }

    /// Feed one inbound frame body to the connection.
    ///
    /// An error means the body was not a valid RPC frame; the transport that
    /// produced it should be closed.
    pub fn handle_frame(&self, body: &[u8]) -> Result<(), ProtoError> {
        let frame = proto::decode(body)?;
        match frame.kind {
            FrameKind::Response => self.handle_response(frame.seq, frame.payload),
            FrameKind::Request => self.handle_request(frame.seq, frame.ping, frame.cmd, frame.payload),
        }
        Ok(())
    }

    /// Number of calls currently awaiting a terminal outcome.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the connection down: every pending call fires `on_error(Closed)`
    /// and its timer is released. Later calls fail immediately the same way.
    pub(crate) fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PendingCall> = {
            let mut pending = self.shared.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            call.timer.abort();
            tracing::debug!(cmd = %call.cmd, "rpc: cancelling pending call, connection closed");
            (call.finish)(CallOutcome::Error(RpcError::Closed));
        }
    }

    fn next_seq(&self) -> u32 {
        self.shared.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_response(&self, seq: u32, payload: &[u8]) {
        let call = self.shared.pending.lock().remove(&seq);
        match call {
            Some(call) => {
                call.timer.abort();
                tracing::trace!(seq, cmd = %call.cmd, "rpc: response");
                (call.finish)(CallOutcome::Response(payload.to_vec()));
            }
            // Late response after timeout, or the echo of a notify.
            None => tracing::trace!(seq, "rpc: response matches no pending call"),
        }
    }

    fn handle_request(&self, seq: u32, ping: bool, cmd: &str, payload: &[u8]) {
        if ping {
            tracing::trace!(seq, "rpc: ping");
            (self.shared.send)(proto::encode(seq, FrameKind::Response, true, "", &[]));
            return;
        }
        let rsp = {
            let handlers = self.shared.handlers.lock();
            match handlers.get(cmd) {
                Some(handler) => handler(payload),
                None => {
                    tracing::debug!(cmd, "rpc: no handler for command, dropping request");
                    None
                }
            }
        };
        if let Some(payload) = rsp {
            (self.shared.send)(proto::encode(seq, FrameKind::Response, false, "", &payload));
        }
    }

    fn start_call(
        &self,
        cmd: String,
        payload: Vec<u8>,
        ping: bool,
        timeout_ms: u32,
        retry: i32,
        on_rsp: Option<RspFn>,
        on_timeout: Option<TimeoutFn>,
        on_error: Option<ErrorFn>,
    ) {
        let finish = make_finish(on_rsp, on_timeout, on_error);
        if self.is_closed() {
            tracing::debug!(cmd = %cmd, "rpc: call on closed connection");
            finish(CallOutcome::Error(RpcError::Closed));
            return;
        }

        let seq = self.next_seq();
        let frame = proto::encode(seq, FrameKind::Request, ping, &cmd, &payload);
        tracing::trace!(seq, cmd = %cmd, timeout_ms, retry, "rpc: call");

        let weak = Arc::downgrade(&self.shared);
        let period = Duration::from_millis(u64::from(timeout_ms));
        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(shared) = weak.upgrade() else { return };
                if !retry_or_expire(&shared, seq) {
                    return;
                }
            }
        });

        let call = PendingCall {
            cmd,
            frame: frame.clone(),
            retries_remaining: retry,
            timer,
            finish,
        };
        {
            let mut pending = self.shared.pending.lock();
            // Re-checked under the lock so a concurrent shutdown either sees
            // this entry or we see the closed flag.
            if self.is_closed() {
                drop(pending);
                call.timer.abort();
                (call.finish)(CallOutcome::Error(RpcError::Closed));
                return;
            }
            pending.insert(seq, call);
        }
        (self.shared.send)(frame);
    }
}

/// Timer tick for one pending call. Returns true when the timer should keep
/// running (a retransmission happened).
fn retry_or_expire(shared: &Arc<Shared>, seq: u32) -> bool {
    let mut pending = shared.pending.lock();
    let resend = match pending.get_mut(&seq) {
        // Completed (or cancelled) while the timer was firing.
        None => return false,
        Some(call) => {
            if call.retries_remaining != 0 {
                if call.retries_remaining > 0 {
                    call.retries_remaining -= 1;
                }
                tracing::debug!(seq, cmd = %call.cmd, "rpc: call timed out, retransmitting");
                Some(call.frame.clone())
            } else {
                None
            }
        }
    };
    match resend {
        Some(frame) => {
            drop(pending);
            (shared.send)(frame);
            true
        }
        None => {
            let call = pending.remove(&seq);
            drop(pending);
            if let Some(call) = call {
                tracing::debug!(seq, cmd = %call.cmd, "rpc: call timed out");
                (call.finish)(CallOutcome::Timeout);
            }
            false
        }
    }
}

fn make_finish(
    on_rsp: Option<RspFn>,
    on_timeout: Option<TimeoutFn>,
    on_error: Option<ErrorFn>,
) -> FinishFn {
    Box::new(move |outcome| match outcome {
        CallOutcome::Response(payload) => {
            if let Some(rsp) = on_rsp {
                if let Err(e) = rsp(payload) {
                    match on_error {
                        Some(f) => f(e),
                        None => tracing::warn!(error = %e, "rpc: response dropped"),
                    }
                }
            }
        }
        CallOutcome::Timeout => {
            if let Some(f) = on_timeout {
                f();
            }
        }
        CallOutcome::Error(e) => match on_error {
            Some(f) => f(e),
            None => tracing::debug!(error = %e, "rpc: call failed"),
        },
    })
}

/// Builder for one outbound call.
///
/// Terminal callbacks are all optional; whichever of response / timeout /
/// error occurs first fires its callback (if set) exactly once.
#[must_use = "a call builder does nothing until call() is invoked"]
pub struct CallBuilder<'a> {
    rpc: &'a Rpc,
    cmd: String,
    payload: Vec<u8>,
    ping: bool,
    timeout_ms: u32,
    retry: i32,
    on_rsp: Option<RspFn>,
    on_timeout: Option<TimeoutFn>,
    on_error: Option<ErrorFn>,
}

impl<'a> CallBuilder<'a> {
    fn new(rpc: &'a Rpc, cmd: String, ping: bool) -> Self {
        Self {
            cmd,
            payload: Vec::new(),
            ping,
            timeout_ms: rpc.shared.config.call_timeout_ms,
            retry: rpc.shared.config.retry_count,
            on_rsp: None,
            on_timeout: None,
            on_error: None,
            rpc,
        }
    }

    /// Attach the request payload.
    pub fn msg<T: facet::Facet<'static>>(mut self, value: &T) -> Self {
        self.payload = codec::to_vec(value);
        self
    }

    /// Override the per-call timeout.
    pub fn timeout(mut self, ms: u32) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Override the retry count. `-1` retries forever; each retransmission
    /// reuses the original sequence number.
    pub fn retry(mut self, count: i32) -> Self {
        self.retry = count;
        self
    }

    /// Set the response callback. The response payload is decoded as `R`;
    /// a decode failure is routed to the error callback instead.
    pub fn rsp<R, F>(mut self, f: F) -> Self
    where
        R: for<'de> facet::Facet<'de> + 'static,
        F: FnOnce(R) + Send + 'static,
    {
        self.on_rsp = Some(Box::new(move |payload: Vec<u8>| {
            let value = codec::from_slice::<R>(&payload).map_err(RpcError::Decode)?;
            f(value);
            Ok(())
        }));
        self
    }

    /// Set the timeout callback, fired once retries are exhausted.
    pub fn on_timeout(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    /// Set the error callback (connection closed, response decode failure).
    pub fn on_error(mut self, f: impl FnOnce(RpcError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Send the request. Dropping the builder without calling this is a
    /// no-op.
    pub fn call(self) {
        let Self {
            rpc,
            cmd,
            payload,
            ping,
            timeout_ms,
            retry,
            on_rsp,
            on_timeout,
            on_error,
        } = self;
        rpc.start_call(
            cmd, payload, ping, timeout_ms, retry, on_rsp, on_timeout, on_error,
        );
    }
}
