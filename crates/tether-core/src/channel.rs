//! Framed stream channels.
//!
//! A [`FramedChannel`] wraps a connected byte stream and turns it into a
//! message stream. In packed mode every outbound message is prefixed with a
//! `u32 LE` body length and inbound frames are reassembled through a
//! header → body → deliver loop, with bodies bounded by
//! [`ChannelConfig::max_body_size`]. In raw mode bytes pass through untouched.
//!
//! The channel owns the stream through two tasks: a writer draining a send
//! queue (completed writes keep submission order) and a reader feeding
//! `on_data`. Reading does not begin until [`FramedChannel::start`] so that
//! callers can install callbacks first. `on_close` fires exactly once, after
//! the final `on_data` delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::config::ChannelConfig;
use crate::error::ChannelError;

/// Read buffer size for raw-mode channels.
const RAW_READ_BUF: usize = 16 * 1024;

/// Buffer size for in-memory channel pairs.
const PAIR_BUF: usize = 64 * 1024;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type DataFn = Box<dyn FnMut(Vec<u8>) + Send>;
type CloseFn = Box<dyn FnOnce() + Send>;

enum WriteOp {
    Frame(Vec<u8>),
    Shutdown,
}

/// A framed (or raw) message channel over a byte stream.
///
/// Cheap to clone; all clones share the underlying stream. The channel stays
/// open until the peer disconnects, a transport or framing error occurs, or
/// [`close`](Self::close) is called, whichever comes first.
#[derive(Clone)]
pub struct FramedChannel {
    shared: Arc<Shared>,
}

struct Shared {
    config: ChannelConfig,
    tx: mpsc::UnboundedSender<WriteOp>,
    open: AtomicBool,
    started: AtomicBool,
    close_fired: AtomicBool,
    /// Set to interrupt the reader/writer tasks.
    shutdown_tx: watch::Sender<bool>,
    /// Set once the close path has completed (after `on_close`).
    closed_tx: watch::Sender<bool>,
    on_data: Mutex<Option<DataFn>>,
    on_close: Mutex<Option<CloseFn>>,
    /// Read half, parked here between construction and `start`.
    reader: Mutex<Option<BoxReader>>,
}

impl FramedChannel {
    /// Wrap a connected stream.
    ///
    /// The write task starts immediately so `send` works from the moment of
    /// construction (writes are queued). Call [`start`](Self::start) after
    /// installing callbacks to begin reading.
    pub fn new<S>(stream: S, config: ChannelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            tx,
            open: AtomicBool::new(true),
            started: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            shutdown_tx,
            closed_tx,
            on_data: Mutex::new(None),
            on_close: Mutex::new(None),
            reader: Mutex::new(Some(Box::new(reader))),
        });

        tokio::spawn(run_writer(shared.clone(), Box::new(writer), rx));
        Self { shared }
    }

    /// Create a connected in-memory channel pair (for tests and in-process
    /// wiring). Built on `tokio::io::duplex`.
    pub fn pair(config: ChannelConfig) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_BUF);
        (Self::new(a, config.clone()), Self::new(b, config))
    }

    /// Install the inbound message callback. Packed mode delivers exactly one
    /// complete frame body per invocation; raw mode delivers whatever chunk
    /// the transport returned.
    pub fn on_data(&self, f: impl FnMut(Vec<u8>) + Send + 'static) {
        *self.shared.on_data.lock() = Some(Box::new(f));
    }

    /// Install the close callback. Fires exactly once, after the final
    /// `on_data` delivery, regardless of what closed the channel.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.shared.on_close.lock() = Some(Box::new(f));
    }

    /// Begin reading from the stream. Callbacks registered after this point
    /// may miss inbound data.
    pub fn start(&self) {
        let reader = self.shared.reader.lock().take();
        let Some(reader) = reader else {
            tracing::debug!("channel: start called more than once");
            return;
        };
        if !self.is_open() {
            return;
        }
        self.shared.started.store(true, Ordering::Release);
        tokio::spawn(run_reader(self.shared.clone(), reader));
    }

    /// Queue a message for sending. In packed mode the body is prefixed with
    /// its `u32 LE` length on the wire. Sending on a closed channel is a
    /// no-op.
    pub fn send(&self, body: impl Into<Vec<u8>>) {
        if !self.is_open() {
            tracing::trace!("channel: send on closed channel dropped");
            return;
        }
        let _ = self.shared.tx.send(WriteOp::Frame(body.into()));
    }

    /// Close the channel. Queued but unwritten messages are dropped and
    /// `on_close` fires (once).
    pub fn close(&self) {
        self.shared.initiate_close();
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Wait until the channel has fully closed (`on_close` has fired).
    ///
    /// Infrastructure-side companion to the `on_close` callback slot; returns
    /// immediately if the channel is already closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Shared {
    /// Begin tearing the channel down from any task or caller.
    fn initiate_close(&self) {
        self.open.store(false, Ordering::Release);
        self.shutdown_tx.send_replace(true);
        // With no reader running there is nobody else to finish the close.
        if !self.started.load(Ordering::Acquire) {
            self.finish_close();
        }
    }

    /// Terminal close path: stop the writer, fire `on_close` once, publish
    /// the closed signal. Also drops `on_data` so closures held by the
    /// channel cannot keep a session alive past close.
    fn finish_close(&self) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        let _ = self.tx.send(WriteOp::Shutdown);
        self.shutdown_tx.send_replace(true);
        self.on_data.lock().take();
        let on_close = self.on_close.lock().take();
        if let Some(f) = on_close {
            f();
        }
        self.closed_tx.send_replace(true);
    }

    fn deliver(&self, body: Vec<u8>) {
        let mut guard = self.on_data.lock();
        if let Some(f) = guard.as_mut() {
            f(body);
        } else {
            tracing::trace!(len = body.len(), "channel: inbound data with no on_data handler");
        }
    }
}

async fn run_reader(shared: Arc<Shared>, mut reader: BoxReader) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let res = if shared.config.auto_pack {
        read_packed(&shared, &mut reader, &mut shutdown_rx).await
    } else {
        read_raw(&shared, &mut reader, &mut shutdown_rx).await
    };
    match res {
        Ok(()) => tracing::debug!("channel: peer closed"),
        Err(ChannelError::Closed) => tracing::debug!("channel: closed locally"),
        Err(e) => tracing::warn!(error = %e, "channel: closing after error"),
    }
    shared.finish_close();
}

/// Packed-mode read loop: `ReadHeader -> ReadBody -> Deliver`, repeated. A
/// partial frame is never delivered.
async fn read_packed(
    shared: &Arc<Shared>,
    reader: &mut BoxReader,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    let mut header = [0u8; 4];
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|s| *s) => return Err(ChannelError::Closed),
            res = reader.read_exact(&mut header) => match res {
                Ok(_) => {}
                // EOF on a frame boundary is a clean peer close.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            },
        }

        let len = u32::from_le_bytes(header);
        if len > shared.config.max_body_size {
            return Err(ChannelError::Oversize {
                len,
                max: shared.config.max_body_size,
            });
        }

        let mut body = vec![0u8; len as usize];
        if len > 0 {
            tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|s| *s) => return Err(ChannelError::Closed),
                res = reader.read_exact(&mut body) => { res?; }
            }
        }

        if !shared.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        shared.deliver(body);
    }
}

async fn read_raw(
    shared: &Arc<Shared>,
    reader: &mut BoxReader,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    let mut buf = vec![0u8; RAW_READ_BUF];
    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|s| *s) => return Err(ChannelError::Closed),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(());
        }
        if !shared.open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        shared.deliver(buf[..n].to_vec());
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut writer: BoxWriter,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let op = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|s| *s) => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let body = match op {
            WriteOp::Frame(body) => body,
            WriteOp::Shutdown => break,
        };
        let res = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|s| *s) => break,
            res = write_frame(shared.config.auto_pack, &mut writer, &body) => res,
        };
        if let Err(e) = res {
            tracing::debug!(error = %e, "channel: write failed");
            shared.initiate_close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame(
    auto_pack: bool,
    writer: &mut BoxWriter,
    body: &[u8],
) -> std::io::Result<()> {
    if auto_pack {
        writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    }
    writer.write_all(body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn collect(channel: &FramedChannel) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = unbounded_channel();
        channel.on_data(move |body| {
            let _ = tx.send(body);
        });
        rx
    }

    #[tokio::test]
    async fn packed_roundtrip() {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        let mut rx = collect(&b);
        a.start();
        b.start();

        a.send(b"hello".to_vec());
        a.send(Vec::new());
        a.send(b"world".to_vec());

        assert_eq!(rx.recv().await.unwrap(), b"hello");
        assert_eq!(rx.recv().await.unwrap(), b"");
        assert_eq!(rx.recv().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn packed_preserves_order() {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        let mut rx = collect(&b);
        a.start();
        b.start();

        for i in 0..1000u32 {
            a.send(i.to_string().into_bytes());
        }
        for i in 0..1000u32 {
            assert_eq!(rx.recv().await.unwrap(), i.to_string().into_bytes());
        }
    }

    #[tokio::test]
    async fn raw_passthrough() {
        let (a, b) = FramedChannel::pair(ChannelConfig::default());
        let mut rx = collect(&b);
        a.start();
        b.start();

        a.send(b"raw bytes".to_vec());
        let mut got = Vec::new();
        while got.len() < 9 {
            got.extend(rx.recv().await.unwrap());
        }
        assert_eq!(got, b"raw bytes");
    }

    #[tokio::test]
    async fn oversize_frame_closes_channel() {
        let config = ChannelConfig::packed().with_max_body_size(16);
        let (a, b) = FramedChannel::pair(config);
        let data_seen = Arc::new(AtomicUsize::new(0));
        let seen = data_seen.clone();
        b.on_data(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        b.on_close(move || {
            let _ = close_tx.send(());
        });
        a.start();
        b.start();

        a.send(vec![0u8; 17]);

        tokio::time::timeout(Duration::from_secs(5), close_rx)
            .await
            .expect("close not observed")
            .unwrap();
        assert_eq!(data_seen.load(Ordering::SeqCst), 0);
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn peer_close_fires_on_close_exactly_once() {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        b.on_close(move || {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        a.start();
        b.start();

        a.close();
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        // A second close on either side must not re-fire the callback.
        b.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_on_closed_channel_is_noop() {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        a.start();
        b.start();
        a.close();
        a.closed().await;
        a.send(b"dropped".to_vec());
        assert!(!a.is_open());
    }

    #[tokio::test]
    async fn close_before_start_still_fires_on_close() {
        let (a, _b) = FramedChannel::pair(ChannelConfig::packed());
        let (tx, rx) = tokio::sync::oneshot::channel();
        a.on_close(move || {
            let _ = tx.send(());
        });
        a.close();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn data_received_before_close_is_delivered_first() {
        let (a, b) = FramedChannel::pair(ChannelConfig::packed());
        let (tx, mut rx) = unbounded_channel();
        let data_tx = tx.clone();
        b.on_data(move |body| {
            let _ = data_tx.send(body);
        });
        b.on_close(move || {
            let _ = tx.send(b"<closed>".to_vec());
        });
        a.start();
        b.start();

        a.send(b"last words".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"last words");
        a.close();
        assert_eq!(rx.recv().await.unwrap(), b"<closed>");
    }
}
