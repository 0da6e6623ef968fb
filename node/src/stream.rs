//! Shared video streaming.
//!
//! Each device publishes a TCP stream of length-prefixed frames (8-byte
//! little-endian size, then the frame payload containing a JPEG). Opening
//! one upstream connection per viewer would exhaust the device's file
//! descriptors, so a [`StreamManager`] owns at most one upstream socket per
//! device and fans frames out to any number of subscribers through bounded
//! queues. A slow subscriber only loses its own frames; it never stalls the
//! broadcaster or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ScanError;

/// Frames buffered per subscriber before the broadcaster starts dropping.
const SUBSCRIBER_QUEUE_FRAMES: usize = 10;
/// How long a subscriber waits on its queue before re-checking liveness.
const SUBSCRIBER_RECV_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the upstream stays open after the last subscriber leaves.
const IDLE_TEARDOWN_GRACE: Duration = Duration::from_secs(30);
/// Upper bound on a single frame; anything bigger means a desynced stream.
const MAX_FRAME_BYTES: u64 = 32 * 1024 * 1024;

/// `None` is the end-of-stream sentinel.
type FrameMessage = Option<Arc<Vec<u8>>>;

/// Multi-client fan-out over one upstream frame socket.
#[derive(Clone, Debug)]
pub struct StreamManager {
    inner: Arc<StreamInner>,
}

#[derive(Debug)]
struct StreamInner {
    addr: String,
    device_id: String,
    running: AtomicBool,
    state: Mutex<StreamState>,
}

#[derive(Default, Debug)]
struct StreamState {
    subscribers: HashMap<u64, mpsc::Sender<FrameMessage>>,
    next_subscriber_id: u64,
    broadcaster: Option<tokio::task::JoinHandle<()>>,
}

/// One viewer's handle on the shared stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct StreamSubscriber {
    id: u64,
    rx: mpsc::Receiver<FrameMessage>,
    manager: StreamManager,
}

impl StreamManager {
    pub fn new(ip: &str, port: u16, device_id: &str) -> Self {
        StreamManager {
            inner: Arc::new(StreamInner {
                addr: format!("{ip}:{port}"),
                device_id: device_id.to_string(),
                running: AtomicBool::new(false),
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    /// Attach a new subscriber, lazily (re)establishing the upstream
    /// connection and broadcaster when there is none or it has died.
    pub async fn subscribe(&self) -> Result<StreamSubscriber, ScanError> {
        let mut state = self.inner.state.lock().await;

        let broadcaster_alive = self.inner.running.load(Ordering::SeqCst)
            && state
                .broadcaster
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false);

        if !broadcaster_alive {
            if state.broadcaster.is_some() {
                info!(
                    device = %self.inner.device_id,
                    upstream = %self.inner.addr,
                    "Stream connection needs restart"
                );
            }
            let socket = TcpStream::connect(&self.inner.addr)
                .await
                .map_err(|e| ScanError::Network {
                    url: self.inner.addr.clone(),
                    message: e.to_string(),
                })?;
            socket.set_nodelay(true).ok();

            self.inner.running.store(true, Ordering::SeqCst);
            let inner = Arc::clone(&self.inner);
            state.broadcaster = Some(tokio::spawn(broadcast_loop(inner, socket)));
            info!(
                device = %self.inner.device_id,
                upstream = %self.inner.addr,
                "Started shared streaming connection"
            );
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_FRAMES);
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, tx);
        info!(device = %self.inner.device_id, subscriber = id, "New streaming client connected");

        Ok(StreamSubscriber {
            id,
            rx,
            manager: self.clone(),
        })
    }

    /// Tear everything down: close the upstream and signal end-of-stream to
    /// every subscriber.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if let Some(handle) = state.broadcaster.take() {
            handle.abort();
        }
        for tx in state.subscribers.values() {
            let _ = tx.try_send(None);
        }
        state.subscribers.clear();
    }

    /// Number of currently attached subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.state.lock().await.subscribers.len()
    }

    async fn remove_subscriber(&self, id: u64) {
        let mut state = self.inner.state.lock().await;
        state.subscribers.remove(&id);
        info!(device = %self.inner.device_id, subscriber = id, "Streaming client disconnected");

        if state.subscribers.is_empty() && self.inner.running.load(Ordering::SeqCst) {
            // Keep the upstream warm for a grace period in case another
            // viewer attaches right away.
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(IDLE_TEARDOWN_GRACE).await;
                let mut state = manager.inner.state.lock().await;
                if state.subscribers.is_empty()
                    && manager.inner.running.load(Ordering::SeqCst)
                {
                    info!(
                        device = %manager.inner.device_id,
                        "No streaming clients left, closing shared connection"
                    );
                    manager.inner.running.store(false, Ordering::SeqCst);
                    if let Some(handle) = state.broadcaster.take() {
                        handle.abort();
                    }
                }
            });
        }
    }
}

impl StreamSubscriber {
    /// Next pre-formatted MJPEG part, or `None` when the stream ends.
    pub async fn next_part(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match tokio::time::timeout(SUBSCRIBER_RECV_TIMEOUT, self.rx.recv()).await {
                Ok(Some(Some(part))) => return Some(part),
                // Explicit sentinel or closed channel: stream over.
                Ok(Some(None)) | Ok(None) => return None,
                Err(_) => {
                    if !self.manager.inner.running.load(Ordering::SeqCst) {
                        return None;
                    }
                    // Broadcaster still alive, keep waiting.
                }
            }
        }
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.remove_subscriber(id).await;
            });
        }
    }
}

/// Read length-prefixed frames off the upstream socket and enqueue the
/// formatted MJPEG part to every subscriber. Any read error ends the loop;
/// the next subscribe() restarts it.
async fn broadcast_loop(inner: Arc<StreamInner>, mut socket: TcpStream) {
    let mut len_buf = [0u8; 8];

    loop {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = socket.read_exact(&mut len_buf).await {
            debug!(device = %inner.device_id, error = %e, "Upstream stream closed");
            break;
        }
        let size = u64::from_le_bytes(len_buf);
        if size == 0 || size > MAX_FRAME_BYTES {
            warn!(device = %inner.device_id, size, "Implausible frame size, dropping stream");
            break;
        }

        let mut payload = vec![0u8; size as usize];
        if let Err(e) = socket.read_exact(&mut payload).await {
            debug!(device = %inner.device_id, error = %e, "Upstream read failed mid-frame");
            break;
        }

        let part = Arc::new(mjpeg_part(extract_jpeg(&payload)));

        let mut state = inner.state.lock().await;
        let mut disconnected = Vec::new();
        for (id, tx) in &state.subscribers {
            match tx.try_send(Some(part.clone())) {
                Ok(()) => {}
                // Queue full: drop this frame for this client only.
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => disconnected.push(*id),
            }
        }
        for id in disconnected {
            state.subscribers.remove(&id);
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    let state = inner.state.lock().await;
    for tx in state.subscribers.values() {
        let _ = tx.try_send(None);
    }
    debug!(device = %inner.device_id, "Streaming broadcast loop ended");
}

/// Slice the JPEG out of a frame payload. Device-side producers wrap the
/// JPEG in a serialisation envelope; the image itself is delimited by the
/// JPEG start/end markers. Payloads without markers pass through untouched.
fn extract_jpeg(payload: &[u8]) -> &[u8] {
    let start = payload
        .windows(2)
        .position(|w| w == [0xFF, 0xD8])
        .unwrap_or(0);
    let end = payload
        .windows(2)
        .rposition(|w| w == [0xFF, 0xD9])
        .map(|p| p + 2)
        .unwrap_or(payload.len());
    if start < end {
        &payload[start..end]
    } else {
        payload
    }
}

/// Format one multipart MJPEG part around the JPEG bytes.
fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part =
        Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type:image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
