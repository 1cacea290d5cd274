//! Viewer registry and the WebSocket server that fills it.
//!
//! Every accepted connection first receives the binary [`Handshake`], then
//! joins the registry with a bounded chunk queue.  The relay only offers
//! chunks to the queues; membership changes happen here, when a viewer's
//! session ends for any reason.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use plantcam_common::protocol::Handshake;

pub type ViewerId = u64;

/// Upper bound on the closing frame to a viewer that may not be reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of offering one chunk to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The viewer already disconnected; expected, not a fault.
    Gone,
    /// The viewer's queue was full; it has been told to leave.
    Evicted,
}

/// Per-chunk tally returned by [`ViewerRegistry::broadcast`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub gone: usize,
    pub evicted: usize,
}

struct ViewerSlot {
    tx: mpsc::Sender<Bytes>,
    evict: CancellationToken,
}

impl ViewerSlot {
    fn offer(&self, chunk: &Bytes) -> Delivery {
        if self.evict.is_cancelled() {
            return Delivery::Evicted;
        }
        match self.tx.try_send(chunk.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict.cancel();
                Delivery::Evicted
            }
        }
    }
}

/// Live set of connected viewers.
pub struct ViewerRegistry {
    viewers: Mutex<HashMap<ViewerId, ViewerSlot>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl ViewerRegistry {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            viewers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        })
    }

    /// Add a viewer. It stays registered until the returned lease is dropped.
    pub fn register(self: &Arc<Self>) -> ViewerLease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let evict = CancellationToken::new();
        self.lock().insert(
            id,
            ViewerSlot {
                tx,
                evict: evict.clone(),
            },
        );
        ViewerLease {
            id,
            rx,
            evict,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `chunk` to every registered viewer without blocking.
    pub fn broadcast(&self, chunk: &Bytes) -> BroadcastReport {
        let viewers = self.lock();
        let mut report = BroadcastReport::default();
        for (id, slot) in viewers.iter() {
            match slot.offer(chunk) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Gone => report.gone += 1,
                Delivery::Evicted => {
                    if report.evicted == 0 {
                        debug!("Viewer {id} cannot keep up");
                    }
                    report.evicted += 1;
                }
            }
        }
        report
    }

    /// Ask every viewer to leave.
    pub fn close_all(&self) {
        for slot in self.lock().values() {
            slot.evict.cancel();
        }
    }

    fn deregister(&self, id: ViewerId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ViewerId, ViewerSlot>> {
        self.viewers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registration handle held by a viewer session.
pub struct ViewerLease {
    id: ViewerId,
    rx: mpsc::Receiver<Bytes>,
    evict: CancellationToken,
    registry: Arc<ViewerRegistry>,
}

impl ViewerLease {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Next queued chunk, in broadcast order.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Fires when the relay or the server asks this viewer to leave.
    pub fn eviction(&self) -> CancellationToken {
        self.evict.clone()
    }

    /// Stop accepting chunks while staying registered, like a session that
    /// is tearing down.
    #[cfg(test)]
    pub(crate) fn close_queue(&mut self) {
        self.rx.close();
    }
}

impl Drop for ViewerLease {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

// ── socket server ────────────────────────────────────────────────────────

/// Shared state for the WebSocket handler.
#[derive(Clone)]
pub struct SocketState {
    pub registry: Arc<ViewerRegistry>,
    pub handshake: Handshake,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

/// Serve viewer connections on `listener` until `state.shutdown` fires.
///
/// Any path upgrades to a viewer socket.  Viewer sessions are spawned on
/// `state.tracker` so the caller can wait for them to finish.
pub async fn serve(listener: TcpListener, state: SocketState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let registry = state.registry.clone();
    let app = Router::new().fallback(ws_upgrade).with_state(state);

    if let Ok(addr) = listener.local_addr() {
        info!("Socket server listening on {addr}");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    registry.close_all();
    info!("Socket server stopped");
    Ok(())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<SocketState>,
) -> Response {
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| tracker.track_future(viewer_session(socket, peer, state)))
}

async fn viewer_session(mut socket: WebSocket, peer: SocketAddr, state: SocketState) {
    let header = Bytes::copy_from_slice(&state.handshake.encode());
    tokio::select! {
        sent = socket.send(Message::Binary(header)) => if let Err(e) = sent {
            debug!("Viewer {peer} left before the handshake: {e}");
            return;
        },
        _ = state.shutdown.cancelled() => return,
    }

    let mut lease = state.registry.register();
    let evicted = lease.eviction();
    info!(
        "Viewer {} connected from {peer} ({} watching)",
        lease.id(),
        state.registry.len()
    );

    // Sends are raced against eviction and shutdown: a client that stops
    // reading blocks the send, not the session.
    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break "server shutdown",
            _ = evicted.cancelled() => break "evicted",
            chunk = lease.recv() => match chunk {
                Some(chunk) => tokio::select! {
                    sent = socket.send(Message::Binary(chunk)) => if sent.is_err() {
                        break "send failed";
                    },
                    _ = evicted.cancelled() => break "evicted",
                    _ = state.shutdown.cancelled() => break "server shutdown",
                },
                None => break "queue closed",
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break "closed by client",
                Some(Err(_)) => break "receive error",
                Some(Ok(_)) => {}
            },
        }
    };

    let id = lease.id();
    drop(lease);
    if reason == "evicted" {
        warn!("Viewer {id} ({peer}) evicted: too slow to keep up");
    } else {
        info!("Viewer {id} ({peer}) disconnected: {reason}");
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, socket.send(Message::Close(None))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn test_register_and_drop_lease() {
        let registry = ViewerRegistry::new(4);
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_queue_evicts_only_that_viewer() {
        let registry = ViewerRegistry::new(2);
        let mut fast = registry.register();
        let slow = registry.register();

        for i in 0..5u8 {
            let report = registry.broadcast(&Bytes::from(vec![i]));
            assert_eq!(report.delivered + report.evicted, 2);
            // Keep the fast viewer drained.
            assert_eq!(fast.try_recv().as_deref(), Some(&[i][..]));
        }
        assert!(slow.eviction().is_cancelled());
        assert!(!fast.eviction().is_cancelled());
    }

    #[test]
    fn test_closed_viewer_is_gone_not_fatal() {
        let registry = ViewerRegistry::new(4);
        let mut alive = registry.register();
        let mut dead = registry.register();

        // A session whose receiver closed but has not deregistered yet.
        dead.close_queue();

        let report = registry.broadcast(&Bytes::from_static(b"x"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.gone, 1);
        assert_eq!(alive.try_recv().as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn test_handshake_precedes_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ViewerRegistry::new(8);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let state = SocketState {
            registry: registry.clone(),
            handshake: Handshake::new(640, 480),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        let server = tokio::spawn(serve(listener, state));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let WsMessage::Binary(first) = first else {
            panic!("handshake must be binary, got {first:?}");
        };
        assert_eq!(Handshake::decode(&first), Some(Handshake::new(640, 480)));

        // Registration happens right after the handshake is sent.
        while registry.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        registry.broadcast(&Bytes::from_static(b"chunk-1"));
        registry.broadcast(&Bytes::from_static(b"chunk-2"));

        for expected in [&b"chunk-1"[..], &b"chunk-2"[..]] {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => assert_eq!(&data[..], expected),
                other => panic!("unexpected message {other:?}"),
            }
        }

        shutdown.cancel();
        server.await.unwrap().unwrap();
        tracker.close();
        tracker.wait().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_and_dropped_viewers_do_not_hold_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ViewerRegistry::new(4);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let state = SocketState {
            registry: registry.clone(),
            handshake: Handshake::new(640, 480),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        let server = tokio::spawn(serve(listener, state));
        let url = format!("ws://{addr}/");

        let (mut healthy, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        // Connected but never read from again.
        let (_stalled, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (dropped, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let header = healthy.next().await.unwrap().unwrap();
        assert!(matches!(header, WsMessage::Binary(_)));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.len() < 3 {
            assert!(tokio::time::Instant::now() < deadline, "viewers never registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(dropped);

        // Far more than loopback socket buffers hold, so the stalled
        // session's sends block.
        for i in 0..64u8 {
            let chunk = Bytes::from(vec![i; 1 << 20]);
            registry.broadcast(&chunk);
            let next = tokio::time::timeout(Duration::from_secs(5), healthy.next())
                .await
                .expect("healthy viewer starved")
                .unwrap()
                .unwrap();
            match next {
                WsMessage::Binary(data) => assert_eq!(data[..], chunk[..], "chunk {i}"),
                other => panic!("unexpected message {other:?}"),
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.len() > 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} viewers still registered",
                registry.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        server.await.unwrap().unwrap();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(3), tracker.wait())
            .await
            .expect("viewer sessions outlived shutdown");
        assert!(registry.is_empty());
    }
}
