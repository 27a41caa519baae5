//! Secondary destination fan-out
//!
//! Mirrors the primary stream's encoded output to zero or more extra
//! publish targets. Each destination runs its own task with its own
//! cancellation token; a slow or failed destination never blocks or
//! fails the primary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FanoutConfig;
use crate::engine::{DestinationConnector, EncodedFrame};
use crate::events::{Notifier, SessionEvent};

/// Externally visible state of one secondary destination
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    pub uri: String,
    pub connected: bool,
    /// Frames dropped because the destination's queue was full
    pub dropped: u64,
}

struct SecondaryDestination {
    uri: String,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    frames: mpsc::Sender<EncodedFrame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SecondaryDestination {
    fn shutdown(self) {
        self.cancel.cancel();
        // The task closes its sink on cancellation; aborting would skip that
        drop(self.task);
    }
}

pub struct FanoutManager {
    connector: Arc<dyn DestinationConnector>,
    settle: Duration,
    queue_depth: usize,
    notifier: Notifier,
    urls: Vec<String>,
    destinations: Vec<SecondaryDestination>,
}

impl FanoutManager {
    pub fn new(connector: Arc<dyn DestinationConnector>, config: &FanoutConfig, notifier: Notifier) -> Self {
        Self {
            connector,
            settle: config.settle(),
            queue_depth: config.queue_depth.max(1),
            notifier,
            urls: Vec::new(),
            destinations: Vec::new(),
        }
    }

    /// Replace the destination set. Connects after the settle delay when
    /// the primary is live, otherwise waits for [`Self::on_primary_active`].
    pub fn start(&mut self, urls: &[String], primary_active: bool) {
        self.disconnect();

        let mut cleaned: Vec<String> = Vec::new();
        for url in urls {
            let url = url.trim();
            if url.is_empty() || cleaned.iter().any(|known| known == url) {
                continue;
            }
            cleaned.push(url.to_string());
        }
        self.urls = cleaned;

        info!("Fan-out set to {} destination(s)", self.urls.len());
        if primary_active {
            self.connect_all();
        } else if !self.urls.is_empty() {
            debug!("Primary not live yet; deferring secondary connections");
        }
    }

    /// Disconnect and forget every destination
    pub fn stop(&mut self) {
        self.disconnect();
        if !self.urls.is_empty() {
            info!("Fan-out stopped");
        }
        self.urls.clear();
    }

    /// Tear down connections but remember the set, e.g. while backgrounded
    pub fn disconnect(&mut self) {
        for destination in self.destinations.drain(..) {
            debug!("Disconnecting secondary {}", destination.uri);
            destination.shutdown();
        }
    }

    /// The primary reached Active; connect any configured destinations
    /// that are not already running.
    pub fn on_primary_active(&mut self) {
        if self.destinations.is_empty() && !self.urls.is_empty() {
            self.connect_all();
        }
    }

    pub fn on_session_stopped(&mut self) {
        self.stop();
    }

    /// Offer one encoded unit to every connected destination without
    /// blocking. Returns how many destinations accepted it.
    pub fn offer(&self, frame: &EncodedFrame) -> usize {
        let mut accepted = 0;
        for destination in &self.destinations {
            if !destination.connected.load(Ordering::Relaxed) {
                continue;
            }
            match destination.frames.try_send(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    destination.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        accepted
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn statuses(&self) -> Vec<DestinationStatus> {
        self.urls
            .iter()
            .map(|uri| {
                let running = self.destinations.iter().find(|d| &d.uri == uri);
                DestinationStatus {
                    uri: uri.clone(),
                    connected: running
                        .map(|d| d.connected.load(Ordering::Relaxed))
                        .unwrap_or(false),
                    dropped: running
                        .map(|d| d.dropped.load(Ordering::Relaxed))
                        .unwrap_or(0),
                }
            })
            .collect()
    }

    fn connect_all(&mut self) {
        let urls = self.urls.clone();
        for uri in urls {
            let destination = self.spawn_destination(uri);
            self.destinations.push(destination);
        }
    }

    fn spawn_destination(&self, uri: String) -> SecondaryDestination {
        let (tx, mut rx) = mpsc::channel::<EncodedFrame>(self.queue_depth);
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task_uri = uri.clone();
        let task_connected = connected.clone();
        let token = cancel.clone();
        let connector = self.connector.clone();
        let notifier = self.notifier.clone();
        let settle = self.settle;

        let task = tokio::spawn(async move {
            let uri = task_uri;

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }

            let connecting = connector.connect(&uri);
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = connecting => result,
            };

            let mut sink = match result {
                Ok(sink) => sink,
                Err(e) => {
                    warn!("Secondary {} failed to connect: {}", uri, e);
                    notifier.notify(SessionEvent::DestinationFailed {
                        uri,
                        msg: e.to_string(),
                    });
                    return;
                }
            };

            info!("Secondary {} connected", uri);
            task_connected.store(true, Ordering::Relaxed);
            notifier.notify(SessionEvent::DestinationConnected { uri: uri.clone() });

            loop {
                let frame = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else {
                    break;
                };
                if let Err(e) = sink.send(&frame).await {
                    warn!("Secondary {} send failed: {}", uri, e);
                    notifier.notify(SessionEvent::DestinationFailed {
                        uri: uri.clone(),
                        msg: e.to_string(),
                    });
                    break;
                }
            }

            task_connected.store(false, Ordering::Relaxed);
            sink.close();
            debug!("Secondary {} task finished", uri);
        });

        SecondaryDestination {
            uri,
            connected,
            dropped: Arc::new(AtomicU64::new(0)),
            frames: tx,
            cancel,
            task,
        }
    }
}

impl Drop for FanoutManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackConnector;
    use crate::engine::FrameKind;
    use crate::events::EventBridge;
    use tokio::sync::broadcast;

    fn frame(pts_us: u64) -> EncodedFrame {
        EncodedFrame {
            kind: FrameKind::Video,
            pts_us,
            key_frame: pts_us == 0,
            data: Arc::from(vec![0u8; 16]),
        }
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_destination_is_reported_and_others_connect() {
        let bridge = EventBridge::new(32);
        let mut rx = bridge.subscribe();
        let connector = LoopbackConnector::new().failing(["rtmp://bad/live"]);
        let mut fanout = FanoutManager::new(
            Arc::new(connector.clone()),
            &FanoutConfig::default(),
            bridge.notifier(),
        );

        let start = tokio::time::Instant::now();
        fanout.start(&urls(&["rtmp://bad/live", "rtmp://good/live"]), true);

        let mut failed = None;
        let mut connected = None;
        for _ in 0..2 {
            match next_event(&mut rx).await {
                SessionEvent::DestinationFailed { uri, .. } => failed = Some(uri),
                SessionEvent::DestinationConnected { uri } => connected = Some(uri),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert_eq!(failed.as_deref(), Some("rtmp://bad/live"));
        assert_eq!(connected.as_deref(), Some("rtmp://good/live"));

        assert_eq!(fanout.offer(&frame(0)), 1);
        let statuses = fanout.statuses();
        assert!(!statuses[0].connected);
        assert!(statuses[1].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connections_wait_for_primary() {
        let bridge = EventBridge::new(32);
        let mut rx = bridge.subscribe();
        let mut fanout = FanoutManager::new(
            Arc::new(LoopbackConnector::new()),
            &FanoutConfig::default(),
            bridge.notifier(),
        );

        fanout.start(&urls(&["rtmp://a/live", " ", "rtmp://a/live"]), false);
        assert_eq!(fanout.urls().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        fanout.on_primary_active();
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::DestinationConnected {
                uri: "rtmp://a/live".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_destination_drops_instead_of_blocking() {
        let bridge = EventBridge::new(32);
        let mut rx = bridge.subscribe();
        let connector = LoopbackConnector::new().with_send_delay(Duration::from_secs(1));
        let config = FanoutConfig {
            settle_ms: 0,
            queue_depth: 2,
        };
        let mut fanout = FanoutManager::new(Arc::new(connector.clone()), &config, bridge.notifier());

        fanout.start(&urls(&["rtmp://slow/live"]), true);
        next_event(&mut rx).await;

        let accepted: usize = (0..10).map(|pts| fanout.offer(&frame(pts))).sum();
        assert!(accepted < 10);
        let dropped = fanout.statuses()[0].dropped;
        assert_eq!(accepted as u64 + dropped, 10);
        assert!(dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_settle_never_connects() {
        let bridge = EventBridge::new(32);
        let mut rx = bridge.subscribe();
        let connector = LoopbackConnector::new();
        let mut fanout = FanoutManager::new(
            Arc::new(connector.clone()),
            &FanoutConfig::default(),
            bridge.notifier(),
        );

        fanout.start(&urls(&["rtmp://a/live"]), true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        fanout.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert!(fanout.statuses().is_empty());
        assert_eq!(fanout.offer(&frame(0)), 0);
    }
}
