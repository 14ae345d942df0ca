//! Broadcast engine
//!
//! Fans a message out to every registered connection except its origin.
//! Frames are queued with `try_send`, so a slow or dead recipient costs the
//! sender one failed enqueue and never a wait.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PeerWriteError;
use crate::frame::{encode, relay_limit};
use crate::protocol::Envelope;
use crate::registry::Registry;

/// What to fan out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// The origin just connected
    Join,
    /// Text read from the origin
    Text(String),
}

/// Per-call delivery counts, for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames queued to recipients
    pub delivered: usize,
    /// Recipients whose queue was full
    pub lagging: usize,
    /// Recipients already closing
    pub gone: usize,
}

impl BroadcastReport {
    pub fn failed(&self) -> usize {
        self.lagging + self.gone
    }
}

/// Fan-out over a shared [`Registry`]
///
/// `max_frame_size` is the inbound limit; relayed frames may exceed it by
/// [`RELAY_HEADROOM`](crate::frame::RELAY_HEADROOM) because the origin
/// address and timestamp are rewritten.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    max_frame_size: usize,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, max_frame_size: usize) -> Self {
        Self {
            registry,
            max_frame_size,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queue `outgoing` to every connection whose address differs from
    /// `origin`
    ///
    /// Blank text is dropped here. Per-recipient failures are logged and
    /// skipped; they never reach the caller as errors.
    pub fn broadcast(&self, origin: &str, outgoing: Outgoing) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let msg = match outgoing {
            Outgoing::Join => Envelope::joined(origin),
            Outgoing::Text(text) => Envelope::new(&text, origin),
        };
        if msg.is_blank() {
            debug!(origin = %origin, "Suppressed blank message");
            return report;
        }

        let frame = match encode(&msg, relay_limit(self.max_frame_size)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(origin = %origin, error = %e, "Cannot encode broadcast");
                return report;
            }
        };

        for peer in self.registry.snapshot() {
            if peer.remote_address() == origin {
                continue;
            }

            match peer.try_deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(PeerWriteError::Lagging) => {
                    report.lagging += 1;
                    warn!(peer = %peer.remote_address(), origin = %origin, "Dropped frame for lagging peer");
                }
                Err(PeerWriteError::Gone) => {
                    report.gone += 1;
                    debug!(peer = %peer.remote_address(), "Skipped closing peer");
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, DEFAULT_MAX_FRAME_SIZE};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn setup() -> (Broadcaster, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        (
            Broadcaster::new(registry.clone(), DEFAULT_MAX_FRAME_SIZE),
            registry,
        )
    }

    fn received(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_origin_excluded() {
        let (engine, registry) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        registry.register("10.0.0.1:1", tx_a);
        registry.register("10.0.0.2:2", tx_b);
        registry.register("10.0.0.3:3", tx_c);

        let report = engine.broadcast("10.0.0.2:2", Outgoing::Text("hello\n".into()));
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx_a, &mut rx_c] {
            let msgs = received(rx);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].text, "hello\r");
            assert_eq!(msgs[0].from_address, "10.0.0.2:2");
        }
        assert!(received(&mut rx_b).is_empty());
    }

    #[test]
    fn test_join_notification() {
        let (engine, registry) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register("10.0.0.1:1", tx_a);
        registry.register("10.0.0.2:2", tx_b);

        engine.broadcast("10.0.0.2:2", Outgoing::Join);

        let msgs = received(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body(), "10.0.0.2:2 joined the chat");
        assert_eq!(msgs[0].from_address, "10.0.0.2:2");
        assert!(received(&mut rx_b).is_empty());
    }

    #[test]
    fn test_blank_suppressed() {
        let (engine, registry) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("10.0.0.1:1", tx);

        for blank in ["\n", "   ", "\r\n", "\t\n"] {
            let report = engine.broadcast("10.0.0.2:2", Outgoing::Text(blank.into()));
            assert_eq!(report, BroadcastReport::default());
        }
        assert!(received(&mut rx).is_empty());
    }

    #[test]
    fn test_lagging_peer_isolated() {
        let (engine, registry) = setup();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        registry.register("10.0.0.1:1", slow_tx);
        registry.register("10.0.0.3:3", fast_tx);

        let first = engine.broadcast("10.0.0.2:2", Outgoing::Text("one".into()));
        let second = engine.broadcast("10.0.0.2:2", Outgoing::Text("two".into()));

        assert_eq!(first.delivered, 2);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.lagging, 1);
        assert_eq!(registry.len(), 2);

        let texts: Vec<String> = received(&mut fast_rx).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one\r", "two\r"]);
    }

    #[test]
    fn test_removed_during_broadcast_not_delivered() {
        let (engine, registry) = setup();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = registry.register("10.0.0.1:1", tx_a);
        registry.register("10.0.0.3:3", tx_b);

        // Removal as the handler performs it: deregister then close
        let stale = registry.snapshot();
        registry.deregister(a.id());
        a.close();
        assert_eq!(stale.len(), 2);

        let report = engine.broadcast("10.0.0.2:2", Outgoing::Text("after".into()));
        assert_eq!(report.delivered, 1);
        assert!(received(&mut rx_a).is_empty());
        assert_eq!(received(&mut rx_b).len(), 1);

        // A broadcast still holding the stale snapshot sees the close flag
        assert_eq!(
            stale[0].try_deliver(Bytes::from_static(b"x")),
            Err(PeerWriteError::Gone)
        );
    }

    #[test]
    fn test_oversized_message_dropped() {
        let registry = Arc::new(Registry::new());
        let engine = Broadcaster::new(registry.clone(), 8);
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("10.0.0.1:1", tx);

        let report = engine.broadcast("10.0.0.2:2", Outgoing::Text("a".repeat(relay_limit(8))));
        assert_eq!(report, BroadcastReport::default());
        assert!(received(&mut rx).is_empty());
    }

    #[test]
    fn test_restamped_text_at_inbound_limit_delivered() {
        let registry = Arc::new(Registry::new());
        let engine = Broadcaster::new(registry.clone(), 64);
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("10.0.0.1:1", tx);

        // 64 bytes on the wire from the sender, larger once re-addressed
        let text = format!("{}\r", "x".repeat(61));
        let report = engine.broadcast("192.168.100.200:54321", Outgoing::Text(text));
        assert_eq!(report.delivered, 1);

        let msgs = received(&mut rx);
        assert!(msgs[0].to_bytes().len() > 64);
        assert_eq!(msgs[0].body(), "x".repeat(61));
    }
}
