//! Projection-change notifications.
//!
//! The UI subscribes once and re-renders on every notice instead of
//! polling; the bus is owned by the client and handed to whatever needs
//! to publish, never reached through a global.

use tokio::sync::broadcast;

/// What caused the projection to change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// A local write (create/update/delete/undo).
    LocalWrite,
    /// Events merged from a sync pull.
    RemotePull,
    /// An event applied from the realtime channel.
    Realtime,
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeKind>,
}

impl ChangeBus {
    pub fn new() -> Self {
        // Slow subscribers miss intermediate notices, which is fine:
        // any notice means "re-read the projection".
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeKind> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: ChangeKind) {
        // No receivers is not an error; notices are advisory.
        let _ = self.tx.send(kind);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_notices() {
        let bus = ChangeBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ChangeKind::LocalWrite);
        assert_eq!(rx.recv().await.unwrap(), ChangeKind::LocalWrite);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = ChangeBus::new();
        bus.publish(ChangeKind::RemotePull);
    }
}
