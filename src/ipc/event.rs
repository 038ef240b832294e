//! Internal event bus (C17): the typed event set the Resource Manager loop
//! (C10) waits on, plus a broadcast channel so read-only observers (status
//! reporters, the RPC server) can see round outcomes without ever locking
//! the loop itself.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::app::Exc;
use crate::platform::RefreshReport;

/// One of the events the Resource Manager loop reacts to. It consumes
/// these from a single `mpsc` channel, one at a time — queuing is the
/// channel's job, so the loop body itself never needs to be reentrant.
#[derive(Debug)]
pub enum ManagerEvent {
    /// Host capacity changed (C7's `Refresh()` observed a delta).
    PlatRefresh(RefreshReport),
    /// A new execution context has registered and is ready to be scheduled.
    NewApp(Exc),
    /// An execution context has exited and should be torn down.
    AppExit(u64),
    /// A remote peer joined the directory.
    PeerJoin(u16),
    /// An operator command arrived (CLI, signal, or RPC management call).
    UserCmd(UserCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Shutdown,
    ReloadConfig,
}

/// A serializable summary of a handled `ManagerEvent`, broadcast after the
/// loop finishes processing it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ManagerNotification {
    PlatRefresh { cpu_total: u64, mem_total_bytes: u64 },
    NewApp { uid: u64 },
    AppExit { uid: u64 },
    SyncDone { succeeded: usize, failed: usize },
    PeerJoin { id: u16 },
    Shutdown,
}

/// Broadcasts `ManagerNotification`s to every connected read-only consumer.
/// Cheaply cloneable; all clones share the same channel.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ManagerNotification>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish a notification. Ignored if nobody is subscribed.
    pub fn publish(&self, notification: ManagerNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerNotification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_notifications() {
        let bus = EventBroadcaster::new();
        let mut rx = bus.subscribe();
        bus.publish(ManagerNotification::PeerJoin { id: 3 });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ManagerNotification::PeerJoin { id: 3 }));
    }
}
