//! Device hotplug events feeding the probe controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: String,
    pub device: String,
}

impl DeviceEvent {
    pub fn new(action: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            device: device.into(),
        }
    }
}

#[async_trait]
pub trait DeviceEventSource: Send {
    /// Next event; `None` once the source is closed.
    async fn recv(&mut self) -> Option<DeviceEvent>;

    /// An already queued event, without waiting.
    fn try_recv(&mut self) -> Option<DeviceEvent>;

    /// Whether the device manager has finished processing its queue.
    async fn is_settled(&mut self) -> bool;
}

/// In-process event source. The paired `EventSender` feeds it and
/// controls what `is_settled` reports.
pub struct ChannelEventSource {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
    settled: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<DeviceEvent>,
    settled: Arc<AtomicBool>,
}

pub fn channel() -> (EventSender, ChannelEventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settled = Arc::new(AtomicBool::new(true));
    (
        EventSender {
            tx,
            settled: Arc::clone(&settled),
        },
        ChannelEventSource { rx, settled },
    )
}

impl EventSender {
    /// False once the source is gone.
    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn set_settled(&self, settled: bool) {
        self.settled.store(settled, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceEventSource for ChannelEventSource {
    async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    async fn is_settled(&mut self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{channel, DeviceEvent, DeviceEventSource};

    #[tokio::test]
    async fn queued_events_drain_without_waiting() {
        let (tx, mut source) = channel();
        assert!(tx.send(DeviceEvent::new("add", "/dev/sdb")));
        assert!(tx.send(DeviceEvent::new("change", "/dev/sdb")));
        assert_eq!(source.recv().await.map(|e| e.action), Some("add".to_string()));
        assert!(source.try_recv().is_some());
        assert!(source.try_recv().is_none());

        tx.set_settled(false);
        assert!(!source.is_settled().await);
        drop(tx);
        assert_eq!(source.recv().await, None);
    }
}
