use std::sync::{
    mpsc::{self, Receiver, Sender},
    Mutex,
};

use crate::StoreEvent;

/// Trait for consuming events.
///
/// Each embedder provides its own implementation.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StoreEvent);
}

/// Channel-based event sink.
///
/// Sends events through a standard mpsc channel so a consumer thread (notifier, audit log,
/// test harness) can drain them at its own pace.
pub struct ChannelSink {
    sender: Mutex<Sender<StoreEvent>>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<StoreEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StoreEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}

/// No-op event sink for headless operation.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: StoreEvent) {}
}

/// Collector sink that stores all events for inspection.
#[derive(Default)]
pub struct CollectorSink {
    events: Mutex<Vec<StoreEvent>>,
}

impl CollectorSink {
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectorSink {
    fn emit(&self, event: StoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
