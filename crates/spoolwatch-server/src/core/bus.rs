use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use spoolwatch_model::{
    MessageId, MessageStatus, OperationResult, QueueOperation, QueueSnapshot
};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Notifications pushed to live consumers (dashboards, websocket fan-out).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    BatchStored {
        events: usize,
        unknown: usize,
    },
    StatusAdvanced {
        message_id: MessageId,
        status: MessageStatus,
    },
    QueueOperation {
        actor_id: String,
        result: OperationResult,
    },
    BulkOperation {
        actor_id: String,
        operation: QueueOperation,
        succeeded: usize,
        failed: usize,
    },
    SnapshotTaken {
        snapshot: QueueSnapshot,
    },
}

pub trait MessageBus: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
    /// Fire-and-forget. Events published while stopped are discarded.
    fn publish(
        &self,
        event: BusEvent,
    );
}

pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
    running: AtomicBool,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, running: AtomicBool::new(false) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl MessageBus for BroadcastBus {
    fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("message bus started");
        }
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("message bus stopped");
        }
    }

    fn publish(
        &self,
        event: BusEvent,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        // No subscribers is not an error.
        if let Err(err) = self.tx.send(event) {
            debug!("bus event without subscribers: event={:?}", err.0);
        }
    }
}
