use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique viewer identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewerId(pub String);

impl Default for ViewerId {
    fn default() -> Self {
        Self(format!("viewer_{}", Uuid::now_v7()))
    }
}

impl ViewerId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of connected progress viewers. Each viewer owns the receiving
/// end of a bounded channel that its SSE response drains.
pub struct ViewerRegistry {
    viewers: DashMap<ViewerId, mpsc::Sender<Arc<str>>>,
    max_send_queue: usize,
}

impl ViewerRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            viewers: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new viewer and return its ID + receiver.
    pub fn register(&self) -> (ViewerId, mpsc::Receiver<Arc<str>>) {
        let id = ViewerId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.viewers.insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unregister(&self, id: &ViewerId) {
        self.viewers.remove(id);
    }

    /// Write `message` to every viewer without waiting. Viewers whose stream
    /// has gone away are pruned here. A viewer that cannot keep up is
    /// disconnected rather than left with a gap in its sequence; its stream
    /// ends after the queued events. Returns how many viewers accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        let message: Arc<str> = Arc::from(message);
        let mut delivered = 0;
        let mut closed = Vec::new();
        let mut lagging = Vec::new();

        for entry in self.viewers.iter() {
            match entry.value().try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => lagging.push(entry.key().clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            self.unregister(&id);
            tracing::debug!(viewer_id = %id, "pruned disconnected viewer");
        }
        for id in lagging {
            self.unregister(&id);
            tracing::warn!(viewer_id = %id, "viewer queue full, disconnecting slow viewer");
        }
        delivered
    }

    /// Drop every viewer's sender, which ends their streams.
    pub fn clear(&self) {
        self.viewers.clear();
    }

    /// Number of registered viewers.
    pub fn count(&self) -> usize {
        self.viewers.len()
    }
}
