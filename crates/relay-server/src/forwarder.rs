//! Relays progress events to a hub owned by another process.
//!
//! `emit` only appends to a bounded in-memory queue. A single background task
//! drains it strictly in order: the head is removed once the hub accepts it
//! (or rejects it with a 4xx, which no retry can fix); transport errors and
//! 5xx responses leave it in place and the task backs off before retrying.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::ProgressEvent;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct ForwarderConfig {
    pub ingest_url: String,
    pub queue_cap: usize,
    pub retry_delay: Duration,
    pub flush_timeout: Duration,
}

struct Queue {
    events: Mutex<VecDeque<(u64, ProgressEvent)>>,
    cap: usize,
    next_seq: AtomicU64,
    pushed: Notify,
    drained: Notify,
}

impl Queue {
    fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
            next_seq: AtomicU64::new(0),
            pushed: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Append, evicting the oldest entry when full. Returns whether an
    /// entry was evicted.
    fn push(&self, event: ProgressEvent) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let evicted = {
            let mut events = self.events.lock();
            let evicted = if events.len() >= self.cap {
                events.pop_front().is_some()
            } else {
                false
            };
            events.push_back((seq, event));
            evicted
        };
        self.pushed.notify_one();
        evicted
    }

    fn front(&self) -> Option<(u64, ProgressEvent)> {
        self.events.lock().front().cloned()
    }

    /// Remove the head if it is still `seq`; it may have been evicted while
    /// in flight.
    fn pop_if(&self, seq: u64) {
        let empty = {
            let mut events = self.events.lock();
            if events.front().is_some_and(|(s, _)| *s == seq) {
                events.pop_front();
            }
            events.is_empty()
        };
        if empty {
            self.drained.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }
}

enum Delivery {
    Accepted,
    Rejected(u16),
    Retry(String),
}

pub(crate) struct Forwarder {
    queue: Arc<Queue>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    flush_timeout: Duration,
}

impl Forwarder {
    pub fn start(config: ForwarderConfig) -> Self {
        let queue = Arc::new(Queue::new(config.queue_cap));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(drain(
            Arc::clone(&queue),
            config.ingest_url,
            config.retry_delay,
            cancel.clone(),
        ));
        Self {
            queue,
            cancel,
            worker: Mutex::new(Some(worker)),
            flush_timeout: config.flush_timeout,
        }
    }

    pub fn enqueue(&self, event: ProgressEvent) {
        if self.queue.push(event) {
            debug!(cap = self.queue.cap, "forward queue full, dropped oldest event");
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Give queued events up to the flush timeout to reach the hub, then
    /// stop the worker and discard whatever is left.
    pub async fn stop(&self) {
        let flushed = tokio::time::timeout(self.flush_timeout, async {
            loop {
                let drained = self.queue.drained.notified();
                if self.queue.len() == 0 {
                    break;
                }
                drained.await;
            }
        })
        .await
        .is_ok();

        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if !flushed {
            warn!(discarded = self.queue.len(), "forwarder stopped before queue drained");
        }
    }
}

async fn drain(queue: Arc<Queue>, url: String, retry_delay: Duration, cancel: CancellationToken) {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();
    info!(url = %url, "forwarding progress events to hub");

    loop {
        let Some((seq, event)) = queue.front() else {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = queue.pushed.notified() => {}
            }
            continue;
        };

        let delivery = tokio::select! {
            () = cancel.cancelled() => return,
            delivery = post(&client, &url, &event) => delivery,
        };

        match delivery {
            Delivery::Accepted => queue.pop_if(seq),
            Delivery::Rejected(status) => {
                warn!(status, operation_id = %event.operation_id, "hub rejected event, dropping");
                queue.pop_if(seq);
            }
            Delivery::Retry(reason) => {
                debug!(reason = %reason, "hub unavailable, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
}

async fn post(client: &reqwest::Client, url: &str, event: &ProgressEvent) -> Delivery {
    match client.post(url).json(event).send().await {
        Ok(resp) if resp.status().is_success() => Delivery::Accepted,
        Ok(resp) if resp.status().is_client_error() => Delivery::Rejected(resp.status().as_u16()),
        Ok(resp) => Delivery::Retry(format!("status {}", resp.status())),
        Err(e) => Delivery::Retry(e.to_string()),
    }
}
