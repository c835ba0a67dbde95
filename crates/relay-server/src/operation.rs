use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{OperationId, ProgressEvent, ProgressKind};

use crate::hub::ProgressHub;

#[derive(Default)]
struct Sequence {
    started: bool,
    finished: bool,
}

/// Feeds one operation's events into the hub while keeping its sequence
/// well-formed: exactly one `start` first, at most one terminal event last.
///
/// Later `start` events (the tool announcing its session) become messages;
/// anything arriving after the terminal event is dropped.
pub struct OperationReporter {
    hub: Arc<ProgressHub>,
    operation_id: OperationId,
    sequence: Mutex<Sequence>,
}

impl OperationReporter {
    pub fn new(hub: Arc<ProgressHub>, operation_id: OperationId) -> Self {
        Self {
            hub,
            operation_id,
            sequence: Mutex::new(Sequence::default()),
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// Emit the operation's `start`. Only the first call has any effect.
    pub fn begin(&self, content: impl Into<String>) {
        let mut seq = self.sequence.lock();
        if seq.started {
            return;
        }
        seq.started = true;
        self.hub.start_operation(&self.operation_id, content);
    }

    /// Forward a normalized event from the running tool.
    pub fn forward(&self, mut event: ProgressEvent) {
        let mut seq = self.sequence.lock();
        if seq.finished {
            return;
        }
        event.operation_id = self.operation_id.as_str().to_string();
        let kind = event.kind;
        match kind {
            ProgressKind::Start if seq.started => {
                event.kind = ProgressKind::Message;
                event.content = format!("session started: {}", event.content);
            }
            ProgressKind::Start => seq.started = true,
            k if k.is_terminal() => {
                if !seq.started {
                    seq.started = true;
                    self.hub.start_operation(&self.operation_id, "");
                }
                seq.finished = true;
            }
            _ if !seq.started => {
                seq.started = true;
                self.hub.start_operation(&self.operation_id, "");
            }
            _ => {}
        }
        self.hub.emit(event);
    }

    /// Close with `end` unless a terminal event was already sent.
    pub fn finish(&self, content: impl Into<String>) {
        self.close(ProgressKind::End, content.into());
    }

    /// Close with `error` unless a terminal event was already sent.
    pub fn fail(&self, message: impl Into<String>) {
        self.close(ProgressKind::Error, message.into());
    }

    pub fn is_finished(&self) -> bool {
        self.sequence.lock().finished
    }

    fn close(&self, kind: ProgressKind, content: String) {
        let mut seq = self.sequence.lock();
        if seq.finished {
            return;
        }
        if !seq.started {
            seq.started = true;
            self.hub.start_operation(&self.operation_id, "");
        }
        seq.finished = true;
        match kind {
            ProgressKind::Error => self.hub.fail_operation(&self.operation_id, content),
            _ => self.hub.end_operation(&self.operation_id, content),
        }
    }
}
