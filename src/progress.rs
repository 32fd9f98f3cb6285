//! Replaces the opaque "context" of the source design (§9) with a plain
//! struct: a cancellation flag plus a progress sink trait object, passed
//! by reference through every long-running call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Named progress events, positional payloads per spec §6.
#[derive(Debug, Clone)]
pub enum Event {
    IndexWalkData { count: u64, total: u64 },
    IndexUpsertFile { path: String },
    CheckoutUpsertFile { path: String },
    CheckoutRemoveFile { path: String },
    CloudBeforeDownloadFile { path: String },
    CloudBeforeUploadFile { path: String },
    CloudBeforeUploadRef { path: String },
    CloudLock,
    CloudUnlock,
    CloudCorrupted { still_missing: u64 },
    CloudAfterFixObjects { fixed: u64 },
}

/// One method per event kind, collapsed into a single `emit` plus an
/// enum, matching the §9 suggestion ("a small trait object with one
/// method per event kind (or one generic `emit(event, payload)`)").
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: drops every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to an unbounded channel; used by callers that want to
/// observe progress from another thread/task (e.g. a UI).
pub struct ChannelSink {
    tx: crossbeam_channel::Sender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, crossbeam_channel::Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Carried by reference through long calls: publishes progress and
/// carries the cooperative cancellation signal (spec §5).
#[derive(Clone)]
pub struct Context {
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl Context {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn none() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit(&self, event: Event) {
        self.sink.emit(event);
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Returns an error if cancellation was requested; call at every
    /// suspension point (spec §5).
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::none()
    }
}
