//! Scan events broadcast to any number of listeners

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::ScanFailure;
use crate::extraction::ExtractionResult;
use crate::vision::AnalysisResult;

/// Observable side effects of a scan session
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A document appeared after a frame without one
    DocumentDetected(AnalysisResult),
    /// The session entered the positioned state
    Positioned(AnalysisResult),
    /// Frame quality differs from the previous frame
    QualityChanged(AnalysisResult),
    /// A capture attempt finished: accepted result or the reason it was not
    ScanComplete(Result<ExtractionResult, ScanFailure>),
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::DocumentDetected(_) => "document_detected",
            ScanEvent::Positioned(_) => "positioned",
            ScanEvent::QualityChanged(_) => "quality_changed",
            ScanEvent::ScanComplete(_) => "scan_complete",
        }
    }
}

/// Fan-out of scan events. Every subscriber receives every event; dropped
/// receivers are pruned on the next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ScanEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener
    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: ScanEvent) {
        trace!("Emitting {}", event.name());
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
