//! Scan Controller
//!
//! State machine deciding when to capture, how often to retry and when a
//! session ends, plus the events it broadcasts along the way.

pub mod controller;
pub mod events;
pub mod state;

pub use controller::{ScanController, ScanSettings};
pub use events::{EventBus, ScanEvent};
pub use state::{CaptureTicket, ScanOutcome, ScanSession, ScanState};
