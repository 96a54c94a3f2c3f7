//! Scan session state

use std::time::{Duration, Instant};

use crate::error::ScanFailure;
use crate::extraction::ExtractionResult;

/// Where a scan session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No session
    Idle,
    /// Watching frames for a usable document
    Sampling,
    /// Document centered and sharp enough, waiting for the trigger condition
    Positioned,
    /// One capture + extraction in flight
    Capturing { attempt: u64, manual: bool },
    /// Last attempt was rejected; sampling resumes at `resume_at`
    Retrying { resume_at: Instant },
    Success,
    Failed,
    TimedOut,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Success | ScanState::Failed | ScanState::TimedOut)
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self, ScanState::Capturing { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Sampling => "sampling",
            ScanState::Positioned => "positioned",
            ScanState::Capturing { .. } => "capturing",
            ScanState::Retrying { .. } => "retrying",
            ScanState::Success => "success",
            ScanState::Failed => "failed",
            ScanState::TimedOut => "timed_out",
        }
    }
}

/// Identifies one capture attempt. A result is only applied if its ticket
/// still matches the session's in-flight attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket {
    pub session: u64,
    pub attempt: u64,
    /// Requested through `manual_scan` rather than the trigger condition
    pub manual: bool,
}

/// Mutable state of one scan session, owned by the scan controller
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub(crate) id: u64,
    pub(crate) state: ScanState,
    pub(crate) attempts: u32,
    pub(crate) last_scan_at: Option<Instant>,
    pub(crate) session_start: Instant,
    pub(crate) max_attempts: u32,
    pub(crate) cooldown: Duration,
    pub(crate) auto_entry_timeout: Duration,
    pub(crate) had_document: bool,
    pub(crate) last_quality: Option<f64>,
    pub(crate) last_failure: Option<ScanFailure>,
}

impl ScanSession {
    pub(crate) fn new(
        id: u64,
        now: Instant,
        max_attempts: u32,
        cooldown: Duration,
        auto_entry_timeout: Duration,
    ) -> Self {
        Self {
            id,
            state: ScanState::Sampling,
            attempts: 0,
            last_scan_at: None,
            session_start: now,
            max_attempts,
            cooldown,
            auto_entry_timeout,
            had_document: false,
            last_quality: None,
            last_failure: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last_scan_at(&self) -> Option<Instant> {
        self.last_scan_at
    }

    pub fn session_start(&self) -> Instant {
        self.session_start
    }

    /// Reason the most recent attempt was rejected
    pub fn last_failure(&self) -> Option<&ScanFailure> {
        self.last_failure.as_ref()
    }

    /// When the auto-entry timeout fires
    pub fn deadline(&self) -> Instant {
        self.session_start + self.auto_entry_timeout
    }

    pub(crate) fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_scan_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown)
    }
}

/// Terminal outcome of a session. Exactly one is produced per session.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Success(ExtractionResult),
    /// Every attempt was used without an accepted result
    Failed { attempts: u32, last_failure: ScanFailure },
    /// The auto-entry timeout elapsed first
    TimedOut { attempts: u32 },
    /// Stopped by the caller
    Stopped,
    /// Camera readiness was revoked mid-session
    PermissionRevoked,
}

impl ScanOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScanOutcome::Success(_))
    }
}
