//! Scan controller
//!
//! Decides from a stream of analysis results when to trigger a capture,
//! enforces the cooldown between attempts and the attempt budget, and
//! resolves the session to exactly one terminal outcome.
//!
//! The controller is synchronous and takes the current time as an argument;
//! the pipeline drives it from its session task.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::events::{EventBus, ScanEvent};
use super::state::{CaptureTicket, ScanOutcome, ScanSession, ScanState};
use crate::error::{ConfigError, ScanFailure};
use crate::extraction::ExtractionResult;
use crate::vision::AnalysisResult;

/// Retry policy and acceptance threshold for a scan session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Capture attempts per session
    pub max_attempts: u32,
    /// Minimum delay between two triggered captures
    pub cooldown_ms: u64,
    /// Session length before falling back to manual entry
    pub auto_entry_timeout_ms: u64,
    /// Extraction confidence required to accept a result
    pub success_threshold: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::lenient()
    }
}

impl ScanSettings {
    /// Low acceptance threshold, tolerant of OCR noise
    pub fn lenient() -> Self {
        Self {
            max_attempts: 3,
            cooldown_ms: 2000,
            auto_entry_timeout_ms: 60_000,
            success_threshold: 0.3,
        }
    }

    pub fn strict() -> Self {
        Self {
            success_threshold: 0.7,
            ..Self::lenient()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn auto_entry_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_entry_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("scan.max_attempts", "must be at least 1"));
        }
        if self.auto_entry_timeout_ms == 0 {
            return Err(ConfigError::invalid("scan.auto_entry_timeout_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(ConfigError::invalid(
                "scan.success_threshold",
                format!("{} is outside [0, 1]", self.success_threshold),
            ));
        }
        Ok(())
    }
}

/// Scan state machine
pub struct ScanController {
    settings: ScanSettings,
    quality_threshold: f64,
    events: EventBus,
    session: Option<ScanSession>,
    next_session_id: u64,
    next_attempt_id: u64,
}

impl ScanController {
    /// `quality_threshold` is the analyzer quality a positioned frame needs
    pub fn new(settings: ScanSettings, quality_threshold: f64, events: EventBus) -> Self {
        Self {
            settings,
            quality_threshold,
            events,
            session: None,
            next_session_id: 1,
            next_attempt_id: 1,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> ScanState {
        self.session.as_ref().map_or(ScanState::Idle, |s| s.state)
    }

    pub fn attempts(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.attempts)
    }

    /// Start a new session, replacing any previous one. Returns its id.
    pub fn start(&mut self, now: Instant) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;

        self.session = Some(ScanSession::new(
            id,
            now,
            self.settings.max_attempts,
            self.settings.cooldown(),
            self.settings.auto_entry_timeout(),
        ));

        info!(
            "Scan session {} started (max attempts {}, cooldown {:?}, timeout {:?})",
            id,
            self.settings.max_attempts,
            self.settings.cooldown(),
            self.settings.auto_entry_timeout()
        );
        id
    }

    /// End the session. Idempotent. Returns the ticket of a capture that was
    /// in flight, whose result will now be ignored.
    pub fn stop(&mut self) -> Option<CaptureTicket> {
        let session = self.session.take()?;
        info!("Scan session {} stopped in state {}", session.id, session.state.name());
        match session.state {
            ScanState::Capturing { attempt, manual } => Some(CaptureTicket {
                session: session.id,
                attempt,
                manual,
            }),
            _ => None,
        }
    }

    /// Feed one analysis result. Returns a ticket when the trigger condition
    /// holds and a capture should be started.
    pub fn observe(&mut self, result: &AnalysisResult, now: Instant) -> Option<CaptureTicket> {
        let quality_threshold = self.quality_threshold;
        let session = self.session.as_mut()?;
        if session.state.is_terminal() {
            return None;
        }

        let mut events = Vec::new();

        if result.has_document && !session.had_document {
            events.push(ScanEvent::DocumentDetected(result.clone()));
        }
        session.had_document = result.has_document;

        if session.last_quality != Some(result.quality) {
            events.push(ScanEvent::QualityChanged(result.clone()));
        }
        session.last_quality = Some(result.quality);

        if let ScanState::Retrying { resume_at } = session.state {
            if now < resume_at {
                self.emit_all(events);
                return None;
            }
            debug!("Session {} resuming sampling", session.id);
            session.state = ScanState::Sampling;
        }

        let mut ticket = None;
        match session.state {
            ScanState::Sampling | ScanState::Positioned => {
                if result.is_ready(quality_threshold) {
                    if session.state != ScanState::Positioned {
                        debug!("Session {} positioned (quality {:.2})", session.id, result.quality);
                        session.state = ScanState::Positioned;
                        events.push(ScanEvent::Positioned(result.clone()));
                    }
                    if session.attempts < session.max_attempts && session.cooldown_elapsed(now) {
                        ticket = Some(begin_attempt(session, &mut self.next_attempt_id, now, false));
                    }
                } else {
                    session.state = ScanState::Sampling;
                }
            }
            // A second trigger while capturing is a no-op
            _ => {}
        }

        self.emit_all(events);
        ticket
    }

    /// Request a capture now, ignoring position and cooldown. Still counts
    /// as an attempt and is refused while another capture is in flight.
    pub fn manual_scan(&mut self, now: Instant) -> Result<CaptureTicket, ScanFailure> {
        let session = self.session.as_mut().ok_or(ScanFailure::Inactive)?;
        if session.state.is_terminal() {
            return Err(ScanFailure::Inactive);
        }
        if session.state.is_capturing() {
            return Err(ScanFailure::Busy);
        }
        if session.attempts >= session.max_attempts {
            return Err(ScanFailure::AttemptsExhausted {
                attempts: session.attempts,
            });
        }
        Ok(begin_attempt(session, &mut self.next_attempt_id, now, true))
    }

    /// Apply the result of a capture attempt. Results for a ticket that no
    /// longer matches the in-flight attempt are dropped. Returns the terminal
    /// outcome when this attempt ends the session.
    pub fn complete(
        &mut self,
        ticket: CaptureTicket,
        outcome: Result<ExtractionResult, ScanFailure>,
        now: Instant,
    ) -> Option<ScanOutcome> {
        let success_threshold = self.settings.success_threshold;
        let Some(session) = self.session.as_mut() else {
            warn!("Dropping result of attempt {}: no active session", ticket.attempt);
            return None;
        };
        let in_flight = matches!(session.state, ScanState::Capturing { attempt, .. } if attempt == ticket.attempt);
        if session.id != ticket.session || !in_flight {
            warn!(
                "Dropping stale result of attempt {} for session {}",
                ticket.attempt, ticket.session
            );
            return None;
        }

        let failure = match outcome {
            Ok(result) if result.confidence >= success_threshold => {
                info!(
                    "Session {} succeeded on attempt {} (confidence {:.2})",
                    session.id, session.attempts, result.confidence
                );
                session.state = ScanState::Success;
                self.events.emit(ScanEvent::ScanComplete(Ok(result.clone())));
                return Some(ScanOutcome::Success(result));
            }
            Ok(result) => ScanFailure::LowConfidence {
                confidence: result.confidence,
                threshold: success_threshold,
            },
            Err(failure) => failure,
        };

        warn!(
            "Session {} attempt {}/{} rejected: {}",
            session.id, session.attempts, session.max_attempts, failure
        );
        session.last_failure = Some(failure.clone());
        self.events.emit(ScanEvent::ScanComplete(Err(failure.clone())));

        if session.attempts >= session.max_attempts {
            info!("Session {} failed after {} attempts", session.id, session.attempts);
            session.state = ScanState::Failed;
            return Some(ScanOutcome::Failed {
                attempts: session.attempts,
                last_failure: failure,
            });
        }

        session.state = ScanState::Retrying {
            resume_at: now + session.cooldown,
        };
        None
    }

    /// Fire the auto-entry timeout if its deadline has passed. Fires at most
    /// once per session.
    pub fn check_timeout(&mut self, now: Instant) -> Option<ScanOutcome> {
        let session = self.session.as_mut()?;
        if session.state.is_terminal() || now < session.deadline() {
            return None;
        }

        info!(
            "Session {} timed out after {:?} in state {}",
            session.id,
            now.saturating_duration_since(session.session_start),
            session.state.name()
        );
        session.state = ScanState::TimedOut;
        Some(ScanOutcome::TimedOut {
            attempts: session.attempts,
        })
    }

    fn emit_all(&self, events: Vec<ScanEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

fn begin_attempt(session: &mut ScanSession, next_attempt_id: &mut u64, now: Instant, manual: bool) -> CaptureTicket {
    let attempt = *next_attempt_id;
    *next_attempt_id += 1;

    session.attempts += 1;
    session.last_scan_at = Some(now);
    session.state = ScanState::Capturing { attempt, manual };

    info!(
        "Session {} capture attempt {}/{}{}",
        session.id,
        session.attempts,
        session.max_attempts,
        if manual { " (manual)" } else { "" }
    );

    CaptureTicket {
        session: session.id,
        attempt,
        manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::DocumentType;
    use crate::vision::BoundingBox;
    use crossbeam_channel::Receiver;
    use std::collections::BTreeMap;

    fn frame_result(positioned: bool, quality: f64, at: Instant) -> AnalysisResult {
        AnalysisResult {
            has_document: positioned,
            is_positioned: positioned,
            quality,
            bounding_box: if positioned {
                BoundingBox::new(10, 10, 100, 60)
            } else {
                BoundingBox::default()
            },
            sharpness: quality,
            contrast: quality,
            brightness: 0.5,
            timestamp: at,
        }
    }

    fn extraction(confidence: f64) -> ExtractionResult {
        ExtractionResult {
            raw_text: "DRIVER LICENSE".to_string(),
            document_type: DocumentType::DriversLicense,
            fields: BTreeMap::new(),
            confidence,
        }
    }

    fn controller(settings: ScanSettings) -> (ScanController, Receiver<ScanEvent>) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        (ScanController::new(settings, 0.5, bus), rx)
    }

    fn drain(rx: &Receiver<ScanEvent>) -> Vec<&'static str> {
        rx.try_iter().map(|e| e.name()).collect()
    }

    #[test]
    fn test_settings_validation() {
        assert!(ScanSettings::lenient().validate().is_ok());
        assert!(ScanSettings::strict().validate().is_ok());

        let zero_attempts = ScanSettings {
            max_attempts: 0,
            ..ScanSettings::default()
        };
        assert!(zero_attempts.validate().is_err());

        let bad_threshold = ScanSettings {
            success_threshold: 1.5,
            ..ScanSettings::default()
        };
        assert!(bad_threshold.validate().is_err());
    }

    #[test]
    fn test_positioned_frame_triggers_capture() {
        let (mut sc, rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);
        assert_eq!(sc.state(), ScanState::Sampling);

        let ticket = sc.observe(&frame_result(true, 0.8, t0), t0).expect("capture triggered");
        assert!(!ticket.manual);
        assert_eq!(sc.attempts(), 1);
        assert!(sc.state().is_capturing());
        assert_eq!(
            drain(&rx),
            vec!["document_detected", "quality_changed", "positioned"]
        );

        // Second trigger while capturing is ignored
        assert!(sc.observe(&frame_result(true, 0.9, t0), t0).is_none());
        assert_eq!(sc.attempts(), 1);
    }

    #[test]
    fn test_low_quality_stays_sampling() {
        let (mut sc, _rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);

        assert!(sc.observe(&frame_result(true, 0.3, t0), t0).is_none());
        assert_eq!(sc.state(), ScanState::Sampling);
        assert!(sc.observe(&frame_result(false, 0.9, t0), t0).is_none());
        assert_eq!(sc.state(), ScanState::Sampling);
    }

    #[test]
    fn test_success_ends_session() {
        let (mut sc, rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);
        let ticket = sc.observe(&frame_result(true, 0.8, t0), t0).unwrap();
        drain(&rx);

        let outcome = sc.complete(ticket, Ok(extraction(0.9)), t0);
        assert!(matches!(outcome, Some(ScanOutcome::Success(_))));
        assert_eq!(sc.state(), ScanState::Success);
        assert_eq!(drain(&rx), vec!["scan_complete"]);

        // Nothing after a terminal state, including the timeout
        assert!(sc.observe(&frame_result(true, 0.8, t0), t0 + Duration::from_secs(5)).is_none());
        assert!(sc.check_timeout(t0 + Duration::from_secs(120)).is_none());
    }

    #[test]
    fn test_three_low_confidence_attempts_fail() {
        let settings = ScanSettings {
            max_attempts: 3,
            cooldown_ms: 1000,
            ..ScanSettings::default()
        };
        let (mut sc, _rx) = controller(settings);
        let mut now = Instant::now();
        sc.start(now);

        let mut captures = 0;
        let mut outcome = None;
        for _ in 0..20 {
            if let Some(ticket) = sc.observe(&frame_result(true, 0.8, now), now) {
                captures += 1;
                outcome = sc.complete(ticket, Ok(extraction(0.1)), now);
                if outcome.is_some() {
                    break;
                }
            }
            now += Duration::from_millis(500);
        }

        assert_eq!(captures, 3);
        assert!(matches!(
            outcome,
            Some(ScanOutcome::Failed {
                attempts: 3,
                last_failure: ScanFailure::LowConfidence { .. }
            })
        ));
        assert_eq!(sc.state(), ScanState::Failed);

        // No fourth capture
        now += Duration::from_secs(10);
        assert!(sc.observe(&frame_result(true, 0.8, now), now).is_none());
        assert_eq!(sc.manual_scan(now), Err(ScanFailure::Inactive));
        assert_eq!(sc.attempts(), 3);
    }

    #[test]
    fn test_cooldown_between_triggered_captures() {
        let settings = ScanSettings {
            cooldown_ms: 2000,
            ..ScanSettings::default()
        };
        let (mut sc, _rx) = controller(settings);
        let t0 = Instant::now();
        sc.start(t0);

        let ticket = sc.observe(&frame_result(true, 0.8, t0), t0).unwrap();
        assert!(sc.complete(ticket, Err(ScanFailure::Capture(crate::error::CaptureError::EmptyImage)), t0).is_none());
        assert!(matches!(sc.state(), ScanState::Retrying { .. }));

        let early = t0 + Duration::from_millis(1999);
        assert!(sc.observe(&frame_result(true, 0.8, early), early).is_none());

        let later = t0 + Duration::from_millis(2000);
        let second = sc.observe(&frame_result(true, 0.8, later), later).unwrap();
        assert_eq!(sc.session().unwrap().last_scan_at(), Some(later));
        assert_ne!(second.attempt, ticket.attempt);
        assert_eq!(sc.attempts(), 2);
    }

    #[test]
    fn test_manual_scan_bypasses_trigger() {
        let (mut sc, _rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);

        let ticket = sc.manual_scan(t0).unwrap();
        assert!(ticket.manual);
        assert_eq!(sc.attempts(), 1);
        assert_eq!(sc.manual_scan(t0), Err(ScanFailure::Busy));

        assert!(sc.complete(ticket, Ok(extraction(0.05)), t0).is_none());
        // Cooldown does not apply to manual scans
        let again = sc.manual_scan(t0 + Duration::from_millis(1)).unwrap();
        assert_eq!(sc.attempts(), 2);
        assert!(sc.complete(again, Ok(extraction(0.05)), t0).is_none());

        let last = sc.manual_scan(t0 + Duration::from_millis(2)).unwrap();
        assert!(matches!(
            sc.complete(last, Ok(extraction(0.05)), t0),
            Some(ScanOutcome::Failed { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_manual_scan_requires_idle_session() {
        let settings = ScanSettings {
            max_attempts: 1,
            ..ScanSettings::default()
        };
        let (mut sc, _rx) = controller(settings);
        let t0 = Instant::now();
        assert_eq!(sc.manual_scan(t0), Err(ScanFailure::Inactive));

        sc.start(t0);
        sc.manual_scan(t0).unwrap();
        assert_eq!(sc.manual_scan(t0), Err(ScanFailure::Busy));
        assert!(sc.attempts() <= 1);
    }

    #[test]
    fn test_stop_returns_in_flight_ticket() {
        let (mut sc, _rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);

        let manual = sc.manual_scan(t0).unwrap();
        let returned = sc.stop().unwrap();
        assert!(returned.manual);
        assert_eq!(returned, manual);

        sc.start(t0);
        let triggered = sc.observe(&frame_result(true, 0.8, t0), t0).unwrap();
        let returned = sc.stop().unwrap();
        assert!(!returned.manual);
        assert_eq!(returned, triggered);
    }

    #[test]
    fn test_timeout_fires_once_at_deadline() {
        let settings = ScanSettings {
            auto_entry_timeout_ms: 60_000,
            ..ScanSettings::default()
        };
        let (mut sc, _rx) = controller(settings);
        let t0 = Instant::now();
        sc.start(t0);
        sc.observe(&frame_result(true, 0.8, t0), t0).unwrap();

        assert!(sc.check_timeout(t0 + Duration::from_millis(59_999)).is_none());
        let outcome = sc.check_timeout(t0 + Duration::from_secs(60));
        assert_eq!(outcome, Some(ScanOutcome::TimedOut { attempts: 1 }));
        assert_eq!(sc.state(), ScanState::TimedOut);
        assert!(sc.check_timeout(t0 + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn test_stale_result_ignored() {
        let (mut sc, rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);
        let ticket = sc.manual_scan(t0).unwrap();

        assert_eq!(sc.stop(), Some(ticket));
        assert_eq!(sc.stop(), None);
        assert_eq!(sc.state(), ScanState::Idle);

        sc.start(t0);
        assert!(sc.complete(ticket, Ok(extraction(1.0)), t0).is_none());
        assert_eq!(sc.state(), ScanState::Sampling);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_events_fire_on_changes_only() {
        let (mut sc, rx) = controller(ScanSettings::default());
        let t0 = Instant::now();
        sc.start(t0);

        sc.observe(&frame_result(false, 0.2, t0), t0);
        sc.observe(&frame_result(false, 0.2, t0), t0);
        assert_eq!(drain(&rx), vec!["quality_changed"]);

        sc.observe(&frame_result(true, 0.3, t0), t0);
        assert_eq!(drain(&rx), vec!["document_detected", "quality_changed"]);

        sc.observe(&frame_result(true, 0.3, t0), t0);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_attempts_never_decrease_or_exceed_max() {
        let settings = ScanSettings {
            max_attempts: 2,
            cooldown_ms: 0,
            ..ScanSettings::default()
        };
        let (mut sc, _rx) = controller(settings);
        let mut now = Instant::now();
        sc.start(now);

        let mut previous = 0;
        for i in 0..10 {
            if let Some(ticket) = sc.observe(&frame_result(true, 0.9, now), now) {
                sc.complete(ticket, Ok(extraction(0.0)), now);
            }
            let _ = sc.manual_scan(now);
            assert!(sc.attempts() >= previous);
            assert!(sc.attempts() <= 2, "iteration {i}");
            previous = sc.attempts();
            now += Duration::from_millis(10);
        }
    }
}
