#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fpbridge_engines::log_stream::LogStream;
use fpbridge_engines::quality::QualityScorer;
use fpbridge_kernel_contracts::enrollment::{
    AttemptOrdinal, EnrollmentPhase, EnrollmentSession, FailureReason, FingerIndex, SubjectId,
};
use fpbridge_kernel_contracts::ContractViolation;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::device::{DeviceError, DeviceSession, DEFAULT_CAPTURE_TIMEOUT};

pub const DEFAULT_LIFT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentConfig {
    pub capture_timeout: Duration,
    /// Pause between attempts so the subject can lift and re-place the finger.
    pub lift_delay: Duration,
}

impl EnrollmentConfig {
    pub fn mvp_desktop_v1() -> Self {
        Self {
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            lift_delay: DEFAULT_LIFT_DELAY,
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self::mvp_desktop_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRequest {
    pub subject_id: String,
    pub finger_index: FingerIndex,
}

impl EnrollmentRequest {
    pub fn new(subject_id: impl Into<String>, finger_index: FingerIndex) -> Self {
        Self {
            subject_id: subject_id.into(),
            finger_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnrollmentError {
    #[error("an enrollment is already in progress")]
    ConcurrencyConflict,

    #[error("invalid enrollment request: {0}")]
    InvalidRequest(ContractViolation),

    #[error("enrollment state machine violated: {0}")]
    StateMachine(ContractViolation),

    #[error("enrollment slot lock poisoned")]
    LockPoisoned,
}

impl From<ContractViolation> for EnrollmentError {
    fn from(violation: ContractViolation) -> Self {
        EnrollmentError::StateMachine(violation)
    }
}

/// Drives the three-scan enrollment against the shared device session.
///
/// `enroll` blocks the calling thread for the whole session. At most one session runs at a time;
/// `abort` may be called from any other thread to cancel it.
pub struct EnrollmentOrchestrator {
    config: EnrollmentConfig,
    device: Arc<DeviceSession>,
    scorer: QualityScorer,
    logs: Arc<LogStream>,
    active: Mutex<Option<CancelToken>>,
}

/// Clears the active slot when the running enrollment returns, whatever the exit path.
struct ActiveSlot<'a> {
    slot: &'a Mutex<Option<CancelToken>>,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

enum AttemptResult {
    Captured,
    Failed(FailureReason),
    Cancelled,
}

impl EnrollmentOrchestrator {
    pub fn new(
        config: EnrollmentConfig,
        device: Arc<DeviceSession>,
        scorer: QualityScorer,
        logs: Arc<LogStream>,
    ) -> Self {
        Self {
            config,
            device,
            scorer,
            logs,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> EnrollmentConfig {
        self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Fires the running session's cancel token. Returns false when nothing is running.
    pub fn abort(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                tracing::info!("enrollment abort requested");
                true
            }
            None => false,
        }
    }

    pub fn enroll(&self, request: EnrollmentRequest) -> Result<EnrollmentSession, EnrollmentError> {
        let subject_id =
            SubjectId::new(request.subject_id).map_err(EnrollmentError::InvalidRequest)?;
        let (cancel, _slot) = self.claim_slot()?;
        self.drive(subject_id, request.finger_index, &cancel)
            .map_err(|violation| self.record_violation(violation))
    }

    fn drive(
        &self,
        subject_id: SubjectId,
        finger: FingerIndex,
        cancel: &CancelToken,
    ) -> Result<EnrollmentSession, ContractViolation> {
        let mut session = EnrollmentSession::new(subject_id, finger);
        self.logs.info(format!(
            "👆 Starting enrollment for subject {}, {} (Index: {})",
            session.subject_id().as_str(),
            finger.display_name(),
            finger.0
        ));

        for ordinal in AttemptOrdinal::all() {
            if cancel.is_cancelled() {
                return self.finish_aborted(session);
            }
            session.enter(EnrollmentPhase::Attempt(ordinal))?;
            match self.run_attempt(&mut session, ordinal, cancel)? {
                AttemptResult::Captured => {}
                AttemptResult::Cancelled => return self.finish_aborted(session),
                AttemptResult::Failed(reason) => return self.finish_failed(session, reason),
            }
            if !ordinal.is_last() {
                self.logs.info("👆 Please lift finger and place again");
                if cancel.wait(self.config.lift_delay) {
                    return self.finish_aborted(session);
                }
            }
        }

        if cancel.is_cancelled() {
            return self.finish_aborted(session);
        }
        session.enter(EnrollmentPhase::Merging)?;
        self.logs.info("🔄 Merging fingerprint templates...");
        let merged = {
            let [t1, t2, t3] =
                session
                    .successful_templates()
                    .ok_or(ContractViolation::InvalidValue {
                        field: "enrollment_session.attempts",
                        reason: "merge requires three successful attempts",
                    })?;
            self.device.merge(t1, t2, t3)
        };
        let merged = match merged {
            Ok(merged) => merged,
            Err(err) => {
                tracing::warn!(error = %err, "template merge failed");
                return self.finish_failed(session, err.failure_reason());
            }
        };
        if merged.is_empty() {
            return self.finish_failed(session, FailureReason::MergeError);
        }

        let composite = QualityScorer::composite(&session.attempt_scores());
        session.complete(merged, composite)?;
        self.logs.success(format!(
            "🎉 ENROLLMENT COMPLETED: {}",
            finger.display_name()
        ));
        for attempt in session.attempts() {
            self.logs.success(format!(
                "📊 LẦN {}: Quality {}% ({} bytes)",
                attempt.ordinal().get(),
                attempt.quality().map(|q| q.value()).unwrap_or(0),
                attempt.template().map(<[u8]>::len).unwrap_or(0)
            ));
        }
        self.logs
            .success(format!("🏆 FINAL QUALITY: {}%", composite.value()));
        tracing::info!(
            subject = session.subject_id().as_str(),
            finger = finger.0,
            quality = composite.value(),
            "enrollment completed"
        );
        Ok(session)
    }

    /// Terminal exit for a session whose state machine was driven out of contract.
    fn record_violation(&self, violation: ContractViolation) -> EnrollmentError {
        self.logs
            .error(format!("❌ ENROLLMENT FAILED: {violation}"));
        tracing::error!(error = %violation, "enrollment state machine violated");
        EnrollmentError::StateMachine(violation)
    }

    fn claim_slot(&self) -> Result<(CancelToken, ActiveSlot<'_>), EnrollmentError> {
        let mut slot = self
            .active
            .lock()
            .map_err(|_| EnrollmentError::LockPoisoned)?;
        if slot.is_some() {
            self.logs
                .warning("⚠️ Enrollment already in progress, request rejected");
            return Err(EnrollmentError::ConcurrencyConflict);
        }
        let token = CancelToken::new();
        *slot = Some(token.clone());
        Ok((token, ActiveSlot { slot: &self.active }))
    }

    fn run_attempt(
        &self,
        session: &mut EnrollmentSession,
        ordinal: AttemptOrdinal,
        cancel: &CancelToken,
    ) -> Result<AttemptResult, ContractViolation> {
        let n = ordinal.get();
        let attempt = session.current_attempt_mut()?;
        attempt.mark_waiting()?;
        self.logs.info(format!("⏳ LẦN {n} WAITING"));

        match self.device.capture(self.config.capture_timeout, cancel) {
            Ok(template) => {
                attempt.mark_scanning()?;
                self.logs.info(format!("🔄 LẦN {n} SCANNING"));
                let quality = self.scorer.score(&template);
                let size = template.len();
                attempt.succeed(template, quality)?;
                self.logs.success(format!(
                    "✅ LẦN {n} OK - Quality {}% ({size} bytes)",
                    quality.value()
                ));
                Ok(AttemptResult::Captured)
            }
            Err(DeviceError::Cancelled) => {
                attempt.fail(FailureReason::Cancelled)?;
                Ok(AttemptResult::Cancelled)
            }
            Err(err) => {
                let reason = err.failure_reason();
                attempt.fail(reason)?;
                self.logs
                    .error(format!("❌ LẦN {n} FAIL - {}", reason.as_str()));
                tracing::warn!(attempt = n, error = %err, "capture attempt failed");
                Ok(AttemptResult::Failed(reason))
            }
        }
    }

    fn finish_failed(
        &self,
        mut session: EnrollmentSession,
        reason: FailureReason,
    ) -> Result<EnrollmentSession, ContractViolation> {
        session.fail(reason)?;
        self.logs
            .error(format!("❌ ENROLLMENT FAILED: {}", reason.as_str()));
        Ok(session)
    }

    fn finish_aborted(
        &self,
        mut session: EnrollmentSession,
    ) -> Result<EnrollmentSession, ContractViolation> {
        session.abort()?;
        self.logs.warning("⛔ ENROLLMENT ABORTED");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ScannerSdk, SdkError};
    use fpbridge_kernel_contracts::device::{CaptureParams, DeviceState};
    use fpbridge_kernel_contracts::enrollment::{AttemptOutcome, EnrollmentStatus};
    use fpbridge_kernel_contracts::logs::LogLevel;
    use fpbridge_kernel_contracts::Validate;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone)]
    enum Poll {
        Template(Vec<u8>),
        Fault,
    }

    /// Hands out scripted polls once `gate` is open. An exhausted script means no finger.
    struct ScriptedSdk {
        polls: VecDeque<Poll>,
        gate: Arc<AtomicBool>,
        merge_result: Result<Vec<u8>, SdkError>,
    }

    impl ScannerSdk for ScriptedSdk {
        fn open(&mut self) -> Result<CaptureParams, SdkError> {
            Ok(CaptureParams {
                image_width: 300,
                image_height: 400,
            })
        }

        fn acquire(&mut self) -> Result<Option<Vec<u8>>, SdkError> {
            if !self.gate.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.polls.pop_front() {
                None => Ok(None),
                Some(Poll::Template(t)) => Ok(Some(t)),
                Some(Poll::Fault) => Err(SdkError::Driver(-8)),
            }
        }

        fn merge(&mut self, _t1: &[u8], _t2: &[u8], _t3: &[u8]) -> Result<Vec<u8>, SdkError> {
            self.merge_result.clone()
        }

        fn close(&mut self) {}
    }

    struct Harness {
        orchestrator: Arc<EnrollmentOrchestrator>,
        device: Arc<DeviceSession>,
        logs: Arc<LogStream>,
        gate: Arc<AtomicBool>,
    }

    fn template(size: usize, nonzero: usize) -> Vec<u8> {
        let mut t = vec![0u8; size];
        for b in t.iter_mut().take(nonzero) {
            *b = 0x5A;
        }
        t
    }

    const SHORT_TIMEOUT: EnrollmentConfig = EnrollmentConfig {
        capture_timeout: Duration::from_millis(60),
        lift_delay: Duration::ZERO,
    };

    fn harness(polls: Vec<Poll>, merge_result: Result<Vec<u8>, SdkError>) -> Harness {
        harness_with(polls, merge_result, SHORT_TIMEOUT)
    }

    fn harness_with(
        polls: Vec<Poll>,
        merge_result: Result<Vec<u8>, SdkError>,
        config: EnrollmentConfig,
    ) -> Harness {
        let gate = Arc::new(AtomicBool::new(true));
        let sdk = ScriptedSdk {
            polls: polls.into(),
            gate: gate.clone(),
            merge_result,
        };
        let device = Arc::new(DeviceSession::with_settings(
            Box::new(sdk),
            "ZKTeco Scanner",
            Duration::from_millis(2),
        ));
        device.initialize().unwrap();
        let logs = Arc::new(LogStream::new(200));
        let orchestrator = Arc::new(EnrollmentOrchestrator::new(
            config,
            device.clone(),
            QualityScorer::default(),
            logs.clone(),
        ));
        Harness {
            orchestrator,
            device,
            logs,
            gate,
        }
    }

    fn sixty_percent_scans() -> Vec<Poll> {
        (0..3).map(|_| Poll::Template(template(600, 360))).collect()
    }

    fn messages(logs: &LogStream) -> Vec<String> {
        logs.since(None).into_iter().map(|e| e.message).collect()
    }

    fn count_containing(msgs: &[String], needle: &str) -> usize {
        msgs.iter().filter(|m| m.contains(needle)).count()
    }

    fn request() -> EnrollmentRequest {
        EnrollmentRequest::new("E-0001", FingerIndex(1))
    }

    #[test]
    fn at_enroll_01_three_scans_merge_with_floor_mean_quality() {
        let h = harness(
            vec![
                Poll::Template(template(500, 400)),
                Poll::Template(template(500, 450)),
                Poll::Template(template(500, 500)),
            ],
            Ok(vec![0xAB; 512]),
        );
        let session = h.orchestrator.enroll(request()).unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Completed);
        let scores: Vec<u8> = session.attempt_scores().iter().map(|q| q.value()).collect();
        assert_eq!(scores, vec![80, 90, 100]);
        assert_eq!(session.composite_quality().unwrap().value(), 90);
        assert_eq!(session.final_template().unwrap().len(), 512);
        session.validate().unwrap();

        let msgs = messages(&h.logs);
        assert!(msgs[0].contains("E-0001"));
        assert!(msgs[0].contains("Ngón trỏ trái"));
        assert_eq!(count_containing(&msgs, "Please lift finger"), 2);
        assert!(msgs.iter().any(|m| m == "🏆 FINAL QUALITY: 90%"));
        assert!(msgs.iter().any(|m| m == "📊 LẦN 2: Quality 90% (500 bytes)"));
        assert!(!h.orchestrator.is_active());
        assert_eq!(h.device.state(), DeviceState::Ready);
    }

    #[test]
    fn at_enroll_02_timeout_on_second_attempt_fails_without_retry() {
        let h = harness(vec![Poll::Template(template(600, 360))], Ok(vec![1; 8]));
        let session = h.orchestrator.enroll(request()).unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Failed);
        assert_eq!(session.failure(), Some(FailureReason::Timeout));
        assert_eq!(session.attempts().len(), 2);
        assert_eq!(session.attempts()[1].outcome(), AttemptOutcome::Failure);
        assert!(session.final_template().is_none());
        assert!(!session.has_entered(EnrollmentPhase::Merging));

        let msgs = messages(&h.logs);
        assert_eq!(count_containing(&msgs, " OK - "), 1);
        assert_eq!(count_containing(&msgs, "LẦN 2 FAIL - Timeout"), 1);
        assert_eq!(count_containing(&msgs, " FAIL - "), 1);
        assert!(msgs.iter().any(|m| m == "❌ ENROLLMENT FAILED: Timeout"));
        assert_eq!(h.device.state(), DeviceState::Ready);
    }

    #[test]
    fn at_enroll_03_fault_on_first_attempt_never_merges() {
        let h = harness(vec![Poll::Fault], Ok(vec![1; 8]));
        let session = h.orchestrator.enroll(request()).unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Failed);
        assert_eq!(session.failure(), Some(FailureReason::DeviceFault));
        assert_eq!(session.attempts().len(), 1);
        assert!(!session.has_entered(EnrollmentPhase::Merging));
        assert_eq!(h.device.state(), DeviceState::Faulted);
        assert_eq!(count_containing(&messages(&h.logs), "WAITING"), 1);
    }

    #[test]
    fn at_enroll_04_second_enrollment_is_rejected_while_first_runs() {
        let h = harness_with(
            sixty_percent_scans(),
            Ok(vec![1; 64]),
            EnrollmentConfig {
                capture_timeout: Duration::from_secs(10),
                lift_delay: Duration::ZERO,
            },
        );
        h.gate.store(false, Ordering::SeqCst);
        let orchestrator = h.orchestrator.clone();
        let first = std::thread::spawn(move || {
            orchestrator.enroll(EnrollmentRequest::new("E-0001", FingerIndex(1)))
        });
        while h.device.state() != DeviceState::Busy {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.orchestrator.is_active());

        let second = h
            .orchestrator
            .enroll(EnrollmentRequest::new("E-0002", FingerIndex(2)));
        assert_eq!(second.unwrap_err(), EnrollmentError::ConcurrencyConflict);

        h.gate.store(true, Ordering::SeqCst);
        let first = first.join().unwrap().unwrap();
        assert_eq!(first.status(), EnrollmentStatus::Completed);
        assert_eq!(first.composite_quality().unwrap().value(), 60);
        assert!(!h.orchestrator.is_active());
    }

    #[test]
    fn at_enroll_05_abort_mid_capture_leaves_device_ready() {
        let h = harness_with(
            vec![],
            Ok(vec![1; 8]),
            EnrollmentConfig {
                capture_timeout: Duration::from_secs(10),
                lift_delay: Duration::ZERO,
            },
        );
        let orchestrator = h.orchestrator.clone();
        let worker = std::thread::spawn(move || {
            orchestrator.enroll(EnrollmentRequest::new("E-0001", FingerIndex(3)))
        });
        while h.device.state() != DeviceState::Busy {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.orchestrator.abort());
        let session = worker.join().unwrap().unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Aborted);
        assert_eq!(session.attempts()[0].failure(), Some(FailureReason::Cancelled));
        assert!(!session.has_entered(EnrollmentPhase::Merging));
        assert_eq!(h.device.state(), DeviceState::Ready);
        assert!(!h.orchestrator.abort());
        session.validate().unwrap();
    }

    #[test]
    fn at_enroll_06_abort_during_lift_delay_stops_further_attempts() {
        let h = harness_with(
            sixty_percent_scans(),
            Ok(vec![1; 8]),
            EnrollmentConfig {
                capture_timeout: Duration::from_secs(5),
                lift_delay: Duration::from_secs(30),
            },
        );
        let orchestrator = h.orchestrator.clone();
        let worker = std::thread::spawn(move || orchestrator.enroll(request()));
        while count_containing(&messages(&h.logs), "Please lift finger") == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.orchestrator.abort());
        let session = worker.join().unwrap().unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Aborted);
        assert_eq!(session.failure(), Some(FailureReason::Cancelled));
        assert_eq!(session.attempts().len(), 1);
        let msgs = messages(&h.logs);
        assert_eq!(msgs.last().map(String::as_str), Some("⛔ ENROLLMENT ABORTED"));
        assert_eq!(h.device.state(), DeviceState::Ready);
    }

    #[test]
    fn at_enroll_07_merge_rejection_fails_without_template() {
        let h = harness(sixty_percent_scans(), Err(SdkError::MergeRejected(-22)));
        let session = h.orchestrator.enroll(request()).unwrap();

        assert_eq!(session.status(), EnrollmentStatus::Failed);
        assert_eq!(session.failure(), Some(FailureReason::MergeError));
        assert!(session.has_entered(EnrollmentPhase::Merging));
        assert!(session.final_template().is_none());
        assert!(session.composite_quality().is_none());
        session.validate().unwrap();
    }

    #[test]
    fn at_enroll_08_blank_subject_is_rejected_before_touching_device() {
        let h = harness(vec![], Ok(vec![1; 8]));
        let err = h
            .orchestrator
            .enroll(EnrollmentRequest::new("  ", FingerIndex(1)))
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::InvalidRequest(_)));
        assert!(h.logs.is_empty());
    }

    #[test]
    fn at_enroll_09_disconnected_device_fails_first_attempt() {
        let h = harness(vec![], Ok(vec![1; 8]));
        h.device.disconnect();
        let session = h.orchestrator.enroll(request()).unwrap();
        assert_eq!(session.status(), EnrollmentStatus::Failed);
        assert_eq!(session.failure(), Some(FailureReason::DeviceNotReady));
    }

    #[test]
    fn at_enroll_10_state_machine_violation_is_logged_as_terminal_failure() {
        let h = harness(vec![], Ok(vec![1; 8]));
        let violation = ContractViolation::InvalidTransition {
            from: "completed",
            to: "attempt_1",
        };
        let err = h.orchestrator.record_violation(violation.clone());

        assert_eq!(err, EnrollmentError::StateMachine(violation));
        let events = h.logs.since(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, LogLevel::Error);
        assert!(events[0].message.starts_with("❌ ENROLLMENT FAILED: "));
    }
}
