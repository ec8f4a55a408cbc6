#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const ENROLLMENT_ATTEMPT_COUNT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "subject_id",
                reason: "must not be empty",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Which digit is being enrolled. Opaque to the bridge; only used for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FingerIndex(pub i32);

impl FingerIndex {
    pub fn display_name(self) -> String {
        let name = match self.0 {
            0 => "Ngón cái trái",
            1 => "Ngón trỏ trái",
            2 => "Ngón giữa trái",
            3 => "Ngón áp út trái",
            4 => "Ngón út trái",
            5 => "Ngón cái phải",
            6 => "Ngón trỏ phải",
            7 => "Ngón giữa phải",
            8 => "Ngón áp út phải",
            9 => "Ngón út phải",
            other => return format!("Ngón {other}"),
        };
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualityScore(u8);

impl QualityScore {
    pub const ZERO: QualityScore = QualityScore(0);
    pub const MAX: QualityScore = QualityScore(100);

    pub fn new(value: u8) -> Result<Self, ContractViolation> {
        if value > Self::MAX.0 {
            return Err(ContractViolation::InvalidRange {
                field: "quality_score",
                min: 0,
                max: 100,
                got: i64::from(value),
            });
        }
        Ok(Self(value))
    }

    pub fn saturating(value: u64) -> Self {
        Self(value.min(u64::from(Self::MAX.0)) as u8)
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptOrdinal(u8);

impl AttemptOrdinal {
    pub const FIRST: AttemptOrdinal = AttemptOrdinal(1);
    pub const LAST: AttemptOrdinal = AttemptOrdinal(ENROLLMENT_ATTEMPT_COUNT);

    pub fn new(value: u8) -> Result<Self, ContractViolation> {
        if !(1..=ENROLLMENT_ATTEMPT_COUNT).contains(&value) {
            return Err(ContractViolation::InvalidRange {
                field: "attempt_ordinal",
                min: 1,
                max: i64::from(ENROLLMENT_ATTEMPT_COUNT),
                got: i64::from(value),
            });
        }
        Ok(Self(value))
    }

    pub fn all() -> impl Iterator<Item = AttemptOrdinal> {
        (1..=ENROLLMENT_ATTEMPT_COUNT).map(AttemptOrdinal)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_last(self) -> bool {
        self.0 == ENROLLMENT_ATTEMPT_COUNT
    }

    pub fn next(self) -> Option<AttemptOrdinal> {
        Self::new(self.0.saturating_add(1)).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Waiting,
    Scanning,
    Success,
    Failure,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Waiting => "waiting",
            AttemptOutcome::Scanning => "scanning",
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::Failure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    DeviceFault,
    DeviceNotReady,
    DeviceBusy,
    MergeError,
    Cancelled,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "Timeout",
            FailureReason::DeviceFault => "DeviceFault",
            FailureReason::DeviceNotReady => "DeviceNotReady",
            FailureReason::DeviceBusy => "DeviceBusy",
            FailureReason::MergeError => "MergeError",
            FailureReason::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureAttempt {
    ordinal: AttemptOrdinal,
    outcome: AttemptOutcome,
    template: Option<Vec<u8>>,
    quality: Option<QualityScore>,
    failure: Option<FailureReason>,
}

impl CaptureAttempt {
    pub fn new(ordinal: AttemptOrdinal) -> Self {
        Self {
            ordinal,
            outcome: AttemptOutcome::Pending,
            template: None,
            quality: None,
            failure: None,
        }
    }

    pub fn ordinal(&self) -> AttemptOrdinal {
        self.ordinal
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn template(&self) -> Option<&[u8]> {
        self.template.as_deref()
    }

    pub fn quality(&self) -> Option<QualityScore> {
        self.quality
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.failure
    }

    pub fn mark_waiting(&mut self) -> Result<(), ContractViolation> {
        self.advance(AttemptOutcome::Pending, AttemptOutcome::Waiting)
    }

    pub fn mark_scanning(&mut self) -> Result<(), ContractViolation> {
        self.advance(AttemptOutcome::Waiting, AttemptOutcome::Scanning)
    }

    pub fn succeed(
        &mut self,
        template: Vec<u8>,
        quality: QualityScore,
    ) -> Result<(), ContractViolation> {
        self.advance(AttemptOutcome::Scanning, AttemptOutcome::Success)?;
        self.template = Some(template);
        self.quality = Some(quality);
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), ContractViolation> {
        if self.outcome.is_terminal() {
            return Err(ContractViolation::InvalidTransition {
                from: self.outcome.as_str(),
                to: AttemptOutcome::Failure.as_str(),
            });
        }
        self.outcome = AttemptOutcome::Failure;
        self.failure = Some(reason);
        Ok(())
    }

    fn advance(
        &mut self,
        expected: AttemptOutcome,
        next: AttemptOutcome,
    ) -> Result<(), ContractViolation> {
        if self.outcome != expected {
            return Err(ContractViolation::InvalidTransition {
                from: self.outcome.as_str(),
                to: next.as_str(),
            });
        }
        self.outcome = next;
        Ok(())
    }
}

impl Validate for CaptureAttempt {
    fn validate(&self) -> Result<(), ContractViolation> {
        let success = self.outcome == AttemptOutcome::Success;
        if success != self.template.is_some() || success != self.quality.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "capture_attempt.template",
                reason: "template and quality must be present exactly on success",
            });
        }
        if (self.outcome == AttemptOutcome::Failure) != self.failure.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "capture_attempt.failure",
                reason: "failure reason must be present exactly on failure",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl EnrollmentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::InProgress => "in_progress",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Failed => "failed",
            EnrollmentStatus::Aborted => "aborted",
        }
    }
}

/// States of the three-scan enrollment machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrollmentPhase {
    Idle,
    Attempt(AttemptOrdinal),
    Merging,
    Completed,
    Failed,
    Aborted,
}

impl EnrollmentPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            EnrollmentPhase::Idle => "idle",
            EnrollmentPhase::Attempt(AttemptOrdinal(1)) => "attempt_1",
            EnrollmentPhase::Attempt(AttemptOrdinal(2)) => "attempt_2",
            EnrollmentPhase::Attempt(_) => "attempt_3",
            EnrollmentPhase::Merging => "merging",
            EnrollmentPhase::Completed => "completed",
            EnrollmentPhase::Failed => "failed",
            EnrollmentPhase::Aborted => "aborted",
        }
    }

    pub fn can_transition_to(self, next: EnrollmentPhase) -> bool {
        use EnrollmentPhase::*;
        match (self, next) {
            (Idle, Attempt(o)) => o == AttemptOrdinal::FIRST,
            (Attempt(a), Attempt(b)) => a.next() == Some(b),
            (Attempt(a), Merging) => a.is_last(),
            (Merging, Completed) => true,
            (Attempt(_) | Merging, Failed) => true,
            (Idle | Attempt(_) | Merging, Aborted) => true,
            _ => false,
        }
    }
}

/// One (subject, finger) enrollment run. Discarded once the result is handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentSession {
    subject_id: SubjectId,
    finger_index: FingerIndex,
    attempts: Vec<CaptureAttempt>,
    status: EnrollmentStatus,
    final_template: Option<Vec<u8>>,
    composite_quality: Option<QualityScore>,
    failure: Option<FailureReason>,
    trail: Vec<EnrollmentPhase>,
}

impl EnrollmentSession {
    pub fn new(subject_id: SubjectId, finger_index: FingerIndex) -> Self {
        Self {
            subject_id,
            finger_index,
            attempts: Vec::with_capacity(usize::from(ENROLLMENT_ATTEMPT_COUNT)),
            status: EnrollmentStatus::InProgress,
            final_template: None,
            composite_quality: None,
            failure: None,
            trail: vec![EnrollmentPhase::Idle],
        }
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    pub fn finger_index(&self) -> FingerIndex {
        self.finger_index
    }

    pub fn attempts(&self) -> &[CaptureAttempt] {
        &self.attempts
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status
    }

    pub fn final_template(&self) -> Option<&[u8]> {
        self.final_template.as_deref()
    }

    pub fn composite_quality(&self) -> Option<QualityScore> {
        self.composite_quality
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.failure
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.trail
            .last()
            .copied()
            .unwrap_or(EnrollmentPhase::Idle)
    }

    /// Every phase the session has entered, oldest first.
    pub fn trail(&self) -> &[EnrollmentPhase] {
        &self.trail
    }

    pub fn has_entered(&self, phase: EnrollmentPhase) -> bool {
        self.trail.contains(&phase)
    }

    /// Enters the next phase. Entering an attempt phase opens a fresh `CaptureAttempt`.
    pub fn enter(&mut self, next: EnrollmentPhase) -> Result<(), ContractViolation> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(ContractViolation::InvalidTransition {
                from: current.as_str(),
                to: next.as_str(),
            });
        }
        if let EnrollmentPhase::Attempt(ordinal) = next {
            self.attempts.push(CaptureAttempt::new(ordinal));
        }
        self.trail.push(next);
        Ok(())
    }

    pub fn current_attempt_mut(&mut self) -> Result<&mut CaptureAttempt, ContractViolation> {
        let EnrollmentPhase::Attempt(ordinal) = self.phase() else {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_session.phase",
                reason: "no attempt in progress",
            });
        };
        match self.attempts.last_mut() {
            Some(attempt) if attempt.ordinal() == ordinal => Ok(attempt),
            _ => Err(ContractViolation::InvalidValue {
                field: "enrollment_session.attempts",
                reason: "current attempt missing",
            }),
        }
    }

    pub fn successful_templates(&self) -> Option<[&[u8]; 3]> {
        if self.attempts.len() != usize::from(ENROLLMENT_ATTEMPT_COUNT) {
            return None;
        }
        let mut it = self.attempts.iter().map(CaptureAttempt::template);
        Some([it.next()??, it.next()??, it.next()??])
    }

    pub fn attempt_scores(&self) -> Vec<QualityScore> {
        self.attempts
            .iter()
            .filter_map(CaptureAttempt::quality)
            .collect()
    }

    pub fn complete(
        &mut self,
        merged_template: Vec<u8>,
        composite: QualityScore,
    ) -> Result<(), ContractViolation> {
        if self.successful_templates().is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_session.attempts",
                reason: "completion requires three successful attempts",
            });
        }
        if merged_template.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_session.final_template",
                reason: "must not be empty",
            });
        }
        self.enter(EnrollmentPhase::Completed)?;
        self.status = EnrollmentStatus::Completed;
        self.final_template = Some(merged_template);
        self.composite_quality = Some(composite);
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), ContractViolation> {
        self.enter(EnrollmentPhase::Failed)?;
        self.status = EnrollmentStatus::Failed;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn abort(&mut self) -> Result<(), ContractViolation> {
        self.enter(EnrollmentPhase::Aborted)?;
        self.status = EnrollmentStatus::Aborted;
        self.failure = Some(FailureReason::Cancelled);
        Ok(())
    }
}

impl Validate for EnrollmentSession {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.attempts.len() > usize::from(ENROLLMENT_ATTEMPT_COUNT) {
            return Err(ContractViolation::InvalidRange {
                field: "enrollment_session.attempts",
                min: 0,
                max: i64::from(ENROLLMENT_ATTEMPT_COUNT),
                got: self.attempts.len() as i64,
            });
        }
        for (idx, attempt) in self.attempts.iter().enumerate() {
            if usize::from(attempt.ordinal().get()) != idx + 1 {
                return Err(ContractViolation::InvalidValue {
                    field: "enrollment_session.attempts",
                    reason: "ordinals must run 1..=3 in order",
                });
            }
            attempt.validate()?;
        }
        let completed = self.status == EnrollmentStatus::Completed;
        let three_successes = self.successful_templates().is_some();
        if self.final_template.is_some() != (completed && three_successes) {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_session.final_template",
                reason: "merged template exists iff completed with three successes",
            });
        }
        if self.composite_quality.is_some() != completed {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_session.composite_quality",
                reason: "composite score exists iff completed",
            });
        }
        Ok(())
    }
}
