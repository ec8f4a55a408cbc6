#![forbid(unsafe_code)]

//! Exclusive owner of the scanner handle.
//!
//! The vendor SDK is single-handle and not reentrant, so every call into it happens while holding
//! the session's SDK lock, and the public operations first claim the `Ready -> Busy` transition.
//! A second caller arriving while a capture or merge is in flight is rejected with
//! [`DeviceError::Busy`] instead of being queued behind it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fpbridge_kernel_contracts::device::{CaptureParams, DeviceInfo, DeviceState};
use fpbridge_kernel_contracts::enrollment::FailureReason;
use thiserror::Error;

use crate::cancel::CancelToken;

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SCANNER_MODEL: &str = "ZKTeco Scanner";

/// Failures reported by the vendor capability itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    #[error("no scanner attached")]
    NoDevice,

    #[error("driver error code {0}")]
    Driver(i32),

    #[error("merge rejected with code {0}")]
    MergeRejected(i32),
}

/// The opaque vendor capability. Only [`DeviceSession`] calls into it.
pub trait ScannerSdk: Send {
    /// Opens the first attached scanner and reports its capture geometry.
    fn open(&mut self) -> Result<CaptureParams, SdkError>;

    /// Marks the start of a new capture, before its first [`ScannerSdk::acquire`] poll.
    fn begin_capture(&mut self) {}

    /// One non-blocking acquisition poll. `Ok(None)` means no finger on the sensor yet.
    fn acquire(&mut self) -> Result<Option<Vec<u8>>, SdkError>;

    fn merge(&mut self, t1: &[u8], t2: &[u8], t3: &[u8]) -> Result<Vec<u8>, SdkError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("scanner not ready (state: {})", .0.as_str())]
    NotReady(DeviceState),

    #[error("scanner is busy with another operation")]
    Busy,

    #[error("no finger presented within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("scanner hardware fault: {0}")]
    Fault(SdkError),

    #[error("template merge rejected: {0}")]
    Merge(SdkError),

    #[error("could not open scanner: {0}")]
    OpenFailed(SdkError),

    #[error("capture cancelled")]
    Cancelled,

    #[error("device session lock poisoned")]
    LockPoisoned,
}

impl DeviceError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DeviceError::NotReady(DeviceState::Faulted) => FailureReason::DeviceFault,
            DeviceError::NotReady(_) => FailureReason::DeviceNotReady,
            DeviceError::Busy => FailureReason::DeviceBusy,
            DeviceError::Timeout(_) => FailureReason::Timeout,
            DeviceError::Fault(_) | DeviceError::OpenFailed(_) | DeviceError::LockPoisoned => {
                FailureReason::DeviceFault
            }
            DeviceError::Merge(_) => FailureReason::MergeError,
            DeviceError::Cancelled => FailureReason::Cancelled,
        }
    }
}

pub struct DeviceSession {
    model: String,
    poll_interval: Duration,
    state: Mutex<DeviceState>,
    info: Mutex<Option<DeviceInfo>>,
    sdk: Mutex<Box<dyn ScannerSdk>>,
}

impl DeviceSession {
    pub fn new(sdk: Box<dyn ScannerSdk>) -> Self {
        Self::with_settings(sdk, DEFAULT_SCANNER_MODEL, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_settings(
        sdk: Box<dyn ScannerSdk>,
        model: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            model: model.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: Mutex::new(DeviceState::Disconnected),
            info: Mutex::new(None),
            sdk: Mutex::new(sdk),
        }
    }

    /// Current state. Never waits on an in-flight capture.
    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `Disconnected|Faulted -> Connecting -> Ready`, or `-> Faulted` when the SDK refuses.
    /// Already `Ready` is a no-op success.
    pub fn initialize(&self) -> Result<DeviceInfo, DeviceError> {
        let previous = {
            let mut state = self.state.lock().map_err(|_| DeviceError::LockPoisoned)?;
            match *state {
                DeviceState::Ready => {
                    if let Some(info) = self.device_info() {
                        return Ok(info);
                    }
                }
                DeviceState::Busy | DeviceState::Connecting => return Err(DeviceError::Busy),
                DeviceState::Disconnected | DeviceState::Faulted => {}
            }
            let previous = *state;
            *state = DeviceState::Connecting;
            previous
        };

        let mut sdk = match self.sdk.lock() {
            Ok(sdk) => sdk,
            Err(_) => {
                self.set_state(DeviceState::Faulted);
                return Err(DeviceError::LockPoisoned);
            }
        };
        if previous == DeviceState::Faulted {
            sdk.close();
        }
        match sdk.open() {
            Ok(params) => {
                let info = match DeviceInfo::new(self.model.clone(), params) {
                    Ok(info) => info,
                    Err(_) => {
                        sdk.close();
                        self.set_state(DeviceState::Faulted);
                        return Err(DeviceError::OpenFailed(SdkError::NoDevice));
                    }
                };
                self.set_info(Some(info.clone()));
                self.set_state(DeviceState::Ready);
                tracing::info!(
                    model = %info.model,
                    width = info.params.image_width,
                    height = info.params.image_height,
                    "scanner opened"
                );
                Ok(info)
            }
            Err(err) => {
                self.set_info(None);
                self.set_state(DeviceState::Faulted);
                tracing::warn!(error = %err, "scanner open failed");
                Err(DeviceError::OpenFailed(err))
            }
        }
    }

    /// Polls the sensor until a template arrives, `timeout` elapses or `cancel` fires.
    pub fn capture(&self, timeout: Duration, cancel: &CancelToken) -> Result<Vec<u8>, DeviceError> {
        let mut sdk = self.claim()?;
        sdk.begin_capture();
        let outcome = poll_for_template(&mut **sdk, timeout, self.poll_interval, cancel);
        let next = match &outcome {
            Err(DeviceError::Fault(err)) => {
                tracing::error!(error = %err, "scanner fault during capture");
                DeviceState::Faulted
            }
            _ => DeviceState::Ready,
        };
        // Released while still holding the SDK lock so a waiting disconnect wins the last word.
        self.set_state(next);
        drop(sdk);
        outcome
    }

    pub fn merge(&self, t1: &[u8], t2: &[u8], t3: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let mut sdk = self.claim()?;
        let outcome = sdk.merge(t1, t2, t3).map_err(DeviceError::Merge);
        self.set_state(DeviceState::Ready);
        drop(sdk);
        outcome
    }

    /// Any state -> `Disconnected`. Waits for an in-flight SDK call to return first.
    pub fn disconnect(&self) {
        let mut sdk = self.sdk.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != DeviceState::Disconnected {
            sdk.close();
            tracing::info!("scanner closed");
        }
        self.set_info(None);
        self.set_state(DeviceState::Disconnected);
    }

    fn claim(&self) -> Result<MutexGuard<'_, Box<dyn ScannerSdk>>, DeviceError> {
        {
            let mut state = self.state.lock().map_err(|_| DeviceError::LockPoisoned)?;
            match *state {
                DeviceState::Ready => *state = DeviceState::Busy,
                DeviceState::Busy | DeviceState::Connecting => return Err(DeviceError::Busy),
                other => return Err(DeviceError::NotReady(other)),
            }
        }
        let sdk = match self.sdk.lock() {
            Ok(sdk) => sdk,
            Err(_) => {
                self.set_state(DeviceState::Faulted);
                return Err(DeviceError::LockPoisoned);
            }
        };
        // A disconnect may have slipped in between the claim and the SDK lock.
        let state = self.state();
        if state != DeviceState::Busy {
            return Err(DeviceError::NotReady(state));
        }
        Ok(sdk)
    }

    fn set_state(&self, next: DeviceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn set_info(&self, info: Option<DeviceInfo>) {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }
}

fn poll_for_template(
    sdk: &mut dyn ScannerSdk,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancelToken,
) -> Result<Vec<u8>, DeviceError> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        match sdk.acquire() {
            Ok(Some(template)) => return Ok(template),
            Ok(None) => {}
            Err(err) => return Err(DeviceError::Fault(err)),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DeviceError::Timeout(timeout));
        }
        if cancel.wait(poll_interval.min(deadline - now)) {
            return Err(DeviceError::Cancelled);
        }
    }
}
