#![forbid(unsafe_code)]

pub mod config;
pub mod http;

use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Local, TimeZone};
use fpbridge_engines::log_stream::{format_wire_time, parse_wire_time, LogStream};
use fpbridge_engines::quality::QualityScorer;
use fpbridge_kernel_contracts::enrollment::{EnrollmentSession, EnrollmentStatus, FingerIndex};
use fpbridge_kernel_contracts::logs::{LogEvent, LogLevel, LogSeq};
use fpbridge_os::device::{DeviceError, DeviceSession, ScannerSdk};
use fpbridge_os::enrollment::{EnrollmentError, EnrollmentOrchestrator, EnrollmentRequest};
use fpbridge_os::simulated::{SimulatedScanner, SimulatedScannerConfig};

pub use config::{BridgeConfig, ConfigError};

/// API version reported by `GET /test`; the web client pins against it.
pub const BRIDGE_API_VERSION: &str = "1.0.0";
pub const RECENT_LOGS_LIMIT: usize = 50;
pub const TEST_SUBJECT_ID: &str = "TEST";
pub const TEST_FINGER_INDEX: FingerIndex = FingerIndex(1);

const SCANNER_NOT_CONNECTED: &str = "Scanner not connected";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    pub message: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InitializeResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScannerStatusBody {
    pub connected: bool,
    pub state: String,
    pub device_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScannerStatusResponse {
    pub success: bool,
    pub status: ScannerStatusBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CaptureRequest {
    #[serde(default, alias = "employee_id")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub finger_index: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TestEnrollmentRequest {
    #[serde(default)]
    pub finger_index: Option<i32>,
}

/// Outcome of a capture as the web client reads it. Template fields are present only on success.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CaptureResponse {
    pub success: bool,
    pub message: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finger_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finger_name: Option<String>,
}

impl CaptureResponse {
    fn rejected(message: impl Into<String>) -> Self {
        Self::unsuccessful("rejected", message)
    }

    fn unsuccessful(status: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            status: status.to_string(),
            template_data: None,
            template_size: None,
            quality_score: None,
            quality: None,
            finger_index: None,
            finger_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    fn from_event<Tz>(event: LogEvent, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            seq: event.seq.0,
            timestamp: format_wire_time(event.at, tz),
            level: event.level,
            message: event.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogsSinceQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub cursor: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogsSinceResponse {
    pub success: bool,
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecentLogsResponse {
    pub success: bool,
    pub logs: Vec<LogEntry>,
    pub total_logs: usize,
}

/// Everything the HTTP surface talks to. Every method is synchronous; enrollment-bearing calls
/// block for the whole three-scan session and belong on a blocking thread.
pub struct BridgeRuntime {
    config: BridgeConfig,
    device: Arc<DeviceSession>,
    orchestrator: EnrollmentOrchestrator,
    logs: Arc<LogStream>,
}

impl BridgeRuntime {
    pub fn new(config: BridgeConfig, sdk: Box<dyn ScannerSdk>) -> Self {
        let logs = Arc::new(LogStream::new(config.log_retention));
        Self::with_log_stream(config, sdk, logs)
    }

    pub fn with_log_stream(
        config: BridgeConfig,
        sdk: Box<dyn ScannerSdk>,
        logs: Arc<LogStream>,
    ) -> Self {
        let device = Arc::new(DeviceSession::with_settings(
            sdk,
            config.scanner_model.clone(),
            config.poll_interval,
        ));
        let scorer =
            QualityScorer::with_reference_size(config.quality_reference_size).unwrap_or_default();
        let orchestrator =
            EnrollmentOrchestrator::new(config.enrollment(), device.clone(), scorer, logs.clone());
        Self {
            config,
            device,
            orchestrator,
            logs,
        }
    }

    /// Runtime backed by the in-process simulated scanner.
    pub fn simulated(config: BridgeConfig) -> Self {
        let sim = SimulatedScanner::new(SimulatedScannerConfig {
            finger_delay: config.sim_finger_delay,
            ..SimulatedScannerConfig::desktop_default()
        });
        Self::new(config, Box::new(sim))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceSession {
        &self.device
    }

    pub fn log_stream(&self) -> &LogStream {
        &self.logs
    }

    pub fn test_connection(&self) -> TestConnectionResponse {
        self.test_connection_at(&Local::now())
    }

    pub fn test_connection_at<Tz>(&self, now: &DateTime<Tz>) -> TestConnectionResponse
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        self.logs.info("🔗 Connection test from web client");
        TestConnectionResponse {
            success: true,
            message: "Desktop Bridge API is running".to_string(),
            version: BRIDGE_API_VERSION.to_string(),
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn initialize_scanner(&self) -> InitializeResponse {
        self.logs.info("🔌 Initializing scanner...");
        match self.device.initialize() {
            Ok(info) => {
                let display = info.display();
                self.logs.success(format!(
                    "✅ Scanner connected: {}x{}",
                    info.params.image_width, info.params.image_height
                ));
                InitializeResponse {
                    success: true,
                    message: "Scanner initialized successfully".to_string(),
                    device_info: Some(display),
                }
            }
            Err(DeviceError::Busy) => {
                self.logs
                    .warning("⚠️ Scanner is busy, initialization skipped");
                InitializeResponse {
                    success: false,
                    message: "Scanner is busy".to_string(),
                    device_info: None,
                }
            }
            Err(err) => {
                self.logs
                    .error(format!("❌ Failed to connect to scanner: {err}"));
                InitializeResponse {
                    success: false,
                    message: format!("Could not connect to scanner: {err}"),
                    device_info: None,
                }
            }
        }
    }

    /// Cancels any running enrollment, then releases the handle. Always succeeds.
    pub fn disconnect_scanner(&self) -> MessageResponse {
        if self.orchestrator.abort() {
            self.logs
                .warning("⛔ Disconnect requested during enrollment, aborting");
        }
        self.device.disconnect();
        self.logs.info("🔌 Scanner disconnected");
        MessageResponse::ok("Scanner disconnected successfully")
    }

    pub fn scanner_status(&self) -> ScannerStatusResponse {
        let state = self.device.state();
        let device_info = match self.device.device_info() {
            Some(info) if state.is_connected() => info.display(),
            _ => SCANNER_NOT_CONNECTED.to_string(),
        };
        ScannerStatusResponse {
            success: true,
            status: ScannerStatusBody {
                connected: state.is_connected(),
                state: state.as_str().to_string(),
                device_info,
            },
        }
    }

    /// Runs the full three-scan enrollment. Blocks until Completed, Failed or Aborted.
    pub fn capture_fingerprint(&self, request: CaptureRequest) -> CaptureResponse {
        let Some(finger_index) = request.finger_index else {
            return CaptureResponse::rejected("finger_index is required");
        };
        let finger = FingerIndex(finger_index);
        let subject_id = request.subject_id.unwrap_or_default();
        self.run_enrollment(EnrollmentRequest::new(subject_id, finger), |session| {
            let quality = session
                .composite_quality()
                .map(|q| q.value())
                .unwrap_or(0);
            let size = session.final_template().map(<[u8]>::len).unwrap_or(0);
            format!("Fingerprint captured successfully: {size} bytes, Quality: {quality}%")
        })
    }

    /// Demo enrollment for the bridge test page. Defaults to the left index finger.
    pub fn test_enrollment(&self, request: TestEnrollmentRequest) -> CaptureResponse {
        let finger = request
            .finger_index
            .map(FingerIndex)
            .unwrap_or(TEST_FINGER_INDEX);
        if self.device.state().is_connected() {
            self.logs.info(format!(
                "🧪 TEST MODE: Starting 3-scan enrollment for {}",
                finger.display_name()
            ));
        }
        self.run_enrollment(
            EnrollmentRequest::new(TEST_SUBJECT_ID, finger),
            |session| {
                format!(
                    "Test enrollment completed for {}",
                    session.finger_index().display_name()
                )
            },
        )
    }

    pub fn abort_enrollment(&self) -> MessageResponse {
        if self.orchestrator.abort() {
            MessageResponse::ok("Enrollment abort requested")
        } else {
            MessageResponse::err("No enrollment in progress")
        }
    }

    pub fn is_enrolling(&self) -> bool {
        self.orchestrator.is_active()
    }

    pub fn logs_since(&self, query: LogsSinceQuery) -> LogsSinceResponse {
        self.logs_since_at(query, &Local::now())
    }

    /// `cursor` wins over `since`. An empty or missing `since` returns the whole retained buffer.
    pub fn logs_since_at<Tz>(&self, query: LogsSinceQuery, now: &DateTime<Tz>) -> LogsSinceResponse
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let tz = now.timezone();
        let events = if let Some(cursor) = query.cursor {
            self.logs.after(LogSeq(cursor))
        } else {
            match query.since.as_deref().map(str::trim) {
                None | Some("") => self.logs.since(None),
                Some(raw) => match parse_wire_time(raw) {
                    Some(time_of_day) => self.logs.since_wire_time(time_of_day, now),
                    None => {
                        return LogsSinceResponse {
                            success: false,
                            logs: Vec::new(),
                            message: Some(format!(
                                "Invalid since timestamp '{raw}', expected HH:MM:SS"
                            )),
                        }
                    }
                },
            }
        };
        LogsSinceResponse {
            success: true,
            logs: events
                .into_iter()
                .map(|e| LogEntry::from_event(e, &tz))
                .collect(),
            message: None,
        }
    }

    pub fn recent_logs(&self) -> RecentLogsResponse {
        let tz = Local;
        let (events, total_logs) = self.logs.recent(RECENT_LOGS_LIMIT);
        RecentLogsResponse {
            success: true,
            logs: events
                .into_iter()
                .map(|e| LogEntry::from_event(e, &tz))
                .collect(),
            total_logs,
        }
    }

    pub fn clear_logs(&self) -> MessageResponse {
        self.logs.clear();
        self.logs.info("🧹 Logs cleared");
        MessageResponse::ok("Logs cleared successfully")
    }

    fn run_enrollment<F>(&self, request: EnrollmentRequest, success_message: F) -> CaptureResponse
    where
        F: FnOnce(&EnrollmentSession) -> String,
    {
        if !self.device.state().is_connected() {
            return CaptureResponse::rejected(SCANNER_NOT_CONNECTED);
        }
        let finger = request.finger_index;
        let session = match self.orchestrator.enroll(request) {
            Ok(session) => session,
            Err(EnrollmentError::ConcurrencyConflict) => {
                return CaptureResponse::rejected("Another enrollment is already in progress")
            }
            Err(EnrollmentError::InvalidRequest(violation)) => {
                return CaptureResponse::rejected(format!("Invalid request: {violation}"))
            }
            Err(err) => {
                tracing::error!(error = %err, "enrollment aborted by internal error");
                self.logs.error(format!("❌ Enrollment error: {err}"));
                return CaptureResponse::unsuccessful("failed", format!("Enrollment error: {err}"));
            }
        };

        match session.status() {
            EnrollmentStatus::Completed => {
                let (Some(template), Some(quality)) =
                    (session.final_template(), session.composite_quality())
                else {
                    return CaptureResponse::unsuccessful(
                        "failed",
                        "Enrollment completed without a merged template",
                    );
                };
                let message = success_message(&session);
                self.logs.success(message.clone());
                CaptureResponse {
                    success: true,
                    message,
                    status: EnrollmentStatus::Completed.as_str().to_string(),
                    template_data: Some(base64::engine::general_purpose::STANDARD.encode(template)),
                    template_size: Some(template.len()),
                    quality_score: Some(quality.value()),
                    quality: Some(quality.value()),
                    finger_index: Some(finger.0),
                    finger_name: Some(finger.display_name()),
                }
            }
            EnrollmentStatus::Aborted => CaptureResponse::unsuccessful(
                EnrollmentStatus::Aborted.as_str(),
                "Enrollment aborted",
            ),
            EnrollmentStatus::Failed | EnrollmentStatus::InProgress => {
                let reason = session
                    .failure()
                    .map(|r| r.as_str())
                    .unwrap_or("unknown");
                CaptureResponse::unsuccessful(
                    EnrollmentStatus::Failed.as_str(),
                    format!("Failed to capture fingerprint ({reason}). Please try again."),
                )
            }
        }
    }
}
