#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use fpbridge_engines::log_stream::DEFAULT_LOG_RETENTION;
use fpbridge_engines::quality::DEFAULT_REFERENCE_SIZE;
use fpbridge_os::device::{DEFAULT_CAPTURE_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_SCANNER_MODEL};
use fpbridge_os::enrollment::{EnrollmentConfig, DEFAULT_LIFT_DELAY};
use thiserror::Error;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_SIM_FINGER_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("FPBRIDGE_HTTP_BIND is not a socket address: {0}")]
    InvalidBind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub http_bind: SocketAddr,
    pub capture_timeout: Duration,
    pub poll_interval: Duration,
    pub lift_delay: Duration,
    pub log_retention: usize,
    pub quality_reference_size: usize,
    pub scanner_model: String,
    pub sim_finger_delay: Duration,
}

impl BridgeConfig {
    pub fn default_local() -> Self {
        Self {
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lift_delay: DEFAULT_LIFT_DELAY,
            log_retention: DEFAULT_LOG_RETENTION,
            quality_reference_size: DEFAULT_REFERENCE_SIZE,
            scanner_model: DEFAULT_SCANNER_MODEL.to_string(),
            sim_finger_delay: DEFAULT_SIM_FINGER_DELAY,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Out-of-range or unparsable numbers fall back to their default.
    /// Only a bad bind address is fatal.
    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = Self::default_local();
        let http_bind = match env_getter("FPBRIDGE_HTTP_BIND") {
            Some(raw) => raw
                .trim()
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBind(raw))?,
            None => defaults.http_bind,
        };
        let capture_timeout = parse_millis(
            &mut env_getter,
            "FPBRIDGE_CAPTURE_TIMEOUT_MS",
            1_000..=120_000,
            defaults.capture_timeout,
        );
        let poll_interval = parse_millis(
            &mut env_getter,
            "FPBRIDGE_POLL_INTERVAL_MS",
            10..=1_000,
            defaults.poll_interval,
        );
        let lift_delay = parse_millis(
            &mut env_getter,
            "FPBRIDGE_LIFT_DELAY_MS",
            0..=10_000,
            defaults.lift_delay,
        );
        let sim_finger_delay = parse_millis(
            &mut env_getter,
            "FPBRIDGE_SIM_FINGER_DELAY_MS",
            0..=60_000,
            defaults.sim_finger_delay,
        );
        let log_retention = parse_ranged(
            env_getter("FPBRIDGE_LOG_RETENTION"),
            "FPBRIDGE_LOG_RETENTION",
            10..=10_000,
        )
        .map(|v| v as usize)
        .unwrap_or(defaults.log_retention);
        let quality_reference_size = parse_ranged(
            env_getter("FPBRIDGE_QUALITY_REFERENCE_SIZE"),
            "FPBRIDGE_QUALITY_REFERENCE_SIZE",
            1..=65_536,
        )
        .map(|v| v as usize)
        .unwrap_or(defaults.quality_reference_size);
        let scanner_model = env_getter("FPBRIDGE_SCANNER_MODEL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.scanner_model);

        Ok(Self {
            http_bind,
            capture_timeout,
            poll_interval,
            lift_delay,
            log_retention,
            quality_reference_size,
            scanner_model,
            sim_finger_delay,
        })
    }

    pub fn enrollment(&self) -> EnrollmentConfig {
        EnrollmentConfig {
            capture_timeout: self.capture_timeout,
            lift_delay: self.lift_delay,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::default_local()
    }
}

fn parse_millis<F>(
    env_getter: &mut F,
    key: &str,
    range: RangeInclusive<u64>,
    default: Duration,
) -> Duration
where
    F: FnMut(&str) -> Option<String>,
{
    parse_ranged(env_getter(key), key, range)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_ranged(raw: Option<String>, key: &str, range: RangeInclusive<u64>) -> Option<u64> {
    let raw = raw?;
    let parsed = raw.trim().parse::<u64>().ok().filter(|v| range.contains(v));
    if parsed.is_none() {
        tracing::warn!(
            key,
            value = %raw,
            min = range.start(),
            max = range.end(),
            "ignoring out-of-range config value"
        );
    }
    parsed
}
