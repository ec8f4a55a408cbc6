#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

/// Lifecycle of the single physical scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Faulted,
}

impl DeviceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Ready => "ready",
            DeviceState::Busy => "busy",
            DeviceState::Faulted => "faulted",
        }
    }

    /// True while a hardware handle is open and usable (idle or mid-operation).
    pub const fn is_connected(self) -> bool {
        matches!(self, DeviceState::Ready | DeviceState::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureParams {
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub params: CaptureParams,
}

impl DeviceInfo {
    pub fn new(model: impl Into<String>, params: CaptureParams) -> Result<Self, ContractViolation> {
        let info = Self {
            model: model.into(),
            params,
        };
        info.validate()?;
        Ok(info)
    }

    /// Status line shown by the web client, e.g. `ZKTeco Scanner - USB Connected (300x400)`.
    pub fn display(&self) -> String {
        format!(
            "{} - USB Connected ({}x{})",
            self.model, self.params.image_width, self.params.image_height
        )
    }
}

impl Validate for DeviceInfo {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.model.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "device_info.model",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}
