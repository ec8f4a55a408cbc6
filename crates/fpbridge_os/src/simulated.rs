#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use fpbridge_kernel_contracts::device::CaptureParams;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::device::{ScannerSdk, SdkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedScannerConfig {
    /// How long after the first poll of a capture the simulated finger lands.
    pub finger_delay: Duration,
    pub template_size: usize,
    /// Share of non-zero bytes per template, in percent.
    pub density_percent: u8,
    pub image_width: u32,
    pub image_height: u32,
    pub seed: u64,
    pub fail_open: bool,
    /// 1-based capture number that reports a hardware fault instead of a template.
    pub fault_on_capture: Option<u32>,
    /// 1-based capture number from which on no finger is ever presented.
    pub withhold_from_capture: Option<u32>,
    pub reject_merge: bool,
}

impl SimulatedScannerConfig {
    pub fn desktop_default() -> Self {
        Self {
            finger_delay: Duration::from_millis(1500),
            template_size: 600,
            density_percent: 60,
            image_width: 300,
            image_height: 400,
            seed: 0x5EED_F1A6,
            fail_open: false,
            fault_on_capture: None,
            withhold_from_capture: None,
            reject_merge: false,
        }
    }

    /// No finger delay. Used by tests and smoke checks.
    pub fn instant() -> Self {
        Self {
            finger_delay: Duration::ZERO,
            ..Self::desktop_default()
        }
    }
}

impl Default for SimulatedScannerConfig {
    fn default() -> Self {
        Self::desktop_default()
    }
}

/// In-process stand-in for the vendor SDK, with injectable faults.
pub struct SimulatedScanner {
    config: SimulatedScannerConfig,
    rng: StdRng,
    open: bool,
    captures_started: u32,
    finger_due: Option<Instant>,
}

impl SimulatedScanner {
    pub fn new(config: SimulatedScannerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            open: false,
            captures_started: 0,
            finger_due: None,
        }
    }

    pub fn captures_started(&self) -> u32 {
        self.captures_started
    }

    fn start_capture(&mut self) -> Instant {
        self.captures_started += 1;
        let due = Instant::now() + self.config.finger_delay;
        self.finger_due = Some(due);
        due
    }

    fn synth_template(&mut self) -> Vec<u8> {
        let size = self.config.template_size;
        let nonzero = size * usize::from(self.config.density_percent.min(100)) / 100;
        let mut template = vec![0u8; size];
        for b in template.iter_mut().take(nonzero) {
            *b = self.rng.gen_range(1..=u8::MAX);
        }
        template.shuffle(&mut self.rng);
        template
    }
}

impl ScannerSdk for SimulatedScanner {
    fn open(&mut self) -> Result<CaptureParams, SdkError> {
        if self.config.fail_open {
            return Err(SdkError::NoDevice);
        }
        self.open = true;
        self.finger_due = None;
        Ok(CaptureParams {
            image_width: self.config.image_width,
            image_height: self.config.image_height,
        })
    }

    fn begin_capture(&mut self) {
        if self.open {
            self.start_capture();
        }
    }

    fn acquire(&mut self) -> Result<Option<Vec<u8>>, SdkError> {
        if !self.open {
            return Err(SdkError::NoDevice);
        }
        let due = match self.finger_due {
            Some(due) => due,
            None => self.start_capture(),
        };
        let capture_no = self.captures_started;
        if self.config.withhold_from_capture.is_some_and(|n| capture_no >= n) {
            return Ok(None);
        }
        if Instant::now() < due {
            return Ok(None);
        }
        self.finger_due = None;
        if self.config.fault_on_capture == Some(capture_no) {
            return Err(SdkError::Driver(-8));
        }
        Ok(Some(self.synth_template()))
    }

    fn merge(&mut self, t1: &[u8], t2: &[u8], t3: &[u8]) -> Result<Vec<u8>, SdkError> {
        if !self.open {
            return Err(SdkError::NoDevice);
        }
        if self.config.reject_merge || t1.is_empty() || t2.is_empty() || t3.is_empty() {
            return Err(SdkError::MergeRejected(-22));
        }
        let len = t1.len().max(t2.len()).max(t3.len());
        let at = |t: &[u8], i: usize| t.get(i).copied().unwrap_or(0);
        Ok((0..len)
            .map(|i| at(t1, i) | at(t2, i) | at(t3, i))
            .collect())
    }

    fn close(&mut self) {
        self.open = false;
        self.finger_due = None;
    }
}
