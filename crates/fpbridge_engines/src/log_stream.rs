#![forbid(unsafe_code)]

//! Append-only progress feed polled by the web client.
//!
//! The stream is a bounded ring: once `capacity` events are retained the oldest one is dropped
//! on every append. Logs older than the retention horizon may therefore be unavailable to a
//! late poller; `since` and `after` then return the oldest events still held instead of failing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use fpbridge_kernel_contracts::logs::{LogEvent, LogLevel, LogSeq};
use fpbridge_kernel_contracts::UnixTimeSec;

pub const DEFAULT_LOG_RETENTION: usize = 100;
pub const WIRE_TIME_FORMAT: &str = "%H:%M:%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeSec;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeSec {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        UnixTimeSec(secs)
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeSec) -> Self {
        Self {
            now: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, at: UnixTimeSec) {
        self.now.store(at.0, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        let next = UnixTimeSec(self.now.load(Ordering::SeqCst)).saturating_add_secs(secs);
        self.now.store(next.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeSec {
        UnixTimeSec(self.now.load(Ordering::SeqCst))
    }
}

#[derive(Debug)]
struct LogBuffer {
    events: VecDeque<LogEvent>,
    next_seq: u64,
    last_at: UnixTimeSec,
}

pub struct LogStream {
    capacity: usize,
    clock: Arc<dyn Clock>,
    buffer: Mutex<LogBuffer>,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            clock,
            buffer: Mutex::new(LogBuffer {
                events: VecDeque::with_capacity(capacity),
                next_seq: 1,
                last_at: UnixTimeSec::EPOCH,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn now(&self) -> UnixTimeSec {
        self.clock.now()
    }

    /// Appends one event stamped with the current second. Never fails.
    pub fn append(&self, level: LogLevel, message: impl Into<String>) -> LogSeq {
        let message = message.into();
        let now = self.clock.now();
        let seq = {
            let mut buffer = self.lock();
            // Wall clock may step backwards; the feed must not.
            let at = now.max(buffer.last_at);
            let seq = LogSeq(buffer.next_seq);
            buffer.next_seq = buffer.next_seq.saturating_add(1);
            buffer.last_at = at;
            if buffer.events.len() >= self.capacity {
                buffer.events.pop_front();
            }
            buffer.events.push_back(LogEvent {
                seq,
                at,
                level,
                message: message.clone(),
            });
            seq
        };
        match level {
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(seq = seq.0, level = level.as_str(), "{message}")
            }
            LogLevel::Warning => tracing::warn!(seq = seq.0, "{message}"),
            LogLevel::Error => tracing::error!(seq = seq.0, "{message}"),
        }
        seq
    }

    pub fn info(&self, message: impl Into<String>) -> LogSeq {
        self.append(LogLevel::Info, message)
    }

    pub fn success(&self, message: impl Into<String>) -> LogSeq {
        self.append(LogLevel::Success, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> LogSeq {
        self.append(LogLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> LogSeq {
        self.append(LogLevel::Error, message)
    }

    /// Events stamped at or after `since`, in append order. `None` returns everything retained.
    ///
    /// Inclusive: events appended later in the same second as the last poll are replayed.
    pub fn since(&self, since: Option<UnixTimeSec>) -> Vec<LogEvent> {
        let buffer = self.lock();
        match since {
            None => buffer.events.iter().cloned().collect(),
            Some(t) => buffer
                .events
                .iter()
                .filter(|e| e.at >= t)
                .cloned()
                .collect(),
        }
    }

    /// Events at or after a bare `HH:MM:SS` echoed back by a client.
    ///
    /// The time of day is resolved against the newer of `now` and the latest stamp in the feed, so
    /// a stamp clamped ahead of a stepped-back wall clock still means today.
    pub fn since_wire_time<Tz: TimeZone>(
        &self,
        time_of_day: NaiveTime,
        now: &DateTime<Tz>,
    ) -> Vec<LogEvent> {
        let last_at = self.lock().last_at;
        let reference = i64::try_from(last_at.0)
            .ok()
            .and_then(|secs| now.timezone().timestamp_opt(secs, 0).single())
            .filter(|feed_now| feed_now > now)
            .unwrap_or_else(|| now.clone());
        self.since(Some(resolve_wire_time(time_of_day, &reference)))
    }

    /// Events strictly after `cursor`. Exact, duplicate-free polling.
    pub fn after(&self, cursor: LogSeq) -> Vec<LogEvent> {
        let buffer = self.lock();
        buffer
            .events
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect()
    }

    /// Newest `n` events plus the number currently retained.
    pub fn recent(&self, n: usize) -> (Vec<LogEvent>, usize) {
        let buffer = self.lock();
        let total = buffer.events.len();
        let skip = total.saturating_sub(n);
        (buffer.events.iter().skip(skip).cloned().collect(), total)
    }

    pub fn latest_seq(&self) -> Option<LogSeq> {
        self.lock().events.back().map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every retained event. Sequence numbers keep counting.
    pub fn clear(&self) {
        self.lock().events.clear();
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        // Every mutation is a single push/pop under the lock, so a poisoned buffer is still whole.
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn format_wire_time<Tz>(at: UnixTimeSec, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let secs = i64::try_from(at.0).unwrap_or(i64::MAX);
    match Utc.timestamp_opt(secs, 0).single() {
        Some(utc) => utc
            .with_timezone(tz)
            .format(WIRE_TIME_FORMAT)
            .to_string(),
        None => "00:00:00".to_string(),
    }
}

pub fn parse_wire_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), WIRE_TIME_FORMAT).ok()
}

/// Maps a bare `HH:MM:SS` onto the latest instant at or before `now` with that time of day.
///
/// A poll sent at 00:00:05 asking for `23:59:58` therefore means the previous evening.
pub fn resolve_wire_time<Tz: TimeZone>(time_of_day: NaiveTime, now: &DateTime<Tz>) -> UnixTimeSec {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..2 {
        if let Some(at) = tz.from_local_datetime(&date.and_time(time_of_day)).earliest() {
            if at <= *now {
                return UnixTimeSec(u64::try_from(at.timestamp()).unwrap_or(0));
            }
        }
        match date.pred_opt() {
            Some(prev) => date = prev,
            None => break,
        }
    }
    UnixTimeSec::EPOCH
}
