use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, Timelike, Utc};

use crate::model::{Ms, TimeSlot};

/// Source of wall-clock time in Unix milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> Ms {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven time, shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicI64>,
}

impl ManualTimeSource {
    pub fn new(now: Ms) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Maps wall-clock time onto hourly slots in one fixed UTC offset.
///
/// The offset is configuration, never the host's local zone, so every
/// process agrees on slot boundaries regardless of where it runs.
#[derive(Clone)]
pub struct Clock {
    offset: FixedOffset,
    source: Arc<dyn TimeSource>,
}

impl Clock {
    pub fn new(offset: FixedOffset, source: Arc<dyn TimeSource>) -> Self {
        Self { offset, source }
    }

    pub fn system(offset: FixedOffset) -> Self {
        Self::new(offset, Arc::new(SystemTimeSource))
    }

    /// Clock over a manual source; returns the handle that drives it.
    pub fn manual(offset: FixedOffset, now: Ms) -> (Self, ManualTimeSource) {
        let source = ManualTimeSource::new(now);
        (Self::new(offset, Arc::new(source.clone())), source)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now_ms(&self) -> Ms {
        self.source.now_ms()
    }

    pub fn current_slot(&self) -> TimeSlot {
        self.slot_of(self.now_ms())
    }

    pub fn slot_of(&self, at: Ms) -> TimeSlot {
        let local = DateTime::<Utc>::from_timestamp_millis(at)
            .unwrap_or_default()
            .with_timezone(&self.offset);
        TimeSlot::clamped(local.date_naive(), local.hour())
    }

    /// Instant the slot begins, in Unix ms.
    pub fn slot_start(&self, slot: &TimeSlot) -> Ms {
        let local = slot.date().and_time(NaiveTime::MIN) + TimeDelta::hours(i64::from(slot.hour()));
        local.and_utc().timestamp_millis() - i64::from(self.offset.local_minus_utc()) * 1000
    }

    /// Instant the slot ends (exclusive), in Unix ms. Leases expire here.
    pub fn slot_end(&self, slot: &TimeSlot) -> Ms {
        self.slot_start(slot) + crate::model::HOUR_MS
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("offset", &self.offset).finish()
    }
}

/// Build a fixed offset from minutes east of UTC (EST is -300).
pub fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}
