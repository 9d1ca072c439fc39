//! Temporary same-day schedule override with automatic restore.
//!
//! A boost snapshots the mirrored entries for its kind, posts a single-slot
//! schedule for today and arms a restore timer. The backup lives in one slot
//! per kind: a second boost started before the first timer fires overwrites
//! it, and the first timer then restores the second boost's backup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local};
use serde_json::value::RawValue;
use serde_json::json;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::schedule::ScheduleEngine;
use crate::store::{self, StateStore, keys};
use crate::types::{BoostState, Event, EventSink, ResourceIdentity, Schedule, ScheduleKind, TimeSlot, TimerId, Weekday};
use crate::{Error, Result};

pub const MAX_BOOST_MINUTES: u32 = 180;

/// What an armed boost looks like to the caller.
#[derive(Debug, Clone)]
pub struct BoostTicket {
    pub timer: TimerId,
    pub start: String,
    pub end: String,
    pub restore_at: DateTime<Local>,
    pub delay: Duration,
}

/// Single-slot override for today's weekday. The end is `24:00` when the
/// boost would run past midnight.
pub fn override_schedule(kind: ScheduleKind, now: DateTime<Local>, minutes: u32) -> (Schedule, String, String) {
    let start = now.format("%H:%M").to_string();
    let end_at = now + chrono::Duration::minutes(i64::from(minutes));
    let end = if end_at.date_naive() != now.date_naive() {
        "24:00".to_string()
    } else {
        end_at.format("%H:%M").to_string()
    };

    let mut schedule = Schedule::new();
    schedule.set_day(
        Weekday::from_chrono(now.weekday()),
        vec![TimeSlot {
            start: start.clone(),
            end: end.clone(),
            mode: kind.on_mode().to_string(),
            position: 0,
        }],
    );
    (schedule, start, end)
}

/// Boost length clamped to `1..=MAX_BOOST_MINUTES`.
pub fn clamp_minutes(minutes: u32) -> u32 {
    minutes.clamp(1, MAX_BOOST_MINUTES)
}

pub fn restore_delay(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(clamp_minutes(minutes)) * 60)
}

#[derive(Clone)]
pub struct BoostController {
    engine: ScheduleEngine,
    clock: Arc<dyn Clock>,
    sessions: Arc<Mutex<HashMap<ScheduleKind, BoostState>>>,
    events: EventSink,
}

impl BoostController {
    pub fn new(engine: ScheduleEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            sessions: Arc::default(),
            events: EventSink::default(),
        }
    }

    pub(crate) fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.engine.store()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ScheduleKind, BoostState>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, kind: ScheduleKind) -> BoostState {
        self.sessions().get(&kind).copied().unwrap_or_default()
    }

    /// Persisted restore deadline, if a boost is outstanding.
    pub fn pending_restore(&self, kind: ScheduleKind) -> Option<DateTime<Local>> {
        let raw = self.store().get_str(&keys::restore_at(kind))?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Local))
    }

    /// Backs up the mirrored schedule, posts the override and arms the
    /// restore timer. If the override post fails the previous state is kept
    /// and no timer is armed.
    pub async fn start_boost(&self, kind: ScheduleKind, id: &ResourceIdentity, minutes: u32) -> Result<BoostTicket> {
        let minutes = clamp_minutes(minutes);
        let now = self.clock.now();

        let backup = self
            .store()
            .get_str(&keys::entries(kind))
            .unwrap_or_else(|| "{}".to_string());
        self.store().set(&keys::backup(kind), json!(backup))?;

        let (schedule, start, end) = override_schedule(kind, now, minutes);
        let delay = restore_delay(minutes);
        let restore_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let timer = TimerId::new();

        let previous = self
            .sessions()
            .insert(kind, BoostState::Boosting { timer, restore_at });
        if let Err(e) = self.engine.post_schedule(kind, id, &schedule).await {
            let mut sessions = self.sessions();
            match previous {
                Some(state) => sessions.insert(kind, state),
                None => sessions.remove(&kind),
            };
            return Err(e);
        }

        self.store()
            .set(&keys::restore_at(kind), json!(restore_at.to_rfc3339()))?;

        let this = self.clone();
        let target = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.expire(kind, &target, timer).await;
        });

        info!(%kind, %start, %end, %timer, "boost started");
        self.events.emit(&Event::BoostStarted {
            kind,
            start: start.clone(),
            end: end.clone(),
            timer,
        });
        Ok(BoostTicket {
            timer,
            start,
            end,
            restore_at,
            delay,
        })
    }

    /// Runs the restore armed by `timer`. The spawned timer calls this when
    /// its delay elapses. Only the timer of the current session returns the
    /// kind to `Idle`; a superseded timer still reposts the backup slot.
    pub async fn expire(&self, kind: ScheduleKind, id: &ResourceIdentity, timer: TimerId) {
        match self.restore(kind, id).await {
            Ok(()) => {
                let current = {
                    let mut sessions = self.sessions();
                    let current = matches!(
                        sessions.get(&kind),
                        Some(BoostState::Boosting { timer: t, .. }) if *t == timer
                    );
                    if current {
                        sessions.insert(kind, BoostState::Idle);
                    }
                    current
                };
                if current && let Err(e) = self.store().set(&keys::restore_at(kind), json!("")) {
                    warn!(%kind, "failed to clear restore deadline: {e}");
                }
                info!(%kind, %timer, superseded = !current, "boost restored");
                self.events.emit(&Event::BoostRestored {
                    kind,
                    timer: Some(timer),
                });
            }
            Err(e) => {
                error!(%kind, %timer, "boost restore failed, backup kept for manual reapply: {e}");
                self.sessions().insert(kind, BoostState::RestoreFailed);
                store::record_error(self.store().as_ref(), self.clock.now(), "boost restore", &e);
                self.events.emit(&Event::BoostRestoreFailed {
                    kind,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Reposts the stored backup byte-for-byte. Also the manual reapply path
    /// after a failed automatic restore.
    pub async fn restore(&self, kind: ScheduleKind, id: &ResourceIdentity) -> Result<()> {
        let backup = self
            .store()
            .get_str(&keys::backup(kind))
            .ok_or_else(|| Error::BoostRestoreFailed(Box::new(Error::MissingConfig("boost backup"))))?;
        let raw = RawValue::from_string(backup).map_err(|e| Error::BoostRestoreFailed(Box::new(e.into())))?;
        self.engine
            .post_raw(kind, id, &raw)
            .await
            .map_err(|e| Error::BoostRestoreFailed(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn override_is_single_slot_today() {
        // 2024-01-01 is a Monday
        let (s, start, end) = override_schedule(ScheduleKind::HotWater, at(2024, 1, 1, 10, 0), 15);
        assert_eq!((start.as_str(), end.as_str()), ("10:00", "10:15"));
        assert_eq!(
            s.day(Weekday::Mon),
            &[TimeSlot {
                start: "10:00".into(),
                end: "10:15".into(),
                mode: "on".into(),
                position: 0,
            }]
        );
        assert_eq!(s.slot_count(), 1);
    }

    #[test]
    fn override_past_midnight_ends_at_24() {
        let (s, _, end) = override_schedule(ScheduleKind::Heating, at(2024, 1, 7, 23, 30), 60);
        assert_eq!(end, "24:00");
        assert_eq!(s.day(Weekday::Sun)[0].mode, "normal");
    }

    #[test]
    fn zero_minutes_is_one_minute() {
        assert_eq!(clamp_minutes(0), 1);
        assert_eq!(clamp_minutes(600), MAX_BOOST_MINUTES);
        assert_eq!(restore_delay(0), Duration::from_secs(60));
        assert_eq!(restore_delay(15), Duration::from_secs(900));

        let (_, start, end) = override_schedule(ScheduleKind::HotWater, at(2024, 1, 1, 10, 0), clamp_minutes(0));
        assert_eq!((start.as_str(), end.as_str()), ("10:00", "10:01"));
        assert!(end > start);
    }
}
