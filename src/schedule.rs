//! Weekly schedule normalization and the schedule read/write commands.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::value::RawValue;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::logger::log_with;
use crate::protocol::{self, FeatureSet, NewSchedule, RESET_SCHEDULE, SET_SCHEDULE};
use crate::request::RequestClient;
use crate::store::{StateStore, keys};
use crate::types::{Feature, ResourceIdentity, Schedule, ScheduleKind, TimeSlot, Weekday};
use crate::{Error, Result};

/// Strict 24h `HH:MM`. `24:00` is accepted as the end of day.
pub fn is_hhmm(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' || !b.iter().enumerate().all(|(i, c)| i == 2 || c.is_ascii_digit()) {
        return false;
    }
    let hours = (b[0] - b'0') * 10 + (b[1] - b'0');
    let minutes = (b[3] - b'0') * 10 + (b[4] - b'0');
    (hours < 24 && minutes < 60) || s == "24:00"
}

fn truncate_time(v: Option<&Value>) -> String {
    let s = match v {
        Some(Value::String(s)) => s.as_str(),
        _ => "",
    };
    s.chars().take(5).collect()
}

/// Cleans one weekday's raw entries: truncates times, maps disallowed modes,
/// drops invalid or inverted slots, sorts by start and renumbers positions.
fn normalize_day(kind: ScheduleKind, raw: Option<&Value>) -> Vec<TimeSlot> {
    let entries = raw.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
    let mut slots: Vec<TimeSlot> = entries
        .iter()
        .map(|e| {
            let mode = e.get("mode").and_then(Value::as_str).unwrap_or_default();
            TimeSlot {
                start: truncate_time(e.get("start")),
                end: truncate_time(e.get("end")),
                mode: if kind.allowed_modes().contains(&mode) {
                    mode.to_string()
                } else {
                    kind.off_mode().to_string()
                },
                position: 0,
            }
        })
        .filter(|s| is_hhmm(&s.start) && is_hhmm(&s.end) && s.end > s.start)
        .collect();

    slots.sort_by(|a, b| a.start.cmp(&b.start));
    renumber(&mut slots);
    slots
}

fn renumber(slots: &mut [TimeSlot]) {
    for (i, slot) in slots.iter_mut().enumerate() {
        slot.position = i as u32;
    }
}

/// Parses operator-submitted JSON into a normalized schedule.
pub fn parse_schedule(kind: ScheduleKind, raw: &str) -> Result<Schedule> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| Error::InvalidScheduleJson(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::InvalidScheduleJson("expected a JSON object".into()));
    }
    Ok(normalize(kind, &value))
}

pub fn normalize(kind: ScheduleKind, value: &Value) -> Schedule {
    let mut schedule = Schedule::new();
    for day in Weekday::ALL {
        schedule.set_day(day, normalize_day(kind, value.get(day.key())));
    }
    schedule
}

/// Keeps the first `max_entries` slots of each weekday. Zero disables trimming.
pub fn trim(schedule: &Schedule, max_entries: usize) -> Schedule {
    if max_entries == 0 {
        return schedule.clone();
    }
    let mut out = Schedule::new();
    for (day, slots) in schedule.iter() {
        let mut kept: Vec<TimeSlot> = slots.iter().take(max_entries).cloned().collect();
        renumber(&mut kept);
        out.set_day(day, kept);
    }
    out
}

/// Reads, writes and resets the three schedule features and mirrors the
/// remote state into `Ctrl.<kind>.entries` / `.active`.
#[derive(Clone)]
pub struct ScheduleEngine {
    client: RequestClient,
    store: Arc<dyn StateStore>,
    max_entries: HashMap<ScheduleKind, usize>,
}

impl ScheduleEngine {
    pub fn new(client: RequestClient, store: Arc<dyn StateStore>) -> Self {
        let max_entries = ScheduleKind::ALL
            .into_iter()
            .map(|k| (k, k.default_max_entries()))
            .collect();
        Self {
            client,
            store,
            max_entries,
        }
    }

    pub fn with_max_entries(mut self, kind: ScheduleKind, max: usize) -> Self {
        self.max_entries.insert(kind, max);
        self
    }

    pub fn max_entries(&self, kind: ScheduleKind) -> usize {
        self.max_entries
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_max_entries())
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Fetches the schedule feature and mirrors it locally.
    pub async fn read_schedule(&self, kind: ScheduleKind, id: &ResourceIdentity) -> Result<Value> {
        let path = protocol::feature_path(id, kind.feature());
        let resp = self.client.get(&path).await?.error_for_status()?;
        let feature = resp
            .json
            .as_ref()
            .and_then(Feature::from_json)
            .ok_or_else(|| Error::Protocol(format!("{} is not a feature", kind.feature())))?;
        self.mirror_feature(kind, Some(&feature))
    }

    /// Mirrors `kind` from an already fetched feature list.
    pub fn mirror_from_list(&self, kind: ScheduleKind, features: &[Feature]) -> Result<Value> {
        self.mirror_feature(kind, FeatureSet::new(features).get(kind.feature()))
    }

    fn mirror_feature(&self, kind: ScheduleKind, feature: Option<&Feature>) -> Result<Value> {
        let entries = feature
            .and_then(|f| f.property("entries"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let active = feature
            .and_then(|f| f.property("active"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.store.set(&keys::entries(kind), json!(entries.to_string()))?;
        self.store.set(&keys::active(kind), json!(active))?;
        debug!(%kind, active, "schedule mirrored");
        Ok(entries)
    }

    /// Validates, normalizes and trims `proposed`, then posts it. The mirror is
    /// only updated after the remote acknowledged the write.
    pub async fn write_schedule(&self, kind: ScheduleKind, id: &ResourceIdentity, proposed: &str) -> Result<Schedule> {
        let normalized = parse_schedule(kind, proposed)?;
        let trimmed = trim(&normalized, self.max_entries(kind));
        if trimmed.slot_count() < normalized.slot_count() {
            warn!(%kind, dropped = normalized.slot_count() - trimmed.slot_count(), "slots beyond cap discarded");
        }
        self.post_schedule(kind, id, &trimmed).await?;
        Ok(trimmed)
    }

    /// Posts an already-built schedule without normalization.
    pub async fn post_schedule(&self, kind: ScheduleKind, id: &ResourceIdentity, schedule: &Schedule) -> Result<()> {
        let serialized = serde_json::to_string(schedule)?;
        let raw = RawValue::from_string(serialized)?;
        self.post_raw(kind, id, &raw).await
    }

    /// Posts `entries` byte-for-byte as the new schedule and mirrors it.
    pub async fn post_raw(&self, kind: ScheduleKind, id: &ResourceIdentity, entries: &RawValue) -> Result<()> {
        let path = protocol::command_path(id, kind.feature(), SET_SCHEDULE);
        self.track(&path);
        log_with(self.client.logger(), |l| {
            let body = serde_json::from_str(entries.get()).unwrap_or(Value::Null);
            l.log_command(kind.feature(), SET_SCHEDULE, &body)
        });

        let body = NewSchedule { new_schedule: entries };
        let resp = self.client.post(&path, &body).await?;
        self.record_status(&path, resp.status)?;
        resp.error_for_status()?;

        self.store.set(&keys::entries(kind), json!(entries.get()))?;
        self.store.set(&keys::active(kind), json!(true))?;
        info!(%kind, "schedule set");
        Ok(())
    }

    /// Asks the device to restore its default schedule. The mirror is left
    /// alone until the next read.
    pub async fn reset_schedule(&self, kind: ScheduleKind, id: &ResourceIdentity) -> Result<()> {
        self.command(id, kind.feature(), RESET_SCHEDULE, &json!({})).await?;
        info!(%kind, "schedule reset");
        Ok(())
    }

    /// Posts a plain command and fails on non-2xx.
    pub async fn command(&self, id: &ResourceIdentity, feature: &str, command: &str, body: &Value) -> Result<()> {
        let path = protocol::command_path(id, feature, command);
        self.track(&path);
        log_with(self.client.logger(), |l| l.log_command(feature, command, body));
        let resp = self.client.post(&path, body).await?;
        self.record_status(&path, resp.status)?;
        resp.error_for_status()?;
        Ok(())
    }

    fn track(&self, path: &str) {
        if let Err(e) = self.store.set(keys::LAST_TRIED, json!(path)) {
            warn!("failed to record last path: {e}");
        }
    }

    fn record_status(&self, path: &str, status: u16) -> Result<()> {
        self.store.set(keys::LAST_STATUS, json!(format!("POST {path} -> {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: &str, end: &str, mode: &str, position: u32) -> TimeSlot {
        TimeSlot {
            start: start.into(),
            end: end.into(),
            mode: mode.into(),
            position,
        }
    }

    #[test]
    fn hhmm_pattern() {
        assert!(is_hhmm("00:00"));
        assert!(is_hhmm("23:59"));
        assert!(is_hhmm("24:00"));
        assert!(!is_hhmm("24:01"));
        assert!(!is_hhmm("7:00"));
        assert!(!is_hhmm("07:60"));
        assert!(!is_hhmm("07-00"));
    }

    #[test]
    fn normalizes_truncates_sorts_and_renumbers() {
        let raw = r#"{
            "mon": [
                {"start": "18:00:00", "end": "22:00", "mode": "on", "position": 7},
                {"start": "06:00", "end": "08:30:15", "mode": "on"}
            ]
        }"#;
        let s = parse_schedule(ScheduleKind::HotWater, raw).unwrap();
        assert_eq!(
            s.day(Weekday::Mon),
            &[slot("06:00", "08:30", "on", 0), slot("18:00", "22:00", "on", 1)]
        );
        for day in Weekday::ALL.into_iter().skip(1) {
            assert!(s.day(day).is_empty());
        }
    }

    #[test]
    fn disallowed_mode_falls_back_to_off_mode() {
        let raw = r#"{"tue": [{"start": "06:00", "end": "07:00", "mode": "comfort"}]}"#;
        let heating = parse_schedule(ScheduleKind::Heating, raw).unwrap();
        assert_eq!(heating.day(Weekday::Tue)[0].mode, "reduced");
        let circ = parse_schedule(ScheduleKind::Circulation, raw).unwrap();
        assert_eq!(circ.day(Weekday::Tue)[0].mode, "off");
    }

    #[test]
    fn inverted_and_malformed_slots_dropped() {
        let raw = r#"{"wed": [
            {"start": "10:00", "end": "10:00", "mode": "on"},
            {"start": "12:00", "end": "11:00", "mode": "on"},
            {"start": "9:00", "end": "11:00", "mode": "on"},
            {"start": 600, "end": "11:00", "mode": "on"},
            {"start": "13:00", "end": "14:00", "mode": "on"}
        ]}"#;
        let s = parse_schedule(ScheduleKind::HotWater, raw).unwrap();
        assert_eq!(s.day(Weekday::Wed), &[slot("13:00", "14:00", "on", 0)]);
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = r#"{"mon": [
            {"start": "20:00", "end": "21:00", "mode": "normal"},
            {"start": "05:30", "end": "07:00", "mode": "eco"},
            {"start": "12:00", "end": "13:00", "mode": "normal"}
        ], "sun": [{"start": "08:00", "end": "24:00", "mode": "normal"}]}"#;
        let once = parse_schedule(ScheduleKind::Heating, raw).unwrap();
        let twice = parse_schedule(ScheduleKind::Heating, &serde_json::to_string(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_keeps_earliest_slots() {
        let raw = r#"{"fri": [
            {"start": "20:00", "end": "21:00", "mode": "on"},
            {"start": "01:00", "end": "02:00", "mode": "on"},
            {"start": "16:00", "end": "17:00", "mode": "on"},
            {"start": "04:00", "end": "05:00", "mode": "on"},
            {"start": "08:00", "end": "09:00", "mode": "on"},
            {"start": "12:00", "end": "13:00", "mode": "on"}
        ]}"#;
        let s = trim(&parse_schedule(ScheduleKind::HotWater, raw).unwrap(), 4);
        let starts: Vec<&str> = s.day(Weekday::Fri).iter().map(|t| t.start.as_str()).collect();
        assert_eq!(starts, vec!["01:00", "04:00", "08:00", "12:00"]);
        assert_eq!(s.day(Weekday::Fri)[3].position, 3);
    }

    #[test]
    fn rejects_non_object_json() {
        for raw in ["[]", "\"mon\"", "not json", ""] {
            let err = parse_schedule(ScheduleKind::HotWater, raw).unwrap_err();
            assert!(matches!(err, Error::InvalidScheduleJson(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn serializes_all_weekdays_in_order() {
        let s = parse_schedule(ScheduleKind::HotWater, "{}").unwrap();
        assert_eq!(
            serde_json::to_string(&s).unwrap(),
            r#"{"mon":[],"tue":[],"wed":[],"thu":[],"fri":[],"sat":[],"sun":[]}"#
        );
    }
}
