//! Maps a polled feature list into flat `Values.*` keys and keeps the
//! "burner hours today" statistic.

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use serde_json::{Value, json};
use tracing::debug;

use crate::Result;
use crate::protocol::FeatureSet;
use crate::store::{StateStore, keys};
use crate::types::Feature;

/// How a persisted value is read from the feature list.
#[derive(Debug, Clone, Copy)]
enum Reading {
    /// Candidate `(feature, property)` pairs, first defined wins.
    Number(&'static [(&'static str, &'static str)]),
    Flag(&'static str, &'static str),
    Text(&'static str, &'static str),
}

use Reading::{Flag, Number, Text};

const DEVICE_VALUES: &[(&str, Reading)] = &[
    ("Values.outsideTemp", Number(&[("heating.sensors.temperature.outside", "value")])),
    (
        "Values.boilerTemp",
        Number(&[
            ("heating.boiler.sensors.temperature.main", "value"),
            ("heating.boiler.temperature", "value"),
        ]),
    ),
    ("Values.c0_supplyTemp", Number(&[("heating.circuits.0.sensors.temperature.supply", "value")])),
    (
        "Values.dhwActual",
        Number(&[
            ("heating.dhw.sensors.temperature.dhwCylinder", "value"),
            ("heating.dhw.sensors.temperature.hotWaterStorage", "value"),
        ]),
    ),
    ("Values.dhwTarget", Number(&[("heating.dhw.temperature.main", "value")])),
    ("Values.burnerActive", Flag("heating.burners.0", "active")),
    ("Values.burnerModulation", Number(&[("heating.burners.0.modulation", "value")])),
    ("Values.burnerHours", Number(&[("heating.burners.0.statistics", "hours")])),
    ("Values.burnerStarts", Number(&[("heating.burners.0.statistics", "starts")])),
    ("Values.hk0_curveSlope", Number(&[("heating.circuits.0.heating.curve", "slope")])),
    ("Values.hk0_curveShift", Number(&[("heating.circuits.0.heating.curve", "shift")])),
    ("Values.hk0_programActive", Text("heating.circuits.0.operating.programs.active", "value")),
    ("Values.hk0_name", Text("heating.circuits.0.name", "name")),
    (
        "Values.hk0_prog_normal_temp",
        Number(&[("heating.circuits.0.operating.programs.normal", "temperature")]),
    ),
    (
        "Values.hk0_prog_reduced_temp",
        Number(&[("heating.circuits.0.operating.programs.reduced", "temperature")]),
    ),
    ("Values.hk0_prog_eco_temp", Number(&[("heating.circuits.0.operating.programs.eco", "temperature")])),
    ("Ctrl.mode", Text("heating.circuits.0.operating.modes.active", "value")),
    ("Ctrl.circulationPump.status", Text("heating.circuits.0.circulation.pump", "status")),
    ("Ctrl.primaryPump.status", Text("heating.dhw.pumps.primary", "status")),
    ("Ctrl.dhwCharging.active", Flag("heating.dhw.charging", "active")),
];

pub const WIFI_RSSI: &str = "Values.wifiRssi";
pub const BURNER_HOURS: &str = "Values.burnerHours";

fn read(set: &FeatureSet<'_>, reading: Reading) -> Value {
    match reading {
        Number(candidates) => set.number(candidates).map(|n| json!(n)).unwrap_or(Value::Null),
        Flag(feature, prop) => set.boolean(feature, prop).map(Value::Bool).unwrap_or(Value::Null),
        Text(feature, prop) => set.string(feature, prop).map(Value::String).unwrap_or(Value::Null),
    }
}

/// Writes every mapped value, `null` where the device does not report it.
/// Returns how many values were present. An empty device list is skipped.
pub fn map_values(store: &dyn StateStore, features: &[Feature], gateway_features: &[Feature]) -> Result<usize> {
    let mut present = 0;

    if !features.is_empty() {
        let set = FeatureSet::new(features);
        for (key, reading) in DEVICE_VALUES {
            let value = read(&set, *reading);
            if !value.is_null() {
                present += 1;
            }
            store.set(key, value)?;
        }
    }

    // only overwrite when the gateway reports it
    if let Some(rssi) = FeatureSet::new(gateway_features).number(&[("tcu.wifi", "strength")]) {
        store.set(WIFI_RSSI, json!(rssi))?;
        present += 1;
    }

    debug!(present, "telemetry mapped");
    Ok(present)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Updates `Stats.burnerHoursTotal` and `Stats.burnerHoursToday`. The
/// midnight baseline is re-seeded when it is unset, zero or from another day.
pub fn update_burner_today(store: &dyn StateStore, total: Option<f64>, today: NaiveDate) -> Result<f64> {
    let total_hours = total.unwrap_or(0.0);
    store.set(keys::STATS_BURNER_HOURS_TOTAL, total.map(|t| json!(t)).unwrap_or(Value::Null))?;

    let base = store.get_f64(keys::STATS_BASE_HOURS).unwrap_or(0.0);
    let base_date = store.get_str(keys::STATS_BASE_DATE).unwrap_or_default();
    if base_date != today.to_string() || base == 0.0 {
        reset_baseline(store, total_hours, today)?;
        return Ok(0.0);
    }

    let delta = round2((total_hours - base).max(0.0));
    store.set(keys::STATS_BURNER_HOURS_TODAY, json!(delta))?;
    Ok(delta)
}

/// Midnight rollover: the last known total becomes the new baseline.
pub fn rollover(store: &dyn StateStore, today: NaiveDate) -> Result<()> {
    let total = store.get_f64(keys::STATS_BURNER_HOURS_TOTAL).unwrap_or(0.0);
    reset_baseline(store, total, today)
}

fn reset_baseline(store: &dyn StateStore, base: f64, today: NaiveDate) -> Result<()> {
    store.set(keys::STATS_BASE_HOURS, json!(base))?;
    store.set(keys::STATS_BASE_DATE, json!(today.to_string()))?;
    store.set(keys::STATS_BURNER_HOURS_TODAY, json!(0.0))
}

/// Time until two seconds past the next local midnight, at least 30 s.
pub fn midnight_delay(now: DateTime<Local>) -> Duration {
    let floor = Duration::from_secs(30);
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|t| t.and_local_timezone(Local).earliest());
    let Some(next) = next else {
        return Duration::from_secs(24 * 3600);
    };
    let until = (next - now).to_std().unwrap_or_default() + Duration::from_secs(2);
    until.max(floor)
}
