use std::fmt;

use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// The three schedule domains the bridge can read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleKind {
    Heating,
    HotWater,
    Circulation,
}

impl ScheduleKind {
    pub const ALL: [ScheduleKind; 3] = [
        ScheduleKind::Heating,
        ScheduleKind::HotWater,
        ScheduleKind::Circulation,
    ];

    pub fn feature(&self) -> &'static str {
        match self {
            ScheduleKind::Heating => "heating.circuits.0.heating.schedule",
            ScheduleKind::HotWater => "heating.dhw.schedule",
            ScheduleKind::Circulation => "heating.dhw.pumps.circulation.schedule",
        }
    }

    /// Modes a slot may carry. Anything else becomes [`Self::off_mode`].
    pub fn allowed_modes(&self) -> &'static [&'static str] {
        match self {
            ScheduleKind::Heating => &["normal"],
            ScheduleKind::HotWater | ScheduleKind::Circulation => &["on"],
        }
    }

    pub fn off_mode(&self) -> &'static str {
        match self {
            ScheduleKind::Heating => "reduced",
            ScheduleKind::HotWater | ScheduleKind::Circulation => "off",
        }
    }

    pub fn on_mode(&self) -> &'static str {
        self.allowed_modes()[0]
    }

    pub fn default_max_entries(&self) -> usize {
        4
    }

    /// Segment used for this kind's persisted `Ctrl.*` keys.
    pub fn state_key(&self) -> &'static str {
        match self {
            ScheduleKind::Heating => "heatingSchedule",
            ScheduleKind::HotWater => "dhwSchedule",
            ScheduleKind::Circulation => "circSchedule",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleKind::Heating => "heating",
            ScheduleKind::HotWater => "dhw",
            ScheduleKind::Circulation => "circ",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Weekday::Mon => "mon",
            Weekday::Tue => "tue",
            Weekday::Wed => "wed",
            Weekday::Thu => "thu",
            Weekday::Fri => "fri",
            Weekday::Sat => "sat",
            Weekday::Sun => "sun",
        }
    }

    pub fn from_chrono(day: chrono::Weekday) -> Self {
        Self::ALL[day.num_days_from_monday() as usize]
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: String,
    pub end: String,
    pub mode: String,
    pub position: u32,
}

/// A weekly schedule. Always carries all seven weekdays, serialized mon..sun.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    days: [Vec<TimeSlot>; 7],
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn day(&self, day: Weekday) -> &[TimeSlot] {
        &self.days[day.index()]
    }

    pub fn set_day(&mut self, day: Weekday, slots: Vec<TimeSlot>) {
        self.days[day.index()] = slots;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, &[TimeSlot])> {
        Weekday::ALL.into_iter().map(|d| (d, self.day(d)))
    }

    pub fn slot_count(&self) -> usize {
        self.days.iter().map(Vec::len).sum()
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(7))?;
        for (day, slots) in self.iter() {
            map.serialize_entry(day.key(), slots)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub installation_id: String,
    pub gateway_id: String,
    pub device_id: String,
}

/// A named property bag on a device, as returned by the features API.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub name: String,
    pub properties: Value,
}

impl Feature {
    pub fn from_json(item: &Value) -> Option<Self> {
        let name = item.get("feature")?.as_str()?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            properties: item.get("properties").cloned().unwrap_or(Value::Null),
        })
    }

    /// `properties.<prop>.value`, if present and not null.
    pub fn property(&self, prop: &str) -> Option<&Value> {
        self.properties
            .get(prop)
            .and_then(|p| p.get("value"))
            .filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// A real device exposed features and was selected.
    Device,
    /// Only the gateway pseudo-device returned features.
    GatewayOnly,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub identity: ResourceIdentity,
    pub mode: DiscoveryMode,
    pub score: i64,
    pub features: Vec<Feature>,
    pub gateway_features: Vec<Feature>,
}

/// Identifier of an armed timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(Uuid);

impl TimerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoostState {
    #[default]
    Idle,
    Boosting {
        timer: TimerId,
        restore_at: DateTime<Local>,
    },
    /// The restore post failed; the backup is still stored for manual reapply.
    RestoreFailed,
}

/// Events emitted to `on_event` callbacks.
#[derive(Debug, Clone)]
pub enum Event {
    TokenRefreshed { endpoint: String },
    DeviceDiscovered { identity: ResourceIdentity, mode: DiscoveryMode },
    ScheduleMirrored { kind: ScheduleKind, active: bool },
    ScheduleWritten { kind: ScheduleKind, slots: usize },
    ScheduleReset { kind: ScheduleKind },
    ModeSet { mode: String },
    BoostStarted { kind: ScheduleKind, start: String, end: String, timer: TimerId },
    BoostRestored { kind: ScheduleKind, timer: Option<TimerId> },
    BoostRestoreFailed { kind: ScheduleKind, message: String },
    Failure { category: &'static str, message: String },
}

pub(crate) type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Fan-out of events to registered callbacks. Cheap to clone.
#[derive(Clone, Default)]
pub(crate) struct EventSink(std::sync::Arc<Vec<EventCallback>>);

impl EventSink {
    pub fn new(callbacks: Vec<EventCallback>) -> Self {
        Self(std::sync::Arc::new(callbacks))
    }

    pub fn emit(&self, event: &Event) {
        for cb in self.0.iter() {
            cb(event);
        }
    }
}
