use serde::Serialize;
use serde_json::{Value, json};

use crate::types::{Feature, ResourceIdentity};

pub const FEATURES_PREFIX: &str = "/iot/v2/features";
pub const GATEWAY_DEVICE: &str = "gateway";

pub const OPERATING_MODE_FEATURE: &str = "heating.circuits.0.operating.modes.active";
pub const OPERATING_MODES: &[&str] = &["dhw", "dhwAndHeating", "forcedNormal", "forcedReduced", "standby"];

pub const SET_SCHEDULE: &str = "setSchedule";
pub const RESET_SCHEDULE: &str = "resetSchedule";
pub const SET_MODE: &str = "setMode";

fn enc(s: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(s)
}

pub fn installation_features_path(installation_id: &str) -> String {
    format!("{FEATURES_PREFIX}/installations/{}/features", enc(installation_id))
}

pub fn device_features_path(installation_id: &str, gateway_id: &str, device_id: &str) -> String {
    format!(
        "{FEATURES_PREFIX}/installations/{}/gateways/{}/devices/{}/features",
        enc(installation_id),
        enc(gateway_id),
        enc(device_id)
    )
}

pub fn feature_path(id: &ResourceIdentity, feature: &str) -> String {
    format!(
        "{}/{}",
        device_features_path(&id.installation_id, &id.gateway_id, &id.device_id),
        enc(feature)
    )
}

pub fn command_path(id: &ResourceIdentity, feature: &str, command: &str) -> String {
    format!("{}/commands/{}", feature_path(id, feature), enc(command))
}

/// `{"newSchedule": ...}` command body.
#[derive(Serialize)]
pub struct NewSchedule<'a, T: ?Sized + Serialize> {
    #[serde(rename = "newSchedule")]
    pub new_schedule: &'a T,
}

pub fn set_mode_body(mode: &str) -> Value {
    json!({ "mode": mode })
}

/// Path segment following `marker` in `uri`, e.g. the id in `/devices/{id}/`.
fn segment_after<'a>(uri: &'a str, marker: &str) -> Option<&'a str> {
    let start = uri.find(marker)? + marker.len();
    let rest = &uri[start..];
    let end = rest.find('/')?;
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

/// Deduplicates while keeping first-seen order.
pub fn uniq<I: IntoIterator<Item = String>>(ids: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in ids {
        if !id.is_empty() && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn aggregate_uris(aggregate: &Value) -> impl Iterator<Item = &str> {
    aggregate
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|f| f.get("uri").and_then(Value::as_str))
}

/// Device ids referenced as `/devices/{id}/features/` in the installation
/// aggregate, excluding the gateway pseudo-device.
pub fn extract_device_ids(aggregate: &Value) -> Vec<String> {
    let ids = aggregate_uris(aggregate)
        .filter_map(|uri| {
            let id = segment_after(uri, "/devices/")?;
            let tail = uri.split_once(&format!("/devices/{id}"))?.1;
            tail.starts_with("/features/").then_some(id)
        })
        .filter(|id| *id != GATEWAY_DEVICE)
        .map(str::to_string);
    uniq(ids)
}

pub fn extract_gateway_ids(aggregate: &Value) -> Vec<String> {
    uniq(
        aggregate_uris(aggregate)
            .filter_map(|uri| segment_after(uri, "/gateways/"))
            .map(str::to_string),
    )
}

/// Features from a `{"data": [...]}` list response. Anything else is empty.
pub fn parse_feature_list(json: Option<&Value>) -> Vec<Feature> {
    json.and_then(|j| j.get("data"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Feature::from_json).collect())
        .unwrap_or_default()
}

/// Lookup over a feature list. Candidate lists are tried in order and the
/// first defined value wins.
pub struct FeatureSet<'a> {
    features: &'a [Feature],
}

impl<'a> FeatureSet<'a> {
    pub fn new(features: &'a [Feature]) -> Self {
        Self { features }
    }

    pub fn get(&self, name: &str) -> Option<&'a Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn first_present(&self, candidates: &[(&str, &str)]) -> Option<&'a Value> {
        candidates
            .iter()
            .find_map(|(feature, prop)| self.get(feature)?.property(prop))
    }

    pub fn number(&self, candidates: &[(&str, &str)]) -> Option<f64> {
        candidates.iter().find_map(|c| match self.first_present(std::slice::from_ref(c))? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn boolean(&self, feature: &str, prop: &str) -> Option<bool> {
        self.first_present(&[(feature, prop)])?.as_bool()
    }

    pub fn string(&self, feature: &str, prop: &str) -> Option<String> {
        match self.first_present(&[(feature, prop)])? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
