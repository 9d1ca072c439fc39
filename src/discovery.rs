//! Finds the device under a gateway that actually exposes the heating
//! features, by probing candidate ids and scoring their feature lists.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::logger::log_with;
use crate::protocol::{self, GATEWAY_DEVICE};
use crate::request::RequestClient;
use crate::store::{StateStore, keys};
use crate::types::{Discovery, DiscoveryMode, Feature, ResourceIdentity};
use crate::{Error, Result};

pub const PRIMARY_POINTS: i64 = 10;
pub const SECONDARY_POINTS: i64 = 3;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub primary_prefix: String,
    pub secondary_prefixes: Vec<String>,
    /// Probing stops once a candidate scores at least this much.
    pub good_enough: i64,
    pub probe_list: Vec<String>,
    pub gateway_id: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            primary_prefix: "heating.".into(),
            secondary_prefixes: ["heatpump.", "ventilation.", "solar."].map(String::from).to_vec(),
            good_enough: PRIMARY_POINTS,
            probe_list: ["0", "1", "2", "3", "heating", "system", "boiler"]
                .map(String::from)
                .to_vec(),
            gateway_id: None,
        }
    }
}

/// +10 per feature under the primary prefix, +3 per feature under any
/// secondary prefix.
pub fn score_features(features: &[Feature], primary: &str, secondary: &[String]) -> i64 {
    features
        .iter()
        .map(|f| {
            let mut s = 0;
            if f.name.starts_with(primary) {
                s += PRIMARY_POINTS;
            }
            if secondary.iter().any(|p| f.name.starts_with(p.as_str())) {
                s += SECONDARY_POINTS;
            }
            s
        })
        .sum()
}

pub fn parse_probe_list(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
pub struct ResourceDiscovery {
    client: RequestClient,
    store: Arc<dyn StateStore>,
    config: DiscoveryConfig,
}

impl ResourceDiscovery {
    pub fn new(client: RequestClient, store: Arc<dyn StateStore>, config: DiscoveryConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn score(&self, features: &[Feature]) -> i64 {
        score_features(features, &self.config.primary_prefix, &self.config.secondary_prefixes)
    }

    pub async fn discover(&self, installation_id: &str) -> Result<Discovery> {
        let mut tried: Vec<Value> = Vec::new();

        let aggregate = self.fetch_aggregate(installation_id, &mut tried).await?;

        let gateway_id = self
            .store
            .get_str(keys::GATEWAY_ID)
            .or_else(|| self.config.gateway_id.clone())
            .or_else(|| {
                aggregate
                    .as_ref()
                    .and_then(|agg| protocol::extract_gateway_ids(agg).into_iter().next())
            })
            .unwrap_or_else(|| GATEWAY_DEVICE.to_string());

        let gateway_features = match self.probe(installation_id, &gateway_id, GATEWAY_DEVICE, &mut tried).await? {
            Some((features, raw)) => {
                self.store.set(keys::GATEWAY_FEATURES_JSON, json!(raw.to_string()))?;
                features
            }
            None => Vec::new(),
        };

        let candidates = self.candidates(aggregate.as_ref());
        self.store.set(keys::DISCOVERY_FOUND, json!(candidates.join(",")))?;

        let mut best: Option<(String, i64, Vec<Feature>)> = None;
        for dev in &candidates {
            let Some((features, _)) = self.probe(installation_id, &gateway_id, dev, &mut tried).await? else {
                continue;
            };
            let score = self.score(&features);
            debug!(device = %dev, score, items = features.len(), "candidate scored");
            if best.as_ref().is_none_or(|(_, s, _)| score > *s) {
                best = Some((dev.clone(), score, features));
            }
            if score >= self.config.good_enough {
                break;
            }
        }
        self.store.set(keys::DISCOVERY_TRIED, json!(Value::Array(tried).to_string()))?;

        let mut identity = ResourceIdentity {
            installation_id: installation_id.to_string(),
            gateway_id: gateway_id.clone(),
            device_id: String::new(),
        };

        if let Some((device_id, score, features)) = best {
            identity.device_id = device_id;
            self.persist_pick(&identity, "probed")?;
            info!(device_id = %identity.device_id, gateway_id = %gateway_id, items = features.len(), "device discovered");
            return Ok(Discovery {
                identity,
                mode: DiscoveryMode::Device,
                score,
                features,
                gateway_features,
            });
        }

        if !gateway_features.is_empty() {
            identity.device_id = GATEWAY_DEVICE.to_string();
            self.store.set(
                keys::DISCOVERY_LAST_PICK,
                json!(json!({"gatewayId": gateway_id, "deviceId": GATEWAY_DEVICE, "reason": "gateway-only"}).to_string()),
            )?;
            warn!("only gateway features found, running in gateway-only mode");
            return Ok(Discovery {
                identity,
                mode: DiscoveryMode::GatewayOnly,
                score: 0,
                features: Vec::new(),
                gateway_features,
            });
        }

        self.store.set(keys::DEVICE_ID, json!(""))?;
        Err(Error::DiscoveryExhausted {
            tried: candidates.len(),
        })
    }

    /// Stored device id, ids seen in the aggregate, then the probe list. The
    /// gateway pseudo-device is probed separately and never a candidate.
    fn candidates(&self, aggregate: Option<&Value>) -> Vec<String> {
        let stored = self.store.get_str(keys::DEVICE_ID);
        let from_uris = aggregate.map(protocol::extract_device_ids).unwrap_or_default();
        let probe = self
            .store
            .get_str(keys::DEVICE_PROBE_LIST)
            .map(|csv| parse_probe_list(&csv))
            .unwrap_or_else(|| self.config.probe_list.clone());
        let mut ids = protocol::uniq(stored.into_iter().chain(from_uris).chain(probe));
        ids.retain(|id| id != GATEWAY_DEVICE);
        ids
    }

    async fn fetch_aggregate(&self, installation_id: &str, tried: &mut Vec<Value>) -> Result<Option<Value>> {
        let path = protocol::installation_features_path(installation_id);
        tried.push(json!({"t": "GET", "path": path}));
        match self.client.get(&path).await {
            Ok(resp) => {
                self.store
                    .set(keys::LAST_STATUS, json!(format!("GET {path} -> {}", resp.status)))?;
                if resp.is_success() {
                    if let Some(json) = &resp.json {
                        self.store.set(keys::FEATURES_JSON, json!(json.to_string()))?;
                    }
                    Ok(resp.json)
                } else {
                    Ok(None)
                }
            }
            Err(e @ (Error::AuthRefresh { .. } | Error::MissingConfig(_))) => Err(e),
            Err(e) => {
                warn!(path = %path, "installation aggregate unavailable: {e}");
                Ok(None)
            }
        }
    }

    /// Feature list and raw body for one device, `None` when the call fails
    /// or lists nothing.
    async fn probe(
        &self,
        installation_id: &str,
        gateway_id: &str,
        device_id: &str,
        tried: &mut Vec<Value>,
    ) -> Result<Option<(Vec<Feature>, Value)>> {
        let path = protocol::device_features_path(installation_id, gateway_id, device_id);
        tried.push(json!({"t": "GET", "path": path}));
        let resp = match self.client.get(&path).await {
            Ok(resp) => resp,
            Err(e @ (Error::AuthRefresh { .. } | Error::MissingConfig(_))) => return Err(e),
            Err(e) => {
                debug!(path = %path, "probe failed: {e}");
                return Ok(None);
            }
        };
        if !resp.is_success() {
            debug!(path = %path, status = resp.status, "probe rejected");
            return Ok(None);
        }
        let Some(json) = resp.json else {
            return Ok(None);
        };
        log_with(self.client.logger(), |l| l.log_features(&path, resp.status, &json));
        let features = protocol::parse_feature_list(Some(&json));
        Ok((!features.is_empty()).then_some((features, json)))
    }

    fn persist_pick(&self, identity: &ResourceIdentity, reason: &str) -> Result<()> {
        self.store.set(keys::GATEWAY_ID, json!(identity.gateway_id))?;
        self.store.set(keys::DEVICE_ID, json!(identity.device_id))?;
        let pick = json!({
            "gatewayId": identity.gateway_id,
            "deviceId": identity.device_id,
            "reason": reason,
        });
        self.store.set(keys::DISCOVERY_LAST_PICK, json!(pick.to_string()))
    }
}
