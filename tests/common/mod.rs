#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, TimeZone};
use serde_json::{Value, json};
use vicare_bridge::{
    Bridge, Clock, Config, Credential, CredentialStore, Event, IdentityEndpoint, MemoryStore, RequestClient,
    ResourceIdentity, StateStore, TokenManager, keys,
};
use wiremock::MockServer;

pub const INSTALLATION: &str = "4711";
pub const GATEWAY: &str = "GW1";
pub const MODERN_TOKEN_PATH: &str = "/idp/v3/token";
pub const LEGACY_TOKEN_PATH: &str = "/idp/v2/token";
pub const AGGREGATE_PATH: &str = "/iot/v2/features/installations/4711/features";

pub fn device_path(device: &str) -> String {
    format!("/iot/v2/features/installations/4711/gateways/GW1/devices/{device}/features")
}

pub fn feature_path(device: &str, feature: &str) -> String {
    format!("{}/{feature}", device_path(device))
}

pub fn command_path(device: &str, feature: &str, command: &str) -> String {
    format!("{}/commands/{command}", feature_path(device, feature))
}

pub fn identity() -> ResourceIdentity {
    ResourceIdentity {
        installation_id: INSTALLATION.into(),
        gateway_id: GATEWAY.into(),
        device_id: "0".into(),
    }
}

/// Wall clock frozen at a chosen instant.
pub struct FixedClock(Mutex<DateTime<Local>>);

impl FixedClock {
    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap())))
    }

    /// 2024-01-01 10:00, a Monday.
    pub fn monday_ten() -> Arc<Self> {
        Self::at(2024, 1, 1, 10, 0)
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.0.lock().unwrap();
        *now += chrono::Duration::seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.0.lock().unwrap()
    }
}

/// Token that will not need a refresh for an hour.
pub fn seed_valid_token(store: &MemoryStore, clock: &dyn Clock) {
    store.set(keys::ACCESS_TOKEN, json!("cached-token")).unwrap();
    store
        .set(keys::ACCESS_TOKEN_EXPIRES_AT, json!(clock.now_millis() + 3_600_000))
        .unwrap();
}

pub fn seed_identity(store: &MemoryStore) {
    store.set(keys::GATEWAY_ID, json!(GATEWAY)).unwrap();
    store.set(keys::DEVICE_ID, json!("0")).unwrap();
}

pub fn token_body(access: &str) -> Value {
    json!({
        "access_token": access,
        "expires_in": 3600,
        "refresh_token": "refresh-2",
        "token_type": "Bearer",
        "scope": "IoT User offline_access"
    })
}

pub fn token_manager(server: &MockServer, store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> TokenManager {
    let seed = Credential {
        refresh_token: "refresh-1".into(),
        client_id: "client-id".into(),
        ..Credential::default()
    };
    TokenManager::new(
        reqwest::Client::new(),
        CredentialStore::new(store.clone(), seed),
        store,
        vec![
            IdentityEndpoint::new("modern", format!("{}{MODERN_TOKEN_PATH}", server.uri())),
            IdentityEndpoint::new("legacy", format!("{}{LEGACY_TOKEN_PATH}", server.uri())),
        ],
        format!("{}/idp/v3/authorize", server.uri()),
        clock,
    )
}

pub fn request_client(server: &MockServer, store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> RequestClient {
    let tokens = Arc::new(token_manager(server, store, clock));
    RequestClient::new(reqwest::Client::new(), server.uri(), tokens)
}

pub fn config(server: &MockServer) -> Config {
    let mut config = Config::new(INSTALLATION, "client-id");
    config.gateway_id = Some(GATEWAY.into());
    config.refresh_token = "refresh-1".into();
    config.api_base = server.uri();
    config.token_url = format!("{}{MODERN_TOKEN_PATH}", server.uri());
    config.legacy_token_url = format!("{}{LEGACY_TOKEN_PATH}", server.uri());
    config.authorize_url = format!("{}/idp/v3/authorize", server.uri());
    config
}

/// Bridge against the mock server with a valid token and captured events.
pub fn bridge(
    server: &MockServer,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
) -> (Bridge, Arc<Mutex<Vec<Event>>>) {
    seed_valid_token(&store, clock.as_ref());
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(vec![]));
    let sink = events.clone();
    let bridge = Bridge::builder(config(server))
        .store(store)
        .clock(clock)
        .on_event(move |event| sink.lock().unwrap().push(event.clone()))
        .build()
        .expect("bridge should build");
    (bridge, events)
}

pub fn feature_list(names: &[&str]) -> Value {
    let data: Vec<Value> = names
        .iter()
        .map(|n| json!({"feature": n, "properties": {}}))
        .collect();
    json!({ "data": data })
}
