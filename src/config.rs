use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::discovery::{DiscoveryConfig, parse_probe_list};
use crate::types::ScheduleKind;
use crate::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.viessmann-climatesolutions.com";
pub const DEFAULT_TOKEN_URL: &str = "https://iam.viessmann-climatesolutions.com/idp/v3/token";
pub const DEFAULT_LEGACY_TOKEN_URL: &str = "https://iam.viessmann.com/idp/v2/token";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://iam.viessmann-climatesolutions.com/idp/v3/authorize";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:4280/callback";
pub const DEFAULT_SCOPE: &str = "IoT User offline_access";

#[derive(Debug, Clone)]
pub struct Config {
    pub installation_id: String,
    pub gateway_id: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Seed refresh token. Rotated tokens in the state store take precedence.
    pub refresh_token: String,
    pub api_base: String,
    pub token_url: String,
    pub legacy_token_url: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub scope: String,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub boost_minutes: u32,
    pub auto_refresh: bool,
    pub probe_list: Vec<String>,
    pub primary_prefix: String,
    pub secondary_prefixes: Vec<String>,
    /// Per-kind slot caps overriding the default of 4.
    pub max_entries: HashMap<ScheduleKind, usize>,
    /// JSON state file. `None` keeps state in memory.
    pub state_file: Option<PathBuf>,
}

impl Config {
    pub fn new(installation_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        let discovery = DiscoveryConfig::default();
        Self {
            installation_id: installation_id.into(),
            gateway_id: None,
            client_id: client_id.into(),
            client_secret: None,
            refresh_token: String::new(),
            api_base: DEFAULT_API_BASE.into(),
            token_url: DEFAULT_TOKEN_URL.into(),
            legacy_token_url: DEFAULT_LEGACY_TOKEN_URL.into(),
            authorize_url: DEFAULT_AUTHORIZE_URL.into(),
            redirect_uri: DEFAULT_REDIRECT_URI.into(),
            scope: DEFAULT_SCOPE.into(),
            poll_interval: Duration::from_secs(300),
            http_timeout: Duration::from_secs(15),
            boost_minutes: 30,
            auto_refresh: true,
            probe_list: discovery.probe_list,
            primary_prefix: discovery.primary_prefix,
            secondary_prefixes: discovery.secondary_prefixes,
            max_entries: HashMap::new(),
            state_file: None,
        }
    }

    /// Reads `VICARE_*` variables. `VICARE_INSTALLATION_ID` and
    /// `VICARE_CLIENT_ID` are required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let installation_id = get("VICARE_INSTALLATION_ID").ok_or(Error::MissingConfig("VICARE_INSTALLATION_ID"))?;
        let client_id = get("VICARE_CLIENT_ID").ok_or(Error::MissingConfig("VICARE_CLIENT_ID"))?;
        let mut config = Self::new(installation_id, client_id);

        config.gateway_id = get("VICARE_GATEWAY_ID");
        config.client_secret = get("VICARE_CLIENT_SECRET");
        if let Some(v) = get("VICARE_REFRESH_TOKEN") {
            config.refresh_token = v;
        }
        if let Some(v) = get("VICARE_API_BASE") {
            config.api_base = v;
        }
        if let Some(v) = get("VICARE_TOKEN_URL") {
            config.token_url = v;
        }
        if let Some(v) = get("VICARE_LEGACY_TOKEN_URL") {
            config.legacy_token_url = v;
        }
        if let Some(v) = get("VICARE_AUTHORIZE_URL") {
            config.authorize_url = v;
        }
        if let Some(v) = get("VICARE_REDIRECT_URI") {
            config.redirect_uri = v;
        }
        if let Some(v) = get("VICARE_SCOPE") {
            config.scope = v;
        }
        if let Some(secs) = parsed::<u64>("VICARE_POLL_SECS", get("VICARE_POLL_SECS")) {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>("VICARE_HTTP_TIMEOUT_SECS", get("VICARE_HTTP_TIMEOUT_SECS")) {
            config.http_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(min) = parsed("VICARE_BOOST_MINUTES", get("VICARE_BOOST_MINUTES")) {
            config.boost_minutes = min;
        }
        if let Some(flag) = parsed("VICARE_AUTO_REFRESH", get("VICARE_AUTO_REFRESH")) {
            config.auto_refresh = flag;
        }
        if let Some(v) = get("VICARE_PROBE_LIST") {
            config.probe_list = parse_probe_list(&v);
        }
        if let Some(v) = get("VICARE_PRIMARY_PREFIX") {
            config.primary_prefix = v;
        }
        if let Some(v) = get("VICARE_SECONDARY_PREFIXES") {
            config.secondary_prefixes = parse_probe_list(&v);
        }
        for kind in ScheduleKind::ALL {
            let key = match kind {
                ScheduleKind::Heating => "VICARE_MAX_ENTRIES_HEATING",
                ScheduleKind::HotWater => "VICARE_MAX_ENTRIES_DHW",
                ScheduleKind::Circulation => "VICARE_MAX_ENTRIES_CIRC",
            };
            if let Some(max) = parsed(key, get(key)) {
                config.max_entries.insert(kind, max);
            }
        }
        config.state_file = get("VICARE_STATE_FILE").map(PathBuf::from);

        Ok(config)
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            primary_prefix: self.primary_prefix.clone(),
            secondary_prefixes: self.secondary_prefixes.clone(),
            probe_list: self.probe_list.clone(),
            gateway_id: self.gateway_id.clone(),
            ..DiscoveryConfig::default()
        }
    }
}

/// Unparseable values are ignored with a warning and the default is kept.
fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
