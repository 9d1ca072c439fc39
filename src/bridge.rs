//! The assembled bridge: one session context owning the token manager,
//! request client, discovery, schedule engine and boost controller, plus the
//! poll and midnight timers.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::{IdentityEndpoint, TokenManager};
use crate::boost::{BoostController, BoostTicket};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::{Credential, CredentialStore, Pkce};
use crate::discovery::ResourceDiscovery;
use crate::logger::{MessageLogMode, MessageLogger, SharedLogger};
use crate::protocol::{OPERATING_MODE_FEATURE, OPERATING_MODES, SET_MODE, set_mode_body};
use crate::request::RequestClient;
use crate::schedule::ScheduleEngine;
use crate::store::{self, FileStore, MemoryStore, StateStore, keys};
use crate::telemetry;
use crate::types::{
    DiscoveryMode, Event, EventCallback, EventSink, ResourceIdentity, Schedule, ScheduleKind, TimerId,
};
use crate::{Error, Result};

/// Inbound requests from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Stores the JSON under `Ctrl.<kind>.scheduleJson` and writes it.
    SetScheduleJson(ScheduleKind, String),
    /// Writes the stored `Ctrl.<kind>.scheduleJson`.
    Apply(ScheduleKind),
    Reset(ScheduleKind),
    BoostNow(ScheduleKind),
    RefreshTokenNow,
    SetMode(String),
    GenerateAuthorizeUrl,
    /// `None` uses the code stored under `Auth.loginHelper.authorizationCode`.
    ExchangeAuthorizationCode(Option<String>),
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub identity: ResourceIdentity,
    pub mode: DiscoveryMode,
    pub score: i64,
    pub values: usize,
}

/// An armed background task. Aborted on [`Bridge::shutdown`].
#[derive(Debug)]
pub struct TimerHandle {
    pub id: TimerId,
    task: JoinHandle<()>,
}

pub struct BridgeBuilder {
    config: Config,
    event_callbacks: Vec<EventCallback>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    http: Option<reqwest::Client>,
}

impl BridgeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            event_callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
            store: None,
            clock: None,
            http: None,
        }
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default client, which carries `Config::http_timeout`.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<Bridge> {
        let config = self.config;
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder().timeout(config.http_timeout).build()?,
        };

        let logger: Option<SharedLogger> = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Arc::new(Mutex::new(MessageLogger::new(mode, &path)?))),
            _ => None,
        };

        let store: Arc<dyn StateStore> = match (self.store, &config.state_file) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        if store.get(keys::INSTALLATION_ID).is_none() {
            store.set(keys::INSTALLATION_ID, json!(config.installation_id))?;
        }
        if store.get(keys::AUTO_REFRESH).is_none() {
            store.set(keys::AUTO_REFRESH, json!(config.auto_refresh))?;
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = EventSink::new(self.event_callbacks);

        let seed = Credential {
            refresh_token: config.refresh_token.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            ..Credential::default()
        };
        let endpoints = vec![
            IdentityEndpoint::new("modern", &config.token_url),
            IdentityEndpoint::new("legacy", &config.legacy_token_url),
        ];
        let tokens = Arc::new(
            TokenManager::new(
                http.clone(),
                CredentialStore::new(store.clone(), seed),
                store.clone(),
                endpoints,
                &config.authorize_url,
                clock.clone(),
            )
            .with_logger(logger.clone())
            .with_events(events.clone()),
        );

        let client = RequestClient::new(http, &config.api_base, tokens.clone()).with_logger(logger);
        let mut engine = ScheduleEngine::new(client.clone(), store.clone());
        for (kind, max) in &config.max_entries {
            engine = engine.with_max_entries(*kind, *max);
        }
        let discovery = ResourceDiscovery::new(client, store.clone(), config.discovery());
        let boost = BoostController::new(engine.clone(), clock.clone()).with_events(events.clone());

        Ok(Bridge {
            config: Arc::new(config),
            store,
            clock,
            tokens,
            engine,
            discovery,
            boost,
            events,
            identity: Arc::default(),
            timers: Arc::default(),
        })
    }
}

#[derive(Clone)]
pub struct Bridge {
    config: Arc<Config>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenManager>,
    engine: ScheduleEngine,
    discovery: ResourceDiscovery,
    boost: BoostController,
    events: EventSink,
    identity: Arc<Mutex<Option<ResourceIdentity>>>,
    timers: Arc<Mutex<Vec<TimerHandle>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Bridge {
    pub fn builder(config: Config) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn schedules(&self) -> &ScheduleEngine {
        &self.engine
    }

    pub fn boost(&self) -> &BoostController {
        &self.boost
    }

    /// Identity resolved by the last successful discovery in this session.
    pub fn identity(&self) -> Option<ResourceIdentity> {
        lock(&self.identity).clone()
    }

    /// Discovery, schedule mirrors and telemetry, in that order. Failures are
    /// recorded under `Raw.error` and reported as a `Failure` event.
    ///
    /// An exhausted discovery also drops the session identity, so later
    /// commands rediscover instead of addressing the abandoned device.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let result = self.poll_inner().await;
        if let Err(e) = &result {
            if matches!(e, Error::DiscoveryExhausted { .. }) {
                *lock(&self.identity) = None;
            }
            self.fail("poll", e);
        }
        result
    }

    async fn poll_inner(&self) -> Result<PollReport> {
        let found = self.discovery.discover(&self.config.installation_id).await?;
        self.remember(&found.identity, found.mode);

        if !found.features.is_empty() {
            for kind in ScheduleKind::ALL {
                self.engine.mirror_from_list(kind, &found.features)?;
                self.events.emit(&Event::ScheduleMirrored {
                    kind,
                    active: self.store.get_bool(&keys::active(kind)).unwrap_or(false),
                });
            }
        }

        let values = telemetry::map_values(self.store.as_ref(), &found.features, &found.gateway_features)?;
        if !found.features.is_empty() {
            let total = self.store.get_f64(telemetry::BURNER_HOURS);
            telemetry::update_burner_today(self.store.as_ref(), total, self.clock.now().date_naive())?;
        }

        debug!(device_id = %found.identity.device_id, values, "poll complete");
        Ok(PollReport {
            identity: found.identity,
            mode: found.mode,
            score: found.score,
            values,
        })
    }

    fn remember(&self, identity: &ResourceIdentity, mode: DiscoveryMode) {
        let changed = {
            let mut current = lock(&self.identity);
            let changed = current.as_ref() != Some(identity);
            *current = Some(identity.clone());
            changed
        };
        if changed {
            self.events.emit(&Event::DeviceDiscovered {
                identity: identity.clone(),
                mode,
            });
        }
    }

    /// Session identity, then the ids persisted by an earlier run, then a
    /// fresh discovery.
    async fn resolve_identity(&self) -> Result<ResourceIdentity> {
        if let Some(id) = self.identity() {
            return Ok(id);
        }
        if let (Some(gateway_id), Some(device_id)) =
            (self.store.get_str(keys::GATEWAY_ID), self.store.get_str(keys::DEVICE_ID))
        {
            let id = ResourceIdentity {
                installation_id: self.config.installation_id.clone(),
                gateway_id,
                device_id,
            };
            *lock(&self.identity) = Some(id.clone());
            return Ok(id);
        }
        let found = self.discovery.discover(&self.config.installation_id).await?;
        self.remember(&found.identity, found.mode);
        Ok(found.identity)
    }

    fn fail(&self, context: &str, err: &Error) {
        match err {
            Error::AuthRefresh { .. } | Error::DiscoveryExhausted { .. } | Error::BoostRestoreFailed(_) => {
                error!(context, category = err.category(), "{err}")
            }
            _ => warn!(context, category = err.category(), "{err}"),
        }
        store::record_error(self.store.as_ref(), self.clock.now(), context, err);
        self.events.emit(&Event::Failure {
            category: err.category(),
            message: err.to_string(),
        });
    }

    /// Runs a trigger. Errors are recorded like poll failures and returned.
    pub async fn handle(&self, trigger: Trigger) -> Result<()> {
        let context = match &trigger {
            Trigger::SetScheduleJson(..) => "set schedule",
            Trigger::Apply(_) => "apply schedule",
            Trigger::Reset(_) => "reset schedule",
            Trigger::BoostNow(_) => "boost",
            Trigger::RefreshTokenNow => "token refresh",
            Trigger::SetMode(_) => "set mode",
            Trigger::GenerateAuthorizeUrl => "authorize url",
            Trigger::ExchangeAuthorizationCode(_) => "code exchange",
        };
        let result = match trigger {
            Trigger::SetScheduleJson(kind, raw) => self.set_schedule_json(kind, &raw).await.map(drop),
            Trigger::Apply(kind) => self.apply(kind).await.map(drop),
            Trigger::Reset(kind) => self.reset_schedule(kind).await,
            Trigger::BoostNow(kind) => self.boost_now(kind, None).await.map(drop),
            Trigger::RefreshTokenNow => self.refresh_token_now().await,
            Trigger::SetMode(mode) => self.set_operating_mode(&mode).await,
            Trigger::GenerateAuthorizeUrl => self.generate_authorize_url().map(drop),
            Trigger::ExchangeAuthorizationCode(code) => self.exchange_authorization_code(code).await,
        };
        if let Err(e) = &result {
            self.fail(context, e);
        }
        result
    }

    pub async fn read_schedule(&self, kind: ScheduleKind) -> Result<Value> {
        let id = self.resolve_identity().await?;
        let entries = self.engine.read_schedule(kind, &id).await?;
        self.events.emit(&Event::ScheduleMirrored {
            kind,
            active: self.store.get_bool(&keys::active(kind)).unwrap_or(false),
        });
        Ok(entries)
    }

    /// Re-read after a successful mutation. A failure only loses freshness.
    async fn reread(&self, kind: ScheduleKind) {
        if let Err(e) = self.read_schedule(kind).await {
            warn!(%kind, "re-read after write failed: {e}");
        }
    }

    pub async fn set_schedule_json(&self, kind: ScheduleKind, raw: &str) -> Result<Schedule> {
        self.store.set(&keys::schedule_json(kind), json!(raw))?;
        self.write_schedule(kind, raw).await
    }

    pub async fn apply(&self, kind: ScheduleKind) -> Result<Schedule> {
        let raw = self.store.get_str(&keys::schedule_json(kind)).unwrap_or_default();
        self.write_schedule(kind, &raw).await
    }

    async fn write_schedule(&self, kind: ScheduleKind, raw: &str) -> Result<Schedule> {
        // rejected input never needs an identity or a token
        crate::schedule::parse_schedule(kind, raw)?;
        let id = self.resolve_identity().await?;
        let written = self.engine.write_schedule(kind, &id, raw).await?;
        self.events.emit(&Event::ScheduleWritten {
            kind,
            slots: written.slot_count(),
        });
        self.reread(kind).await;
        Ok(written)
    }

    pub async fn reset_schedule(&self, kind: ScheduleKind) -> Result<()> {
        let id = self.resolve_identity().await?;
        self.engine.reset_schedule(kind, &id).await?;
        self.events.emit(&Event::ScheduleReset { kind });
        self.reread(kind).await;
        Ok(())
    }

    /// Minutes default to `Ctrl.<kind>.boostMinutes`, then the configured value.
    pub async fn boost_now(&self, kind: ScheduleKind, minutes: Option<u32>) -> Result<BoostTicket> {
        let minutes = minutes
            .or_else(|| self.store.get_f64(&keys::boost_minutes(kind)).map(|m| m.max(0.0) as u32))
            .unwrap_or(self.config.boost_minutes);
        let id = self.resolve_identity().await?;
        self.boost.start_boost(kind, &id, minutes).await
    }

    /// Manual reapply of the stored boost backup.
    pub async fn restore_boost(&self, kind: ScheduleKind) -> Result<()> {
        let id = self.resolve_identity().await?;
        self.boost.restore(kind, &id).await?;
        self.events.emit(&Event::BoostRestored { kind, timer: None });
        Ok(())
    }

    pub async fn refresh_token_now(&self) -> Result<()> {
        self.tokens.ensure_valid_token(true).await.map(drop)
    }

    pub async fn set_operating_mode(&self, mode: &str) -> Result<()> {
        if !OPERATING_MODES.contains(&mode) {
            return Err(Error::InvalidMode(mode.to_string()));
        }
        let id = self.resolve_identity().await?;
        self.engine
            .command(&id, OPERATING_MODE_FEATURE, SET_MODE, &set_mode_body(mode))
            .await?;
        self.store.set("Ctrl.mode", json!(mode))?;
        info!(mode, "operating mode set");
        self.events.emit(&Event::ModeSet { mode: mode.to_string() });
        Ok(())
    }

    /// Generates a PKCE pair, keeps the verifier and returns the login URL.
    pub fn generate_authorize_url(&self) -> Result<String> {
        let creds = self.tokens.credentials().load();
        if creds.client_id.is_empty() {
            return Err(Error::MissingConfig("client id"));
        }
        let redirect_uri = self
            .store
            .get_str(keys::REDIRECT_URI)
            .unwrap_or_else(|| self.config.redirect_uri.clone());
        let scope = self
            .store
            .get_str(keys::SCOPE)
            .unwrap_or_else(|| self.config.scope.clone());
        let pkce = Pkce::generate();
        let url = self
            .tokens
            .authorize_url(&creds.client_id, &redirect_uri, &scope, &pkce.challenge);
        self.store.set(keys::CODE_VERIFIER, json!(pkce.verifier))?;
        self.store.set(keys::AUTHORIZE_URL, json!(url))?;
        info!("authorize url generated");
        Ok(url)
    }

    pub async fn exchange_authorization_code(&self, code: Option<String>) -> Result<()> {
        let code = code
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.store.get_str(keys::AUTHORIZATION_CODE))
            .ok_or(Error::MissingConfig("authorization code"))?;
        let verifier = self
            .store
            .get_str(keys::CODE_VERIFIER)
            .ok_or(Error::MissingConfig("code verifier"))?;
        let redirect_uri = self
            .store
            .get_str(keys::REDIRECT_URI)
            .unwrap_or_else(|| self.config.redirect_uri.clone());
        self.tokens
            .exchange_authorization_code(code.trim(), &verifier, &redirect_uri)
            .await?;
        self.store.set(keys::AUTHORIZATION_CODE, json!(""))?;
        Ok(())
    }

    /// Polls now and every `poll_interval`, and arms the midnight statistics
    /// rollover. Returns the poll timer id.
    pub fn spawn_polling(&self) -> TimerId {
        let this = self.clone();
        let period = self.config.poll_interval;
        let id = TimerId::new();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // already recorded by poll_once, retried next tick
                let _ = this.poll_once().await;
            }
        });
        info!(%id, interval_secs = period.as_secs(), "polling started");
        lock(&self.timers).push(TimerHandle { id, task });
        self.spawn_midnight_rollover();
        id
    }

    fn spawn_midnight_rollover(&self) -> TimerId {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let id = TimerId::new();
        let task = tokio::spawn(async move {
            loop {
                let delay = telemetry::midnight_delay(clock.now());
                debug!(secs = delay.as_secs(), "midnight rollover armed");
                tokio::time::sleep(delay).await;
                if let Err(e) = telemetry::rollover(store.as_ref(), clock.now().date_naive()) {
                    warn!("midnight rollover failed: {e}");
                }
            }
        });
        lock(&self.timers).push(TimerHandle { id, task });
        id
    }

    /// Aborts the poll and midnight timers. Armed boost restores still fire.
    pub fn shutdown(&self) {
        let timers: Vec<TimerHandle> = lock(&self.timers).drain(..).collect();
        for timer in timers {
            debug!(id = %timer.id, "timer aborted");
            timer.task.abort();
        }
    }
}
