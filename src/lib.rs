mod auth;
mod boost;
mod bridge;
mod clock;
mod config;
mod credentials;
mod diff;
mod discovery;
mod error;
mod logger;
mod protocol;
mod request;
mod schedule;
mod store;
mod telemetry;
mod types;

pub use auth::{IdentityEndpoint, REFRESH_LEEWAY_MILLIS, TokenManager};
pub use boost::{BoostController, BoostTicket, MAX_BOOST_MINUTES, clamp_minutes, override_schedule, restore_delay};
pub use bridge::{Bridge, BridgeBuilder, PollReport, TimerHandle, Trigger};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use credentials::{Credential, CredentialStore, EXPIRY_SAFETY_MARGIN_SECS, Pkce, TokenResponse};
pub use discovery::{DiscoveryConfig, ResourceDiscovery, score_features};
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use protocol::{FeatureSet, OPERATING_MODES};
pub use request::{ApiResponse, RequestClient};
pub use schedule::{ScheduleEngine, normalize, parse_schedule, trim};
pub use store::{FileStore, MemoryStore, StateStore, keys, record_error};
pub use telemetry::{map_values, midnight_delay, update_burner_today};
pub use types::*;
