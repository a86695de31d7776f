use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scout_adapters::{
    build_adapters, exa, opentable, places, resy, AdapterSettings, BeliSettings, ExaSettings,
    OpenTableSettings, PlacesAdapter, PlacesSettings, ResySettings, SourceAdapter,
};
use scout_core::{DiscoveryRequest, GeoIndex};
use scout_enrich::email::DEFAULT_HUNTER_BASE_URL;
use scout_enrich::{EmailFinder, Geocoder, GroupSettings, HunterClient, PlacesGeocoder};
use scout_http::{ApiKey, HttpClientConfig, HttpFetcher, RateLimit};
use tracing::debug;

use crate::session::{DiscoverySession, SessionSettings};

/// Relative to the workspace root.
pub const GEO_INDEX_PATH: &str = "config/neighborhoods.yaml";

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub places_api_key: Option<ApiKey>,
    pub resy_api_key: Option<ApiKey>,
    pub opentable_api_key: Option<ApiKey>,
    pub beli_agent_url: Option<String>,
    pub beli_agent_api_key: Option<ApiKey>,
    pub exa_api_key: Option<ApiKey>,
    pub hunter_api_key: Option<ApiKey>,
    pub places_base_url: String,
    pub resy_base_url: String,
    pub opentable_base_url: String,
    pub exa_base_url: String,
    pub hunter_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Requests per second allowed to each provider. `0` disables pacing.
    pub http_rate_per_sec: u32,
    pub adapter_timeout_secs: u64,
    pub agent_poll_secs: u64,
    pub enrich_concurrency: usize,
    pub enrich_pause_ms: u64,
    pub workspace_root: PathBuf,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            places_api_key: None,
            resy_api_key: None,
            opentable_api_key: None,
            beli_agent_url: None,
            beli_agent_api_key: None,
            exa_api_key: None,
            hunter_api_key: None,
            places_base_url: places::DEFAULT_BASE_URL.to_string(),
            resy_base_url: resy::DEFAULT_BASE_URL.to_string(),
            opentable_base_url: opentable::DEFAULT_BASE_URL.to_string(),
            exa_base_url: exa::DEFAULT_BASE_URL.to_string(),
            hunter_base_url: DEFAULT_HUNTER_BASE_URL.to_string(),
            user_agent: "event-venue-scout/0.1".to_string(),
            http_timeout_secs: 15,
            http_rate_per_sec: 0,
            adapter_timeout_secs: 45,
            agent_poll_secs: 2,
            enrich_concurrency: 5,
            enrich_pause_ms: 200,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_text(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            places_api_key: ApiKey::from_env("GOOGLE_PLACES_API_KEY"),
            resy_api_key: ApiKey::from_env("RESY_API_KEY"),
            opentable_api_key: ApiKey::from_env("OPENTABLE_API_KEY"),
            beli_agent_url: env_text("BELI_AGENT_URL"),
            beli_agent_api_key: ApiKey::from_env("BELI_AGENT_API_KEY"),
            exa_api_key: ApiKey::from_env("EXA_API_KEY"),
            hunter_api_key: ApiKey::from_env("HUNTER_API_KEY"),
            user_agent: env_text("SCOUT_USER_AGENT").unwrap_or(defaults.user_agent.clone()),
            http_timeout_secs: env_or("SCOUT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_rate_per_sec: env_or("SCOUT_HTTP_RATE_PER_SEC", defaults.http_rate_per_sec),
            adapter_timeout_secs: env_or("SCOUT_ADAPTER_TIMEOUT_SECS", defaults.adapter_timeout_secs),
            agent_poll_secs: env_or("SCOUT_AGENT_POLL_SECS", defaults.agent_poll_secs),
            enrich_concurrency: env_or("SCOUT_ENRICH_CONCURRENCY", defaults.enrich_concurrency),
            enrich_pause_ms: env_or("SCOUT_ENRICH_PAUSE_MS", defaults.enrich_pause_ms),
            workspace_root: env_text("SCOUT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root.clone()),
            ..defaults
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: RateLimit::per_second(self.http_rate_per_sec),
            ..Default::default()
        }
    }

    pub fn build_http(&self) -> Result<Arc<HttpFetcher>> {
        let http = HttpFetcher::new(self.http_config()).context("building http client")?;
        Ok(Arc::new(http))
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            places: PlacesSettings {
                api_key: self.places_api_key.clone(),
                base_url: self.places_base_url.clone(),
                ..PlacesSettings::default()
            },
            resy: ResySettings {
                api_key: self.resy_api_key.clone(),
                base_url: self.resy_base_url.clone(),
                ..ResySettings::default()
            },
            opentable: OpenTableSettings {
                api_key: self.opentable_api_key.clone(),
                base_url: self.opentable_base_url.clone(),
                ..OpenTableSettings::default()
            },
            beli: BeliSettings {
                agent_url: self.beli_agent_url.clone(),
                api_key: self.beli_agent_api_key.clone(),
                poll_interval: Duration::from_secs(self.agent_poll_secs.max(1)),
                ..BeliSettings::default()
            },
            exa: ExaSettings {
                api_key: self.exa_api_key.clone(),
                base_url: self.exa_base_url.clone(),
                ..ExaSettings::default()
            },
        }
    }

    /// Every provider adapter; unconfigured ones are filtered by the session.
    pub fn build_adapters(&self, http: &Arc<HttpFetcher>) -> Vec<Arc<dyn SourceAdapter>> {
        build_adapters(http, &self.adapter_settings())
    }

    pub fn build_email_finder(&self, http: &Arc<HttpFetcher>) -> Option<Arc<EmailFinder>> {
        let key = self.hunter_api_key.clone()?;
        let client = HunterClient::new(Arc::clone(http), key, self.hunter_base_url.clone());
        Some(Arc::new(EmailFinder::new(Arc::new(client))))
    }

    pub fn build_geocoder(&self, http: &Arc<HttpFetcher>) -> Option<Arc<dyn Geocoder>> {
        self.places_api_key.as_ref()?;
        let places = PlacesAdapter::new(Arc::clone(http), self.adapter_settings().places);
        Some(Arc::new(PlacesGeocoder::new(places)))
    }

    pub fn enrich_groups(&self) -> GroupSettings {
        GroupSettings {
            size: self.enrich_concurrency.max(1),
            pause: Duration::from_millis(self.enrich_pause_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            adapter_timeout: Duration::from_secs(self.adapter_timeout_secs.max(1)),
            enrich_groups: self.enrich_groups(),
        }
    }

    /// Workspace geo index when present, else the embedded copy.
    pub fn load_geo_index(&self) -> Result<GeoIndex> {
        load_geo_index(&self.workspace_root)
    }

    /// A session wired with every adapter and whichever enrichers have keys.
    pub fn build_session(&self, request: DiscoveryRequest) -> Result<DiscoverySession> {
        let http = self.build_http()?;
        let geo = Arc::new(self.load_geo_index()?);
        let mut session = DiscoverySession::new(request, self.build_adapters(&http), geo)
            .with_settings(self.session_settings());
        if let Some(finder) = self.build_email_finder(&http) {
            session = session.with_email_finder(finder);
        }
        if let Some(geocoder) = self.build_geocoder(&http) {
            session = session.with_geocoder(geocoder);
        }
        debug!(session_id = %session.id(), "discovery session built from config");
        Ok(session)
    }
}

pub fn load_geo_index(workspace_root: &Path) -> Result<GeoIndex> {
    let path = workspace_root.join(GEO_INDEX_PATH);
    if path.is_file() {
        debug!(path = %path.display(), "loading geo index from workspace");
        return GeoIndex::load(&path).with_context(|| format!("loading {}", path.display()));
    }
    GeoIndex::embedded().context("parsing embedded geo index")
}
