//! Source adapter contract + provider adapters.
//!
//! Every adapter turns one provider's protocol into [`Candidate`]s. Adapters
//! never deduplicate across providers and never surface errors to the
//! session: [`SourceAdapter::search`] converts failures and timeouts into a
//! `warn` progress event and an empty result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scout_core::{Candidate, ProgressSink, ProviderId, Region, SearchFilters};
use scout_http::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod beli;
pub mod exa;
pub mod opentable;
pub mod places;
pub mod resy;

pub use beli::{AgentTaskType, BeliAgentAdapter, BeliSettings};
pub use exa::{ExaAdapter, ExaSettings};
pub use opentable::{OpenTableAdapter, OpenTableSettings};
pub use places::{PlacesAdapter, PlacesPriceLevel, PlacesSearchType, PlacesSettings};
pub use resy::{ResyAdapter, ResySettings};

pub const CRATE_NAME: &str = "scout-adapters";

/// Per-call context shared by all adapters in one fan-out pass.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub session_id: Uuid,
    pub progress: ProgressSink,
    pub timeout: Duration,
}

impl AdapterContext {
    pub fn new(session_id: Uuid, progress: ProgressSink, timeout: Duration) -> Self {
        Self {
            session_id,
            progress,
            timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing credentials for {0}")]
    MissingCredentials(ProviderId),
    #[error("region {0} has no coordinates")]
    NoCoordinates(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("agent task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },
    #[error("agent task {task_id} did not finish in time")]
    TaskTimeout { task_id: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Whether the credentials this adapter needs are present.
    fn is_configured(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        region: &Region,
        filters: &SearchFilters,
        ctx: &AdapterContext,
    ) -> Result<Vec<Candidate>, AdapterError>;

    /// Infallible search: bounded by `ctx.timeout`, failures become a `warn`
    /// progress event and an empty list.
    async fn search(
        &self,
        region: &Region,
        filters: &SearchFilters,
        ctx: &AdapterContext,
    ) -> Vec<Candidate> {
        let provider = self.provider();
        let started = Instant::now();
        match tokio::time::timeout(ctx.timeout, self.fetch(region, filters, ctx)).await {
            Ok(Ok(candidates)) => {
                debug!(
                    %provider,
                    region = %region.label(),
                    count = candidates.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "adapter search finished"
                );
                candidates
            }
            Ok(Err(err)) => {
                ctx.progress.warn(format!(
                    "{} search failed for {}: {err}",
                    provider.display_name(),
                    region.label()
                ));
                Vec::new()
            }
            Err(_) => {
                ctx.progress.warn(format!(
                    "{} timed out after {}s searching {}",
                    provider.display_name(),
                    ctx.timeout.as_secs(),
                    region.label()
                ));
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub places: PlacesSettings,
    pub resy: ResySettings,
    pub opentable: OpenTableSettings,
    pub beli: BeliSettings,
    pub exa: ExaSettings,
}

pub fn adapter_for_provider(
    provider: ProviderId,
    http: &Arc<HttpFetcher>,
    settings: &AdapterSettings,
) -> Arc<dyn SourceAdapter> {
    match provider {
        ProviderId::Places => Arc::new(PlacesAdapter::new(Arc::clone(http), settings.places.clone())),
        ProviderId::Resy => Arc::new(ResyAdapter::new(Arc::clone(http), settings.resy.clone())),
        ProviderId::OpenTable => Arc::new(OpenTableAdapter::new(
            Arc::clone(http),
            settings.opentable.clone(),
        )),
        ProviderId::Beli => Arc::new(BeliAgentAdapter::new(Arc::clone(http), settings.beli.clone())),
        ProviderId::Exa => Arc::new(ExaAdapter::new(Arc::clone(http), settings.exa.clone())),
    }
}

/// One adapter per provider, in provider-declaration order.
pub fn build_adapters(
    http: &Arc<HttpFetcher>,
    settings: &AdapterSettings,
) -> Vec<Arc<dyn SourceAdapter>> {
    ProviderId::ALL
        .into_iter()
        .map(|provider| adapter_for_provider(provider, http, settings))
        .collect()
}

pub(crate) fn text_or_none(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn base_url(raw: &str) -> &str {
    raw.trim_end_matches('/')
}

/// Neighborhood to stamp on results when the provider did not report one.
///
/// Only geo-restricted neighborhood searches qualify; a text-only search may
/// return venues from anywhere in the city.
pub(crate) fn region_neighborhood(region: &Region) -> Option<String> {
    region
        .bounds
        .and(region.neighborhood_name())
        .map(ToString::to_string)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub fn fixture_path(provider: &str, file: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(provider)
            .join(file)
    }

    pub fn read_fixture(provider: &str, file: &str) -> String {
        let path = fixture_path(provider, file);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}
