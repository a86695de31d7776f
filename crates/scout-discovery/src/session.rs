//! One discovery request, from fan-out to the final ordered list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use scout_adapters::{AdapterContext, SourceAdapter};
use scout_core::{
    Candidate, DiscoveryRequest, GeoIndex, MergedEntity, ProgressKind, ProgressSink, ProviderId, Region,
    SearchFilters, SessionSummary,
};
use scout_enrich::{domain_from_website, run_in_groups, EmailFinder, Geocoder, GroupSettings};
use serde::Serialize;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::interleave::interleave;
use crate::resolver::{apply_found_email, apply_geocode, IdentityResolver, Observation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub adapter_timeout: Duration,
    pub enrich_groups: GroupSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(45),
            enrich_groups: GroupSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    Init,
    Searching { region_index: usize, region: String },
    Enriching,
    Done,
    Failed { message: String },
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. } | Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no providers requested")]
    NoProviders,
    #[error("session cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub session_id: Uuid,
    pub city: String,
    /// Providers actually searched.
    pub providers: Vec<ProviderId>,
    pub phase: SessionPhase,
    pub entities: Vec<MergedEntity>,
    pub summary: SessionSummary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mutable aggregation state; only the absorb and enrichment steps touch it.
#[derive(Debug, Default)]
struct SessionState {
    resolver: IdentityResolver,
    order: Vec<String>,
    placed: HashSet<String>,
    regions_searched: usize,
}

impl SessionState {
    /// Folds one region pass. `results` must be in provider order.
    fn absorb(&mut self, results: Vec<(ProviderId, Vec<Candidate>)>, sink: &ProgressSink) -> usize {
        let mut fresh_lists = Vec::with_capacity(results.len());
        for (provider, candidates) in results {
            let mut fresh = Vec::new();
            for candidate in &candidates {
                match self.resolver.observe(candidate) {
                    Observation::New(key) => fresh.push(key),
                    Observation::Merged { key, changed: true } if self.placed.contains(&key) => {
                        if let Some(entity) = self.resolver.get(&key) {
                            sink.emit(ProgressKind::CandidateUpdated {
                                entity: entity.clone(),
                            });
                        }
                    }
                    Observation::Merged { .. } | Observation::Skipped => {}
                }
            }
            debug!(%provider, candidates = candidates.len(), fresh = fresh.len(), "absorbed provider results");
            fresh_lists.push(fresh);
        }

        let mut added = 0usize;
        for key in interleave(fresh_lists) {
            if let Some(entity) = self.resolver.get(&key) {
                sink.emit(ProgressKind::CandidateFound {
                    entity: entity.clone(),
                });
            }
            self.placed.insert(key.clone());
            self.order.push(key);
            added += 1;
        }
        added
    }

    fn head_keys(&self, limit: usize) -> Vec<String> {
        self.order.iter().take(limit).cloned().collect()
    }

    fn entities(&self, limit: usize) -> Vec<MergedEntity> {
        self.order
            .iter()
            .take(limit)
            .filter_map(|key| self.resolver.get(key).cloned())
            .collect()
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub struct DiscoverySession {
    id: Uuid,
    request: DiscoveryRequest,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    email_finder: Option<Arc<EmailFinder>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    geo: Arc<GeoIndex>,
    settings: SessionSettings,
    cancel: CancellationToken,
    sink: ProgressSink,
    phase: SessionPhase,
    active: Vec<ProviderId>,
}

impl DiscoverySession {
    pub fn new(
        mut request: DiscoveryRequest,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        geo: Arc<GeoIndex>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let sink = request
            .progress
            .take()
            .unwrap_or_else(ProgressSink::detached)
            .with_cancellation(cancel.clone());
        Self {
            id: Uuid::new_v4(),
            request,
            adapters,
            email_finder: None,
            geocoder: None,
            geo,
            settings: SessionSettings::default(),
            cancel,
            sink,
            phase: SessionPhase::Init,
            active: Vec::new(),
        }
    }

    pub fn with_email_finder(mut self, finder: Arc<EmailFinder>) -> Self {
        self.email_finder = Some(finder);
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Ties the session (and its progress sink) to a caller-owned token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.sink = self.sink.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> DiscoveryOutcome {
        let started_at = Utc::now();
        let span = info_span!("discovery_session", session_id = %self.id, city = %self.request.city);
        let mut state = SessionState::default();
        let cancel = self.cancel.clone();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DiscoveryError::Cancelled),
            result = self.drive(&mut state).instrument(span) => result,
        };

        let entities = match result {
            Ok(entities) => entities,
            Err(DiscoveryError::Cancelled) => {
                info!(session_id = %self.id, "discovery session cancelled");
                self.phase = SessionPhase::Cancelled;
                Vec::new()
            }
            Err(err) => {
                let message = err.to_string();
                self.sink.fail(message.clone());
                self.phase = SessionPhase::Failed { message };
                Vec::new()
            }
        };

        DiscoveryOutcome {
            session_id: self.id,
            city: self.request.city.trim().to_string(),
            providers: self.active,
            phase: self.phase,
            summary: SessionSummary::from_entities(&entities, state.regions_searched),
            entities,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn drive(&mut self, state: &mut SessionState) -> Result<Vec<MergedEntity>, DiscoveryError> {
        if self.request.sources.is_empty() {
            return Err(DiscoveryError::NoProviders);
        }

        let adapters = self.select_adapters();
        self.active = adapters.iter().map(|a| a.provider()).collect();
        let filters = self.request.filters();
        let limit = self.request.limit;

        if adapters.is_empty() {
            self.sink.warn("None of the requested providers are configured, nothing to search");
            return Ok(self.finish(state, limit));
        }

        let regions = self.request.regions(&self.geo);
        let provider_names: Vec<_> = self.active.iter().map(|p| p.display_name()).collect();
        let region_labels: Vec<_> = regions.iter().map(|r| r.label()).collect();
        self.sink.info(format!(
            "Searching {} via {} across {} region(s): {}; cuisine {}, party of {}",
            filters.city,
            provider_names.join(", "),
            regions.len(),
            region_labels.join(" | "),
            filters.cuisine.as_deref().unwrap_or("any"),
            filters.party_size
        ));

        for (index, region) in regions.iter().enumerate() {
            self.phase = SessionPhase::Searching {
                region_index: index,
                region: region.label(),
            };
            self.sink.info(format!(
                "Searching {} ({}/{})",
                region.label(),
                index + 1,
                regions.len()
            ));
            let results = self.search_region(&adapters, region, &filters).await;
            let added = state.absorb(results, &self.sink);
            state.regions_searched += 1;
            self.sink.success(format!(
                "{}: {added} new venue(s), {} so far",
                region.label(),
                state.order.len()
            ));
        }

        self.phase = SessionPhase::Enriching;
        self.enrich(state, &filters, limit).await;
        Ok(self.finish(state, limit))
    }

    /// Requested, registered and configured adapters in provider order.
    fn select_adapters(&self) -> Vec<Arc<dyn SourceAdapter>> {
        let mut selected: Vec<Arc<dyn SourceAdapter>> = self
            .adapters
            .iter()
            .filter(|a| self.request.sources.contains(&a.provider()))
            .cloned()
            .collect();
        selected.sort_by_key(|a| a.provider());
        selected.dedup_by_key(|a| a.provider());

        for provider in &self.request.sources {
            if !selected.iter().any(|a| a.provider() == *provider) {
                self.sink.warn(format!(
                    "No adapter registered for {}, skipping",
                    provider.display_name()
                ));
            }
        }
        selected.retain(|adapter| {
            let configured = adapter.is_configured();
            if !configured {
                self.sink.warn(format!(
                    "{} is missing credentials, skipping",
                    adapter.provider().display_name()
                ));
            }
            configured
        });
        selected
    }

    async fn search_region(
        &self,
        adapters: &[Arc<dyn SourceAdapter>],
        region: &Region,
        filters: &SearchFilters,
    ) -> Vec<(ProviderId, Vec<Candidate>)> {
        let ctx = AdapterContext::new(self.id, self.sink.clone(), self.settings.adapter_timeout);
        let handles: Vec<_> = adapters
            .iter()
            .map(|adapter| {
                let adapter = Arc::clone(adapter);
                let region = region.clone();
                let filters = filters.clone();
                let ctx = ctx.clone();
                let span = info_span!("adapter_search", provider = %adapter.provider());
                tokio::spawn(async move { adapter.search(&region, &filters, &ctx).await }.instrument(span))
            })
            .collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let joined = join_all(handles).await;
        adapters
            .iter()
            .zip(joined)
            .map(|(adapter, result)| {
                let provider = adapter.provider();
                match result {
                    Ok(candidates) => (provider, candidates),
                    Err(err) => {
                        self.sink.warn(format!(
                            "{} search for {} did not complete: {err}",
                            provider.display_name(),
                            region.label()
                        ));
                        (provider, Vec::new())
                    }
                }
            })
            .collect()
    }

    /// Geocode fallback then email lookup, over the first `limit` entities only.
    async fn enrich(&self, state: &mut SessionState, filters: &SearchFilters, limit: usize) {
        let head = state.head_keys(limit);
        let groups = self.settings.enrich_groups;

        if let Some(geocoder) = &self.geocoder {
            let lookups: Vec<(String, String)> = head
                .iter()
                .filter_map(|key| {
                    let entity = state.resolver.get(key)?;
                    (entity.location.is_none() && entity.is_only_from(ProviderId::Exa))
                        .then(|| (key.clone(), entity.name.clone()))
                })
                .collect();

            if !lookups.is_empty() {
                self.sink.info(format!(
                    "Geocoding {} venue(s) found only through web search",
                    lookups.len()
                ));
                let city = filters.city.as_str();
                let results = run_in_groups(lookups, groups, |(key, name)| async move {
                    let found = geocoder.geocode(&name, city).await;
                    (key, name, found)
                })
                .await;

                for (key, name, found) in results {
                    match found {
                        Ok(Some(found)) => {
                            if let Some(entity) = state.resolver.get_mut(&key) {
                                apply_geocode(entity, &found);
                                self.sink.emit(ProgressKind::CandidateUpdated {
                                    entity: entity.clone(),
                                });
                            }
                        }
                        Ok(None) => self.sink.info(format!("No location found for {name}")),
                        Err(err) => self.sink.info(format!("Geocoding {name} failed: {err}")),
                    }
                }
            }
        }

        if let Some(finder) = &self.email_finder {
            let targets: Vec<(String, String)> = head
                .iter()
                .filter_map(|key| {
                    let entity = state.resolver.get(key)?;
                    if entity.email.is_some() {
                        return None;
                    }
                    let domain = domain_from_website(entity.website.as_deref()?)?;
                    Some((key.clone(), domain))
                })
                .collect();

            if !targets.is_empty() {
                self.sink.info(format!(
                    "Looking up contact emails for {} venue(s)",
                    targets.len()
                ));
                let domains: Vec<String> = targets.iter().map(|(_, domain)| domain.clone()).collect();
                let found = finder.find_emails_batch(&domains, groups).await;

                for (key, domain) in targets {
                    match found.get(&domain).cloned().flatten() {
                        Some(email) => {
                            if let Some(entity) = state.resolver.get_mut(&key) {
                                if apply_found_email(entity, &email) {
                                    self.sink.emit(ProgressKind::CandidateUpdated {
                                        entity: entity.clone(),
                                    });
                                }
                            }
                        }
                        None => self.sink.info(format!("No contact email found for {domain}")),
                    }
                }
            }
        }
    }

    fn finish(&mut self, state: &SessionState, limit: usize) -> Vec<MergedEntity> {
        let entities = state.entities(limit);
        let summary = SessionSummary::from_entities(&entities, state.regions_searched);
        self.sink.success(format!(
            "Found {} venue(s): {} with private dining, {} with a contact email",
            summary.total, summary.with_private_dining, summary.with_email
        ));
        self.sink.emit(ProgressKind::Complete {
            entities: entities.clone(),
            summary,
        });
        self.phase = SessionPhase::Done;
        entities
    }
}
