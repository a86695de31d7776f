//! Core domain model, progress events and geo index for the venue scout.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CRATE_NAME: &str = "scout-core";

const EMBEDDED_GEO_INDEX: &str = include_str!("../../../config/neighborhoods.yaml");

/// External data providers, in declaration order.
///
/// The derived ordering is the provider-declaration order used when
/// interleaving per-provider results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "places")]
    Places,
    #[serde(rename = "resy")]
    Resy,
    #[serde(rename = "opentable")]
    OpenTable,
    #[serde(rename = "beli")]
    Beli,
    #[serde(rename = "exa")]
    Exa,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Places,
        ProviderId::Resy,
        ProviderId::OpenTable,
        ProviderId::Beli,
        ProviderId::Exa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Places => "places",
            ProviderId::Resy => "resy",
            ProviderId::OpenTable => "opentable",
            ProviderId::Beli => "beli",
            ProviderId::Exa => "exa",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::Places => "Google Places",
            ProviderId::Resy => "Resy",
            ProviderId::OpenTable => "OpenTable",
            ProviderId::Beli => "Beli",
            ProviderId::Exa => "Exa",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider `{0}` (expected one of: places, resy, opentable, beli, exa)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance in meters.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub southwest: GeoPoint,
    pub northeast: GeoPoint,
}

impl Bounds {
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.southwest.lat + self.northeast.lat) / 2.0,
            lng: (self.southwest.lng + self.northeast.lng) / 2.0,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.southwest.lat
            && point.lat <= self.northeast.lat
            && point.lng >= self.southwest.lng
            && point.lng <= self.northeast.lng
    }

    /// Radius of the circle centered on the box that reaches its corners.
    pub fn radius_meters(&self) -> f64 {
        self.center().distance_meters(&self.northeast)
    }
}

/// Price tier on a 0–4 scale (0 = free, 4 = very expensive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTier(u8);

impl PriceTier {
    pub const MAX: u8 = 4;

    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    /// Tier from a `$`-style rating such as `"$$$"`.
    pub fn from_dollar_signs(text: &str) -> Option<Self> {
        let count = text.trim().chars().filter(|c| *c == '$').count();
        if count == 0 {
            return None;
        }
        u8::try_from(count).ok().and_then(Self::new)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Per-person spend estimate in USD for providers that do not publish one.
    pub fn per_person_estimate(&self) -> Option<u32> {
        match self.0 {
            1 => Some(25),
            2 => Some(50),
            3 => Some(90),
            4 => Some(150),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrivateDining {
    pub available: bool,
    pub capacity_min: Option<u32>,
    pub capacity_max: Option<u32>,
    pub minimum_spend: Option<u32>,
}

impl PrivateDining {
    pub fn has_capacity(&self) -> bool {
        self.capacity_min.is_some() || self.capacity_max.is_some()
    }
}

/// One provider's view of one venue. Immutable once an adapter returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub provider: ProviderId,
    pub provider_ref: Option<String>,
    pub website: Option<String>,
    pub reference_url: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub email_confidence: Option<u8>,
    pub location: Option<GeoPoint>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub region: Option<String>,
    pub cuisine: Option<String>,
    pub price_tier: Option<PriceTier>,
    pub price_per_person: Option<u32>,
    pub rating: Option<f64>,
    pub resy_id: Option<String>,
    pub opentable_id: Option<String>,
    pub beli_rank: Option<u32>,
    pub private_dining: Option<PrivateDining>,
    pub reservation_url: Option<String>,
}

impl Candidate {
    pub fn new(provider: ProviderId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider,
            provider_ref: None,
            website: None,
            reference_url: None,
            phone: None,
            email: None,
            email_confidence: None,
            location: None,
            address: None,
            neighborhood: None,
            region: None,
            cuisine: None,
            price_tier: None,
            price_per_person: None,
            rating: None,
            resy_id: None,
            opentable_id: None,
            beli_rank: None,
            private_dining: None,
            reservation_url: None,
        }
    }

    /// Sets the tier and, when the provider exposes no per-person price, the estimate.
    pub fn with_price_tier(mut self, tier: Option<PriceTier>) -> Self {
        self.price_tier = tier;
        if self.price_per_person.is_none() {
            self.price_per_person = tier.and_then(|t| t.per_person_estimate());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider", rename_all = "snake_case")]
pub enum EmailSource {
    Provider(ProviderId),
    Finder,
}

/// Deduplicated, cross-provider record for one venue within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntity {
    pub dedup_key: String,
    pub name: String,
    pub providers: BTreeSet<ProviderId>,
    pub provider_ref: Option<String>,
    pub website: Option<String>,
    pub reference_url: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub email_confidence: Option<u8>,
    pub email_source: Option<EmailSource>,
    pub location: Option<GeoPoint>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub region: Option<String>,
    pub cuisine: Option<String>,
    pub price_tier: Option<PriceTier>,
    pub price_per_person: Option<u32>,
    pub rating: Option<f64>,
    pub resy_id: Option<String>,
    pub opentable_id: Option<String>,
    pub beli_rank: Option<u32>,
    pub private_dining: Option<PrivateDining>,
    pub reservation_url: Option<String>,
}

impl MergedEntity {
    pub fn from_candidate(dedup_key: impl Into<String>, candidate: &Candidate) -> Self {
        Self {
            dedup_key: dedup_key.into(),
            name: candidate.name.trim().to_string(),
            providers: BTreeSet::from([candidate.provider]),
            provider_ref: candidate.provider_ref.clone(),
            website: candidate.website.clone(),
            reference_url: candidate.reference_url.clone(),
            phone: candidate.phone.clone(),
            email: candidate.email.clone(),
            email_confidence: candidate.email.as_ref().and(candidate.email_confidence),
            email_source: candidate
                .email
                .as_ref()
                .map(|_| EmailSource::Provider(candidate.provider)),
            location: candidate.location,
            address: candidate.address.clone(),
            neighborhood: candidate.neighborhood.clone(),
            region: candidate.region.clone(),
            cuisine: candidate.cuisine.clone(),
            price_tier: candidate.price_tier,
            price_per_person: candidate.price_per_person,
            rating: candidate.rating,
            resy_id: candidate.resy_id.clone(),
            opentable_id: candidate.opentable_id.clone(),
            beli_rank: candidate.beli_rank,
            private_dining: candidate.private_dining.clone(),
            reservation_url: candidate.reservation_url.clone(),
        }
    }

    pub fn has_verified_private_dining(&self) -> bool {
        self.private_dining.as_ref().is_some_and(|pd| pd.available)
    }

    pub fn is_only_from(&self, provider: ProviderId) -> bool {
        self.providers.len() == 1 && self.providers.contains(&provider)
    }
}

/// Request-level filters handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub city: String,
    pub cuisine: Option<String>,
    pub party_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegionScope {
    City,
    Neighborhood { name: String },
    BoundingBox,
}

/// Scope of a single fan-out pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub city: String,
    pub scope: RegionScope,
    pub bounds: Option<Bounds>,
    /// Falls back to the city center when the scope has no box of its own.
    pub center: Option<GeoPoint>,
}

impl Region {
    pub fn city(city: impl Into<String>, bounds: Option<Bounds>) -> Self {
        Self {
            city: city.into(),
            scope: RegionScope::City,
            center: bounds.map(|b| b.center()),
            bounds,
        }
    }

    pub fn neighborhood(
        city: impl Into<String>,
        name: impl Into<String>,
        bounds: Option<Bounds>,
        fallback_center: Option<GeoPoint>,
    ) -> Self {
        Self {
            city: city.into(),
            scope: RegionScope::Neighborhood { name: name.into() },
            center: bounds.map(|b| b.center()).or(fallback_center),
            bounds,
        }
    }

    pub fn bounding_box(city: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            city: city.into(),
            scope: RegionScope::BoundingBox,
            center: Some(bounds.center()),
            bounds: Some(bounds),
        }
    }

    pub fn neighborhood_name(&self) -> Option<&str> {
        match &self.scope {
            RegionScope::Neighborhood { name } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Location phrase used inside free-text provider queries.
    pub fn text_location(&self) -> String {
        match &self.scope {
            RegionScope::Neighborhood { name } => format!("{name}, {}", self.city),
            RegionScope::City | RegionScope::BoundingBox => self.city.clone(),
        }
    }

    pub fn label(&self) -> String {
        match (&self.scope, &self.bounds) {
            (RegionScope::BoundingBox, Some(b)) => format!(
                "bounding box ({:.4},{:.4})-({:.4},{:.4})",
                b.southwest.lat, b.southwest.lng, b.northeast.lat, b.northeast.lng
            ),
            _ => self.text_location(),
        }
    }

    /// Search radius for center-based providers.
    pub fn radius_meters(&self, default_radius: f64) -> f64 {
        self.bounds
            .map(|b| b.radius_meters())
            .unwrap_or(default_radius)
    }
}

fn default_party_size() -> u32 {
    2
}

/// One discovery session's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub city: String,
    /// Legacy single-neighborhood field; ignored when `neighborhoods` is non-empty.
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub neighborhoods: Vec<String>,
    /// Overrides `neighborhoods` when present.
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default = "default_party_size")]
    pub party_size: u32,
    pub sources: BTreeSet<ProviderId>,
    pub limit: usize,
    #[serde(skip)]
    pub progress: Option<ProgressSink>,
}

impl DiscoveryRequest {
    pub fn new(city: impl Into<String>, sources: impl IntoIterator<Item = ProviderId>, limit: usize) -> Self {
        Self {
            city: city.into(),
            neighborhood: None,
            neighborhoods: Vec::new(),
            bounds: None,
            cuisine: None,
            party_size: default_party_size(),
            sources: sources.into_iter().collect(),
            limit,
            progress: None,
        }
    }

    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            city: self.city.trim().to_string(),
            cuisine: self
                .cuisine
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string),
            party_size: self.party_size.max(1),
        }
    }

    /// Neighborhood names to search, de-duplicated case-insensitively in request order.
    pub fn neighborhood_names(&self) -> Vec<String> {
        let raw: Vec<&String> = if self.neighborhoods.is_empty() {
            self.neighborhood.iter().collect()
        } else {
            self.neighborhoods.iter().collect()
        };
        let mut seen = BTreeSet::new();
        raw.into_iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.to_lowercase()))
            .map(ToString::to_string)
            .collect()
    }

    /// Regions searched by the session, in order.
    pub fn regions(&self, geo: &GeoIndex) -> Vec<Region> {
        let city = self.city.trim();
        if let Some(bounds) = self.bounds {
            return vec![Region::bounding_box(city, bounds)];
        }

        let city_bounds = geo.city(city).map(|c| c.bounds);
        let names = self.neighborhood_names();
        if names.is_empty() {
            return vec![Region::city(city, city_bounds)];
        }

        names
            .into_iter()
            .map(|name| {
                let bounds = geo.neighborhood(city, &name).map(|n| n.bounds);
                Region::neighborhood(city, name, bounds, city_bounds.map(|b| b.center()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total: usize,
    pub by_provider: BTreeMap<ProviderId, usize>,
    pub with_private_dining: usize,
    pub with_email: usize,
    pub regions_searched: usize,
}

impl SessionSummary {
    pub fn from_entities(entities: &[MergedEntity], regions_searched: usize) -> Self {
        let mut by_provider = BTreeMap::new();
        for entity in entities {
            for provider in &entity.providers {
                *by_provider.entry(*provider).or_default() += 1;
            }
        }
        Self {
            total: entities.len(),
            by_provider,
            with_private_dining: entities
                .iter()
                .filter(|e| e.has_verified_private_dining())
                .count(),
            with_email: entities.iter().filter(|e| e.email.is_some()).count(),
            regions_searched,
        }
    }
}

/// Event payloads, in the shape the streaming layer frames onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    Log { message: String, level: Level },
    CandidateFound { entity: MergedEntity },
    CandidateUpdated { entity: MergedEntity },
    Complete {
        entities: Vec<MergedEntity>,
        summary: SessionSummary,
    },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn now(kind: ProgressKind) -> Self {
        Self { at: Utc::now(), kind }
    }

    pub fn level(&self) -> Option<Level> {
        match &self.kind {
            ProgressKind::Log { level, .. } => Some(*level),
            ProgressKind::Error { .. } => Some(Level::Error),
            _ => None,
        }
    }
}

/// Sending half of a session's progress channel.
///
/// Log messages are mirrored to `tracing`. Once the attached cancellation
/// token fires, every further event is dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// A sink nobody listens to; logs still reach `tracing`.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, kind: ProgressKind) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(ProgressEvent::now(kind));
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let message = message.into();
        match level {
            Level::Info | Level::Success => tracing::info!(target: "scout::progress", "{message}"),
            Level::Warn => tracing::warn!(target: "scout::progress", "{message}"),
            Level::Error => tracing::error!(target: "scout::progress", "{message}"),
        }
        self.emit(ProgressKind::Log { message, level });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(Level::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    /// Terminal failure event, distinct from an error-level log line.
    pub fn fail(&self, message: impl Into<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let message = message.into();
        tracing::error!(target: "scout::progress", "{message}");
        self.emit(ProgressKind::Error { message });
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeighborhoodGeo {
    pub name: String,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityGeo {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub bounds: Bounds,
    #[serde(default)]
    pub neighborhoods: Vec<NeighborhoodGeo>,
}

impl CityGeo {
    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// City extents and hand-authored neighborhood boxes.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoIndex {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    cities: Vec<CityGeo>,
}

impl GeoIndex {
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_yaml_str(EMBEDDED_GEO_INDEX).context("parsing embedded neighborhoods.yaml")
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn cities(&self) -> &[CityGeo] {
        &self.cities
    }

    pub fn city(&self, name: &str) -> Option<&CityGeo> {
        let name = name.trim();
        self.cities.iter().find(|c| c.matches(name))
    }

    pub fn neighborhood(&self, city: &str, name: &str) -> Option<&NeighborhoodGeo> {
        let name = name.trim();
        self.city(city)?
            .neighborhoods
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }
}
