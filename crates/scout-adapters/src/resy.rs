use std::sync::Arc;

use async_trait::async_trait;
use scout_core::{Candidate, GeoPoint, PriceTier, ProviderId, Region, SearchFilters};
use scout_http::{ApiKey, HttpFetcher};
use serde::{Deserialize, Serialize};

use crate::{base_url, text_or_none, AdapterContext, AdapterError, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://api.resy.com";

/// Used when the region has a center but no box (unknown neighborhood).
const DEFAULT_RADIUS_METERS: f64 = 1_600.0;

#[derive(Debug, Clone)]
pub struct ResySettings {
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub per_page: u32,
}

impl Default for ResySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            per_page: 20,
        }
    }
}

#[derive(Debug, Serialize)]
struct GeoFilter {
    latitude: f64,
    longitude: f64,
    radius: u32,
}

#[derive(Debug, Serialize)]
struct SlotFilter {
    party_size: u32,
}

#[derive(Debug, Serialize)]
struct VenueSearchRequest<'a> {
    geo: GeoFilter,
    query: &'a str,
    per_page: u32,
    types: [&'static str; 1],
    slot_filter: SlotFilter,
}

#[derive(Debug, Deserialize)]
struct VenueSearchResponse {
    #[serde(default)]
    search: Option<SearchHits>,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<VenueHit>,
}

#[derive(Debug, Deserialize)]
struct VenueIds {
    resy: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VenueRating {
    average: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VenueGeo {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct VenueLocation {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VenueHit {
    id: Option<VenueIds>,
    name: Option<String>,
    neighborhood: Option<String>,
    #[serde(default)]
    cuisine: Vec<String>,
    price_range_id: Option<u8>,
    rating: Option<VenueRating>,
    #[serde(rename = "_geoloc")]
    geoloc: Option<VenueGeo>,
    url_slug: Option<String>,
    location: Option<VenueLocation>,
}

fn booking_url(city_code: Option<&str>, slug: Option<&str>) -> Option<String> {
    match (city_code, slug) {
        (Some(code), Some(slug)) if !code.is_empty() && !slug.is_empty() => {
            Some(format!("https://resy.com/cities/{code}/{slug}"))
        }
        _ => None,
    }
}

fn normalize_hits(response: VenueSearchResponse) -> Vec<Candidate> {
    let hits = response.search.map(|s| s.hits).unwrap_or_default();
    hits.into_iter()
        .filter_map(|hit| {
            let name = text_or_none(hit.name)?;
            let resy_id = hit.id.and_then(|ids| ids.resy).map(|id| id.to_string());
            let mut candidate = Candidate::new(ProviderId::Resy, name);
            candidate.provider_ref = resy_id.clone();
            candidate.resy_id = resy_id;
            candidate.neighborhood = text_or_none(hit.neighborhood);
            candidate.cuisine = hit.cuisine.into_iter().find_map(|c| text_or_none(Some(c)));
            candidate.rating = hit.rating.and_then(|r| r.average);
            candidate.location = hit.geoloc.map(|g| GeoPoint::new(g.lat, g.lng));
            candidate.reservation_url = booking_url(
                hit.location.as_ref().and_then(|l| l.code.as_deref()),
                hit.url_slug.as_deref(),
            );
            Some(candidate.with_price_tier(hit.price_range_id.and_then(PriceTier::new)))
        })
        .collect()
}

pub struct ResyAdapter {
    http: Arc<HttpFetcher>,
    settings: ResySettings,
}

impl ResyAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: ResySettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl SourceAdapter for ResyAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Resy
    }

    fn is_configured(&self) -> bool {
        self.settings.api_key.is_some()
    }

    async fn fetch(
        &self,
        region: &Region,
        filters: &SearchFilters,
        _ctx: &AdapterContext,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let api_key = self
            .settings
            .api_key
            .as_ref()
            .ok_or(AdapterError::MissingCredentials(ProviderId::Resy))?;
        let center = region
            .center
            .ok_or_else(|| AdapterError::NoCoordinates(region.label()))?;

        let url = format!("{}/3/venuesearch/search", base_url(&self.settings.base_url));
        let authorization = format!("ResyAPI api_key=\"{}\"", api_key.expose());
        let body = VenueSearchRequest {
            geo: GeoFilter {
                latitude: center.lat,
                longitude: center.lng,
                radius: region.radius_meters(DEFAULT_RADIUS_METERS).round() as u32,
            },
            query: filters.cuisine.as_deref().unwrap_or_default(),
            per_page: self.settings.per_page,
            types: ["venue"],
            slot_filter: SlotFilter {
                party_size: filters.party_size,
            },
        };

        let response: VenueSearchResponse = self
            .http
            .send_json(ProviderId::Resy.as_str(), |client| {
                client
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &authorization)
                    .json(&body)
            })
            .await?;

        Ok(normalize_hits(response)
            .into_iter()
            .map(|mut c| {
                c.region = Some(filters.city.clone());
                c
            })
            .collect())
    }
}
