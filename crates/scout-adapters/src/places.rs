//! Google Places (Text Search v1). Also backs the geocoder used during enrichment.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use scout_core::{Bounds, Candidate, GeoPoint, PriceTier, ProviderId, Region, SearchFilters};
use scout_http::{ApiKey, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{base_url, region_neighborhood, text_or_none, AdapterContext, AdapterError, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://places.googleapis.com";

const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.location,\
places.websiteUri,places.nationalPhoneNumber,places.rating,places.priceLevel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacesSearchType {
    PrivateDining,
    EventSpace,
    Restaurant,
}

impl PlacesSearchType {
    pub const DEFAULT: [PlacesSearchType; 3] = [
        PlacesSearchType::PrivateDining,
        PlacesSearchType::EventSpace,
        PlacesSearchType::Restaurant,
    ];

    pub fn text_query(&self, location: &str, cuisine: Option<&str>) -> String {
        let cuisine = cuisine.map(|c| format!("{c} ")).unwrap_or_default();
        match self {
            Self::PrivateDining => {
                format!("{cuisine}restaurants with private dining rooms in {location}")
            }
            Self::EventSpace => format!("{cuisine}private event spaces in {location}"),
            Self::Restaurant => format!("{cuisine}restaurants in {location}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacesPriceLevel {
    PriceLevelUnspecified,
    PriceLevelFree,
    PriceLevelInexpensive,
    PriceLevelModerate,
    PriceLevelExpensive,
    PriceLevelVeryExpensive,
    #[serde(other)]
    Unrecognized,
}

impl PlacesPriceLevel {
    pub fn tier(&self) -> Option<PriceTier> {
        let value = match self {
            Self::PriceLevelFree => 0,
            Self::PriceLevelInexpensive => 1,
            Self::PriceLevelModerate => 2,
            Self::PriceLevelExpensive => 3,
            Self::PriceLevelVeryExpensive => 4,
            Self::PriceLevelUnspecified | Self::Unrecognized => return None,
        };
        PriceTier::new(value)
    }
}

#[derive(Debug, Clone)]
pub struct PlacesSettings {
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub search_types: Vec<PlacesSearchType>,
    pub page_size: u32,
}

impl Default for PlacesSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            search_types: PlacesSearchType::DEFAULT.to_vec(),
            page_size: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LatLng {
    latitude: f64,
    longitude: f64,
}

impl From<GeoPoint> for LatLng {
    fn from(point: GeoPoint) -> Self {
        Self {
            latitude: point.lat,
            longitude: point.lng,
        }
    }
}

#[derive(Debug, Serialize)]
struct Rectangle {
    low: LatLng,
    high: LatLng,
}

#[derive(Debug, Serialize)]
struct LocationRestriction {
    rectangle: Rectangle,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchTextRequest<'a> {
    text_query: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_restriction: Option<LocationRestriction>,
}

#[derive(Debug, Deserialize)]
struct SearchTextResponse {
    #[serde(default)]
    places: Vec<Place>,
}

#[derive(Debug, Deserialize)]
struct LocalizedText {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Place {
    id: Option<String>,
    display_name: Option<LocalizedText>,
    formatted_address: Option<String>,
    location: Option<LatLng>,
    website_uri: Option<String>,
    national_phone_number: Option<String>,
    rating: Option<f64>,
    price_level: Option<PlacesPriceLevel>,
}

fn normalize_places(response: SearchTextResponse) -> Vec<Candidate> {
    response
        .places
        .into_iter()
        .filter_map(|place| {
            let name = text_or_none(place.display_name.and_then(|d| d.text))?;
            let mut candidate = Candidate::new(ProviderId::Places, name);
            candidate.provider_ref = place.id;
            candidate.website = text_or_none(place.website_uri);
            candidate.phone = text_or_none(place.national_phone_number);
            candidate.address = text_or_none(place.formatted_address);
            candidate.location = place.location.map(|l| GeoPoint::new(l.latitude, l.longitude));
            candidate.rating = place.rating;
            Some(candidate.with_price_tier(place.price_level.and_then(|p| p.tier())))
        })
        .collect()
}

pub struct PlacesAdapter {
    http: Arc<HttpFetcher>,
    settings: PlacesSettings,
}

impl PlacesAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: PlacesSettings) -> Self {
        Self { http, settings }
    }

    /// One Text Search call, optionally restricted to `bounds`.
    pub async fn text_search(
        &self,
        query: &str,
        bounds: Option<&Bounds>,
        page_size: u32,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let api_key = self
            .settings
            .api_key
            .as_ref()
            .ok_or(AdapterError::MissingCredentials(ProviderId::Places))?;
        let url = format!("{}/v1/places:searchText", base_url(&self.settings.base_url));
        let body = SearchTextRequest {
            text_query: query,
            page_size,
            location_restriction: bounds.map(|b| LocationRestriction {
                rectangle: Rectangle {
                    low: b.southwest.into(),
                    high: b.northeast.into(),
                },
            }),
        };

        let response: SearchTextResponse = self
            .http
            .send_json(ProviderId::Places.as_str(), |client| {
                client
                    .post(&url)
                    .header("X-Goog-Api-Key", api_key.expose())
                    .header("X-Goog-FieldMask", FIELD_MASK)
                    .json(&body)
            })
            .await?;
        Ok(normalize_places(response))
    }
}

#[async_trait]
impl SourceAdapter for PlacesAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Places
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
        let location = region.text_location();
        let page_size = self.settings.page_size;
        let searches = self.settings.search_types.iter().map(|search_type| {
            let query = search_type.text_query(&location, filters.cuisine.as_deref());
            async move {
                let result = self.text_search(&query, region.bounds.as_ref(), page_size).await;
                (*search_type, result)
            }
        });

        let neighborhood = region_neighborhood(region);
        let mut candidates = Vec::new();
        let mut succeeded = 0usize;
        let mut first_error = None;
        for (search_type, result) in join_all(searches).await {
            match result {
                Ok(found) => {
                    succeeded += 1;
                    candidates.extend(found.into_iter().map(|mut c| {
                        c.region = Some(filters.city.clone());
                        if c.neighborhood.is_none() {
                            c.neighborhood = neighborhood.clone();
                        }
                        c
                    }));
                }
                Err(err) => {
                    debug!(?search_type, error = %err, "places search type failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if succeeded == 0 => Err(err),
            _ => Ok(candidates),
        }
    }
}
