use std::sync::Arc;

use async_trait::async_trait;
use scout_core::{Candidate, GeoPoint, PriceTier, PrivateDining, ProviderId, Region, SearchFilters};
use scout_http::{ApiKey, HttpFetcher};
use serde::Deserialize;

use crate::{base_url, text_or_none, AdapterContext, AdapterError, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://platform.opentable.com";

const DEFAULT_RADIUS_METERS: f64 = 2_000.0;

#[derive(Debug, Clone)]
pub struct OpenTableSettings {
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub limit: u32,
}

impl Default for OpenTableSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            limit: 25,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingsResponse {
    #[serde(default)]
    items: Vec<Listing>,
}

#[derive(Debug, Deserialize)]
struct ListingPrivateDining {
    #[serde(default)]
    available: bool,
    min_capacity: Option<u32>,
    max_capacity: Option<u32>,
    minimum_spend: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    rid: Option<u64>,
    name: Option<String>,
    neighborhood: Option<String>,
    cuisine: Option<String>,
    price_band: Option<u8>,
    rating: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    profile_url: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    private_dining: Option<ListingPrivateDining>,
}

fn normalize_listings(response: ListingsResponse) -> Vec<Candidate> {
    response
        .items
        .into_iter()
        .filter_map(|listing| {
            let name = text_or_none(listing.name)?;
            let rid = listing.rid.map(|rid| rid.to_string());
            let mut candidate = Candidate::new(ProviderId::OpenTable, name);
            candidate.provider_ref = rid.clone();
            candidate.opentable_id = rid;
            candidate.neighborhood = text_or_none(listing.neighborhood);
            candidate.cuisine = text_or_none(listing.cuisine);
            candidate.rating = listing.rating;
            candidate.location = listing
                .latitude
                .zip(listing.longitude)
                .map(|(lat, lng)| GeoPoint::new(lat, lng));
            candidate.reservation_url = text_or_none(listing.profile_url);
            candidate.phone = text_or_none(listing.phone);
            candidate.address = text_or_none(listing.address);
            candidate.private_dining = listing.private_dining.map(|pd| PrivateDining {
                available: pd.available,
                capacity_min: pd.min_capacity,
                capacity_max: pd.max_capacity,
                minimum_spend: pd.minimum_spend,
            });
            Some(candidate.with_price_tier(listing.price_band.and_then(PriceTier::new)))
        })
        .collect()
}

pub struct OpenTableAdapter {
    http: Arc<HttpFetcher>,
    settings: OpenTableSettings,
}

impl OpenTableAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: OpenTableSettings) -> Self {
        Self { http, settings }
    }

    fn query_params(&self, region: &Region, filters: &SearchFilters) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("covers", filters.party_size.to_string()),
            ("limit", self.settings.limit.to_string()),
        ];
        match region.center {
            Some(center) => {
                params.push(("latitude", center.lat.to_string()));
                params.push(("longitude", center.lng.to_string()));
                params.push((
                    "radius",
                    (region.radius_meters(DEFAULT_RADIUS_METERS).round() as u32).to_string(),
                ));
            }
            None => params.push(("metro", region.city.clone())),
        }
        if let Some(neighborhood) = region.neighborhood_name() {
            params.push(("neighborhood", neighborhood.to_string()));
        }
        if let Some(cuisine) = &filters.cuisine {
            params.push(("term", cuisine.clone()));
        }
        params
    }
}

#[async_trait]
impl SourceAdapter for OpenTableAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::OpenTable
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
            .ok_or(AdapterError::MissingCredentials(ProviderId::OpenTable))?;
        let url = format!("{}/v2/listings", base_url(&self.settings.base_url));
        let params = self.query_params(region, filters);

        let response: ListingsResponse = self
            .http
            .send_json(ProviderId::OpenTable.as_str(), |client| {
                client
                    .get(&url)
                    .bearer_auth(api_key.expose())
                    .query(&params)
            })
            .await?;

        Ok(normalize_listings(response)
            .into_iter()
            .map(|mut c| {
                c.region = Some(filters.city.clone());
                c
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    fn fixture() -> Vec<Candidate> {
        let response: ListingsResponse =
            serde_json::from_str(&read_fixture("opentable", "listings.json")).expect("fixture json");
        normalize_listings(response)
    }

    #[test]
    fn listing_with_private_dining_is_normalized() {
        let candidates = fixture();
        let tavern = &candidates[0];
        assert_eq!(tavern.name, "Gramercy Tavern");
        assert_eq!(tavern.opentable_id.as_deref(), Some("1042"));
        assert_eq!(tavern.neighborhood.as_deref(), Some("Flatiron"));
        assert_eq!(tavern.cuisine.as_deref(), Some("American"));
        assert_eq!(tavern.price_tier.map(|t| t.value()), Some(4));
        assert_eq!(
            tavern.reservation_url.as_deref(),
            Some("https://www.opentable.com/r/gramercy-tavern-new-york")
        );
        assert_eq!(
            tavern.private_dining,
            Some(PrivateDining {
                available: true,
                capacity_min: Some(10),
                capacity_max: Some(22),
                minimum_spend: Some(5000),
            })
        );
    }

    #[test]
    fn listing_without_private_dining_leaves_it_unknown() {
        let candidates = fixture();
        let frenchette = &candidates[1];
        assert_eq!(frenchette.name, "Frenchette");
        assert_eq!(frenchette.private_dining, None);
        assert_eq!(frenchette.rating, None);
        assert_eq!(frenchette.location, Some(GeoPoint::new(40.7196, -74.0052)));
    }

    #[test]
    fn query_uses_center_when_known_and_metro_otherwise() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("http client"));
        let adapter = OpenTableAdapter::new(http, OpenTableSettings::default());
        let filters = SearchFilters {
            city: "New York".into(),
            cuisine: Some("French".into()),
            party_size: 14,
        };

        let centered = Region::neighborhood(
            "New York",
            "Tribeca",
            None,
            Some(GeoPoint::new(40.7128, -74.006)),
        );
        let params = adapter.query_params(&centered, &filters);
        assert!(params.contains(&("latitude", "40.7128".to_string())));
        assert!(params.contains(&("radius", "2000".to_string())));
        assert!(params.contains(&("neighborhood", "Tribeca".to_string())));
        assert!(params.contains(&("covers", "14".to_string())));
        assert!(params.contains(&("term", "French".to_string())));

        let text_only = Region::city("Atlantis", None);
        let params = adapter.query_params(&text_only, &filters);
        assert!(params.contains(&("metro", "Atlantis".to_string())));
        assert!(params.iter().all(|(k, _)| *k != "latitude"));
    }
}
