use async_trait::async_trait;
use scout_adapters::PlacesAdapter;
use scout_core::{Candidate, GeoPoint};

use crate::EnrichError;

/// Facts a geocode lookup can backfill onto an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoMatch {
    pub location: GeoPoint,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub rating: Option<f64>,
    pub website: Option<String>,
}

impl GeoMatch {
    fn from_candidate(candidate: Candidate) -> Option<Self> {
        Some(Self {
            location: candidate.location?,
            address: candidate.address,
            phone: candidate.phone,
            rating: candidate.rating,
            website: candidate.website,
        })
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, name: &str, city: &str) -> Result<Option<GeoMatch>, EnrichError>;
}

/// Geocoding through a single-result Places text search.
pub struct PlacesGeocoder {
    places: PlacesAdapter,
}

impl PlacesGeocoder {
    pub fn new(places: PlacesAdapter) -> Self {
        Self { places }
    }
}

#[async_trait]
impl Geocoder for PlacesGeocoder {
    async fn geocode(&self, name: &str, city: &str) -> Result<Option<GeoMatch>, EnrichError> {
        let query = format!("{}, {}", name.trim(), city.trim());
        let found = self.places.text_search(&query, None, 1).await?;
        Ok(found.into_iter().find_map(GeoMatch::from_candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::ProviderId;

    #[test]
    fn match_requires_coordinates() {
        let mut lilia = Candidate::new(ProviderId::Places, "Lilia");
        lilia.phone = Some("(718) 576-3095".into());
        assert_eq!(GeoMatch::from_candidate(lilia.clone()), None);

        lilia.location = Some(GeoPoint::new(40.7175, -73.9524));
        let matched = GeoMatch::from_candidate(lilia).expect("has coordinates");
        assert_eq!(matched.location, GeoPoint::new(40.7175, -73.9524));
        assert_eq!(matched.phone.as_deref(), Some("(718) 576-3095"));
    }

    #[tokio::test]
    async fn unconfigured_places_surfaces_as_lookup_error() {
        let http = std::sync::Arc::new(
            scout_http::HttpFetcher::new(Default::default()).expect("http client"),
        );
        let geocoder = PlacesGeocoder::new(PlacesAdapter::new(http, Default::default()));
        let err = geocoder.geocode("Misi", "New York").await.unwrap_err();
        assert!(matches!(err, EnrichError::Lookup(_)));
    }
}
