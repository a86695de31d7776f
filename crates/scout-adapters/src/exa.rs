//! Exa neural web search. Two queries per region: venue sites directly, and
//! review/guide sites whose pages name venues in their titles.

use std::sync::Arc;

use async_trait::async_trait;
use scout_core::{Candidate, ProviderId, Region, SearchFilters};
use scout_http::{ApiKey, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{base_url, region_neighborhood, text_or_none, AdapterContext, AdapterError, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://api.exa.ai";

pub const REVIEW_DOMAINS: [&str; 5] = [
    "yelp.com",
    "theinfatuation.com",
    "eater.com",
    "timeout.com",
    "tripadvisor.com",
];

const TITLE_SEPARATORS: [&str; 5] = [" | ", " - ", " – ", " — ", " · "];

#[derive(Debug, Clone)]
pub struct ExaSettings {
    pub api_key: Option<ApiKey>,
    pub base_url: String,
    pub num_results: u32,
}

impl Default for ExaSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            num_results: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExaQueryKind {
    DirectSite,
    ReviewSite,
}

impl ExaQueryKind {
    fn query(&self, location: &str, cuisine: Option<&str>) -> String {
        let cuisine = cuisine.map(|c| format!("{c} ")).unwrap_or_default();
        match self {
            Self::DirectSite => {
                format!("{cuisine}restaurant in {location} with a private dining room for events")
            }
            Self::ReviewSite => format!("review of a {cuisine}restaurant in {location} with private dining"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaSearchRequest {
    query: String,
    num_results: u32,
    #[serde(rename = "type")]
    search_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    include_domains: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exclude_domains: Vec<&'static str>,
}

impl ExaSearchRequest {
    fn new(kind: ExaQueryKind, query: String, num_results: u32) -> Self {
        let (include_domains, exclude_domains) = match kind {
            ExaQueryKind::DirectSite => (Vec::new(), REVIEW_DOMAINS.to_vec()),
            ExaQueryKind::ReviewSite => (REVIEW_DOMAINS.to_vec(), Vec::new()),
        };
        Self {
            query,
            num_results,
            search_type: "auto",
            include_domains,
            exclude_domains,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExaSearchResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Debug, Deserialize)]
struct ExaResult {
    title: Option<String>,
    url: Option<String>,
}

/// Venue name from a page title, or `None` for listicles and empty titles.
pub fn clean_title(title: &str) -> Option<String> {
    let mut text = title.trim();
    if text.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("review:")) {
        text = text[7..].trim_start();
    }

    let cut = TITLE_SEPARATORS
        .iter()
        .filter_map(|sep| text.find(sep))
        .min()
        .unwrap_or(text.len());
    let name = text[..cut].trim();
    if name.is_empty() || is_listicle(name) {
        return None;
    }
    Some(name.to_string())
}

fn is_listicle(name: &str) -> bool {
    let lower = name.to_lowercase();
    let mut words = lower.split_whitespace();
    let first = words.next().unwrap_or_default();
    let second = words.next().unwrap_or_default();
    let numeric = |w: &str| w.parse::<u32>().is_ok();

    numeric(first)
        || first == "best"
        || first == "top"
        || (first == "the" && (numeric(second) || second == "best" || second == "top"))
}

fn site_origin(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

fn normalize_results(kind: ExaQueryKind, response: ExaSearchResponse) -> Vec<Candidate> {
    response
        .results
        .into_iter()
        .filter_map(|result| {
            let name = clean_title(result.title.as_deref()?)?;
            let url = text_or_none(result.url);
            let mut candidate = Candidate::new(ProviderId::Exa, name);
            candidate.provider_ref = url.clone();
            if kind == ExaQueryKind::DirectSite {
                candidate.website = url.as_deref().and_then(site_origin);
            }
            candidate.reference_url = url;
            Some(candidate)
        })
        .collect()
}

pub struct ExaAdapter {
    http: Arc<HttpFetcher>,
    settings: ExaSettings,
}

impl ExaAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: ExaSettings) -> Self {
        Self { http, settings }
    }

    async fn run_query(
        &self,
        api_key: &ApiKey,
        kind: ExaQueryKind,
        query: String,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let url = format!("{}/search", base_url(&self.settings.base_url));
        let body = ExaSearchRequest::new(kind, query, self.settings.num_results);
        let response: ExaSearchResponse = self
            .http
            .send_json(ProviderId::Exa.as_str(), |client| {
                client
                    .post(&url)
                    .header("x-api-key", api_key.expose())
                    .json(&body)
            })
            .await?;
        Ok(normalize_results(kind, response))
    }
}

#[async_trait]
impl SourceAdapter for ExaAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Exa
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
            .ok_or(AdapterError::MissingCredentials(ProviderId::Exa))?;
        let location = region.text_location();
        let cuisine = filters.cuisine.as_deref();

        let (direct, reviews) = futures::join!(
            self.run_query(
                api_key,
                ExaQueryKind::DirectSite,
                ExaQueryKind::DirectSite.query(&location, cuisine)
            ),
            self.run_query(
                api_key,
                ExaQueryKind::ReviewSite,
                ExaQueryKind::ReviewSite.query(&location, cuisine)
            ),
        );

        let neighborhood = region_neighborhood(region);
        let stamp = |mut c: Candidate| {
            c.region = Some(filters.city.clone());
            c.neighborhood = neighborhood.clone();
            c
        };
        match (direct, reviews) {
            (Err(err), Err(other)) => {
                debug!(error = %other, "exa review query failed");
                Err(err)
            }
            (direct, reviews) => {
                let mut candidates = Vec::new();
                for (kind, result) in [
                    (ExaQueryKind::DirectSite, direct),
                    (ExaQueryKind::ReviewSite, reviews),
                ] {
                    match result {
                        Ok(found) => candidates.extend(found.into_iter().map(&stamp)),
                        Err(err) => debug!(?kind, error = %err, "exa query failed"),
                    }
                }
                Ok(candidates)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    fn fixture(kind: ExaQueryKind, file: &str) -> Vec<Candidate> {
        let response: ExaSearchResponse =
            serde_json::from_str(&read_fixture("exa", file)).expect("fixture json");
        normalize_results(kind, response)
    }

    #[test]
    fn direct_results_use_site_origin_as_website() {
        let found = fixture(ExaQueryKind::DirectSite, "direct.json");
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lilia", "Misi"]);
        assert_eq!(found[0].website.as_deref(), Some("https://www.lilianewyork.com"));
        assert_eq!(
            found[0].reference_url.as_deref(),
            Some("https://www.lilianewyork.com/private-events")
        );
        assert_eq!(found[1].website.as_deref(), Some("https://misinewyork.com"));
    }

    #[test]
    fn review_results_only_carry_reference_urls() {
        let found = fixture(ExaQueryKind::ReviewSite, "reviews.json");
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Laser Wolf Brooklyn", "Maison Premiere"]);
        assert!(found.iter().all(|c| c.website.is_none()));
        assert_eq!(
            found[1].reference_url.as_deref(),
            Some("https://www.yelp.com/biz/maison-premiere-brooklyn")
        );
    }

    #[test]
    fn title_cleaning() {
        assert_eq!(clean_title("Lilia | Williamsburg").as_deref(), Some("Lilia"));
        assert_eq!(clean_title("  Review: Via Carota - Eater  ").as_deref(), Some("Via Carota"));
        assert_eq!(clean_title("Dante — West Village").as_deref(), Some("Dante"));
        assert_eq!(clean_title("The Modern").as_deref(), Some("The Modern"));
        assert_eq!(clean_title("The 25 Best Private Dining Rooms"), None);
        assert_eq!(clean_title("12 Restaurants With Private Rooms"), None);
        assert_eq!(clean_title("Best Brunch in SoHo"), None);
        assert_eq!(clean_title("   "), None);
    }

    #[test]
    fn request_shapes_split_review_domains() {
        let direct = serde_json::to_value(ExaSearchRequest::new(
            ExaQueryKind::DirectSite,
            "q".into(),
            10,
        ))
        .expect("serializes");
        assert!(direct.get("includeDomains").is_none());
        assert_eq!(direct["excludeDomains"][0], "yelp.com");
        assert_eq!(direct["numResults"], 10);

        let reviews = serde_json::to_value(ExaSearchRequest::new(
            ExaQueryKind::ReviewSite,
            "q".into(),
            10,
        ))
        .expect("serializes");
        assert!(reviews.get("excludeDomains").is_none());
        assert_eq!(reviews["includeDomains"].as_array().map(Vec::len), Some(5));
    }
}
