use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use scout_http::{ApiKey, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{run_in_groups, EnrichError, GroupSettings};

pub const DEFAULT_HUNTER_BASE_URL: &str = "https://api.hunter.io";

/// Local-part prefixes in order of preference for event inquiries.
pub const EMAIL_PREFERENCES: [&str; 12] = [
    "events",
    "event",
    "private",
    "bookings",
    "booking",
    "reservations",
    "reservation",
    "info",
    "contact",
    "hello",
    "inquiries",
    "inquiry",
];

pub const MIN_EMAIL_CONFIDENCE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailKind {
    Generic,
    Personal,
    #[serde(other)]
    Unknown,
}

/// One address the domain search knows about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DomainEmail {
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: Option<EmailKind>,
    #[serde(default)]
    pub confidence: u8,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

impl DomainEmail {
    fn is_generic(&self) -> bool {
        self.kind == Some(EmailKind::Generic)
    }

    fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailResult {
    pub email: String,
    pub confidence: u8,
    pub kind: EmailKind,
    pub score: u32,
    pub name: Option<String>,
    pub position: Option<String>,
}

/// `100 - index` of the first preference the local part equals or starts with; 0 otherwise.
pub fn score_local_part(email: &str) -> u32 {
    let local = email
        .split('@')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    EMAIL_PREFERENCES
        .iter()
        .position(|pref| local.starts_with(pref))
        .map(|index| 100 - index as u32)
        .unwrap_or(0)
}

pub fn select_best_email(emails: &[DomainEmail]) -> Option<EmailResult> {
    let mut ranked: Vec<(u32, &DomainEmail)> = emails
        .iter()
        .filter(|e| e.value.contains('@'))
        .map(|e| (score_local_part(&e.value), e))
        .collect();
    ranked.sort_by_key(|(score, e)| (Reverse(*score), !e.is_generic(), Reverse(e.confidence)));

    let (score, best) = ranked.into_iter().next()?;
    if best.confidence < MIN_EMAIL_CONFIDENCE {
        debug!(email = %best.value, confidence = best.confidence, "best email below confidence floor");
        return None;
    }
    Some(EmailResult {
        email: best.value.trim().to_string(),
        confidence: best.confidence,
        kind: best.kind.unwrap_or(EmailKind::Unknown),
        score,
        name: best.full_name(),
        position: best.position.clone(),
    })
}

/// Registrable host of a website URL, without a leading `www.`.
pub fn domain_from_website(website: &str) -> Option<String> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.contains('.').then(|| host.to_string())
}

#[async_trait]
pub trait DomainSearch: Send + Sync {
    async fn domain_emails(&self, domain: &str) -> Result<Vec<DomainEmail>, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct DomainSearchResponse {
    #[serde(default)]
    data: Option<DomainSearchData>,
}

#[derive(Debug, Deserialize)]
struct DomainSearchData {
    #[serde(default)]
    emails: Vec<DomainEmail>,
}

pub struct HunterClient {
    http: Arc<HttpFetcher>,
    api_key: ApiKey,
    base_url: String,
    limit: u32,
}

impl HunterClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: ApiKey, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key,
            base_url: base_url.into(),
            limit: 10,
        }
    }
}

#[async_trait]
impl DomainSearch for HunterClient {
    async fn domain_emails(&self, domain: &str) -> Result<Vec<DomainEmail>, EnrichError> {
        let url = format!("{}/v2/domain-search", self.base_url.trim_end_matches('/'));
        let limit = self.limit.to_string();
        let response: DomainSearchResponse = self
            .http
            .send_json("hunter", |client| {
                client.get(&url).query(&[
                    ("domain", domain),
                    ("api_key", self.api_key.expose()),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;
        Ok(response.data.map(|d| d.emails).unwrap_or_default())
    }
}

pub struct EmailFinder {
    search: Arc<dyn DomainSearch>,
}

impl EmailFinder {
    pub fn new(search: Arc<dyn DomainSearch>) -> Self {
        Self { search }
    }

    pub async fn find_email(&self, domain: &str) -> Result<Option<EmailResult>, EnrichError> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(EnrichError::InvalidDomain(domain));
        }
        let emails = self.search.domain_emails(&domain).await?;
        Ok(select_best_email(&emails))
    }

    /// Looks up each distinct domain once; failures map to `None`.
    pub async fn find_emails_batch(
        &self,
        domains: &[String],
        groups: GroupSettings,
    ) -> HashMap<String, Option<EmailResult>> {
        let unique: Vec<String> = domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let found = run_in_groups(unique, groups, |domain| async move {
            let result = match self.find_email(&domain).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(%domain, error = %err, "email lookup failed");
                    None
                }
            };
            (domain, result)
        })
        .await;
        found.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    fn hunter_fixture() -> Vec<DomainEmail> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/hunter/domain_search.json");
        let text = std::fs::read_to_string(path).expect("fixture");
        let response: DomainSearchResponse = serde_json::from_str(&text).expect("fixture json");
        response.data.expect("data").emails
    }

    fn email(value: &str, kind: EmailKind, confidence: u8) -> DomainEmail {
        DomainEmail {
            value: value.to_string(),
            kind: Some(kind),
            confidence,
            first_name: None,
            last_name: None,
            position: None,
        }
    }

    struct FakeSearch {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DomainSearch for FakeSearch {
        async fn domain_emails(&self, domain: &str) -> Result<Vec<DomainEmail>, EnrichError> {
            self.calls.lock().expect("lock").push(domain.to_string());
            match domain {
                "lilianewyork.com" => Ok(hunter_fixture()),
                "broken.example" => Err(EnrichError::InvalidDomain("upstream 500".into())),
                _ => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn preference_scores_follow_list_order() {
        assert_eq!(score_local_part("events@x.com"), 100);
        assert_eq!(score_local_part("EventsTeam@x.com"), 100);
        assert_eq!(score_local_part("event@x.com"), 99);
        assert_eq!(score_local_part("privatedining@x.com"), 98);
        assert_eq!(score_local_part("info@x.com"), 93);
        assert_eq!(score_local_part("inquiry@x.com"), 89);
        assert_eq!(score_local_part("missy@x.com"), 0);
    }

    #[test]
    fn fixture_prefers_generic_events_address() {
        let best = select_best_email(&hunter_fixture()).expect("an email");
        assert_eq!(best.email, "Events@lilianewyork.com");
        assert_eq!(best.score, 100);
        assert_eq!(best.kind, EmailKind::Generic);
        assert_eq!(best.confidence, 72);
    }

    #[test]
    fn confidence_breaks_ties_within_kind() {
        let best = select_best_email(&[
            email("events@a.com", EmailKind::Generic, 60),
            email("events.team@a.com", EmailKind::Generic, 81),
        ])
        .expect("an email");
        assert_eq!(best.email, "events.team@a.com");
    }

    #[test]
    fn low_confidence_winner_is_discarded() {
        let emails = [
            email("events@a.com", EmailKind::Generic, 40),
            email("info@a.com", EmailKind::Generic, 95),
        ];
        assert_eq!(select_best_email(&emails), None);
        assert_eq!(select_best_email(&[]), None);
    }

    #[test]
    fn personal_contact_keeps_name_and_position() {
        let mut chef = email("missy@a.com", EmailKind::Personal, 97);
        chef.first_name = Some("Missy".into());
        chef.last_name = Some("Robbins".into());
        chef.position = Some("Chef".into());
        let best = select_best_email(&[chef]).expect("an email");
        assert_eq!(best.name.as_deref(), Some("Missy Robbins"));
        assert_eq!(best.position.as_deref(), Some("Chef"));
        assert_eq!(best.score, 0);
    }

    #[test]
    fn domains_from_websites() {
        assert_eq!(
            domain_from_website("https://www.lilianewyork.com/").as_deref(),
            Some("lilianewyork.com")
        );
        assert_eq!(
            domain_from_website("misinewyork.com/private-events").as_deref(),
            Some("misinewyork.com")
        );
        assert_eq!(domain_from_website("http://localhost:8080"), None);
        assert_eq!(domain_from_website("  "), None);
    }

    #[tokio::test]
    async fn find_email_rejects_bad_domains() {
        let finder = EmailFinder::new(Arc::new(FakeSearch {
            calls: Mutex::new(Vec::new()),
        }));
        assert!(matches!(
            finder.find_email("localhost").await,
            Err(EnrichError::InvalidDomain(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_dedupes_domains_and_swallows_failures() {
        let search = Arc::new(FakeSearch {
            calls: Mutex::new(Vec::new()),
        });
        let finder = EmailFinder::new(search.clone());
        let domains = vec![
            "lilianewyork.com".to_string(),
            "LilianEwyork.com".to_string(),
            "broken.example".to_string(),
            "quiet.example".to_string(),
        ];

        let found = finder.find_emails_batch(&domains, GroupSettings::default()).await;
        assert_eq!(found.len(), 3);
        assert_eq!(
            found["lilianewyork.com"].as_ref().map(|r| r.email.as_str()),
            Some("Events@lilianewyork.com")
        );
        assert_eq!(found["broken.example"], None);
        assert_eq!(found["quiet.example"], None);
        assert_eq!(search.calls.lock().expect("lock").len(), 3);
    }
}
