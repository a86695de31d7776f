//! Beli has no public API. Rankings come from a browser agent service that
//! accepts a search task and is polled until the task settles.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scout_core::{Candidate, PriceTier, ProgressSink, ProviderId, Region, SearchFilters};
use scout_http::{ApiKey, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{base_url, text_or_none, AdapterContext, AdapterError, SourceAdapter};

/// Margin kept under the adapter timeout so partial venues are returned
/// before the outer timeout discards them.
const DEADLINE_MARGIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BeliSettings {
    /// Agent service base URL. The adapter is unconfigured without it.
    pub agent_url: Option<String>,
    pub api_key: Option<ApiKey>,
    pub poll_interval: Duration,
    pub max_results: u32,
}

impl Default for BeliSettings {
    fn default() -> Self {
        Self {
            agent_url: None,
            api_key: None,
            poll_interval: Duration::from_secs(2),
            max_results: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskType {
    BeliSearch,
}

#[derive(Debug, Serialize)]
struct BeliSearchInput<'a> {
    city: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    neighborhood: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cuisine: Option<&'a str>,
    limit: u32,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    #[serde(rename = "type")]
    task_type: AgentTaskType,
    input: BeliSearchInput<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct TaskSnapshot {
    id: String,
    status: TaskStatus,
    #[serde(default)]
    result: Option<TaskResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskResult {
    #[serde(default)]
    venues: Vec<BeliVenue>,
}

#[derive(Debug, Deserialize)]
struct BeliVenue {
    name: Option<String>,
    rank: Option<u32>,
    neighborhood: Option<String>,
    cuisine: Option<String>,
    price: Option<String>,
    website: Option<String>,
}

#[derive(Debug)]
enum PollOutcome {
    Pending(Vec<Candidate>),
    Done(Vec<Candidate>),
}

fn normalize_venues(venues: Vec<BeliVenue>) -> Vec<Candidate> {
    venues
        .into_iter()
        .filter_map(|venue| {
            let name = text_or_none(venue.name)?;
            let mut candidate = Candidate::new(ProviderId::Beli, name);
            candidate.beli_rank = venue.rank;
            candidate.provider_ref = venue.rank.map(|rank| format!("rank:{rank}"));
            candidate.neighborhood = text_or_none(venue.neighborhood);
            candidate.cuisine = text_or_none(venue.cuisine);
            candidate.website = text_or_none(venue.website);
            let tier = venue.price.as_deref().and_then(PriceTier::from_dollar_signs);
            Some(candidate.with_price_tier(tier))
        })
        .collect()
}

/// Settled tasks end polling; running tasks may already carry partial venues.
fn interpret(snapshot: TaskSnapshot) -> Result<PollOutcome, AdapterError> {
    let venues = snapshot.result.map(|r| r.venues).unwrap_or_default();
    match snapshot.status {
        TaskStatus::Completed => Ok(PollOutcome::Done(normalize_venues(venues))),
        TaskStatus::Failed => Err(AdapterError::TaskFailed {
            task_id: snapshot.id,
            reason: snapshot.error.unwrap_or_else(|| "unknown error".to_string()),
        }),
        TaskStatus::Queued | TaskStatus::Running | TaskStatus::Unknown => {
            Ok(PollOutcome::Pending(normalize_venues(venues)))
        }
    }
}

/// Stops with whatever venues the task has shown so far, or `cause`
/// (a timeout when absent) when it has shown none.
fn keep_partial(
    task_id: &str,
    partial: Vec<Candidate>,
    progress: &ProgressSink,
    cause: Option<AdapterError>,
) -> Result<Vec<Candidate>, AdapterError> {
    if partial.is_empty() {
        return Err(cause.unwrap_or_else(|| AdapterError::TaskTimeout {
            task_id: task_id.to_string(),
        }));
    }
    let reason = cause.map_or_else(|| "still running at deadline".to_string(), |err| err.to_string());
    progress.info(format!(
        "Beli agent task {task_id} stopped early ({reason}), keeping {} partial results",
        partial.len()
    ));
    Ok(partial)
}

/// Polls every `interval` until the task settles. Each poll is bounded by the
/// time left before `deadline`.
async fn wait_for_task<F, Fut>(
    task_id: &str,
    mut partial: Vec<Candidate>,
    deadline: Instant,
    interval: Duration,
    progress: &ProgressSink,
    mut poll: F,
) -> Result<Vec<Candidate>, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TaskSnapshot, AdapterError>>,
{
    loop {
        tokio::time::sleep_until((Instant::now() + interval).min(deadline)).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return keep_partial(task_id, partial, progress, None);
        }

        let snapshot = match tokio::time::timeout(remaining, poll()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => return keep_partial(task_id, partial, progress, Some(err)),
            Err(_) => return keep_partial(task_id, partial, progress, None),
        };
        debug!(%task_id, status = ?snapshot.status, "beli agent task polled");
        match interpret(snapshot) {
            Ok(PollOutcome::Done(found)) => return Ok(found),
            Ok(PollOutcome::Pending(found)) if !found.is_empty() => partial = found,
            Ok(PollOutcome::Pending(_)) => {}
            Err(err) => return keep_partial(task_id, partial, progress, Some(err)),
        }
    }
}

pub struct BeliAgentAdapter {
    http: Arc<HttpFetcher>,
    settings: BeliSettings,
}

impl BeliAgentAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: BeliSettings) -> Self {
        Self { http, settings }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => request.bearer_auth(key.expose()),
            None => request,
        }
    }

    async fn poll(&self, base: &str, task_id: &str) -> Result<TaskSnapshot, AdapterError> {
        let url = format!("{base}/tasks/{task_id}");
        let snapshot = self
            .http
            .send_json(ProviderId::Beli.as_str(), |client| self.authorize(client.get(&url)))
            .await?;
        Ok(snapshot)
    }
}

#[async_trait]
impl SourceAdapter for BeliAgentAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Beli
    }

    fn is_configured(&self) -> bool {
        self.settings.agent_url.is_some()
    }

    async fn fetch(
        &self,
        region: &Region,
        filters: &SearchFilters,
        ctx: &AdapterContext,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let deadline = Instant::now() + ctx.timeout.saturating_sub(DEADLINE_MARGIN);
        let base = self
            .settings
            .agent_url
            .as_deref()
            .map(base_url)
            .ok_or(AdapterError::MissingCredentials(ProviderId::Beli))?;

        let task = CreateTaskRequest {
            task_type: AgentTaskType::BeliSearch,
            input: BeliSearchInput {
                city: &filters.city,
                neighborhood: region.neighborhood_name(),
                cuisine: filters.cuisine.as_deref(),
                limit: self.settings.max_results,
            },
        };
        let create_url = format!("{base}/tasks");
        let created: TaskSnapshot = self
            .http
            .send_json(ProviderId::Beli.as_str(), |client| {
                self.authorize(client.post(&create_url).json(&task))
            })
            .await?;
        ctx.progress.info(format!(
            "Beli agent task {} queued for {}",
            created.id,
            region.label()
        ));

        let task_id = created.id.clone();
        let partial = match interpret(created)? {
            PollOutcome::Done(found) => return Ok(stamp_region(found, filters)),
            PollOutcome::Pending(found) => found,
        };
        let found = wait_for_task(
            &task_id,
            partial,
            deadline,
            self.settings.poll_interval,
            &ctx.progress,
            || self.poll(base, &task_id),
        )
        .await?;
        Ok(stamp_region(found, filters))
    }
}

fn stamp_region(mut candidates: Vec<Candidate>, filters: &SearchFilters) -> Vec<Candidate> {
    for candidate in &mut candidates {
        candidate.region = Some(filters.city.clone());
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    fn snapshot(file: &str) -> TaskSnapshot {
        serde_json::from_str(&read_fixture("beli", file)).expect("fixture json")
    }

    #[test]
    fn queued_task_is_pending_without_venues() {
        match interpret(snapshot("task_created.json")).expect("not failed") {
            PollOutcome::Pending(found) => assert!(found.is_empty()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn completed_task_yields_ranked_candidates() {
        let found = match interpret(snapshot("task_completed.json")).expect("not failed") {
            PollOutcome::Done(found) => found,
            other => panic!("unexpected outcome {other:?}"),
        };
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lilia", "Lucali"]);

        assert_eq!(found[0].beli_rank, Some(3));
        assert_eq!(found[0].price_tier.map(|t| t.value()), Some(3));
        assert_eq!(found[0].website, None);
        assert_eq!(found[1].website.as_deref(), Some("https://www.lucali.com"));
        assert_eq!(found[1].price_per_person, Some(50));
    }

    #[test]
    fn failed_task_carries_the_agent_reason() {
        let err = interpret(snapshot("task_failed.json")).unwrap_err();
        match err {
            AdapterError::TaskFailed { task_id, reason } => {
                assert_eq!(task_id, "task_7f3a");
                assert_eq!(reason, "login wall");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_status_keeps_polling() {
        let snapshot: TaskSnapshot =
            serde_json::from_str(r#"{"id":"t1","status":"paused"}"#).expect("decodes");
        assert_eq!(snapshot.status, TaskStatus::Unknown);
        assert!(matches!(interpret(snapshot), Ok(PollOutcome::Pending(_))));
    }

    #[test]
    fn create_request_matches_agent_task_shape() {
        let task = CreateTaskRequest {
            task_type: AgentTaskType::BeliSearch,
            input: BeliSearchInput {
                city: "New York",
                neighborhood: Some("Williamsburg"),
                cuisine: None,
                limit: 25,
            },
        };
        let json = serde_json::to_value(&task).expect("serializes");
        assert_eq!(json["type"], "beli_search");
        assert_eq!(json["input"]["neighborhood"], "Williamsburg");
        assert!(json["input"].get("cuisine").is_none());
    }

    enum Step {
        Snapshot(&'static str),
        Fail,
        Hang,
    }

    type PollFuture = std::pin::Pin<Box<dyn Future<Output = Result<TaskSnapshot, AdapterError>>>>;

    /// Replays `steps` as successive poll results.
    fn scripted(steps: Vec<Step>) -> impl FnMut() -> PollFuture {
        let mut steps = std::collections::VecDeque::from(steps);
        move || {
            let step = steps.pop_front();
            Box::pin(async move {
                match step {
                    Some(Step::Snapshot(json)) => {
                        Ok(serde_json::from_str(json).expect("snapshot json"))
                    }
                    Some(Step::Fail) => Err(AdapterError::Malformed("agent returned 502".into())),
                    Some(Step::Hang) | None => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(AdapterError::Malformed("unreachable".into()))
                    }
                }
            })
        }
    }

    const RUNNING_WITH_TWO: &str = r#"{"id":"t1","status":"running","result":{"venues":[{"name":"Lilia","rank":1},{"name":"Misi","rank":2}]}}"#;

    fn drain_messages(rx: &mut tokio::sync::mpsc::UnboundedReceiver<scout_core::ProgressEvent>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let scout_core::ProgressKind::Log { message, .. } = event.kind {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_venues_already_seen() {
        let (sink, mut rx) = ProgressSink::channel();
        let deadline = Instant::now() + Duration::from_secs(30);
        let found = wait_for_task(
            "t1",
            Vec::new(),
            deadline,
            Duration::from_secs(2),
            &sink,
            scripted(vec![Step::Snapshot(RUNNING_WITH_TWO), Step::Fail]),
        )
        .await
        .expect("partial venues");

        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lilia", "Misi"]);
        let messages = drain_messages(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("agent returned 502"), "{}", messages[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_without_venues_is_an_error() {
        let (sink, _rx) = ProgressSink::channel();
        let deadline = Instant::now() + Duration::from_secs(30);
        let err = wait_for_task(
            "t1",
            Vec::new(),
            deadline,
            Duration::from_secs(2),
            &sink,
            scripted(vec![Step::Snapshot(r#"{"id":"t1","status":"queued"}"#), Step::Fail]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_is_cut_at_the_deadline() {
        let (sink, _rx) = ProgressSink::channel();
        let start = Instant::now();
        let deadline = start + Duration::from_secs(10);
        let found = wait_for_task(
            "t1",
            Vec::new(),
            deadline,
            Duration::from_secs(2),
            &sink,
            scripted(vec![Step::Snapshot(RUNNING_WITH_TWO), Step::Hang]),
        )
        .await
        .expect("partial venues");
        assert_eq!(found.len(), 2);
        assert!(start.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_venues_times_out() {
        let (sink, _rx) = ProgressSink::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = wait_for_task(
            "t9",
            Vec::new(),
            deadline,
            Duration::from_secs(2),
            &sink,
            scripted(vec![
                Step::Snapshot(r#"{"id":"t9","status":"running"}"#),
                Step::Snapshot(r#"{"id":"t9","status":"running"}"#),
                Step::Snapshot(r#"{"id":"t9","status":"running"}"#),
            ]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::TaskTimeout { task_id } if task_id == "t9"));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_poll_replaces_partial_venues() {
        let (sink, _rx) = ProgressSink::channel();
        let deadline = Instant::now() + Duration::from_secs(30);
        let found = wait_for_task(
            "task_7f3a",
            Vec::new(),
            deadline,
            Duration::from_secs(2),
            &sink,
            scripted(vec![
                Step::Snapshot(RUNNING_WITH_TWO),
                Step::Snapshot(include_str!("../../../fixtures/beli/task_completed.json")),
            ]),
        )
        .await
        .expect("completed");
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lilia", "Lucali"]);
    }

    #[test]
    fn adapter_needs_an_agent_url() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("http client"));
        let unconfigured = BeliAgentAdapter::new(Arc::clone(&http), BeliSettings::default());
        assert!(!unconfigured.is_configured());

        let configured = BeliAgentAdapter::new(
            http,
            BeliSettings {
                agent_url: Some("http://localhost:8931/".into()),
                ..BeliSettings::default()
            },
        );
        assert!(configured.is_configured());
    }
}
