//! Post-pass enrichment for merged entities: contact email lookup and a
//! geocode fallback for records that arrived without coordinates.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use scout_adapters::AdapterError;
use scout_http::FetchError;
use thiserror::Error;
use tracing::debug;

pub mod email;
pub mod geocode;

pub use email::{
    domain_from_website, score_local_part, select_best_email, DomainEmail, DomainSearch, EmailFinder,
    EmailKind, EmailResult, HunterClient, EMAIL_PREFERENCES, MIN_EMAIL_CONFIDENCE,
};
pub use geocode::{GeoMatch, Geocoder, PlacesGeocoder};

pub const CRATE_NAME: &str = "scout-enrich";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Lookup(#[from] AdapterError),
    #[error("not a usable domain: {0}")]
    InvalidDomain(String),
}

/// Fixed-size concurrent groups with a pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSettings {
    pub size: usize,
    pub pause: Duration,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            size: 5,
            pause: Duration::from_millis(200),
        }
    }
}

/// Runs `task` over `items` group by group; output order matches input order.
pub async fn run_in_groups<I, T, F, Fut>(items: Vec<I>, settings: GroupSettings, task: F) -> Vec<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = T>,
{
    let size = settings.size.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut pending = items.into_iter().peekable();
    let mut groups = 0usize;

    while pending.peek().is_some() {
        if groups > 0 && !settings.pause.is_zero() {
            tokio::time::sleep(settings.pause).await;
        }
        let group: Vec<_> = pending.by_ref().take(size).map(&task).collect();
        results.extend(join_all(group).await);
        groups += 1;
    }

    debug!(total, groups, group_size = size, "grouped enrichment finished");
    results
}
