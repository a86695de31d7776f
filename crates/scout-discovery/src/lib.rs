//! Discovery sessions: fan out to every provider per region, fold results
//! through the identity resolver, enrich the head of the list and report.

use anyhow::Result;
use scout_core::DiscoveryRequest;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod interleave;
pub mod report;
pub mod resolver;
pub mod session;

pub use config::{load_geo_index, ScoutConfig, GEO_INDEX_PATH};
pub use interleave::interleave;
pub use report::{render_brief, write_session_report};
pub use resolver::{merge, normalize_name, IdentityResolver, Observation};
pub use session::{DiscoveryError, DiscoveryOutcome, DiscoverySession, SessionPhase, SessionSettings};

pub const CRATE_NAME: &str = "scout-discovery";

/// Runs one session with configuration read from the environment.
pub async fn run_discovery_from_env(request: DiscoveryRequest, cancel: CancellationToken) -> Result<DiscoveryOutcome> {
    let config = ScoutConfig::from_env();
    let session = config.build_session(request)?.with_cancellation(cancel);
    Ok(session.run().await)
}
