use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scout_core::MergedEntity;
use tokio::fs;

use crate::session::{DiscoveryOutcome, SessionPhase};

fn phase_label(phase: &SessionPhase) -> String {
    match phase {
        SessionPhase::Failed { message } => format!("failed ({message})"),
        SessionPhase::Searching { region, .. } => format!("searching {region}"),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// One table cell: pipes escaped, line breaks flattened so rows stay intact.
fn cell(value: Option<&str>) -> String {
    value
        .unwrap_or("-")
        .replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .replace('|', "\\|")
}

fn venue_row(entity: &MergedEntity) -> String {
    let providers: Vec<_> = entity.providers.iter().map(|p| p.display_name()).collect();
    let private_dining = match &entity.private_dining {
        Some(pd) if pd.available => match (pd.capacity_min, pd.capacity_max) {
            (Some(min), Some(max)) => format!("yes ({min}-{max})"),
            (None, Some(max)) => format!("yes (up to {max})"),
            _ => "yes".to_string(),
        },
        Some(_) => "no".to_string(),
        None => "-".to_string(),
    };
    let price = entity
        .price_per_person
        .map(|p| format!("${p}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "| {} | {} | {} | {} | {} | {} | {} |",
        cell(Some(&entity.name)),
        cell(entity.neighborhood.as_deref()),
        providers.join(", "),
        private_dining,
        price,
        cell(entity.email.as_deref()),
        cell(entity.reservation_url.as_deref().or(entity.website.as_deref())),
    )
}

/// Markdown brief for one finished session.
pub fn render_brief(outcome: &DiscoveryOutcome) -> String {
    let summary = &outcome.summary;
    let providers: Vec<_> = outcome.providers.iter().map(|p| p.display_name()).collect();
    let by_provider = if summary.by_provider.is_empty() {
        "- none".to_string()
    } else {
        summary
            .by_provider
            .iter()
            .map(|(provider, count)| format!("- {}: {}", provider.display_name(), count))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut venues = vec![
        "| Venue | Neighborhood | Sources | Private dining | Per person | Email | Link |".to_string(),
        "|---|---|---|---|---|---|---|".to_string(),
    ];
    venues.extend(outcome.entities.iter().map(venue_row));

    format!(
        "# Venue Scout Brief: {}\n\n- Session ID: `{}`\n- State: {}\n- Started: {}\n- Finished: {}\n- Providers: {}\n- Regions searched: {}\n- Venues: {}\n- Verified private dining: {}\n- With contact email: {}\n\n## By Provider\n{}\n\n## Venues\n{}\n",
        outcome.city,
        outcome.session_id,
        phase_label(&outcome.phase),
        outcome.started_at,
        outcome.finished_at,
        if providers.is_empty() { "none".to_string() } else { providers.join(", ") },
        summary.regions_searched,
        summary.total,
        summary.with_private_dining,
        summary.with_email,
        by_provider,
        venues.join("\n"),
    )
}

/// Writes `reports/<session_id>/brief.md` and `entities.json` under `dir`.
pub async fn write_session_report(dir: &Path, outcome: &DiscoveryOutcome) -> Result<PathBuf> {
    let report_dir = dir.join("reports").join(outcome.session_id.to_string());
    fs::create_dir_all(&report_dir)
        .await
        .with_context(|| format!("creating {}", report_dir.display()))?;

    fs::write(report_dir.join("brief.md"), render_brief(outcome))
        .await
        .context("writing brief.md")?;

    let entities_json = serde_json::to_vec_pretty(&serde_json::json!({
        "session_id": outcome.session_id,
        "city": outcome.city,
        "phase": outcome.phase,
        "started_at": outcome.started_at,
        "finished_at": outcome.finished_at,
        "summary": outcome.summary,
        "entities": outcome.entities,
    }))
    .context("serializing session entities")?;
    fs::write(report_dir.join("entities.json"), entities_json)
        .await
        .context("writing entities.json")?;

    Ok(report_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scout_core::{Candidate, PrivateDining, ProviderId, SessionSummary};
    use uuid::Uuid;

    fn outcome() -> DiscoveryOutcome {
        let mut lilia = Candidate::new(ProviderId::OpenTable, "Lilia");
        lilia.neighborhood = Some("Williamsburg".into());
        lilia.email = Some("events@lilianewyork.com".into());
        lilia.private_dining = Some(PrivateDining {
            available: true,
            capacity_min: Some(10),
            capacity_max: Some(40),
            minimum_spend: None,
        });
        let mut pipes = Candidate::new(ProviderId::Exa, "Bar | Grill");
        pipes.website = Some("https://barandgrill.example".into());
        let entities = vec![
            MergedEntity::from_candidate("lilia", &lilia),
            MergedEntity::from_candidate("bargrill", &pipes),
        ];
        let now = Utc::now();
        DiscoveryOutcome {
            session_id: Uuid::new_v4(),
            city: "New York".into(),
            providers: vec![ProviderId::OpenTable, ProviderId::Exa],
            phase: SessionPhase::Done,
            summary: SessionSummary::from_entities(&entities, 2),
            entities,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn brief_lists_counts_and_escapes_cells() {
        let brief = render_brief(&outcome());
        assert!(brief.starts_with("# Venue Scout Brief: New York"));
        assert!(brief.contains("- State: done"));
        assert!(brief.contains("- Providers: OpenTable, Exa"));
        assert!(brief.contains("- Verified private dining: 1"));
        assert!(brief.contains("- With contact email: 1"));
        assert!(brief.contains("| Lilia | Williamsburg | OpenTable | yes (10-40) |"));
        assert!(brief.contains("| Bar \\| Grill |"));
    }

    #[test]
    fn multi_line_values_stay_on_one_row() {
        let mut outcome = outcome();
        outcome.entities[0].neighborhood = Some("Williamsburg\nBrooklyn".into());
        outcome.entities[1].name = "Bar\r\nGrill | Patio".into();
        let brief = render_brief(&outcome);
        assert!(brief.contains("| Lilia | Williamsburg Brooklyn | OpenTable |"));
        assert!(brief.contains("| Bar Grill \\| Patio |"));
        let rows = brief.lines().filter(|line| line.starts_with("| ")).count();
        assert_eq!(rows, 3);
    }

    #[test]
    fn failed_phase_is_spelled_out() {
        let mut failed = outcome();
        failed.phase = SessionPhase::Failed {
            message: "no providers requested".into(),
        };
        assert!(render_brief(&failed).contains("- State: failed (no providers requested)"));
    }

    #[tokio::test]
    async fn writes_brief_and_entities_under_session_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = outcome();
        let report_dir = write_session_report(dir.path(), &outcome).await.expect("report");
        assert_eq!(
            report_dir,
            dir.path().join("reports").join(outcome.session_id.to_string())
        );

        let brief = std::fs::read_to_string(report_dir.join("brief.md")).expect("brief");
        assert!(brief.contains("Lilia"));

        let raw = std::fs::read(report_dir.join("entities.json")).expect("entities");
        let json: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(json["city"], "New York");
        assert_eq!(json["phase"]["state"], "done");
        assert_eq!(json["entities"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["summary"]["total"], 2);
    }
}
