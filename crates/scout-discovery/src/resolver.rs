//! Name-based identity resolution and field-level merge precedence.

use std::collections::HashMap;

use scout_core::{Candidate, EmailSource, MergedEntity, PrivateDining};
use scout_enrich::{EmailResult, GeoMatch};

/// Dedup key: lowercase alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(incoming);
    }
}

fn merge_private_dining(
    existing: &Option<PrivateDining>,
    incoming: &Option<PrivateDining>,
) -> Option<PrivateDining> {
    match (existing, incoming) {
        (None, incoming) => incoming.clone(),
        (Some(current), None) => Some(current.clone()),
        (Some(current), Some(next)) if !current.available && next.available => Some(next.clone()),
        (Some(current), Some(next)) if current.available && next.available => {
            let mut merged = current.clone();
            fill(&mut merged.capacity_min, &next.capacity_min);
            fill(&mut merged.capacity_max, &next.capacity_max);
            fill(&mut merged.minimum_spend, &next.minimum_spend);
            Some(merged)
        }
        (Some(current), Some(_)) => Some(current.clone()),
    }
}

/// Stores `email` unless the stored one carries a confidence that `confidence`
/// does not strictly beat. An unscored stored email yields to any newer one.
fn offer_email(
    entity: &mut MergedEntity,
    email: &str,
    confidence: Option<u8>,
    source: EmailSource,
) -> bool {
    let email = email.trim();
    if email.is_empty() {
        return false;
    }
    let stored_scored = entity.email.is_some() && entity.email_confidence.is_some();
    if stored_scored && confidence <= entity.email_confidence {
        return false;
    }
    entity.email = Some(email.to_string());
    entity.email_confidence = confidence;
    entity.email_source = Some(source);
    true
}

/// Pure merge of a repeat sighting into an existing entity.
pub fn merge(existing: &MergedEntity, candidate: &Candidate) -> MergedEntity {
    let mut merged = existing.clone();
    merged.providers.insert(candidate.provider);

    fill(&mut merged.provider_ref, &candidate.provider_ref);
    fill(&mut merged.resy_id, &candidate.resy_id);
    fill(&mut merged.opentable_id, &candidate.opentable_id);
    fill(&mut merged.beli_rank, &candidate.beli_rank);
    fill(&mut merged.reservation_url, &candidate.reservation_url);

    fill(&mut merged.website, &candidate.website);
    fill(&mut merged.reference_url, &candidate.reference_url);
    fill(&mut merged.phone, &candidate.phone);
    fill(&mut merged.address, &candidate.address);
    fill(&mut merged.neighborhood, &candidate.neighborhood);
    fill(&mut merged.region, &candidate.region);
    fill(&mut merged.location, &candidate.location);
    fill(&mut merged.price_tier, &candidate.price_tier);
    fill(&mut merged.price_per_person, &candidate.price_per_person);
    fill(&mut merged.rating, &candidate.rating);
    fill(&mut merged.cuisine, &candidate.cuisine);

    merged.private_dining = merge_private_dining(&existing.private_dining, &candidate.private_dining);

    if let Some(email) = &candidate.email {
        offer_email(
            &mut merged,
            email,
            candidate.email_confidence,
            EmailSource::Provider(candidate.provider),
        );
    }
    merged
}

/// Applies an email-finder hit under the same precedence as provider emails.
pub fn apply_found_email(entity: &mut MergedEntity, found: &EmailResult) -> bool {
    offer_email(entity, &found.email, Some(found.confidence), EmailSource::Finder)
}

/// Backfills geocode facts; never overwrites.
pub fn apply_geocode(entity: &mut MergedEntity, found: &GeoMatch) {
    fill(&mut entity.location, &Some(found.location));
    fill(&mut entity.address, &found.address);
    fill(&mut entity.phone, &found.phone);
    fill(&mut entity.rating, &found.rating);
    fill(&mut entity.website, &found.website);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    New(String),
    Merged { key: String, changed: bool },
    /// Name normalizes to nothing.
    Skipped,
}

/// Session-wide seen set spanning every region and provider.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    entities: HashMap<String, MergedEntity>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, candidate: &Candidate) -> Observation {
        let key = normalize_name(&candidate.name);
        if key.is_empty() {
            return Observation::Skipped;
        }
        match self.entities.get_mut(&key) {
            Some(existing) => {
                let merged = merge(existing, candidate);
                let changed = merged != *existing;
                *existing = merged;
                Observation::Merged { key, changed }
            }
            None => {
                let entity = MergedEntity::from_candidate(key.clone(), candidate);
                self.entities.insert(key.clone(), entity);
                Observation::New(key)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&MergedEntity> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut MergedEntity> {
        self.entities.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
