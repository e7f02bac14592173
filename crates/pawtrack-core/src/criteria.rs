//! Search criteria, the predicate filter and distance ranking.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::distance_km;
use crate::{FilteredResult, PetReport, PetSize, RankedReport, SearchError, Species, UserPosition};

pub const DEFAULT_RADIUS_KM: f64 = 10.0;
pub const MIN_RADIUS_KM: f64 = 1.0;
pub const MAX_RADIUS_KM: f64 = 50.0;
pub const RECENT_WINDOW_DAYS: i64 = 7;

/// Filter state behind the search controls. Session scoped, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub radius_km: f64,
    pub species: Option<Species>,
    /// Empty means any size.
    pub sizes: BTreeSet<PetSize>,
    pub recent_only: bool,
    pub reward_only: bool,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_RADIUS_KM,
            species: None,
            sizes: BTreeSet::new(),
            recent_only: false,
            reward_only: false,
        }
    }
}

impl SearchCriteria {
    pub fn with_radius(radius_km: f64) -> Result<Self, SearchError> {
        let criteria = Self {
            radius_km,
            ..Self::default()
        };
        criteria.validate()?;
        Ok(criteria)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        validate_radius(self.radius_km)
    }

    /// Merges `update` atomically. On error nothing is changed.
    pub fn apply(&mut self, update: CriteriaUpdate) -> Result<(), SearchError> {
        if let Some(radius) = update.radius_km {
            validate_radius(radius)?;
        }
        if let Some(radius) = update.radius_km {
            self.radius_km = radius;
        }
        if let Some(species) = update.species {
            self.species = species;
        }
        if let Some(sizes) = update.sizes {
            self.sizes = sizes;
        }
        if let Some(recent_only) = update.recent_only {
            self.recent_only = recent_only;
        }
        if let Some(reward_only) = update.reward_only {
            self.reward_only = reward_only;
        }
        Ok(())
    }

    /// True when no predicate beyond the default radius is active.
    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }

    pub fn active_filter_count(&self) -> usize {
        [
            self.species.is_some(),
            !self.sizes.is_empty(),
            self.recent_only,
            self.reward_only,
        ]
        .into_iter()
        .filter(|active| *active)
        .count()
    }
}

fn validate_radius(radius_km: f64) -> Result<(), SearchError> {
    if radius_km.is_finite() && (MIN_RADIUS_KM..=MAX_RADIUS_KM).contains(&radius_km) {
        Ok(())
    } else {
        Err(SearchError::InvalidCriteria {
            field: "radius_km",
            reason: format!("must be between {MIN_RADIUS_KM} and {MAX_RADIUS_KM} km, got {radius_km}"),
        })
    }
}

/// Partial change to [`SearchCriteria`]. `None` leaves a field as is.
///
/// `species` is doubly optional so a caller can clear the restriction with
/// `Some(None)`; in JSON that is an explicit `"species": null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub species: Option<Option<Species>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<BTreeSet<PetSize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_only: Option<bool>,
}

impl CriteriaUpdate {
    pub fn radius(radius_km: f64) -> Self {
        Self {
            radius_km: Some(radius_km),
            ..Self::default()
        }
    }

    pub fn species(species: Option<Species>) -> Self {
        Self {
            species: Some(species),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<Species>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Species>::deserialize(deserializer).map(Some)
}

/// Distance-independent inclusion test. All predicates must hold.
pub fn matches(report: &PetReport, criteria: &SearchCriteria, now: DateTime<Utc>) -> bool {
    if !report.is_active {
        return false;
    }
    if let Some(species) = criteria.species {
        if report.species != species {
            return false;
        }
    }
    if !criteria.sizes.is_empty() && !criteria.sizes.contains(&report.size) {
        return false;
    }
    if criteria.recent_only && now - report.last_seen_date > Duration::days(RECENT_WINDOW_DAYS) {
        return false;
    }
    if criteria.reward_only && !report.has_reward() {
        return false;
    }
    true
}

/// Filters and orders `candidates` for one presentation cycle.
///
/// Candidates with an unusable coordinate are always dropped. Without a
/// position the predicate filter alone runs, input order is kept and
/// `distance_km` is `None`. With a position, candidates outside the radius
/// (inclusive) are dropped and the rest is sorted by distance, then id.
pub fn rank_candidates(
    candidates: &[PetReport],
    criteria: &SearchCriteria,
    position: Option<&UserPosition>,
    now: DateTime<Utc>,
) -> FilteredResult {
    let usable = candidates.iter().filter(|report| match report.coordinate().validate() {
        Ok(()) => true,
        Err(err) => {
            debug!(id = %report.id, %err, "dropping candidate with unusable coordinate");
            false
        }
    });

    let entries = match position {
        None => usable
            .filter(|report| matches(report, criteria, now))
            .map(|report| RankedReport {
                report: report.clone(),
                distance_km: None,
            })
            .collect(),
        Some(position) => {
            let mut ranked = usable
                .filter_map(|report| {
                    let distance = distance_km(position.coordinate, report.coordinate());
                    (distance <= criteria.radius_km && matches(report, criteria, now))
                        .then_some((report, distance))
                })
                .collect::<Vec<_>>();
            ranked.sort_by(|(a, da), (b, db)| {
                da.partial_cmp(db)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            ranked
                .into_iter()
                .map(|(report, distance)| RankedReport {
                    report: report.clone(),
                    distance_km: Some(distance),
                })
                .collect()
        }
    };

    FilteredResult {
        entries,
        computed_at: now,
        position: position.map(|p| p.coordinate),
        criteria: criteria.clone(),
    }
}
