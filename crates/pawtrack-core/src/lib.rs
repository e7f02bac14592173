//! Core domain model, geodistance and filtering for PawTrack.

pub mod criteria;
pub mod geo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use criteria::{
    matches, rank_candidates, CriteriaUpdate, SearchCriteria, DEFAULT_RADIUS_KM, MAX_RADIUS_KM,
    MIN_RADIUS_KM, RECENT_WINDOW_DAYS,
};
pub use geo::{distance_km, haversine_km, BoundingBox, EARTH_RADIUS_KM};

pub const CRATE_NAME: &str = "pawtrack-core";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    #[error("invalid criteria field `{field}`: {reason}")]
    InvalidCriteria { field: &'static str, reason: String },
    #[error("fetching candidates failed: {message}")]
    FetchFailed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Dog,
    Cat,
    Bird,
    Rabbit,
    Other,
}

impl Species {
    pub const ALL: [Species; 5] = [
        Species::Dog,
        Species::Cat,
        Species::Bird,
        Species::Rabbit,
        Species::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Species::Dog => "dog",
            Species::Cat => "cat",
            Species::Bird => "bird",
            Species::Rabbit => "rabbit",
            Species::Other => "other",
        }
    }
}

impl std::str::FromStr for Species {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Species::ALL
            .into_iter()
            .find(|species| species.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown species `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetSize {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl PetSize {
    pub const ALL: [PetSize; 4] = [
        PetSize::Small,
        PetSize::Medium,
        PetSize::Large,
        PetSize::ExtraLarge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PetSize::Small => "small",
            PetSize::Medium => "medium",
            PetSize::Large => "large",
            PetSize::ExtraLarge => "extra_large",
        }
    }
}

impl std::str::FromStr for PetSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        PetSize::ALL
            .into_iter()
            .find(|size| size.as_str() == normalized)
            .ok_or_else(|| format!("unknown size `{s}`"))
    }
}

/// Geographic point in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SearchError> {
        let coordinate = Self {
            latitude,
            longitude,
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Re-checks a coordinate that was built without `new`, e.g. by deserialization.
    pub fn validate(&self) -> Result<(), SearchError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(SearchError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSeenLocation {
    pub coordinate: Coordinate,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
}

impl LastSeenLocation {
    pub fn at(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            address: String::new(),
            city: String::new(),
            state: String::new(),
        }
    }
}

/// Lost-pet report as stored by the document backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetReport {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub species: Species,
    #[serde(default)]
    pub breed: Option<String>,
    pub size: PetSize,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: String,
    pub last_seen_location: LastSeenLocation,
    pub last_seen_date: DateTime<Utc>,
    #[serde(default)]
    pub reward_amount: Option<f64>,
    pub is_active: bool,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PetReport {
    pub fn coordinate(&self) -> Coordinate {
        self.last_seen_location.coordinate
    }

    pub fn has_reward(&self) -> bool {
        self.reward_amount.is_some_and(|amount| amount > 0.0)
    }
}

/// Create payload for a report; the backend assigns id, timestamps and the active flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPetReport {
    pub name: String,
    pub species: Species,
    #[serde(default)]
    pub breed: Option<String>,
    pub size: PetSize,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: String,
    pub last_seen_location: LastSeenLocation,
    pub last_seen_date: DateTime<Utc>,
    #[serde(default)]
    pub reward_amount: Option<f64>,
    pub owner_id: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
}

impl NewPetReport {
    pub fn validate(&self) -> Result<(), SearchError> {
        self.last_seen_location.coordinate.validate()?;
        if let Some(amount) = self.reward_amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(SearchError::InvalidCriteria {
                    field: "reward_amount",
                    reason: format!("must be a non-negative amount, got {amount}"),
                });
            }
        }
        Ok(())
    }

    pub fn into_report(self, id: impl Into<String>, created_at: DateTime<Utc>) -> PetReport {
        PetReport {
            id: id.into(),
            name: self.name,
            species: self.species,
            breed: self.breed,
            size: self.size,
            color: self.color,
            description: self.description,
            last_seen_location: self.last_seen_location,
            last_seen_date: self.last_seen_date,
            reward_amount: self.reward_amount,
            is_active: true,
            owner_id: self.owner_id,
            image_urls: self.image_urls,
            contact_phone: self.contact_phone,
            created_at,
        }
    }
}

/// A report that someone saw a lost pet somewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingRecord {
    pub id: Uuid,
    pub pet_id: String,
    pub reporter_id: String,
    pub location: LastSeenLocation,
    pub seen_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl SightingRecord {
    pub fn new(
        pet_id: impl Into<String>,
        reporter_id: impl Into<String>,
        location: LastSeenLocation,
        seen_at: DateTime<Utc>,
    ) -> Result<Self, SearchError> {
        location.coordinate.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            pet_id: pet_id.into(),
            reporter_id: reporter_id.into(),
            location,
            seen_at,
            notes: None,
            image_url: None,
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Latest device fix from the location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserPosition {
    pub coordinate: Coordinate,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl UserPosition {
    pub fn new(coordinate: Coordinate, recorded_at: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedReport {
    pub report: PetReport,
    /// Absent when no user position was known at compute time.
    pub distance_km: Option<f64>,
}

/// One published search outcome. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredResult {
    pub entries: Vec<RankedReport>,
    pub computed_at: DateTime<Utc>,
    pub position: Option<Coordinate>,
    pub criteria: SearchCriteria,
}

impl FilteredResult {
    pub fn empty(computed_at: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            computed_at,
            position: None,
            criteria: SearchCriteria::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.report.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_rejects_out_of_range_and_nan() {
        assert!(Coordinate::new(37.77, -122.42).is_ok());
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert_eq!(
            Coordinate::new(91.0, 0.0),
            Err(SearchError::InvalidCoordinate {
                latitude: 91.0,
                longitude: 0.0
            })
        );
        assert!(Coordinate::new(0.0, -180.5).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn enums_parse_from_cli_style_text() {
        assert_eq!("Dog".parse::<Species>().unwrap(), Species::Dog);
        assert_eq!(" rabbit ".parse::<Species>().unwrap(), Species::Rabbit);
        assert!("ferret".parse::<Species>().is_err());
        assert_eq!("extra-large".parse::<PetSize>().unwrap(), PetSize::ExtraLarge);
        assert_eq!("Extra Large".parse::<PetSize>().unwrap(), PetSize::ExtraLarge);
        assert_eq!("small".parse::<PetSize>().unwrap(), PetSize::Small);
    }

    #[test]
    fn report_json_uses_snake_case_enums_and_optional_reward() {
        let json = r#"{
            "id": "p1",
            "species": "dog",
            "size": "extra_large",
            "last_seen_location": {"coordinate": {"latitude": 1.0, "longitude": 2.0}},
            "last_seen_date": "2026-10-01T12:00:00Z",
            "is_active": true,
            "created_at": "2026-10-01T12:00:00Z"
        }"#;
        let report: PetReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.size, PetSize::ExtraLarge);
        assert_eq!(report.reward_amount, None);
        assert!(!report.has_reward());
        assert!(report.image_urls.is_empty());
    }

    #[test]
    fn zero_reward_is_not_a_reward() {
        let json = r#"{
            "id": "p2",
            "species": "cat",
            "size": "small",
            "last_seen_location": {"coordinate": {"latitude": 1.0, "longitude": 2.0}},
            "last_seen_date": "2026-10-01T12:00:00Z",
            "reward_amount": 0.0,
            "is_active": true,
            "created_at": "2026-10-01T12:00:00Z"
        }"#;
        let report: PetReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.reward_amount, Some(0.0));
        assert!(!report.has_reward());
    }

    #[test]
    fn sighting_requires_valid_location() {
        let seen_at = Utc::now();
        let bad = LastSeenLocation::at(Coordinate {
            latitude: 120.0,
            longitude: 0.0,
        });
        assert!(SightingRecord::new("p1", "u1", bad, seen_at).is_err());

        let good = LastSeenLocation::at(Coordinate::new(10.0, 10.0).unwrap());
        let sighting = SightingRecord::new("p1", "u1", good, seen_at)
            .unwrap()
            .with_notes("near the park");
        assert_eq!(sighting.notes.as_deref(), Some("near the park"));
        assert_eq!(sighting.pet_id, "p1");
    }

    #[test]
    fn new_report_rejects_negative_reward() {
        let mut draft = NewPetReport {
            name: "Rex".into(),
            species: Species::Dog,
            breed: None,
            size: PetSize::Medium,
            color: None,
            description: String::new(),
            last_seen_location: LastSeenLocation::at(Coordinate::new(0.0, 0.0).unwrap()),
            last_seen_date: Utc::now(),
            reward_amount: Some(-5.0),
            owner_id: "u1".into(),
            image_urls: vec![],
            contact_phone: None,
        };
        assert!(matches!(
            draft.validate(),
            Err(SearchError::InvalidCriteria { field: "reward_amount", .. })
        ));
        draft.reward_amount = Some(25.0);
        let report = draft.into_report("new-1", Utc::now());
        assert!(report.is_active);
        assert!(report.has_reward());
    }
}
