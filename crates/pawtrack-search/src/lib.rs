//! Nearby-pet search engine: owns criteria and position, fetches candidates
//! through a [`ReportGateway`] and publishes ranked results.

pub mod location;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pawtrack_core::{
    distance_km, rank_candidates, Coordinate, CriteriaUpdate, FilteredResult, PetReport,
    SearchCriteria, SearchError, UserPosition,
};
use pawtrack_gateway::{BackoffPolicy, GatewayConfig, ReportGateway};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use location::{
    spawn_location_listener, spawn_periodic_refresh, AuthorizationStatus, ChannelLocationProvider,
    LocationEvent, LocationProvider,
};

pub const CRATE_NAME: &str = "pawtrack-search";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub default_radius_km: f64,
    /// Moving farther than this from the last fetch center triggers a refetch.
    pub refetch_distance_km: f64,
    /// 0 disables periodic refresh.
    pub refresh_interval_secs: u64,
    pub fallback_center: Option<Coordinate>,
    pub web_port: u16,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/v1".to_string(),
            api_token: None,
            http_timeout_secs: 15,
            user_agent: "pawtrack/0.1".to_string(),
            default_radius_km: pawtrack_core::DEFAULT_RADIUS_KM,
            refetch_distance_km: 1.0,
            refresh_interval_secs: 0,
            fallback_center: None,
            web_port: 8000,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Loads YAML (missing keys take defaults), then applies environment overrides.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overrides fields from `lookup`. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());

        if let Some(url) = lookup("PAWTRACK_API_URL") {
            self.api_base_url = url;
        }
        if let Some(token) = lookup("PAWTRACK_API_TOKEN").filter(|t| !t.is_empty()) {
            self.api_token = Some(token);
        }
        if let Some(secs) = lookup("PAWTRACK_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        if let Some(agent) = lookup("PAWTRACK_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(radius) = parsed("PAWTRACK_DEFAULT_RADIUS_KM") {
            self.default_radius_km = radius;
        }
        if let Some(distance) = parsed("PAWTRACK_REFETCH_DISTANCE_KM") {
            self.refetch_distance_km = distance;
        }
        if let Some(secs) = lookup("PAWTRACK_REFRESH_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.refresh_interval_secs = secs;
        }
        if let (Some(lat), Some(lon)) = (parsed("PAWTRACK_FALLBACK_LAT"), parsed("PAWTRACK_FALLBACK_LON")) {
            match Coordinate::new(lat, lon) {
                Ok(center) => self.fallback_center = Some(center),
                Err(err) => warn!(%err, "ignoring fallback center from environment"),
            }
        }
        if let Some(port) = lookup("PAWTRACK_WEB_PORT").and_then(|v| v.parse().ok()) {
            self.web_port = port;
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.api_base_url.clone(),
            api_token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            ..GatewayConfig::default()
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

/// Signals delivered to observers alongside the published result.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    ResultPublished { generation: u64, count: usize },
    FetchFailed { ticket: u64, message: String },
    /// A refresh finished after a newer one was issued; its data was dropped.
    Superseded { ticket: u64 },
    AuthorizationChanged(AuthorizationStatus),
}

/// Where the cached candidates came from. `center: None` means every active report.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FetchArea {
    center: Option<Coordinate>,
    radius_km: f64,
}

impl FetchArea {
    fn covers_radius(&self, radius_km: f64) -> bool {
        self.center.is_none() || radius_km <= self.radius_km
    }
}

struct Fetched {
    ticket: u64,
    candidates: Vec<PetReport>,
    area: FetchArea,
}

/// Search orchestrator. Construct one per presentation root and share it via `Arc`.
pub struct SearchEngine<G> {
    gateway: G,
    config: SearchConfig,
    criteria: watch::Sender<SearchCriteria>,
    position: watch::Sender<Option<UserPosition>>,
    candidates: watch::Sender<Arc<Vec<PetReport>>>,
    fetch_area: watch::Sender<Option<FetchArea>>,
    result: watch::Sender<Arc<FilteredResult>>,
    events: broadcast::Sender<SearchEvent>,
    tickets: AtomicU64,
    generation: AtomicU64,
}

impl<G: ReportGateway> SearchEngine<G> {
    pub fn new(gateway: G, config: SearchConfig) -> Result<Self, SearchError> {
        let criteria = SearchCriteria::with_radius(config.default_radius_km)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            gateway,
            config,
            criteria: watch::Sender::new(criteria),
            position: watch::Sender::new(None),
            candidates: watch::Sender::new(Arc::new(Vec::new())),
            fetch_area: watch::Sender::new(None),
            result: watch::Sender::new(Arc::new(FilteredResult::empty(Utc::now()))),
            events,
            tickets: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn criteria(&self) -> SearchCriteria {
        self.criteria.borrow().clone()
    }

    pub fn position(&self) -> Option<UserPosition> {
        *self.position.borrow()
    }

    /// Last published result. Cheap; readers never see a half-built result.
    pub fn latest(&self) -> Arc<FilteredResult> {
        self.result.borrow().clone()
    }

    /// Number of results published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Watch the published result. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FilteredResult>> {
        self.result.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SearchEvent> {
        self.events.subscribe()
    }

    /// Replaces the position and republishes over the cached candidates.
    pub fn set_position(
        &self,
        position: Option<UserPosition>,
    ) -> Result<Arc<FilteredResult>, SearchError> {
        self.store_position(position)?;
        Ok(self.publish())
    }

    pub(crate) fn store_position(&self, position: Option<UserPosition>) -> Result<(), SearchError> {
        if let Some(position) = &position {
            position.coordinate.validate()?;
        }
        self.position.send_replace(position);
        Ok(())
    }

    /// Merges `update`, republishes over the cached candidates and returns the
    /// resulting criteria. A rejected update changes nothing and publishes nothing.
    ///
    /// The cached candidates only cover the radius they were fetched with; use
    /// [`Self::update_criteria_and_refresh`] when a wider radius must be fetched.
    pub fn update_criteria(&self, update: CriteriaUpdate) -> Result<SearchCriteria, SearchError> {
        let mut next = self.criteria();
        next.apply(update)?;
        self.criteria.send_replace(next.clone());
        self.publish();
        Ok(next)
    }

    /// Like [`Self::update_criteria`], then refetches when the radius now reaches
    /// past the area of the last fetch. A failed refetch keeps the recomputed
    /// result and is reported through [`SearchEvent::FetchFailed`].
    pub async fn update_criteria_and_refresh(
        &self,
        update: CriteriaUpdate,
    ) -> Result<SearchCriteria, SearchError> {
        let criteria = self.update_criteria(update)?;
        if !self.fetch_covers_radius(criteria.radius_km) {
            debug!(radius_km = criteria.radius_km, "radius exceeds last fetch, refreshing");
            let _ = self.refresh().await;
        }
        Ok(criteria)
    }

    /// Ranks `candidates` against the current criteria and position without publishing.
    pub fn recompute(&self, candidates: &[PetReport]) -> FilteredResult {
        let criteria = self.criteria();
        let position = self.position();
        rank_candidates(candidates, &criteria, position.as_ref(), Utc::now())
    }

    /// True when `position` is far enough from the last fetch, or the radius
    /// has grown past it, so the cached candidates may be missing reports.
    pub fn needs_refetch(&self, position: &UserPosition) -> bool {
        let radius_km = self.criteria.borrow().radius_km;
        match *self.fetch_area.borrow() {
            Some(FetchArea {
                center: Some(center),
                radius_km: fetched_km,
            }) => {
                radius_km > fetched_km
                    || distance_km(center, position.coordinate) > self.config.refetch_distance_km
            }
            _ => true,
        }
    }

    fn fetch_covers_radius(&self, radius_km: f64) -> bool {
        match *self.fetch_area.borrow() {
            Some(area) => area.covers_radius(radius_km),
            None => false,
        }
    }

    /// Fetches fresh candidates and publishes them.
    ///
    /// Only the most recently issued refresh may publish; an older one that
    /// resolves late is dropped. On gateway failure the previous result stays
    /// in place and `FetchFailed` is both returned and broadcast.
    pub async fn refresh(&self) -> Result<Arc<FilteredResult>, SearchError> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let radius_km = self.criteria.borrow().radius_km;
        let center = self
            .position()
            .map(|p| p.coordinate)
            .or(self.config.fallback_center);

        let fetched = match center {
            Some(center) => self.gateway.fetch_active_pets(center, radius_km).await,
            None => self.gateway.fetch_all_active().await,
        };

        match fetched {
            Ok(candidates) => {
                let count = candidates.len();
                let fetched = Fetched {
                    ticket,
                    candidates,
                    area: FetchArea { center, radius_km },
                };
                match self.swap_result(Some(fetched)) {
                    Some(result) => {
                        info!(ticket, candidates = count, "refresh fetched candidates");
                        Ok(result)
                    }
                    None => Ok(self.superseded(ticket)),
                }
            }
            Err(_) if ticket != self.tickets.load(Ordering::SeqCst) => Ok(self.superseded(ticket)),
            Err(err) => {
                let message = err.to_string();
                warn!(ticket, %message, "refresh failed, keeping previous result");
                let _ = self.events.send(SearchEvent::FetchFailed {
                    ticket,
                    message: message.clone(),
                });
                Err(SearchError::FetchFailed { message })
            }
        }
    }

    pub(crate) fn notify_authorization(&self, status: AuthorizationStatus) {
        let _ = self.events.send(SearchEvent::AuthorizationChanged(status));
    }

    fn superseded(&self, ticket: u64) -> Arc<FilteredResult> {
        debug!(ticket, "dropping superseded refresh");
        let _ = self.events.send(SearchEvent::Superseded { ticket });
        self.latest()
    }

    /// Recomputes from current state and swaps the published result in one step.
    fn publish(&self) -> Arc<FilteredResult> {
        self.swap_result(None).unwrap_or_else(|| self.latest())
    }

    /// Installs `fetched` (if any), recomputes and publishes, all under the
    /// result lock. Returns `None` without touching anything when `fetched`
    /// carries a ticket that is no longer the latest.
    fn swap_result(&self, fetched: Option<Fetched>) -> Option<Arc<FilteredResult>> {
        let mut published = None;
        self.result.send_if_modified(|slot| {
            if let Some(fetched) = fetched {
                if fetched.ticket != self.tickets.load(Ordering::SeqCst) {
                    return false;
                }
                self.candidates.send_replace(Arc::new(fetched.candidates));
                self.fetch_area.send_replace(Some(fetched.area));
            }
            let candidates = self.candidates.borrow().clone();
            let criteria = self.criteria();
            let position = self.position();
            let next = rank_candidates(&candidates, &criteria, position.as_ref(), Utc::now());
            let next = Arc::new(next);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            published = Some((generation, Arc::clone(&next)));
            *slot = next;
            true
        });
        let (generation, result) = published?;
        debug!(generation, count = result.len(), "published search result");
        let _ = self.events.send(SearchEvent::ResultPublished {
            generation,
            count: result.len(),
        });
        Some(result)
    }
}
