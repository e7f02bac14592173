//! Report fetch gateway: the document-store contract plus HTTP and in-memory backends.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use pawtrack_core::{BoundingBox, Coordinate, NewPetReport, PetReport, SightingRecord};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pawtrack-gateway";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pet report {id} not found")]
    NotFound { id: String },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Backing-store operations the search engine and reporting flows depend on.
#[async_trait]
pub trait ReportGateway: Send + Sync {
    /// Active reports near `center`. The radius is advisory; callers re-filter.
    async fn fetch_active_pets(
        &self,
        center: Coordinate,
        radius_km: f64,
    ) -> Result<Vec<PetReport>, GatewayError>;

    async fn fetch_all_active(&self) -> Result<Vec<PetReport>, GatewayError>;

    async fn fetch_pet(&self, id: &str) -> Result<Option<PetReport>, GatewayError>;

    async fn create_report(&self, report: NewPetReport) -> Result<PetReport, GatewayError>;

    async fn mark_found(&self, id: &str) -> Result<(), GatewayError>;

    async fn submit_sighting(&self, sighting: &SightingRecord) -> Result<(), GatewayError>;

    async fn sightings_for(&self, pet_id: &str) -> Result<Vec<SightingRecord>, GatewayError>;
}

#[async_trait]
impl<G: ReportGateway + ?Sized> ReportGateway for Arc<G> {
    async fn fetch_active_pets(
        &self,
        center: Coordinate,
        radius_km: f64,
    ) -> Result<Vec<PetReport>, GatewayError> {
        (**self).fetch_active_pets(center, radius_km).await
    }

    async fn fetch_all_active(&self) -> Result<Vec<PetReport>, GatewayError> {
        (**self).fetch_all_active().await
    }

    async fn fetch_pet(&self, id: &str) -> Result<Option<PetReport>, GatewayError> {
        (**self).fetch_pet(id).await
    }

    async fn create_report(&self, report: NewPetReport) -> Result<PetReport, GatewayError> {
        (**self).create_report(report).await
    }

    async fn mark_found(&self, id: &str) -> Result<(), GatewayError> {
        (**self).mark_found(id).await
    }

    async fn submit_sighting(&self, sighting: &SightingRecord) -> Result<(), GatewayError> {
        (**self).submit_sighting(sighting).await
    }

    async fn sightings_for(&self, pet_id: &str) -> Result<Vec<SightingRecord>, GatewayError> {
        (**self).sightings_for(pet_id).await
    }
}

/// Response and fixture envelope for report listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PetListing {
    pub pets: Vec<PetReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SightingListing {
    pub sightings: Vec<SightingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            api_token: None,
            timeout: Duration::from_secs(15),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// REST/JSON client for the hosted document store.
#[derive(Debug)]
pub struct HttpReportGateway {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpReportGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends the request built by `build`, retrying transient failures per the backoff policy.
    async fn send<F>(&self, url: &str, build: F) -> Result<reqwest::Response, GatewayError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send,
    {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| GatewayError::Unavailable("gateway is shutting down".to_string()))?;

        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::Request(err));
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let resp = self
            .send(url, || self.request(Method::GET, url).query(query))
            .await?;
        decode(url, resp).await
    }

    async fn listing(&self, query: &[(&str, String)]) -> Result<Vec<PetReport>, GatewayError> {
        let url = self.url("pets");
        let listing: PetListing = self.get_json(&url, query).await?;
        Ok(listing.pets)
    }
}

async fn decode<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T, GatewayError> {
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| GatewayError::Decode {
        url: url.to_string(),
        source,
    })
}

#[async_trait]
impl ReportGateway for HttpReportGateway {
    async fn fetch_active_pets(
        &self,
        center: Coordinate,
        radius_km: f64,
    ) -> Result<Vec<PetReport>, GatewayError> {
        let bbox = BoundingBox::around(center, radius_km);
        let query = [
            ("active", "true".to_string()),
            ("min_lat", bbox.min_latitude.to_string()),
            ("max_lat", bbox.max_latitude.to_string()),
            ("min_lon", bbox.min_longitude.to_string()),
            ("max_lon", bbox.max_longitude.to_string()),
        ];
        let span = info_span!("http_fetch", op = "fetch_active_pets", radius_km);
        let pets = self.listing(&query).instrument(span).await?;
        debug!(count = pets.len(), "fetched candidate reports");
        Ok(pets)
    }

    async fn fetch_all_active(&self) -> Result<Vec<PetReport>, GatewayError> {
        let query = [("active", "true".to_string())];
        self.listing(&query)
            .instrument(info_span!("http_fetch", op = "fetch_all_active"))
            .await
    }

    async fn fetch_pet(&self, id: &str) -> Result<Option<PetReport>, GatewayError> {
        let url = self.url(&format!("pets/{id}"));
        let span = info_span!("http_fetch", op = "fetch_pet", id);
        match self.get_json::<PetReport>(&url, &[]).instrument(span).await {
            Ok(report) => Ok(Some(report)),
            Err(GatewayError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_report(&self, report: NewPetReport) -> Result<PetReport, GatewayError> {
        report
            .validate()
            .map_err(|err| GatewayError::InvalidRecord(err.to_string()))?;
        let url = self.url("pets");
        let resp = self
            .send(&url, || self.request(Method::POST, &url).json(&report))
            .instrument(info_span!("http_fetch", op = "create_report"))
            .await?;
        decode(&url, resp).await
    }

    async fn mark_found(&self, id: &str) -> Result<(), GatewayError> {
        let url = self.url(&format!("pets/{id}"));
        let body = serde_json::json!({ "is_active": false });
        let result = self
            .send(&url, || self.request(Method::PATCH, &url).json(&body))
            .instrument(info_span!("http_fetch", op = "mark_found", id))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(GatewayError::HttpStatus { status: 404, .. }) => {
                Err(GatewayError::NotFound { id: id.to_string() })
            }
            Err(err) => Err(err),
        }
    }

    async fn submit_sighting(&self, sighting: &SightingRecord) -> Result<(), GatewayError> {
        sighting
            .location
            .coordinate
            .validate()
            .map_err(|err| GatewayError::InvalidRecord(err.to_string()))?;
        let url = self.url("sightings");
        self.send(&url, || self.request(Method::POST, &url).json(sighting))
            .instrument(info_span!("http_fetch", op = "submit_sighting", pet_id = %sighting.pet_id))
            .await?;
        Ok(())
    }

    async fn sightings_for(&self, pet_id: &str) -> Result<Vec<SightingRecord>, GatewayError> {
        let url = self.url(&format!("pets/{pet_id}/sightings"));
        let listing: SightingListing = self
            .get_json(&url, &[])
            .instrument(info_span!("http_fetch", op = "sightings_for", pet_id))
            .await?;
        Ok(listing.sightings)
    }
}

/// Process-local store used for fixtures, demos and tests.
#[derive(Debug, Default)]
pub struct MemoryReportGateway {
    pets: RwLock<Vec<PetReport>>,
    sightings: RwLock<Vec<SightingRecord>>,
    unavailable: AtomicBool,
}

impl MemoryReportGateway {
    pub fn new(pets: Vec<PetReport>) -> Self {
        Self {
            pets: RwLock::new(pets),
            ..Self::default()
        }
    }

    pub fn from_fixture(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(load_pet_fixture(path)?))
    }

    /// Simulates an outage: every call fails with [`GatewayError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn replace_all(&self, pets: Vec<PetReport>) {
        *self.pets.write().await = pets;
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(GatewayError::Unavailable("memory gateway offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReportGateway for MemoryReportGateway {
    async fn fetch_active_pets(
        &self,
        center: Coordinate,
        radius_km: f64,
    ) -> Result<Vec<PetReport>, GatewayError> {
        self.check_available()?;
        let bbox = BoundingBox::around(center, radius_km);
        Ok(self
            .pets
            .read()
            .await
            .iter()
            .filter(|p| p.is_active && bbox.contains(p.coordinate()))
            .cloned()
            .collect())
    }

    async fn fetch_all_active(&self) -> Result<Vec<PetReport>, GatewayError> {
        self.check_available()?;
        Ok(self
            .pets
            .read()
            .await
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn fetch_pet(&self, id: &str) -> Result<Option<PetReport>, GatewayError> {
        self.check_available()?;
        Ok(self.pets.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn create_report(&self, report: NewPetReport) -> Result<PetReport, GatewayError> {
        self.check_available()?;
        report
            .validate()
            .map_err(|err| GatewayError::InvalidRecord(err.to_string()))?;
        let created = report.into_report(Uuid::new_v4().to_string(), Utc::now());
        self.pets.write().await.push(created.clone());
        Ok(created)
    }

    async fn mark_found(&self, id: &str) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut pets = self.pets.write().await;
        let pet = pets
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })?;
        pet.is_active = false;
        Ok(())
    }

    async fn submit_sighting(&self, sighting: &SightingRecord) -> Result<(), GatewayError> {
        self.check_available()?;
        sighting
            .location
            .coordinate
            .validate()
            .map_err(|err| GatewayError::InvalidRecord(err.to_string()))?;
        if !self.pets.read().await.iter().any(|p| p.id == sighting.pet_id) {
            return Err(GatewayError::NotFound {
                id: sighting.pet_id.clone(),
            });
        }
        self.sightings.write().await.push(sighting.clone());
        Ok(())
    }

    async fn sightings_for(&self, pet_id: &str) -> Result<Vec<SightingRecord>, GatewayError> {
        self.check_available()?;
        let mut found = self
            .sightings
            .read()
            .await
            .iter()
            .filter(|s| s.pet_id == pet_id)
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by(|a, b| b.seen_at.cmp(&a.seen_at));
        Ok(found)
    }
}

/// Reads a `{ "pets": [...] }` document from disk.
pub fn load_pet_fixture(path: impl AsRef<Path>) -> anyhow::Result<Vec<PetReport>> {
    let listing: PetListing = read_json_file(path)?;
    Ok(listing.pets)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as AxumPath, Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::DateTime;
    use pawtrack_core::{LastSeenLocation, PetSize, Species};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn pet(id: &str, lat: f64, lon: f64, active: bool) -> PetReport {
        let ts = DateTime::parse_from_rfc3339("2026-10-10T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        PetReport {
            id: id.to_string(),
            name: format!("Pet {id}"),
            species: Species::Dog,
            breed: Some("Beagle".into()),
            size: PetSize::Medium,
            color: None,
            description: String::new(),
            last_seen_location: LastSeenLocation::at(Coordinate::new(lat, lon).unwrap()),
            last_seen_date: ts,
            reward_amount: Some(20.0),
            is_active: active,
            owner_id: "owner-1".into(),
            image_urls: vec![],
            contact_phone: None,
            created_at: ts,
        }
    }

    fn new_report() -> NewPetReport {
        NewPetReport {
            name: "Milo".into(),
            species: Species::Cat,
            breed: None,
            size: PetSize::Small,
            color: Some("tabby".into()),
            description: "shy".into(),
            last_seen_location: LastSeenLocation::at(Coordinate::new(1.0, 1.0).unwrap()),
            last_seen_date: Utc::now(),
            reward_amount: None,
            owner_id: "owner-2".into(),
            image_urls: vec![],
            contact_phone: None,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn memory_gateway_prefilters_by_bounding_box_and_activity() {
        let gateway = MemoryReportGateway::new(vec![
            pet("near", 0.01, 0.01, true),
            pet("near-inactive", 0.0, 0.02, false),
            pet("far", 2.0, 2.0, true),
        ]);
        let center = Coordinate::new(0.0, 0.0).unwrap();
        let found = gateway.fetch_active_pets(center, 10.0).await.unwrap();
        assert_eq!(found.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["near"]);

        let all = gateway.fetch_all_active().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn memory_gateway_report_lifecycle() {
        let gateway = MemoryReportGateway::default();
        let created = gateway.create_report(new_report()).await.unwrap();
        assert!(created.is_active);
        assert_eq!(
            gateway.fetch_pet(&created.id).await.unwrap().map(|p| p.name),
            Some("Milo".to_string())
        );

        let sighting = SightingRecord::new(
            created.id.clone(),
            "neighbor",
            LastSeenLocation::at(Coordinate::new(1.001, 1.0).unwrap()),
            Utc::now(),
        )
        .unwrap();
        gateway.submit_sighting(&sighting).await.unwrap();
        assert_eq!(gateway.sightings_for(&created.id).await.unwrap(), vec![sighting]);

        gateway.mark_found(&created.id).await.unwrap();
        assert!(gateway.fetch_all_active().await.unwrap().is_empty());
        assert!(matches!(
            gateway.mark_found("missing").await,
            Err(GatewayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_gateway_rejects_sighting_for_unknown_pet() {
        let gateway = MemoryReportGateway::new(vec![pet("a", 0.0, 0.0, true)]);
        let sighting = SightingRecord::new(
            "ghost",
            "u",
            LastSeenLocation::at(Coordinate::new(0.0, 0.0).unwrap()),
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            gateway.submit_sighting(&sighting).await,
            Err(GatewayError::NotFound { id }) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn memory_gateway_outage_fails_every_call() {
        let gateway = MemoryReportGateway::new(vec![pet("a", 0.0, 0.0, true)]);
        gateway.set_unavailable(true);
        assert!(matches!(
            gateway.fetch_all_active().await,
            Err(GatewayError::Unavailable(_))
        ));
        gateway.set_unavailable(false);
        assert_eq!(gateway.fetch_all_active().await.unwrap().len(), 1);
    }

    #[test]
    fn fixture_loading_reports_path_on_parse_error() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("pets.json");
        let listing = PetListing {
            pets: vec![pet("a", 0.0, 0.0, true)],
        };
        fs::write(&good, serde_json::to_string(&listing).unwrap()).unwrap();
        assert_eq!(load_pet_fixture(&good).unwrap().len(), 1);

        let bad = dir.path().join("broken.json");
        fs::write(&bad, "{ not json").unwrap();
        let err = load_pet_fixture(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[derive(Clone, Default)]
    struct Backend {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
        last_query: Arc<std::sync::Mutex<HashMap<String, String>>>,
        last_auth: Arc<std::sync::Mutex<Option<String>>>,
        sightings: Arc<std::sync::Mutex<Vec<SightingRecord>>>,
    }

    async fn list_pets(
        State(backend): State<Backend>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Result<Json<PetListing>, AxumStatus> {
        let hit = backend.hits.fetch_add(1, Ordering::SeqCst);
        if hit < backend.fail_first {
            return Err(AxumStatus::SERVICE_UNAVAILABLE);
        }
        *backend.last_query.lock().unwrap() = query;
        *backend.last_auth.lock().unwrap() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        Ok(Json(PetListing {
            pets: vec![pet("remote-1", 0.01, 0.0, true)],
        }))
    }

    async fn get_pet(AxumPath(id): AxumPath<String>) -> Result<Json<PetReport>, AxumStatus> {
        if id == "remote-1" {
            Ok(Json(pet("remote-1", 0.01, 0.0, true)))
        } else {
            Err(AxumStatus::NOT_FOUND)
        }
    }

    async fn post_sighting(State(backend): State<Backend>, Json(sighting): Json<SightingRecord>) -> AxumStatus {
        backend.sightings.lock().unwrap().push(sighting);
        AxumStatus::CREATED
    }

    async fn spawn_backend(backend: Backend) -> String {
        let app = Router::new()
            .route("/v1/pets", get(list_pets))
            .route("/v1/pets/{id}", get(get_pet))
            .route("/v1/sightings", post(post_sighting))
            .with_state(backend);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn fast_config(base_url: String) -> GatewayConfig {
        GatewayConfig {
            base_url,
            api_token: Some("secret-token".into()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn http_gateway_sends_bounding_box_and_token() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let gateway = HttpReportGateway::new(fast_config(base)).unwrap();

        let pets = gateway
            .fetch_active_pets(Coordinate::new(0.0, 0.0).unwrap(), 10.0)
            .await
            .unwrap();
        assert_eq!(pets.len(), 1);

        let query = backend.last_query.lock().unwrap().clone();
        assert_eq!(query.get("active").map(String::as_str), Some("true"));
        let max_lat: f64 = query["max_lat"].parse().unwrap();
        let min_lat: f64 = query["min_lat"].parse().unwrap();
        assert!(max_lat > 0.08 && min_lat < -0.08);
        assert_eq!(
            backend.last_auth.lock().unwrap().as_deref(),
            Some("Bearer secret-token")
        );
    }

    #[tokio::test]
    async fn http_gateway_retries_transient_status() {
        let backend = Backend {
            fail_first: 2,
            ..Backend::default()
        };
        let base = spawn_backend(backend.clone()).await;
        let gateway = HttpReportGateway::new(fast_config(base)).unwrap();
        let pets = gateway.fetch_all_active().await.unwrap();
        assert_eq!(pets.len(), 1);
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_gateway_gives_up_after_retry_budget() {
        let backend = Backend {
            fail_first: 10,
            ..Backend::default()
        };
        let base = spawn_backend(backend.clone()).await;
        let gateway = HttpReportGateway::new(fast_config(base)).unwrap();
        let err = gateway.fetch_all_active().await.unwrap_err();
        assert!(matches!(err, GatewayError::HttpStatus { status: 503, .. }));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_gateway_maps_missing_pet_to_none_and_posts_sightings() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let gateway = HttpReportGateway::new(fast_config(base)).unwrap();

        assert!(gateway.fetch_pet("remote-1").await.unwrap().is_some());
        assert!(gateway.fetch_pet("nope").await.unwrap().is_none());

        let sighting = SightingRecord::new(
            "remote-1",
            "walker",
            LastSeenLocation::at(Coordinate::new(0.02, 0.0).unwrap()),
            Utc::now(),
        )
        .unwrap();
        gateway.submit_sighting(&sighting).await.unwrap();
        assert_eq!(backend.sightings.lock().unwrap().as_slice(), &[sighting]);
    }
}
