//! Axum JSON API exposing a search engine to presentation clients.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pawtrack_core::{Coordinate, CriteriaUpdate, LastSeenLocation, SearchError, SightingRecord, UserPosition};
use pawtrack_gateway::{GatewayError, ReportGateway};
use pawtrack_search::SearchEngine;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pawtrack-web";

pub type SharedEngine = Arc<SearchEngine<Arc<dyn ReportGateway>>>;

#[derive(Clone)]
pub struct AppState {
    pub engine: SharedEngine,
}

impl AppState {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a, T: Serialize> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SightingRequest {
    pub pet_id: String,
    pub reporter_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/nearby", get(nearby_handler))
        .route("/criteria", get(criteria_handler).patch(update_criteria_handler))
        .route("/position", put(position_handler))
        .route("/refresh", post(refresh_handler))
        .route("/pets/{id}", get(pet_handler))
        .route("/pets/{id}/found", post(mark_found_handler))
        .route("/pets/{id}/sightings", get(sightings_handler))
        .route("/sightings", post(submit_sighting_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving pawtrack api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn nearby_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = state.engine.latest();
    Json(result.as_ref()).into_response()
}

async fn criteria_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.criteria()).into_response()
}

async fn update_criteria_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<CriteriaUpdate>,
) -> Response {
    match state.engine.update_criteria_and_refresh(update).await {
        Ok(criteria) => Json(criteria).into_response(),
        Err(err) => search_error(err),
    }
}

async fn position_handler(
    State(state): State<Arc<AppState>>,
    Json(position): Json<Option<UserPosition>>,
) -> Response {
    match state.engine.set_position(position) {
        Ok(result) => Json(result.as_ref()).into_response(),
        Err(err) => search_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.refresh().await {
        Ok(result) => Json(result.as_ref()).into_response(),
        Err(err @ SearchError::FetchFailed { .. }) => {
            let stale = state.engine.latest();
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: err.to_string(),
                    result: Some(stale.as_ref()),
                }),
            )
                .into_response()
        }
        Err(err) => search_error(err),
    }
}

async fn pet_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match state.engine.gateway().fetch_pet(&id).await {
        Ok(Some(pet)) => Json(pet).into_response(),
        Ok(None) => gateway_error(GatewayError::NotFound { id }),
        Err(err) => gateway_error(err),
    }
}

async fn mark_found_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(err) = state.engine.gateway().mark_found(&id).await {
        return gateway_error(err);
    }
    // Drop the reunited pet from the published list; a failed refetch keeps the old one.
    let _ = state.engine.refresh().await;
    StatusCode::NO_CONTENT.into_response()
}

async fn sightings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.engine.gateway().sightings_for(&id).await {
        Ok(sightings) => Json(sightings).into_response(),
        Err(err) => gateway_error(err),
    }
}

async fn submit_sighting_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SightingRequest>,
) -> Response {
    let sighting = match build_sighting(req) {
        Ok(sighting) => sighting,
        Err(err) => return search_error(err),
    };
    match state.engine.gateway().submit_sighting(&sighting).await {
        Ok(()) => (StatusCode::CREATED, Json(sighting)).into_response(),
        Err(err) => gateway_error(err),
    }
}

fn build_sighting(req: SightingRequest) -> Result<SightingRecord, SearchError> {
    let location = LastSeenLocation {
        coordinate: Coordinate::new(req.latitude, req.longitude)?,
        address: req.address,
        city: req.city,
        state: req.state,
    };
    let mut sighting = SightingRecord::new(
        req.pet_id,
        req.reporter_id,
        location,
        req.seen_at.unwrap_or_else(Utc::now),
    )?;
    sighting.notes = req.notes;
    sighting.image_url = req.image_url;
    Ok(sighting)
}

fn error_json(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorBody::<()> {
            error: message,
            result: None,
        }),
    )
        .into_response()
}

fn search_error(err: SearchError) -> Response {
    let status = match err {
        SearchError::InvalidCoordinate { .. } | SearchError::InvalidCriteria { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SearchError::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
    };
    error_json(status, err.to_string())
}

fn gateway_error(err: GatewayError) -> Response {
    let status = match err {
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::InvalidRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_json(status, err.to_string())
}
