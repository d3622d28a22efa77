#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use pollustake_adapters::{RandomWalkSensorFeed, SimulatorProfile, TrendForecastOracle};
use pollustake_core::{
    audit_ledger, ComplianceError, ComplianceMonitor, Entity, EntityId, EntityRegistry, FeedError,
    ForecastLogEntry, ForecastOracle, MonitorConfig, NewEntity, QueryWindow, Reading, SensorFeed,
    SlashEvent, StateStore, StorageConfig, StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

/// Readings returned per entity by the dashboard endpoint.
pub const DASHBOARD_HISTORY_LENGTH: usize = 50;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub monitor: MonitorConfig,
    pub lookback: usize,
    pub forecast_alert_threshold: f64,
    /// Seed for the sensor simulator; `None` draws from OS entropy.
    pub feed_seed: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            monitor: MonitorConfig::default(),
            lookback: TrendForecastOracle::DEFAULT_LOOKBACK,
            forecast_alert_threshold: TrendForecastOracle::DEFAULT_ALERT_THRESHOLD,
            feed_seed: None,
        }
    }
}

/// Demo facilities registered at startup together with their emission profile.
pub fn seed_entities() -> Vec<(NewEntity, SimulatorProfile)> {
    vec![
        (
            NewEntity::new("factory-001", "Bhilai Steel Plant", 100)
                .with_location("Bhilai, Chhattisgarh"),
            SimulatorProfile::steel_plant(),
        ),
        (
            NewEntity::new("factory-002", "Durg Cement Works", 75)
                .with_location("Durg, Chhattisgarh"),
            SimulatorProfile::cement_works(),
        ),
    ]
}

#[derive(Clone)]
pub struct ServiceState {
    pub store: Arc<dyn StateStore>,
    pub monitor: Arc<ComplianceMonitor>,
}

impl ServiceState {
    /// Connect storage, seed the demo entities and assemble the monitor.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = config.storage.connect().await?;

        let seeds = seed_entities();
        let feed = seeds.iter().try_fold(
            RandomWalkSensorFeed::new(config.feed_seed),
            |feed, (entity, profile)| feed.with_profile(entity.id.clone(), *profile),
        )?;
        let oracle = TrendForecastOracle::new(config.lookback, config.forecast_alert_threshold);
        let entities = seeds.into_iter().map(|(entity, _)| entity);

        Self::assemble(
            store,
            Arc::new(feed),
            Arc::new(oracle),
            entities,
            config.monitor,
        )
        .await
    }

    /// Build the service around explicit collaborators.
    pub async fn assemble(
        store: Arc<dyn StateStore>,
        feed: Arc<dyn SensorFeed>,
        oracle: Arc<dyn ForecastOracle>,
        entities: impl IntoIterator<Item = NewEntity>,
        monitor_config: MonitorConfig,
    ) -> Result<Self, ServiceError> {
        let registry = EntityRegistry::seed(store.as_ref(), entities).await?;
        let monitor = ComplianceMonitor::new(store.clone(), feed, oracle, registry, monitor_config)?;
        Ok(Self {
            store,
            monitor: Arc::new(monitor),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/dashboard", get(dashboard))
        .route("/v1/forecast/:entity_id", get(latest_forecast))
        .route("/v1/slash-events", get(list_slash_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("compliance core error: {0}")]
    Core(#[from] ComplianceError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("sensor feed error: {0}")]
    Feed(#[from] FeedError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] ComplianceError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StoreError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::InvariantViolation(_) | StoreError::Schema(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Http { status, .. } => *status,
            ApiError::Store(err) => store_status(err),
            ApiError::Core(ComplianceError::Store(err)) => store_status(err),
            ApiError::Core(ComplianceError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(ComplianceError::EntityNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    cycles_completed: u64,
    entities_monitored: usize,
    ledger_conserved: Option<bool>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let ledger_conserved = audit_ledger(state.store.as_ref())
        .await
        .map(|audit| audit.is_consistent())
        .ok();
    let status = match ledger_conserved {
        Some(true) => "ok",
        _ => "degraded",
    };
    Json(HealthResponse {
        status,
        service: "pollustake-service",
        storage_backend: state.store.backend_label(),
        cycles_completed: state.monitor.cycles_completed(),
        entities_monitored: state.monitor.registry().len(),
        ledger_conserved,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    #[serde(flatten)]
    pub entity: Entity,
    pub recent_readings: Vec<Reading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardResponse {
    pub generated_at: DateTime<Utc>,
    pub admin_fund_balance: u64,
    pub entities: Vec<EntityView>,
}

async fn dashboard(State(state): State<ServiceState>) -> Result<Json<DashboardResponse>, ApiError> {
    let fund = state.store.protocol_fund().await?;
    let mut entities = Vec::new();
    for entity in state.store.list_entities().await? {
        let recent_readings = state
            .store
            .recent_readings(&entity.id, DASHBOARD_HISTORY_LENGTH)
            .await?;
        entities.push(EntityView {
            entity,
            recent_readings,
        });
    }

    Ok(Json(DashboardResponse {
        generated_at: Utc::now(),
        admin_fund_balance: fund.admin_fund_balance,
        entities,
    }))
}

async fn latest_forecast(
    State(state): State<ServiceState>,
    Path(entity_id): Path<String>,
) -> Result<Json<ForecastLogEntry>, ApiError> {
    let entity_id = EntityId::new(entity_id);
    if state.store.get_entity(&entity_id).await?.is_none() {
        return Err(ApiError::not_found(format!("entity '{entity_id}' not found")));
    }
    state
        .store
        .latest_forecast(&entity_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no forecast recorded for '{entity_id}'")))
}

#[derive(Debug, Clone, Deserialize)]
struct SlashEventsQuery {
    entity_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashEventsResponse {
    pub returned: usize,
    pub items: Vec<SlashEvent>,
}

async fn list_slash_events(
    State(state): State<ServiceState>,
    Query(query): Query<SlashEventsQuery>,
) -> Result<Json<SlashEventsResponse>, ApiError> {
    let entity_id = match query.entity_id.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::bad_request("entity_id must not be empty")),
        Some(id) => Some(EntityId::new(id)),
        None => None,
    };
    let limit = query.limit.unwrap_or(100);
    if limit == 0 || limit > 1000 {
        return Err(ApiError::bad_request(format!(
            "invalid limit {limit}; expected 1..=1000"
        )));
    }

    let items = state
        .store
        .list_slash_events(
            entity_id.as_ref(),
            QueryWindow {
                limit,
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;

    Ok(Json(SlashEventsResponse {
        returned: items.len(),
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pollustake_core::{
        FeedError, Forecast, InMemoryStateStore, OracleError, SensorSample, SlashTrigger,
    };
    use tower::ServiceExt;

    struct ConstantFeed(f64);

    #[async_trait::async_trait]
    impl SensorFeed for ConstantFeed {
        async fn next_reading(&self, _entity_id: &EntityId) -> Result<SensorSample, FeedError> {
            Ok(SensorSample::new(self.0, 4.0, 9.0))
        }
    }

    struct AlertOracle;

    #[async_trait::async_trait]
    impl ForecastOracle for AlertOracle {
        fn lookback(&self) -> usize {
            1
        }

        async fn predict_breach(&self, _history: &[Reading]) -> Result<Forecast, OracleError> {
            Ok(Forecast {
                breach_predicted: true,
                predicted_value: 171.25,
            })
        }
    }

    async fn state_with_feed(pm2_5: f64) -> ServiceState {
        ServiceState::assemble(
            Arc::new(InMemoryStateStore::new()),
            Arc::new(ConstantFeed(pm2_5)),
            Arc::new(AlertOracle),
            seed_entities().into_iter().map(|(entity, _)| entity),
            MonitorConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn bootstrap_seeds_entities_with_memory_storage() {
        let state = ServiceState::bootstrap(ServiceConfig {
            feed_seed: Some(42),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();

        let entities = state.store.list_entities().await.unwrap();
        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["factory-001", "factory-002"]);
        assert_eq!(entities[1].stake_balance, 75);
        assert_eq!(state.monitor.lookback(), 10);

        let report = state.monitor.run_cycle().await;
        assert!(report.is_clean());
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn health_reports_conserved_ledger() {
        let state = state_with_feed(250.0).await;
        state.monitor.run_cycle().await;

        let (status, body) = get_json(build_router(state), "/v1/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["ledger_conserved"], true);
        assert_eq!(body["cycles_completed"], 1);
        assert_eq!(body["entities_monitored"], 2);
    }

    #[tokio::test]
    async fn dashboard_lists_entities_fund_and_readings() {
        let state = state_with_feed(250.0).await;
        state.monitor.run_cycle().await;
        state.monitor.run_cycle().await;

        let (status, body) = get_json(build_router(state), "/v1/dashboard").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["admin_fund_balance"], 40);
        let entities = body["entities"].as_array().unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0]["id"], "factory-001");
        assert_eq!(entities[0]["status"], "PENALTY");
        assert_eq!(entities[0]["stake_balance"], 80);
        assert_eq!(entities[0]["recent_readings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn forecast_endpoint_returns_latest_or_404() {
        let state = state_with_feed(120.0).await;
        let app = build_router(state.clone());

        let (status, _) = get_json(app.clone(), "/v1/forecast/factory-001").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.monitor.run_cycle().await;
        let (status, body) = get_json(app.clone(), "/v1/forecast/factory-001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["breach_predicted"], true);
        assert_eq!(body["predicted_value"], 171.25);

        let (status, body) = get_json(app, "/v1/forecast/factory-999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("factory-999"));
    }

    #[tokio::test]
    async fn slash_events_filter_by_entity_newest_first() {
        let state = state_with_feed(250.0).await;
        state.monitor.run_cycle().await;
        state.monitor.run_cycle().await;
        state
            .monitor
            .ledger()
            .slash_with_trigger(
                &EntityId::new("factory-002"),
                "manual review",
                SlashTrigger::Manual,
            )
            .await
            .unwrap();
        let app = build_router(state);

        let (status, body) =
            get_json(app.clone(), "/v1/slash-events?entity_id=factory-002&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["returned"], 2);
        assert_eq!(body["items"][0]["triggered_by"], "MANUAL");
        assert_eq!(body["items"][0]["entity_id"], "factory-002");

        let (status, body) = get_json(app.clone(), "/v1/slash-events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["returned"], 5);

        let (status, _) = get_json(app, "/v1/slash-events?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
