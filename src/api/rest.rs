// =============================================================================
// REST API — thin exposure of the four public operations
// =============================================================================
//
// The HTTP surface and its auth/session layer are consumed external
// interfaces, not part of this engine's scope — only `start_strategy` /
// `stop_strategy` / `status_for_user` / `query_trades` need to be reachable
// over the wire at all. Kept in an axum + CORS + Bearer-token shape
// (`api::auth::AuthBearer`) rather than inventing a different HTTP idiom.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::ledger::{TradeLedger, TradeQuery};
use crate::manager::StrategyManager;
use crate::types::{Broker, Environment, InstanceKey, UserId};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<StrategyManager>,
    pub ledger: Arc<dyn TradeLedger>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/users/:user_id/strategies", post(start_strategy))
        .route("/api/v1/users/:user_id/strategies", get(status_for_user))
        .route("/api/v1/users/:user_id/strategies/stop", post(stop_strategy))
        .route("/api/v1/users/:user_id/trades", get(query_trades))
        .route("/api/v1/users/:user_id/trades/stats", get(trade_stats))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct StartStrategyRequest {
    strategy_name: String,
    instrument: String,
    broker: Broker,
    environment: Environment,
    strategy_kind: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default = "default_true")]
    auto_reconnect: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

async fn start_strategy(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<StartStrategyRequest>,
) -> impl IntoResponse {
    let result = state
        .manager
        .start_strategy(
            UserId::from(user_id),
            req.strategy_name,
            req.instrument,
            req.broker,
            req.environment,
            req.strategy_kind,
            req.params,
            req.auto_reconnect,
        )
        .await;

    match result {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!({ "status": "started" }))).into_response(),
        Err(e) => {
            warn!(error = %e, "start_strategy failed");
            (StatusCode::BAD_REQUEST, Json(ApiError { error: e.to_string() })).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopStrategyRequest {
    strategy_name: String,
    instrument: String,
    broker: Broker,
    environment: Environment,
}

async fn stop_strategy(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<StopStrategyRequest>,
) -> impl IntoResponse {
    let key = InstanceKey {
        user_id: UserId::from(user_id),
        strategy_name: req.strategy_name,
        instrument: req.instrument,
        broker: req.broker,
        environment: req.environment,
    };
    match state.manager.stop_strategy(&key).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "stopping" }))).into_response(),
        Err(e) => {
            warn!(error = %e, "stop_strategy failed");
            (StatusCode::BAD_REQUEST, Json(ApiError { error: e.to_string() })).into_response()
        }
    }
}

async fn status_for_user(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.status_for_user(&UserId::from(user_id)).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: e.to_string() })).into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct TradeQueryParams {
    strategy_name: Option<String>,
    instrument: Option<String>,
    limit: Option<usize>,
}

async fn query_trades(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(params): Query<TradeQueryParams>,
) -> impl IntoResponse {
    let query = TradeQuery {
        strategy_name: params.strategy_name,
        instrument: params.instrument,
        status: None,
        limit: params.limit,
    };
    match state.ledger.query_trades(&UserId::from(user_id), query).await {
        Ok(trades) => (StatusCode::OK, Json(trades)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: e.to_string() })).into_response(),
    }
}

async fn trade_stats(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.ledger.trade_stats(&UserId::from(user_id)).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: e.to_string() })).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_strategy_request_defaults_auto_reconnect_true() {
        let json = serde_json::json!({
            "strategy_name": "razor-btc",
            "instrument": "BTC-PERPETUAL",
            "broker": "deribit",
            "environment": "testnet",
            "strategy_kind": "razor",
        });
        let req: StartStrategyRequest = serde_json::from_value(json).unwrap();
        assert!(req.auto_reconnect);
    }
}
