//! Operator HTTP endpoints
//!
//! REST API for the dialler dashboard. Every response uses the
//! `{success, data?|error?}` envelope.

use std::time::Duration;

use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use outdial_core::phone::{area_code, normalize_phone};
use outdial_dialer::{
    initiate_hangup, state_for_area_code, CallDriver, Did, ProductionCallDriver,
};
use outdial_persistence::{ConversationFilter, DurationFilter};
use outdial_telephony::CarrierError;

use crate::media_ws::media_handler;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::webhooks::carrier_webhook;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let (cors_enabled, cors_origins) = {
        let settings = state.settings.read();
        (
            settings.server.cors_enabled,
            settings.server.cors_origins.clone(),
        )
    };
    let cors_layer = build_cors_layer(&cors_origins, cors_enabled);

    Router::new()
        // Agent control
        .route("/api/agent/start", post(agent_start))
        .route("/api/agent/stop", post(agent_stop))
        .route("/api/agent/pause", post(agent_pause))
        .route("/api/agent/resume", post(agent_resume))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/stats", get(agent_stats))
        .route("/api/agent/config", get(agent_config_get))
        .route("/api/agent/config", put(agent_config_put))
        .route("/api/agent/transferred-calls", get(transferred_calls_get))
        .route("/api/agent/transferred-calls", delete(transferred_calls_delete))
        // Conversations
        .route("/api/conversations", get(conversations_list))
        .route("/api/conversations/:call_id", get(conversation_get))
        .route("/api/conversations", delete(conversations_delete))
        // Manual call control
        .route("/api/calls/initiate", post(calls_initiate))
        .route("/api/calls/hangup", post(calls_hangup))
        .route("/api/calls/active", get(calls_active))
        .route("/api/calls/:call_id/status", get(call_status))
        // Carrier-facing endpoints
        .route("/webhooks/carrier", post(carrier_webhook))
        .route("/media", get(media_handler))
        // Operational endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS disabled - allowing all origins (development only)");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed.is_empty() {
        tracing::info!("No CORS origins configured, defaulting to localhost:3000");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().expect("static origin"))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

fn success(data: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({"success": true, "data": data})))
}

fn failure(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"success": false, "error": message.into()})),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    user_ids: Option<Vec<Uuid>>,
    /// Milliseconds between consecutive originations
    #[serde(default)]
    delay_between_calls: Option<u64>,
}

/// POST /api/agent/start
async fn agent_start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };

    let leads = match persistence.leads.dialable(request.user_ids.as_deref()).await {
        Ok(leads) => leads,
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if leads.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "no dialable leads found");
    }

    if let Some(delay_ms) = request.delay_between_calls {
        let config = state.dispatcher.config();
        state
            .dispatcher
            .set_config(config.max_concurrent_calls, Duration::from_millis(delay_ms));
    }

    let queued = leads.len();
    state.dispatcher.start(leads);
    success(json!({
        "state": state.dispatcher.state(),
        "queued": queued,
    }))
}

/// POST /api/agent/stop
async fn agent_stop(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.dispatcher.stop();
    success(json!({"state": state.dispatcher.state()}))
}

/// POST /api/agent/pause
async fn agent_pause(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.dispatcher.pause();
    success(json!({"state": state.dispatcher.state()}))
}

/// POST /api/agent/resume
async fn agent_resume(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.dispatcher.resume();
    success(json!({"state": state.dispatcher.state()}))
}

/// GET /api/agent/status
async fn agent_status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    success(json!({
        "state": state.dispatcher.state(),
        "activeCalls": state.dispatcher.active_calls(),
        "queueLength": state.dispatcher.queue_len(),
        "activePhones": state.services.registry.len(),
    }))
}

/// GET /api/agent/stats
async fn agent_stats(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let stats = state.dispatcher.stats().snapshot();
    let mut data = json!({
        "agent": stats,
        "activeCalls": state.dispatcher.active_calls(),
        "queueLength": state.dispatcher.queue_len(),
    });

    if let Some(persistence) = &state.services.persistence {
        if let Ok(aggregates) = persistence.costs.aggregates().await {
            data["costs"] = json!({
                "total": aggregates.total_cost,
                "calls": aggregates.call_count,
                "engagedCalls": aggregates.engaged_count,
                "averageEngagedCost": aggregates.average_engaged_cost,
            });
        }
        if let Ok(total) = persistence.calls.total().await {
            data["carrierCalls"] = json!({"total": total});
        }
        if let Ok(count) = persistence.transfers.count().await {
            data["transferredCalls"] = json!(count);
        }
    }

    success(data)
}

/// GET /api/agent/config
async fn agent_config_get(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let config = state.dispatcher.config();
    success(json!({
        "transferNumber": state.services.transfer_number.read().clone(),
        "maxConcurrentCalls": config.max_concurrent_calls,
        "delayBetweenCallsMs": config.delay_between_calls.as_millis() as u64,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigRequest {
    #[serde(default)]
    transfer_number: Option<String>,
    #[serde(default)]
    max_concurrent_calls: Option<usize>,
}

/// PUT /api/agent/config
async fn agent_config_put(
    State(state): State<AppState>,
    Json(request): Json<ConfigRequest>,
) -> (StatusCode, Json<Value>) {
    if let Some(max) = request.max_concurrent_calls {
        if !(1..=50).contains(&max) {
            return failure(
                StatusCode::BAD_REQUEST,
                "maxConcurrentCalls must be between 1 and 50",
            );
        }
        let config = state.dispatcher.config();
        state.dispatcher.set_config(max, config.delay_between_calls);
    }
    if let Some(number) = request.transfer_number {
        *state.services.transfer_number.write() = normalize_phone(&number);
    }
    agent_config_get(State(state)).await
}

/// GET /api/agent/transferred-calls
async fn transferred_calls_get(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };
    match persistence.transfers.list().await {
        Ok(records) => success(json!(records)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /api/agent/transferred-calls
async fn transferred_calls_delete(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };
    match persistence.transfers.delete_all().await {
        Ok(deleted) => success(json!({"deleted": deleted})),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default, rename = "durationFilter")]
    duration_filter: Option<String>,
}

/// GET /api/conversations
async fn conversations_list(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let filter = query
        .filter
        .as_deref()
        .map(ConversationFilter::parse)
        .unwrap_or_default();
    let duration = query
        .duration_filter
        .as_deref()
        .and_then(DurationFilter::parse);

    match persistence
        .conversations
        .list(page, limit, filter, duration)
        .await
    {
        Ok((records, total)) => success(json!({
            "conversations": records,
            "total": total,
            "page": page,
            "limit": limit,
        })),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/conversations/:call_id
async fn conversation_get(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    // A live call answers from memory before the row exists
    if let Some(record) = state.services.recorder.get(&call_id) {
        return success(json!(record));
    }
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::NOT_FOUND, "conversation not found");
    };
    match persistence.conversations.get(&call_id).await {
        Ok(Some(record)) => success(json!(record)),
        Ok(None) => failure(StatusCode::NOT_FOUND, "conversation not found"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /api/conversations
async fn conversations_delete(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };
    match persistence.conversations.delete_all().await {
        Ok(deleted) => success(json!({"deleted": deleted})),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest {
    user_id: Uuid,
    #[serde(default)]
    from_number: Option<String>,
}

/// POST /api/calls/initiate
async fn calls_initiate(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(persistence) = &state.services.persistence else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "persistence is not configured");
    };

    let lead = match persistence.leads.get(request.user_id).await {
        Ok(Some(lead)) => lead,
        Ok(None) => return failure(StatusCode::NOT_FOUND, "lead not found"),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let Some(raw_phone) = lead.phone.clone() else {
        return failure(StatusCode::BAD_REQUEST, "lead has no phone number");
    };
    let phone = normalize_phone(&raw_phone);

    // Duplicate-dial suppression: one live attempt per recipient
    let reservation = format!("manual-{}", Uuid::new_v4());
    if let Err(outdial_dialer::DialerError::AlreadyDialing {
        existing_call_id, ..
    }) = state.services.registry.try_reserve(&phone, &reservation)
    {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "phone is already being dialled",
                "existingCallId": existing_call_id,
            })),
        );
    }

    let did = match &request.from_number {
        Some(number) => {
            let number = normalize_phone(number);
            let code = area_code(&number).unwrap_or_default();
            Did {
                state: state_for_area_code(&code),
                number,
                area_code: code,
            }
        }
        None => match state.did_pool.select(&phone) {
            Ok((did, _)) => did,
            Err(e) => {
                state.services.registry.release(&phone);
                return failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
            }
        },
    };

    let driver = ProductionCallDriver::new(state.services.clone());
    match driver.originate(&lead, &did).await {
        Ok(originated) => {
            let call_id = originated.call_id.clone();
            state.services.registry.associate(&phone, &call_id);

            // Release the slot when the call resolves, however it resolves
            let registry = state.services.registry.clone();
            let timeout = state.dispatcher.config().call_timeout;
            let release_phone = phone.clone();
            let completion = originated.completion;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(timeout, completion).await;
                registry.release(&release_phone);
            });

            success(json!({
                "callControlId": call_id,
                "from": did.number,
                "to": phone,
            }))
        }
        Err(e) => {
            state.services.registry.release(&phone);
            let status = match e {
                CarrierError::InvalidNumber(_) => StatusCode::BAD_REQUEST,
                CarrierError::ChannelLimit => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            };
            failure(status, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HangupRequest {
    call_control_id: String,
}

/// POST /api/calls/hangup
async fn calls_hangup(
    State(state): State<AppState>,
    Json(request): Json<HangupRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(context) = state.services.contexts.get(&request.call_control_id) else {
        return failure(StatusCode::NOT_FOUND, "no active call with that id");
    };
    initiate_hangup(&state.services, &context).await;
    success(json!({"callControlId": request.call_control_id}))
}

/// GET /api/calls/active
async fn calls_active(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let calls: Vec<Value> = state
        .services
        .contexts
        .all()
        .into_iter()
        .map(|context| {
            json!({
                "callControlId": context.call_id,
                "leadId": context.lead.id,
                "leadName": context.lead.full_name(),
                "to": context.to_phone,
                "from": context.from_did,
                "active": context.is_active(),
                "transferred": context.is_transferred(),
            })
        })
        .collect();
    success(json!({"calls": calls, "count": calls.len()}))
}

/// GET /api/calls/:call_id/status
async fn call_status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if let Some(context) = state.services.contexts.get(&call_id) {
        let stage = context.engine.lock().await.stage();
        return success(json!({
            "callControlId": call_id,
            "active": context.is_active(),
            "pendingHangup": context.is_pending_hangup(),
            "transferred": context.is_transferred(),
            "stage": stage,
        }));
    }
    if let Some(persistence) = &state.services.persistence {
        if let Ok(Some(record)) = persistence.conversations.get(&call_id).await {
            return success(json!({
                "callControlId": call_id,
                "active": false,
                "status": record.status,
            }));
        }
    }
    failure(StatusCode::NOT_FOUND, "call not found")
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = serde_json::Map::new();
    let mut healthy = true;

    let did_count = state.did_pool.len();
    checks.insert(
        "did_pool".to_string(),
        json!({
            "status": if did_count > 0 { "ok" } else { "empty" },
            "count": did_count,
        }),
    );
    if did_count == 0 {
        healthy = false;
    }

    checks.insert(
        "dialer".to_string(),
        json!({
            "state": state.dispatcher.state(),
            "activeCalls": state.dispatcher.active_calls(),
        }),
    );

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "checks": checks,
        })),
    )
}

/// GET /ready
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = serde_json::Map::new();
    let mut ready = true;

    match &state.services.persistence {
        Some(persistence) => {
            let db_status = match tokio::time::timeout(
                Duration::from_secs(2),
                persistence.client.ping(),
            )
            .await
            {
                Ok(Ok(())) => "ok",
                Ok(Err(_)) => {
                    ready = false;
                    "error"
                }
                Err(_) => {
                    ready = false;
                    "timeout"
                }
            };
            checks.insert("database".to_string(), json!({"status": db_status}));
        }
        None => {
            checks.insert("database".to_string(), json!({"status": "disabled"}));
        }
    }

    checks.insert(
        "media_connections".to_string(),
        json!({
            "current": state
                .media_connections
                .load(std::sync::atomic::Ordering::SeqCst),
            "limit": state.max_media_connections(),
        }),
    );

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": checks,
        })),
    )
}
