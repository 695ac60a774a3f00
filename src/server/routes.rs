use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::stream::Stream;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::AppState;
use crate::dispatch::InboundEvent;
use crate::reaper::TrackMessageRequest;
use crate::snapshot::ConfigDocument;
use crate::snapshot::builder::canonical_config;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    Router::new()
        .nest("/health", health_routes)
        .route("/chats", get(list_chats))
        .route(
            "/chats/{chat_id}/config",
            put(put_chat_config).get(get_chat_config).delete(delete_chat_config),
        )
        .route("/chats/{chat_id}/snapshot", get(get_snapshot))
        .route("/chats/{chat_id}/snapshot/rebuild", post(rebuild_snapshot))
        .route("/dispatch", post(dispatch_event))
        .route("/messages/track", post(track_message))
        .route("/messages/group-replace", post(group_replace))
        .route("/messages/group-cleanup", post(group_cleanup))
        .route("/admin/gc", post(run_gc))
        .route("/admin/stats", get(admin_stats))
        .route("/events", get(events_stream))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

// --- Chat configuration ---

#[tracing::instrument(skip_all, fields(chat_id = %chat_id))]
async fn put_chat_config(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let doc: ConfigDocument = match serde_json::from_value(body.clone()) {
        Ok(doc) => doc,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid configuration: {e}") })),
            );
        }
    };

    let (config_json, config_hash) = match canonical_config(&body) {
        Ok(pair) => pair,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid configuration: {e}") })),
            );
        }
    };

    if let Err(e) = state
        .store
        .set_chat_config(&chat_id, &doc.config_id, &config_json, &config_hash)
    {
        tracing::error!(error = %e, "failed to store chat config");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "storage error" })),
        );
    }

    // Compile eagerly so the loader learns about broken configs now, not on
    // the next user event. The config row is stored either way; a failed
    // build leaves the previous snapshot active.
    match state.builder.build_snapshot(&chat_id, true).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "configHash": config_hash,
                "commands": snapshot.commands.len(),
                "listeners": snapshot.listeners.len(),
                "diagnostics": snapshot.diagnostics,
            })),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "configHash": config_hash, "error": e.to_string() })),
        ),
    }
}

async fn list_chats(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.store.list_chat_ids() {
        Ok(ids) => (StatusCode::OK, Json(json!({ "chats": ids }))),
        Err(e) => {
            tracing::error!(error = %e, "failed to list chats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

async fn get_chat_config(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.store.get_chat_config(&chat_id) {
        Ok(Some(record)) => {
            let config: Value =
                serde_json::from_str(&record.config_json).unwrap_or(Value::Null);
            (
                StatusCode::OK,
                Json(json!({
                    "chatId": record.chat_id,
                    "configId": record.config_id,
                    "configHash": record.config_hash,
                    "updatedAt": record.updated_at,
                    "config": config,
                })),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat has no configuration" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to load chat config");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

async fn delete_chat_config(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.store.delete_chat_config(&chat_id) {
        Ok(removed) => (StatusCode::OK, Json(json!({ "removed": removed }))),
        Err(e) => {
            tracing::error!(error = %e, "failed to delete chat config");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.builder.build_snapshot(&chat_id, false).await {
        Ok(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ),
        },
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn rebuild_snapshot(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.builder.build_snapshot(&chat_id, true).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "configHash": snapshot.config_hash,
                "commands": snapshot.commands.len(),
                "listeners": snapshot.listeners.len(),
            })),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// --- Dispatch ---

#[tracing::instrument(skip_all)]
async fn dispatch_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Json<Value> {
    let outcome = state.dispatcher.dispatch(event).await;
    Json(json!({ "response": outcome.response }))
}

// --- TTL tracking (called by the adapter after it sends a message) ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackMessageBody {
    platform: String,
    chat_id: String,
    message_id: String,
    ttl_seconds: i64,
}

async fn track_message(
    State(state): State<AppState>,
    Json(body): Json<TrackMessageBody>,
) -> (StatusCode, Json<Value>) {
    let request = TrackMessageRequest {
        platform: body.platform,
        chat_id: body.chat_id,
        message_id: body.message_id,
        ttl_seconds: body.ttl_seconds,
        now: None,
    };
    match state.reaper.track_message(request) {
        Ok(tracked) => (StatusCode::OK, Json(json!({ "tracked": tracked }))),
        Err(e) => {
            tracing::error!(error = %e, "failed to track message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

// --- Replacement / cleanup groups (adapter bookkeeping) ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupReplaceBody {
    chat_id: String,
    group: String,
    message_id: String,
}

/// Record the group's new message; the adapter deletes whatever comes back.
async fn group_replace(
    State(state): State<AppState>,
    Json(body): Json<GroupReplaceBody>,
) -> Json<Value> {
    let prior = state.groups.replace(&body.chat_id, &body.group, &body.message_id);
    Json(json!({ "deletePrior": prior }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupCleanupBody {
    chat_id: String,
    group: String,
}

async fn group_cleanup(
    State(state): State<AppState>,
    Json(body): Json<GroupCleanupBody>,
) -> Json<Value> {
    let prior = state.groups.cleanup(&body.chat_id, &body.group);
    Json(json!({ "delete": prior }))
}

// --- Admin ---

async fn run_gc(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pruned = match state.builder.prune_stale_snapshots() {
        Ok(pruned) => pruned,
        Err(e) => {
            tracing::error!(error = %e, "snapshot pruning failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            );
        }
    };

    match state.builder.gc_orphan_bundles().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "prunedSnapshots": pruned,
                "deleted": report.deleted,
                "kept": report.kept,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "bundle gc failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

async fn admin_stats(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (states, flows) = state.flow_state.dump();
    match state.store.stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "store": stats,
                "flowStates": states.len(),
                "activeFlows": flows.len(),
                "trackedGroups": state.groups.dump().len(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to read store stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage error" })),
            )
        }
    }
}

// --- Dispatch event stream ---

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events_tx.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().data(data));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream)
}
