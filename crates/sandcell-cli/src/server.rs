//! HTTP frontend
//!
//! - `POST /api/v1/compiler` with a JSON body
//! - `GET  /api/v1/compiler?code=...&capability=fs,path`
//! - `GET  /health`
//!
//! Anything else answers 404 with a JSON error.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandcell_core::{parse_query, CompilerService, RequestError, RunReply};
use serde_json::{json, Value};
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(service: CompilerService) -> Router {
    Router::new()
        .route("/api/v1/compiler", post(compile_body).get(compile_query))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve until Ctrl-C
pub async fn serve(host: &str, port: u16, service: CompilerService) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "sandcell listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn compile_body(
    State(service): State<CompilerService>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let reply = match payload {
        Ok(Json(body)) => service.run(&body).await,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "malformed request body");
            RunReply::rejected(&RequestError::NotAnObject)
        }
    };
    respond(reply)
}

async fn compile_query(
    State(service): State<CompilerService>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let reply = match parse_query(&params) {
        Ok(request) => service.execute(&request).await,
        Err(err) => RunReply::rejected(&err),
    };
    respond(reply)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route does not exist" })),
    )
        .into_response()
}

fn respond(reply: RunReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}
