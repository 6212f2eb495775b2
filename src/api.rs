//! HTTP request/response surface
//!
//! - `POST /publish` - [`PublishRequest`] body, answers `{"result": "sent"|"queued"}`
//! - `POST /subscribe` - `{topic, caller, permanent?}`
//! - `POST /unsubscribe` - `{topic, caller}`
//! - `GET /status` - [`BrokerStatus`](crate::broker::BrokerStatus)
//! - `GET /metrics` - [`MetricsSnapshot`](crate::observability::MetricsSnapshot)

use crate::broker::{ConnectionManager, PublishOutcome, PublishRequest, Purpose, SubscribeOutcome};
use crate::config::ApiSection;
use crate::error::BrokerError;
use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, Instrument};
use warp::http::StatusCode;
use warp::reply::{json, with_status, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API bind address '{address}': {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },
    #[error("Failed to bind API server: {0}")]
    Bind(#[from] warp::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
    pub caller: String,
    /// Declare the reference non-removable through `/unsubscribe`
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub topic: String,
    pub caller: String,
}

#[derive(Debug, Serialize)]
struct ResultResponse<T: Serialize> {
    result: T,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

fn status_for(error: &BrokerError) -> StatusCode {
    match error {
        BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
        BrokerError::ProtectedReference { .. } => StatusCode::FORBIDDEN,
        BrokerError::Transport(_) => StatusCode::BAD_GATEWAY,
        BrokerError::Configuration(_) | BrokerError::Queue(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply(error: &BrokerError) -> WithStatus<Json> {
    with_status(
        json(&ErrorResponse {
            error: error.to_string(),
            kind: error.kind(),
        }),
        status_for(error),
    )
}

fn ok_reply<T: Serialize>(result: T) -> WithStatus<Json> {
    with_status(json(&ResultResponse { result }), StatusCode::OK)
}

fn with_manager(
    manager: Arc<ConnectionManager>,
) -> impl Filter<Extract = (Arc<ConnectionManager>,), Error = Infallible> + Clone {
    warp::any().map(move || manager.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

async fn handle_publish(
    request: PublishRequest,
    manager: Arc<ConnectionManager>,
) -> Result<WithStatus<Json>, Infallible> {
    let span = crate::api_span!(route = "publish", topic = %request.topic);
    let result = manager.publish_request(request).instrument(span).await;
    Ok(match result {
        Ok(PublishOutcome::Sent) => ok_reply("sent"),
        Ok(PublishOutcome::Queued) => ok_reply("queued"),
        Err(e) => error_reply(&e),
    })
}

async fn handle_subscribe(
    request: SubscribeRequest,
    manager: Arc<ConnectionManager>,
) -> Result<WithStatus<Json>, Infallible> {
    let purpose = if request.permanent {
        Purpose::ApiPermanent
    } else {
        Purpose::Api
    };
    let span = crate::api_span!(route = "subscribe", topic = %request.topic, caller = %request.caller);
    let result = manager
        .subscribe(&request.topic, purpose, request.caller.as_str())
        .instrument(span)
        .await;
    Ok(match result {
        Ok(outcome) => ok_reply::<SubscribeOutcome>(outcome),
        Err(e) => error_reply(&e),
    })
}

async fn handle_unsubscribe(
    request: UnsubscribeRequest,
    manager: Arc<ConnectionManager>,
) -> Result<WithStatus<Json>, Infallible> {
    let span = crate::api_span!(route = "unsubscribe", topic = %request.topic, caller = %request.caller);
    let result = manager
        .unsubscribe_reference(&request.topic, request.caller.as_str())
        .instrument(span)
        .await;
    Ok(match result {
        Ok(()) => ok_reply("unsubscribed"),
        Err(e) => error_reply(&e),
    })
}

async fn handle_status(manager: Arc<ConnectionManager>) -> Result<Json, Infallible> {
    Ok(json(&manager.status().await))
}

/// All API routes
pub fn routes(
    manager: Arc<ConnectionManager>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let publish = warp::path("publish")
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<PublishRequest>())
        .and(with_manager(manager.clone()))
        .and_then(handle_publish);

    let subscribe = warp::path("subscribe")
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<SubscribeRequest>())
        .and(with_manager(manager.clone()))
        .and_then(handle_subscribe);

    let unsubscribe = warp::path("unsubscribe")
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<UnsubscribeRequest>())
        .and(with_manager(manager.clone()))
        .and_then(handle_unsubscribe);

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_manager(manager))
        .and_then(handle_status);

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| json(&metrics().get_metrics()));

    publish
        .or(subscribe)
        .or(unsubscribe)
        .or(status)
        .or(metrics_route)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    manager: Arc<ConnectionManager>,
    section: &ApiSection,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ApiError> {
    let address = format!("{}:{}", section.bind, section.port);
    let addr: SocketAddr = address
        .parse()
        .map_err(|source| ApiError::InvalidAddress {
            address: address.clone(),
            source,
        })?;

    let (bound, server) =
        warp::serve(routes(manager)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(address = %bound, "HTTP API listening");
    server.await;
    Ok(())
}
