//! Conversion webhook endpoints
//!
//! Answers `apiextensions.k8s.io/v1` ConversionReview requests for drives and
//! volumes. TLS is terminated in front of this listener.

use super::{Converter, Kind};
use crate::error::{Error, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const REVIEW_API_VERSION: &str = "apiextensions.k8s.io/v1";

// =============================================================================
// Review types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    #[serde(default)]
    pub objects: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    #[serde(default)]
    pub converted_objects: Vec<Value>,
    pub result: ConversionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// `Success` or `Failure`
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ConversionReview {
    fn answer(uid: String, outcome: Result<Vec<Value>>) -> Self {
        let response = match outcome {
            Ok(converted_objects) => ConversionResponse {
                uid,
                converted_objects,
                result: ConversionResult {
                    status: "Success".to_string(),
                    message: String::new(),
                },
            },
            Err(error) => ConversionResponse {
                uid,
                converted_objects: Vec::new(),
                result: ConversionResult {
                    status: "Failure".to_string(),
                    message: error.to_string(),
                },
            },
        };
        Self {
            api_version: REVIEW_API_VERSION.to_string(),
            kind: "ConversionReview".to_string(),
            request: None,
            response: Some(response),
        }
    }
}

/// Convert every object of a request, all of which must be of `kind`
pub fn convert(converter: &Converter, kind: Kind, request: &ConversionRequest) -> Result<Vec<Value>> {
    request
        .objects
        .iter()
        .map(|object| {
            let object_kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
            if Kind::parse(object_kind)? != kind {
                return Err(Error::KindUnsupported(object_kind.to_string()));
            }
            converter.migrate(object, &request.desired_api_version)
        })
        .collect()
}

// =============================================================================
// Router
// =============================================================================

/// Build the webhook router
pub fn router() -> Router {
    Router::new()
        .route("/convertdrive", post(convert_drive))
        .route("/convertvolume", post(convert_volume))
        .route("/readyz", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(Converter::global())
}

async fn convert_drive(
    State(converter): State<&'static Converter>,
    Json(review): Json<ConversionReview>,
) -> impl IntoResponse {
    handle(converter, Kind::Drive, review)
}

async fn convert_volume(
    State(converter): State<&'static Converter>,
    Json(review): Json<ConversionReview>,
) -> impl IntoResponse {
    handle(converter, Kind::Volume, review)
}

fn handle(converter: &Converter, kind: Kind, review: ConversionReview) -> axum::response::Response {
    let Some(request) = review.request else {
        return (StatusCode::BAD_REQUEST, "conversion review carries no request").into_response();
    };
    let outcome = convert(converter, kind, &request);
    if let Err(error) = &outcome {
        warn!(kind = %kind, uid = %request.uid, error = %error, "conversion failed");
    }
    Json(ConversionReview::answer(request.uid, outcome)).into_response()
}

async fn readiness_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Serve the webhook until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    info!("Conversion webhook listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind conversion webhook: {}", e)))?;

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Conversion webhook shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Conversion webhook error: {}", e)))?;

    Ok(())
}
