//! Defines routes for the upload metadata API.
//!
//! ## Structure
//! - **Object-level endpoints**
//!   - `POST /v1/objects`        — begin object (create the Pending row)
//!   - `POST /v1/objects/commit` — commit object with its final segment list
//!
//! - **Segment-level endpoints**
//!   - `POST /v1/segments`       — commit one segment for a pending stream
//!
//! Binary fields (metadata blobs, piece ids) cross the API base64 encoded.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{begin_object, commit_object, commit_segment},
    },
    services::metabase_service::MetabaseService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all metadata routes.
///
/// The router carries shared state (`MetabaseService`) to all handlers.
pub fn routes() -> Router<MetabaseService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object-level routes
        .route("/v1/objects", post(begin_object))
        .route("/v1/objects/commit", post(commit_object))
        // Segment-level routes
        .route("/v1/segments", post(commit_segment))
}
