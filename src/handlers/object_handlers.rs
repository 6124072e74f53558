//! HTTP handlers for the upload metadata operations.
//! Decodes JSON request bodies (binary fields travel base64 encoded) and
//! delegates all store concerns to `MetabaseService`.

use crate::{
    errors::AppError,
    models::{
        object::{EncryptionParameters, Object, ObjectStream},
        segment::{PieceId, RemotePiece, SegmentPosition},
    },
    services::metabase_service::{
        BeginObject, CommitObjectWithSegments, CommitSegment, MetabaseService,
    },
};
use axum::{Json, extract::State, http::StatusCode};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body for `POST /v1/objects` (begin object).
#[derive(Debug, Deserialize)]
pub struct BeginObjectRequest {
    pub stream: ObjectStream,
    #[serde(default)]
    pub encryption: EncryptionParameters,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request body for `POST /v1/segments` (commit segment).
#[derive(Debug, Deserialize)]
pub struct CommitSegmentRequest {
    pub stream_id: Uuid,
    pub position: SegmentPosition,

    /// Base64-encoded root piece id; omitted or empty for inline segments.
    #[serde(default)]
    pub root_piece_id: Option<String>,

    #[serde(default)]
    pub remote_pieces: Vec<RemotePiece>,

    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
}

/// Request body for `POST /v1/objects/commit`.
#[derive(Debug, Deserialize)]
pub struct CommitObjectRequest {
    pub stream: ObjectStream,

    /// Base64-encoded encrypted metadata fields.
    #[serde(default)]
    pub encrypted_metadata_nonce: Option<String>,
    #[serde(default)]
    pub encrypted_metadata: Option<String>,
    #[serde(default)]
    pub encrypted_metadata_encrypted_key: Option<String>,

    /// Final segment list, ascending by position.
    #[serde(default)]
    pub segments: Vec<SegmentPosition>,
}

/// One deleted remote segment, for the external garbage collector.
#[derive(Debug, Serialize)]
pub struct DeletedSegmentJson {
    /// Base64-encoded root piece id.
    pub root_piece_id: String,
    pub pieces: Vec<RemotePiece>,
}

/// Response body for `POST /v1/objects/commit`.
#[derive(Debug, Serialize)]
pub struct CommitObjectResponse {
    pub object: Object,
    pub deleted_segments: Vec<DeletedSegmentJson>,
}

/// POST `/v1/objects` — create the Pending object row.
pub async fn begin_object(
    State(service): State<MetabaseService>,
    Json(req): Json<BeginObjectRequest>,
) -> Result<(StatusCode, Json<Object>), AppError> {
    let object = service
        .begin_object(BeginObject {
            stream: req.stream,
            encryption: req.encryption,
            expires_at: req.expires_at,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(object)))
}

/// POST `/v1/segments` — upsert one segment row for a pending stream.
pub async fn commit_segment(
    State(service): State<MetabaseService>,
    Json(req): Json<CommitSegmentRequest>,
) -> Result<StatusCode, AppError> {
    let root_piece_id = match req.root_piece_id.as_deref() {
        Some(encoded) if !encoded.is_empty() => PieceId(decode_blob(encoded, "root_piece_id")?),
        _ => PieceId::zero(),
    };

    service
        .commit_segment(CommitSegment {
            stream_id: req.stream_id,
            position: req.position,
            root_piece_id,
            remote_pieces: req.remote_pieces,
            encrypted_size: req.encrypted_size,
            plain_offset: req.plain_offset,
            plain_size: req.plain_size,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/v1/objects/commit` — reconcile the segment list and promote the
/// object to Committed.
pub async fn commit_object(
    State(service): State<MetabaseService>,
    Json(req): Json<CommitObjectRequest>,
) -> Result<Json<CommitObjectResponse>, AppError> {
    let opts = CommitObjectWithSegments {
        stream: req.stream,
        encrypted_metadata_nonce: decode_opt_blob(
            req.encrypted_metadata_nonce.as_deref(),
            "encrypted_metadata_nonce",
        )?,
        encrypted_metadata: decode_opt_blob(req.encrypted_metadata.as_deref(), "encrypted_metadata")?,
        encrypted_metadata_encrypted_key: decode_opt_blob(
            req.encrypted_metadata_encrypted_key.as_deref(),
            "encrypted_metadata_encrypted_key",
        )?,
        segments: req.segments,
    };

    let (object, deleted) = service.commit_object_with_segments(opts).await?;

    let deleted_segments = deleted
        .into_iter()
        .map(|info| DeletedSegmentJson {
            root_piece_id: general_purpose::STANDARD.encode(&info.root_piece_id.0),
            pieces: info.pieces,
        })
        .collect();

    Ok(Json(CommitObjectResponse {
        object,
        deleted_segments,
    }))
}

fn decode_blob(encoded: &str, field: &str) -> Result<Vec<u8>, AppError> {
    general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| AppError::bad_request(format!("invalid base64 in {field}: {err}")))
}

fn decode_opt_blob(encoded: Option<&str>, field: &str) -> Result<Option<Vec<u8>>, AppError> {
    encoded
        .filter(|value| !value.is_empty())
        .map(|value| decode_blob(value, field))
        .transpose()
}
