//! src/services/metabase_service.rs
//!
//! MetabaseService — transactional metadata operations for two-phase object
//! uploads backed by SQLite. Segments are written speculatively while the
//! object row is Pending; `commit_object_with_segments` reconciles the
//! client's final segment list against store state and promotes the object
//! to Committed in one atomic transaction. This file intentionally knows
//! nothing about the physical upload pipeline or piece garbage collection;
//! it only tracks metadata and hands deleted-piece references downstream.

use crate::models::{
    object::{
        EncryptionParameters, FIXED_SEGMENT_SIZE_VARIES, Object, ObjectStatus, ObjectStream,
    },
    segment::{DeletedSegmentInfo, PieceId, RemotePiece, SegmentPosition},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, SqlitePool, Transaction, sqlite::Sqlite};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// How long a pending object may linger before the zombie cleaner is
/// allowed to reap it. Cleared on commit.
const ZOMBIE_DELETION_GRACE_HOURS: i64 = 24;

/// Client-declared positions that have no matching segment row, collected
/// across the whole reconciliation pass so a desynchronized client sees
/// every mismatch at once instead of one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchedSegments(Vec<SegmentPosition>);

impl MismatchedSegments {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn add(&mut self, position: SegmentPosition) {
        self.0.push(position);
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Offending positions, in submission order.
    pub fn positions(&self) -> &[SegmentPosition] {
        &self.0
    }
}

impl fmt::Display for MismatchedSegments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, position) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: segment not committed", position)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MetabaseError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("segments not in ascending order, got {0} before {1}")]
    SegmentOrder(SegmentPosition, SegmentPosition),
    #[error("segments and store do not match: {0}")]
    SegmentsMismatch(MismatchedSegments),
    #[error("object with specified version and pending status is missing")]
    ObjectNotFound,
    #[error("object already exists for this version and stream")]
    ObjectAlreadyExists,
    #[error("not all segment offsets were updated, expected {expected} got {affected}")]
    OffsetUpdateCount { expected: u64, affected: u64 },
    #[error("failed to decode remote pieces: {0}")]
    PieceListDecode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetabaseResult<T> = Result<T, MetabaseError>;

/// Arguments for creating the Pending object row that opens an upload.
#[derive(Clone, Debug)]
pub struct BeginObject {
    pub stream: ObjectStream,
    pub encryption: EncryptionParameters,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Arguments for the speculative per-segment write that happens while the
/// object is Pending.
#[derive(Clone, Debug)]
pub struct CommitSegment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub remote_pieces: Vec<RemotePiece>,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
}

/// Arguments for committing a pending object together with its final,
/// ordered segment list.
#[derive(Clone, Debug)]
pub struct CommitObjectWithSegments {
    pub stream: ObjectStream,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub segments: Vec<SegmentPosition>,
}

/// Store state for one segment, read at the start of the commit
/// transaction. This is the ground truth reconciliation compares against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SegmentInfoForCommit {
    position: SegmentPosition,
    encrypted_size: i32,
    plain_offset: i64,
    plain_size: i32,
}

/// A segment kept by reconciliation, carrying its store-known sizes and
/// the offset it had before the commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SegmentToCommit {
    position: SegmentPosition,
    old_plain_offset: i64,
    plain_size: i32,
    encrypted_size: i32,
}

/// MetabaseService provides the metadata operations of a two-phase upload:
/// - Begin object (insert the Pending row)
/// - Commit segment (upsert one segment row while Pending)
/// - Commit object with segments (reconcile, rewrite offsets, delete
///   orphans, and promote to Committed atomically)
///
/// Each call is an independent unit of work; no state is retained between
/// invocations and all exclusion is expressed through store transactions.
#[derive(Clone)]
pub struct MetabaseService {
    /// Shared SQLite connection pool used for all metadata operations.
    pub db: Arc<SqlitePool>,
}

impl MetabaseService {
    /// Create a new MetabaseService backed by the provided SQLite pool.
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert the Pending object row that opens an upload.
    ///
    /// The row carries a zombie-deletion deadline so abandoned uploads can
    /// be reaped externally; a successful commit clears it. A duplicate
    /// identity maps to `ObjectAlreadyExists`.
    pub async fn begin_object(&self, opts: BeginObject) -> MetabaseResult<Object> {
        opts.stream.verify().map_err(MetabaseError::InvalidRequest)?;
        if opts.encryption.cipher_suite != 0 && opts.encryption.block_size <= 0 {
            return Err(MetabaseError::InvalidRequest(format!(
                "encryption block size is invalid: {}",
                opts.encryption.block_size
            )));
        }

        let created_at = Utc::now();
        let zombie_deadline = created_at + Duration::hours(ZOMBIE_DELETION_GRACE_HOURS);

        let result = sqlx::query(
            "INSERT INTO objects (
                 project_id, bucket_name, object_key, version, stream_id,
                 status, segment_count,
                 total_plain_size, total_encrypted_size, fixed_segment_size,
                 encryption, created_at, expires_at, zombie_deletion_deadline
             ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0, 0, ?, ?, ?, ?)",
        )
        .bind(opts.stream.project_id)
        .bind(opts.stream.bucket_name.clone())
        .bind(opts.stream.object_key.clone())
        .bind(opts.stream.version)
        .bind(opts.stream.stream_id)
        .bind(ObjectStatus::Pending as i64)
        .bind(opts.encryption.encode())
        .bind(created_at)
        .bind(opts.expires_at)
        .bind(zombie_deadline)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(Object {
                stream: opts.stream,
                status: ObjectStatus::Pending,
                segment_count: 0,
                encrypted_metadata_nonce: None,
                encrypted_metadata: None,
                encrypted_metadata_encrypted_key: None,
                total_plain_size: 0,
                total_encrypted_size: 0,
                fixed_segment_size: 0,
                encryption: opts.encryption,
                created_at,
                expires_at: opts.expires_at,
            }),
            Err(err) if is_unique_violation(&err) => Err(MetabaseError::ObjectAlreadyExists),
            Err(err) => Err(MetabaseError::Sqlx(err)),
        }
    }

    /// Upsert one segment row for a pending stream.
    ///
    /// Re-uploading a position replaces the previous row; the final word on
    /// which segments belong to the object is spoken at object commit.
    pub async fn commit_segment(&self, opts: CommitSegment) -> MetabaseResult<()> {
        if opts.stream_id.is_nil() {
            return Err(MetabaseError::InvalidRequest("stream id missing".into()));
        }
        if opts.encrypted_size < 0 {
            return Err(MetabaseError::InvalidRequest(format!(
                "encrypted size is negative: {}",
                opts.encrypted_size
            )));
        }
        if opts.plain_size < 0 {
            return Err(MetabaseError::InvalidRequest(format!(
                "plain size is negative: {}",
                opts.plain_size
            )));
        }
        if opts.plain_offset < 0 {
            return Err(MetabaseError::InvalidRequest(format!(
                "plain offset is negative: {}",
                opts.plain_offset
            )));
        }
        if opts.root_piece_id.is_zero() && !opts.remote_pieces.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "inline segment cannot carry remote pieces".into(),
            ));
        }
        if !opts.root_piece_id.is_zero() && opts.remote_pieces.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "remote segment is missing remote pieces".into(),
            ));
        }

        let pending: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM objects WHERE stream_id = ? AND status = ?")
                .bind(opts.stream_id)
                .bind(ObjectStatus::Pending as i64)
                .fetch_optional(&*self.db)
                .await?;
        if pending.is_none() {
            return Err(MetabaseError::ObjectNotFound);
        }

        let remote_pieces = serde_json::to_string(&opts.remote_pieces)?;
        sqlx::query(
            "INSERT INTO segments (
                 stream_id, position, root_piece_id, remote_pieces,
                 encrypted_size, plain_offset, plain_size
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(stream_id, position) DO UPDATE SET
                 root_piece_id = excluded.root_piece_id,
                 remote_pieces = excluded.remote_pieces,
                 encrypted_size = excluded.encrypted_size,
                 plain_offset = excluded.plain_offset,
                 plain_size = excluded.plain_size",
        )
        .bind(opts.stream_id)
        .bind(opts.position.encode())
        .bind(opts.root_piece_id)
        .bind(remote_pieces)
        .bind(opts.encrypted_size)
        .bind(opts.plain_offset)
        .bind(opts.plain_size)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    /// Commit a pending object against the client's final segment list.
    ///
    /// Inside one transaction: read the segment snapshot, reconcile it with
    /// the client list, rewrite stale plain offsets, delete segments the
    /// client no longer references, and conditionally flip the object row
    /// from Pending to Committed. Any failure rolls the whole transaction
    /// back; a concurrent or repeated commit observes zero rows from the
    /// conditional update and fails with `ObjectNotFound` instead of
    /// committing twice.
    pub async fn commit_object_with_segments(
        &self,
        opts: CommitObjectWithSegments,
    ) -> MetabaseResult<(Object, Vec<DeletedSegmentInfo>)> {
        opts.stream.verify().map_err(MetabaseError::InvalidRequest)?;
        verify_segment_order(&opts.segments)?;

        let mut tx = self.db.begin().await?;

        let in_store = fetch_segments_for_commit(&mut tx, opts.stream.stream_id).await?;
        let (final_segments, to_delete) = determine_commit_actions(&opts.segments, &in_store)?;

        let updates = plan_offset_updates(&final_segments);
        update_segment_offsets(&mut tx, opts.stream.stream_id, &updates).await?;

        let deleted_segments =
            delete_segments_not_in_commit(&mut tx, opts.stream.stream_id, &to_delete).await?;

        let fixed_segment_size = fixed_segment_size(&final_segments);
        let mut total_plain_size: i64 = 0;
        let mut total_encrypted_size: i64 = 0;
        for segment in &final_segments {
            total_plain_size += segment.plain_size as i64;
            total_encrypted_size += segment.encrypted_size as i64;
        }

        let row: Option<(DateTime<Utc>, Option<DateTime<Utc>>, i64)> = sqlx::query_as(
            "UPDATE objects SET
                 status = ?,
                 segment_count = ?,

                 encrypted_metadata_nonce = ?,
                 encrypted_metadata = ?,
                 encrypted_metadata_encrypted_key = ?,

                 total_plain_size = ?,
                 total_encrypted_size = ?,
                 fixed_segment_size = ?,
                 zombie_deletion_deadline = NULL
             WHERE
                 project_id = ? AND
                 bucket_name = ? AND
                 object_key = ? AND
                 version = ? AND
                 stream_id = ? AND
                 status = ?
             RETURNING created_at, expires_at, encryption",
        )
        .bind(ObjectStatus::Committed as i64)
        .bind(final_segments.len() as i64)
        .bind(opts.encrypted_metadata_nonce.clone())
        .bind(opts.encrypted_metadata.clone())
        .bind(opts.encrypted_metadata_encrypted_key.clone())
        .bind(total_plain_size)
        .bind(total_encrypted_size)
        .bind(fixed_segment_size)
        .bind(opts.stream.project_id)
        .bind(opts.stream.bucket_name.clone())
        .bind(opts.stream.object_key.clone())
        .bind(opts.stream.version)
        .bind(opts.stream.stream_id)
        .bind(ObjectStatus::Pending as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((created_at, expires_at, encryption)) = row else {
            // The object is already committed, was deleted, or never existed
            // for this stream id. Dropping the transaction rolls back the
            // offset rewrites and deletions staged above.
            return Err(MetabaseError::ObjectNotFound);
        };

        tx.commit().await?;

        debug!(
            stream_id = %opts.stream.stream_id,
            segments = final_segments.len(),
            deleted = deleted_segments.len(),
            "committed object"
        );

        let object = Object {
            stream: opts.stream,
            status: ObjectStatus::Committed,
            segment_count: final_segments.len() as i32,
            encrypted_metadata_nonce: opts.encrypted_metadata_nonce,
            encrypted_metadata: opts.encrypted_metadata,
            encrypted_metadata_encrypted_key: opts.encrypted_metadata_encrypted_key,
            total_plain_size,
            total_encrypted_size,
            fixed_segment_size,
            encryption: EncryptionParameters::decode(encryption),
            created_at,
            expires_at,
        };
        Ok((object, deleted_segments))
    }
}

/// Reject a client segment list that is not strictly ascending. The empty
/// list is valid: committing an object with zero segments is allowed.
fn verify_segment_order(positions: &[SegmentPosition]) -> MetabaseResult<()> {
    for pair in positions.windows(2) {
        if pair[0] >= pair[1] {
            return Err(MetabaseError::SegmentOrder(pair[0], pair[1]));
        }
    }
    Ok(())
}

/// Load the segment rows persisted for the stream, ordered by position.
async fn fetch_segments_for_commit(
    tx: &mut Transaction<'_, Sqlite>,
    stream_id: Uuid,
) -> MetabaseResult<Vec<SegmentInfoForCommit>> {
    let rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
        "SELECT position, encrypted_size, plain_offset, plain_size
         FROM segments
         WHERE stream_id = ?
         ORDER BY position",
    )
    .bind(stream_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(position, encrypted_size, plain_offset, plain_size)| SegmentInfoForCommit {
                position: SegmentPosition::decode(position),
                encrypted_size: encrypted_size as i32,
                plain_offset,
                plain_size: plain_size as i32,
            },
        )
        .collect())
}

/// Merge-walk the client's ordered position list against the ordered store
/// snapshot and classify every position.
///
/// A position present in both lands in the commit set with its store-known
/// sizes and old offset. A store-only position goes into the delete set:
/// the client uploaded it but chose not to commit it. A client-only
/// position means the segment was deleted before commit finished or never
/// uploaded; every such position is collected and the commit fails as a
/// whole with no mutation.
fn determine_commit_actions(
    segments: &[SegmentPosition],
    segments_in_store: &[SegmentInfoForCommit],
) -> MetabaseResult<(Vec<SegmentToCommit>, Vec<SegmentPosition>)> {
    let mut commit = Vec::with_capacity(segments.len());
    let mut to_delete = Vec::new();
    let mut missing = MismatchedSegments::new();

    let mut i = 0;
    let mut j = 0;
    loop {
        match (segments.get(i), segments_in_store.get(j)) {
            (Some(&a), Some(b)) => {
                if a == b.position {
                    commit.push(SegmentToCommit {
                        position: a,
                        old_plain_offset: b.plain_offset,
                        plain_size: b.plain_size,
                        encrypted_size: b.encrypted_size,
                    });
                    i += 1;
                    j += 1;
                } else if a < b.position {
                    missing.add(a);
                    i += 1;
                } else {
                    to_delete.push(b.position);
                    j += 1;
                }
            }
            (Some(&a), None) => {
                missing.add(a);
                i += 1;
            }
            (None, Some(b)) => {
                to_delete.push(b.position);
                j += 1;
            }
            (None, None) => break,
        }
    }

    if !missing.is_empty() {
        return Err(MetabaseError::SegmentsMismatch(missing));
    }
    Ok((commit, to_delete))
}

/// Plan the minimal offset rewrite for the commit set.
///
/// The expected plain offset of each segment is the running sum of the
/// plain sizes before it. Rows whose stored offset already matches are
/// skipped, so a re-commit of an unchanged segment set plans no writes.
/// Returns `(encoded position, new plain offset)` pairs in position order.
fn plan_offset_updates(commit: &[SegmentToCommit]) -> Vec<(i64, i64)> {
    let mut updates = Vec::new();
    let mut expected_offset: i64 = 0;
    for segment in commit {
        if segment.old_plain_offset != expected_offset {
            updates.push((segment.position.encode(), expected_offset));
        }
        expected_offset += segment.plain_size as i64;
    }
    updates
}

/// Apply the planned offset rewrites as one set-based update.
///
/// The affected-row count must equal the plan size; anything else means
/// the store changed underneath the transaction and the commit must fail
/// rather than silently under-apply.
async fn update_segment_offsets(
    tx: &mut Transaction<'_, Sqlite>,
    stream_id: Uuid,
    updates: &[(i64, i64)],
) -> MetabaseResult<()> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut builder =
        QueryBuilder::<Sqlite>::new("UPDATE segments SET plain_offset = CASE position ");
    for (position, plain_offset) in updates {
        builder.push("WHEN ");
        builder.push_bind(*position);
        builder.push(" THEN ");
        builder.push_bind(*plain_offset);
        builder.push(" ");
    }
    builder.push("END WHERE stream_id = ");
    builder.push_bind(stream_id);
    builder.push(" AND position IN (");
    {
        let mut positions = builder.separated(", ");
        for (position, _) in updates {
            positions.push_bind(*position);
        }
    }
    builder.push(")");

    let result = builder.build().execute(&mut **tx).await?;
    let affected = result.rows_affected();
    if affected != updates.len() as u64 {
        return Err(MetabaseError::OffsetUpdateCount {
            expected: updates.len() as u64,
            affected,
        });
    }
    Ok(())
}

/// Delete the segments the client no longer references and return piece
/// references for the external garbage collector.
///
/// Deletion and the information return are one statement via RETURNING;
/// inline segments are removed but omitted from the result because they
/// have no physical pieces to collect.
async fn delete_segments_not_in_commit(
    tx: &mut Transaction<'_, Sqlite>,
    stream_id: Uuid,
    to_delete: &[SegmentPosition],
) -> MetabaseResult<Vec<DeletedSegmentInfo>> {
    if to_delete.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM segments WHERE stream_id = ");
    builder.push_bind(stream_id);
    builder.push(" AND position IN (");
    {
        let mut positions = builder.separated(", ");
        for position in to_delete {
            positions.push_bind(position.encode());
        }
    }
    builder.push(") RETURNING root_piece_id, remote_pieces");

    let rows: Vec<(PieceId, String)> = builder.build_query_as().fetch_all(&mut **tx).await?;

    let mut deleted = Vec::new();
    for (root_piece_id, remote_pieces) in rows {
        if root_piece_id.is_zero() {
            continue;
        }
        let pieces: Vec<RemotePiece> = serde_json::from_str(&remote_pieces)?;
        deleted.push(DeletedSegmentInfo {
            root_piece_id,
            pieces,
        });
    }
    Ok(deleted)
}

/// Compute the fixed-segment-size hint for the final commit set.
///
/// A positive value is the common encrypted size, allowing offset
/// computation without per-segment lookups. Multi-part objects and sets
/// where a non-last segment's size differs from the first's yield the
/// "varies" sentinel; an empty set yields 0.
fn fixed_segment_size(commit: &[SegmentToCommit]) -> i32 {
    let Some(first) = commit.first() else {
        return 0;
    };
    let common = first.encrypted_size;
    for (i, segment) in commit.iter().enumerate() {
        if segment.position.part != 0 {
            return FIXED_SEGMENT_SIZE_VARIES;
        }
        if i < commit.len() - 1 && segment.encrypted_size != common {
            return FIXED_SEGMENT_SIZE_VARIES;
        }
    }
    common
}

/// Return true if the SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

    fn pos(part: u32, index: u32) -> SegmentPosition {
        SegmentPosition { part, index }
    }

    fn info(position: SegmentPosition, sizes: (i32, i64, i32)) -> SegmentInfoForCommit {
        SegmentInfoForCommit {
            position,
            encrypted_size: sizes.0,
            plain_offset: sizes.1,
            plain_size: sizes.2,
        }
    }

    fn keep(position: SegmentPosition, old_offset: i64, sizes: (i32, i32)) -> SegmentToCommit {
        SegmentToCommit {
            position,
            old_plain_offset: old_offset,
            plain_size: sizes.1,
            encrypted_size: sizes.0,
        }
    }

    #[test]
    fn segment_order_accepts_ascending_and_empty() {
        assert!(verify_segment_order(&[]).is_ok());
        assert!(verify_segment_order(&[pos(0, 0)]).is_ok());
        assert!(verify_segment_order(&[pos(0, 0), pos(0, 1), pos(1, 0), pos(1, 5)]).is_ok());
    }

    #[test]
    fn segment_order_rejects_duplicates_and_decreases() {
        assert!(matches!(
            verify_segment_order(&[pos(0, 0), pos(0, 0)]),
            Err(MetabaseError::SegmentOrder(_, _))
        ));
        assert!(matches!(
            verify_segment_order(&[pos(0, 1), pos(0, 0)]),
            Err(MetabaseError::SegmentOrder(_, _))
        ));
        assert!(matches!(
            verify_segment_order(&[pos(1, 0), pos(0, 5)]),
            Err(MetabaseError::SegmentOrder(_, _))
        ));
    }

    #[test]
    fn commit_actions_matching_sets_keep_everything() {
        let store = vec![
            info(pos(0, 0), (10, 0, 10)),
            info(pos(0, 1), (10, 10, 10)),
        ];
        let (commit, to_delete) =
            determine_commit_actions(&[pos(0, 0), pos(0, 1)], &store).unwrap();
        assert_eq!(
            commit,
            vec![keep(pos(0, 0), 0, (10, 10)), keep(pos(0, 1), 10, (10, 10))]
        );
        assert!(to_delete.is_empty());
    }

    #[test]
    fn commit_actions_collects_every_missing_position() {
        let store = vec![info(pos(0, 1), (10, 0, 10))];
        let err =
            determine_commit_actions(&[pos(0, 0), pos(0, 1), pos(0, 2)], &store).unwrap_err();
        match err {
            MetabaseError::SegmentsMismatch(missing) => {
                assert_eq!(missing.positions(), &[pos(0, 0), pos(0, 2)]);
            }
            other => panic!("expected mismatch error, got {other:?}"),
        }
    }

    #[test]
    fn commit_actions_marks_unreferenced_rows_for_deletion() {
        let store = vec![
            info(pos(0, 0), (10, 0, 10)),
            info(pos(0, 1), (10, 10, 10)),
            info(pos(0, 2), (7, 20, 7)),
        ];
        let (commit, to_delete) =
            determine_commit_actions(&[pos(0, 0), pos(0, 2)], &store).unwrap();
        assert_eq!(
            commit,
            vec![keep(pos(0, 0), 0, (10, 10)), keep(pos(0, 2), 20, (7, 7))]
        );
        assert_eq!(to_delete, vec![pos(0, 1)]);
    }

    #[test]
    fn offset_plan_skips_rows_already_correct() {
        // First two rows already sit at their running-sum offsets; only the
        // third (20 instead of the expected 25) needs a rewrite.
        let commit = vec![
            keep(pos(0, 0), 0, (10, 10)),
            keep(pos(0, 1), 10, (15, 15)),
            keep(pos(0, 2), 20, (7, 7)),
        ];
        assert_eq!(plan_offset_updates(&commit), vec![(pos(0, 2).encode(), 25)]);
    }

    #[test]
    fn offset_plan_is_empty_for_unchanged_set() {
        let commit = vec![
            keep(pos(0, 0), 0, (10, 10)),
            keep(pos(0, 1), 10, (10, 10)),
            keep(pos(0, 2), 20, (7, 7)),
        ];
        assert!(plan_offset_updates(&commit).is_empty());
        assert!(plan_offset_updates(&[]).is_empty());
    }

    #[test]
    fn fixed_segment_size_rules() {
        // Uniform except the last segment: common size wins.
        let uniform_tail = vec![
            keep(pos(0, 0), 0, (10, 10)),
            keep(pos(0, 1), 10, (10, 10)),
            keep(pos(0, 2), 20, (7, 7)),
        ];
        assert_eq!(fixed_segment_size(&uniform_tail), 10);

        // Any non-zero part number means multi-part, so sizes vary.
        let multi_part = vec![keep(pos(0, 0), 0, (10, 10)), keep(pos(1, 0), 10, (5, 5))];
        assert_eq!(fixed_segment_size(&multi_part), FIXED_SEGMENT_SIZE_VARIES);

        // A non-last segment differing from the first also varies.
        let mixed = vec![
            keep(pos(0, 0), 0, (10, 10)),
            keep(pos(0, 1), 10, (8, 8)),
            keep(pos(0, 2), 18, (8, 8)),
        ];
        assert_eq!(fixed_segment_size(&mixed), FIXED_SEGMENT_SIZE_VARIES);

        assert_eq!(fixed_segment_size(&[]), 0);
    }

    async fn test_service() -> MetabaseService {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await.expect("apply schema");
        }
        MetabaseService::new(Arc::new(pool))
    }

    fn test_stream() -> ObjectStream {
        ObjectStream {
            project_id: Uuid::new_v4(),
            bucket_name: "bucket".into(),
            object_key: "photos/2026/img.jpg".into(),
            version: 1,
            stream_id: Uuid::new_v4(),
        }
    }

    fn remote_piece_id() -> PieceId {
        let mut id = vec![0u8; PieceId::SIZE];
        id[0] = 0xab;
        PieceId(id)
    }

    fn remote_pieces() -> Vec<RemotePiece> {
        vec![
            RemotePiece {
                number: 0,
                node_id: Uuid::new_v4(),
            },
            RemotePiece {
                number: 1,
                node_id: Uuid::new_v4(),
            },
        ]
    }

    async fn begin(service: &MetabaseService, stream: &ObjectStream) {
        service
            .begin_object(BeginObject {
                stream: stream.clone(),
                encryption: EncryptionParameters {
                    cipher_suite: 1,
                    block_size: 256,
                },
                expires_at: None,
            })
            .await
            .expect("begin object");
    }

    async fn put_segment(
        service: &MetabaseService,
        stream_id: Uuid,
        position: SegmentPosition,
        plain_offset: i64,
        size: i32,
        remote: bool,
    ) {
        let (root_piece_id, pieces) = if remote {
            (remote_piece_id(), remote_pieces())
        } else {
            (PieceId::zero(), Vec::new())
        };
        service
            .commit_segment(CommitSegment {
                stream_id,
                position,
                root_piece_id,
                remote_pieces: pieces,
                encrypted_size: size,
                plain_offset,
                plain_size: size,
            })
            .await
            .expect("commit segment");
    }

    fn commit_opts(stream: &ObjectStream, segments: Vec<SegmentPosition>) -> CommitObjectWithSegments {
        CommitObjectWithSegments {
            stream: stream.clone(),
            encrypted_metadata_nonce: Some(vec![1, 2, 3]),
            encrypted_metadata: Some(vec![4, 5, 6]),
            encrypted_metadata_encrypted_key: Some(vec![7, 8, 9]),
            segments,
        }
    }

    async fn stored_segments(service: &MetabaseService, stream_id: Uuid) -> Vec<(i64, i64)> {
        sqlx::query_as(
            "SELECT position, plain_offset FROM segments WHERE stream_id = ? ORDER BY position",
        )
        .bind(stream_id)
        .fetch_all(&*service.db)
        .await
        .expect("fetch segments")
    }

    #[tokio::test]
    async fn commit_empty_object() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        let (object, deleted) = service
            .commit_object_with_segments(commit_opts(&stream, vec![]))
            .await
            .expect("commit");

        assert_eq!(object.status, ObjectStatus::Committed);
        assert_eq!(object.segment_count, 0);
        assert_eq!(object.total_plain_size, 0);
        assert_eq!(object.total_encrypted_size, 0);
        assert_eq!(object.fixed_segment_size, 0);
        assert!(deleted.is_empty());
    }

    #[tokio::test]
    async fn commit_computes_aggregates_and_keeps_offsets() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 1), 10, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 2), 20, 7, true).await;

        let (object, deleted) = service
            .commit_object_with_segments(commit_opts(
                &stream,
                vec![pos(0, 0), pos(0, 1), pos(0, 2)],
            ))
            .await
            .expect("commit");

        assert_eq!(object.segment_count, 3);
        assert_eq!(object.total_plain_size, 27);
        assert_eq!(object.total_encrypted_size, 27);
        // Last segment differs, the rest are uniform.
        assert_eq!(object.fixed_segment_size, 10);
        assert!(deleted.is_empty());

        let rows = stored_segments(&service, stream.stream_id).await;
        assert_eq!(
            rows,
            vec![
                (pos(0, 0).encode(), 0),
                (pos(0, 1).encode(), 10),
                (pos(0, 2).encode(), 20),
            ]
        );
    }

    #[tokio::test]
    async fn commit_multi_part_marks_size_as_varying() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(1, 0), 10, 5, true).await;

        let (object, _) = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0), pos(1, 0)]))
            .await
            .expect("commit");

        assert_eq!(object.fixed_segment_size, FIXED_SEGMENT_SIZE_VARIES);
        assert_eq!(object.total_plain_size, 15);
    }

    #[tokio::test]
    async fn commit_rewrites_offsets_after_dropping_a_segment() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 1), 10, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 2), 20, 7, true).await;

        // The client drops 0/1; 0/2 must be renumbered from offset 20 to 10.
        let (object, deleted) = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0), pos(0, 2)]))
            .await
            .expect("commit");

        assert_eq!(object.segment_count, 2);
        assert_eq!(object.total_plain_size, 17);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].root_piece_id, remote_piece_id());
        assert_eq!(deleted[0].pieces.len(), 2);

        let rows = stored_segments(&service, stream.stream_id).await;
        assert_eq!(
            rows,
            vec![(pos(0, 0).encode(), 0), (pos(0, 2).encode(), 10)]
        );
    }

    #[tokio::test]
    async fn deleted_inline_segments_are_removed_but_not_reported() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 1), 10, 4, false).await;

        let (_, deleted) = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0)]))
            .await
            .expect("commit");

        // The inline segment has no pieces to garbage-collect.
        assert!(deleted.is_empty());
        let rows = stored_segments(&service, stream.stream_id).await;
        assert_eq!(rows, vec![(pos(0, 0).encode(), 0)]);
    }

    #[tokio::test]
    async fn commit_fails_when_client_claims_unknown_segments() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 1), 0, 10, true).await;

        let err = service
            .commit_object_with_segments(commit_opts(
                &stream,
                vec![pos(0, 0), pos(0, 1), pos(0, 2)],
            ))
            .await
            .unwrap_err();
        match err {
            MetabaseError::SegmentsMismatch(missing) => {
                assert_eq!(missing.positions(), &[pos(0, 0), pos(0, 2)]);
            }
            other => panic!("expected mismatch error, got {other:?}"),
        }

        // Nothing was mutated: the uploaded segment is still there with its
        // original offset and the object is still pending.
        let rows = stored_segments(&service, stream.stream_id).await;
        assert_eq!(rows, vec![(pos(0, 1).encode(), 0)]);
        let status: i64 = sqlx::query_scalar("SELECT status FROM objects WHERE stream_id = ?")
            .bind(stream.stream_id)
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(status, ObjectStatus::Pending as i64);
    }

    #[tokio::test]
    async fn commit_rejects_unordered_segment_list() {
        let service = test_service().await;
        let stream = test_stream();

        let err = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 1), pos(0, 0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::SegmentOrder(_, _)));
    }

    #[tokio::test]
    async fn second_commit_fails_and_rolls_back_staged_deletions() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 1), 10, 10, true).await;

        let (object, _) = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0), pos(0, 1)]))
            .await
            .expect("first commit");
        assert_eq!(object.segment_count, 2);

        // Sneak an extra segment row in behind the committed object, so the
        // second commit stages a deletion before its conditional update.
        sqlx::query(
            "INSERT INTO segments (stream_id, position, root_piece_id, remote_pieces,
                                   encrypted_size, plain_offset, plain_size)
             VALUES (?, ?, ?, '[]', 5, 20, 5)",
        )
        .bind(stream.stream_id)
        .bind(pos(0, 5).encode())
        .bind(remote_piece_id())
        .execute(&*service.db)
        .await
        .unwrap();

        let err = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0), pos(0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound));

        // Full rollback: the staged deletion of 0/5 must have been undone.
        let rows = stored_segments(&service, stream.stream_id).await;
        assert_eq!(
            rows,
            vec![
                (pos(0, 0).encode(), 0),
                (pos(0, 1).encode(), 10),
                (pos(0, 5).encode(), 20),
            ]
        );
    }

    #[tokio::test]
    async fn begin_object_rejects_duplicate_identity() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        let err = service
            .begin_object(BeginObject {
                stream: stream.clone(),
                encryption: EncryptionParameters::default(),
                expires_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectAlreadyExists));
    }

    #[tokio::test]
    async fn commit_segment_requires_pending_object() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        service
            .commit_object_with_segments(commit_opts(&stream, vec![]))
            .await
            .expect("commit");

        let err = service
            .commit_segment(CommitSegment {
                stream_id: stream.stream_id,
                position: pos(0, 0),
                root_piece_id: remote_piece_id(),
                remote_pieces: remote_pieces(),
                encrypted_size: 10,
                plain_offset: 0,
                plain_size: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::ObjectNotFound));
    }

    #[tokio::test]
    async fn commit_segment_validates_piece_consistency() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        // Inline segment carrying pieces.
        let err = service
            .commit_segment(CommitSegment {
                stream_id: stream.stream_id,
                position: pos(0, 0),
                root_piece_id: PieceId::zero(),
                remote_pieces: remote_pieces(),
                encrypted_size: 10,
                plain_offset: 0,
                plain_size: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)));

        // Remote segment without pieces.
        let err = service
            .commit_segment(CommitSegment {
                stream_id: stream.stream_id,
                position: pos(0, 0),
                root_piece_id: remote_piece_id(),
                remote_pieces: Vec::new(),
                encrypted_size: 10,
                plain_offset: 0,
                plain_size: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn reupload_replaces_segment_row() {
        let service = test_service().await;
        let stream = test_stream();
        begin(&service, &stream).await;

        put_segment(&service, stream.stream_id, pos(0, 0), 0, 10, true).await;
        put_segment(&service, stream.stream_id, pos(0, 0), 0, 12, true).await;

        let (object, _) = service
            .commit_object_with_segments(commit_opts(&stream, vec![pos(0, 0)]))
            .await
            .expect("commit");
        assert_eq!(object.total_plain_size, 12);
        assert_eq!(object.fixed_segment_size, 12);
    }
}
