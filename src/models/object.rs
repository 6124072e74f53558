//! Object-level types: stream identity, lifecycle status, encryption
//! parameters, and rows of the `objects` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel value of `fixed_segment_size` meaning segment sizes vary and
/// offsets must be computed per segment.
pub const FIXED_SEGMENT_SIZE_VARIES: i32 = -1;

/// Identity of one upload attempt for an object.
///
/// The stream id distinguishes concurrent re-uploads of the same
/// key/version; every segment row is keyed by it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectStream {
    /// Owning project.
    pub project_id: Uuid,

    /// Bucket the object lives in.
    pub bucket_name: String,

    /// Object key within the bucket.
    pub object_key: String,

    /// Object version.
    pub version: i64,

    /// Upload attempt identifier.
    pub stream_id: Uuid,
}

impl ObjectStream {
    /// Check the identity fields before touching the store.
    pub fn verify(&self) -> Result<(), String> {
        if self.project_id.is_nil() {
            return Err("project id missing".into());
        }
        if self.bucket_name.is_empty() {
            return Err("bucket name missing".into());
        }
        if self.object_key.is_empty() {
            return Err("object key missing".into());
        }
        if self.version <= 0 {
            return Err(format!("version is invalid: {}", self.version));
        }
        if self.stream_id.is_nil() {
            return Err("stream id missing".into());
        }
        Ok(())
    }
}

/// Lifecycle status of an object row.
///
/// The only transition in this service is Pending -> Committed, performed
/// exactly once by the commit operation's conditional update.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Segments may still be uploaded.
    Pending = 1,

    /// The object is finalized and immutable.
    Committed = 3,
}

/// Encryption parameters of an object, packed into a single integer
/// column: cipher suite in the high 32 bits, block size in the low 32.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncryptionParameters {
    /// Cipher suite identifier.
    pub cipher_suite: u8,

    /// Encryption block size in bytes.
    pub block_size: i32,
}

impl EncryptionParameters {
    pub fn encode(self) -> i64 {
        ((self.cipher_suite as i64) << 32) | (self.block_size as u32) as i64
    }

    pub fn decode(value: i64) -> Self {
        Self {
            cipher_suite: (value >> 32) as u8,
            block_size: value as i32,
        }
    }
}

/// A row of the `objects` table.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Object {
    /// Identity of the upload this row tracks.
    #[serde(flatten)]
    pub stream: ObjectStream,

    /// Lifecycle status.
    pub status: ObjectStatus,

    /// Number of segments in the committed object.
    pub segment_count: i32,

    /// Nonce used to encrypt the metadata blob.
    pub encrypted_metadata_nonce: Option<Vec<u8>>,

    /// Encrypted user metadata.
    pub encrypted_metadata: Option<Vec<u8>>,

    /// Metadata key, wrapped with the object key.
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,

    /// Sum of plain sizes over all segments.
    pub total_plain_size: i64,

    /// Sum of encrypted sizes over all segments.
    pub total_encrypted_size: i64,

    /// Common encrypted segment size, 0 for an empty object, or
    /// [`FIXED_SEGMENT_SIZE_VARIES`] when sizes differ.
    pub fixed_segment_size: i32,

    /// Encryption parameters for the object's content.
    pub encryption: EncryptionParameters,

    /// Creation time of the pending row.
    pub created_at: DateTime<Utc>,

    /// Optional expiry time.
    pub expires_at: Option<DateTime<Utc>>,
}
