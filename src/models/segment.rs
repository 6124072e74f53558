//! Segment-level types: positions, piece placement, and rows of the
//! `segments` table.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position of a segment within an object: a major part number and a
/// minor index within that part.
///
/// Ordering is lexicographic on `(part, index)`, which matches the derive
/// order below. The encoded form keeps that ordering, so the store can
/// sort and range-scan on the encoded column directly.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentPosition {
    /// Part number (major component). Zero for single-part uploads.
    pub part: u32,

    /// Index of the segment within the part (minor component).
    pub index: u32,
}

impl SegmentPosition {
    /// Encode the position as a single sortable integer: the part number in
    /// the high 32 bits, the index in the low 32 bits.
    pub fn encode(self) -> i64 {
        ((self.part as i64) << 32) | self.index as i64
    }

    /// Inverse of [`SegmentPosition::encode`].
    pub fn decode(value: i64) -> Self {
        Self {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// Identifier of the erasure-coded piece set backing one remote segment.
///
/// A zero-valued (or empty) id marks an inline segment, which has no
/// physical pieces on storage nodes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(transparent)]
pub struct PieceId(pub Vec<u8>);

impl PieceId {
    /// Length of a root piece id in bytes.
    pub const SIZE: usize = 32;

    /// Zero-valued id used for inline segments.
    pub fn zero() -> Self {
        Self(vec![0; Self::SIZE])
    }

    /// True when this id denotes an inline segment.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Placement of one erasure-coded piece on a storage node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemotePiece {
    /// Piece number within the erasure-coded set.
    pub number: u16,

    /// Storage node holding the piece.
    pub node_id: Uuid,
}

/// A row of the `segments` table.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Segment {
    /// Stream the segment belongs to.
    pub stream_id: Uuid,

    /// Position within the object.
    pub position: SegmentPosition,

    /// Root piece id; zero for inline segments.
    pub root_piece_id: PieceId,

    /// Piece placement for remote segments; empty for inline ones.
    pub remote_pieces: Vec<RemotePiece>,

    /// Size of the encrypted segment data in bytes.
    pub encrypted_size: i32,

    /// Byte offset of the segment in the object's plaintext.
    pub plain_offset: i64,

    /// Length of the segment in the object's plaintext.
    pub plain_size: i32,
}

/// Reference to the pieces of a segment removed during commit, handed to
/// the external garbage collector. Inline segments never produce one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeletedSegmentInfo {
    /// Root piece id of the deleted segment.
    pub root_piece_id: PieceId,

    /// Remote pieces that backed the segment.
    pub pieces: Vec<RemotePiece>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_encoding_roundtrip() {
        let positions = [
            SegmentPosition { part: 0, index: 0 },
            SegmentPosition { part: 0, index: 7 },
            SegmentPosition { part: 3, index: 0 },
            SegmentPosition {
                part: 10,
                index: u32::MAX,
            },
        ];
        for pos in positions {
            assert_eq!(SegmentPosition::decode(pos.encode()), pos);
        }
    }

    #[test]
    fn position_encoding_is_monotonic() {
        let ordered = [
            SegmentPosition { part: 0, index: 0 },
            SegmentPosition { part: 0, index: 1 },
            SegmentPosition { part: 0, index: 500 },
            SegmentPosition { part: 1, index: 0 },
            SegmentPosition { part: 1, index: 2 },
            SegmentPosition { part: 9, index: 0 },
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].encode() < pair[1].encode());
        }
    }

    #[test]
    fn zero_piece_id_is_inline() {
        assert!(PieceId::zero().is_zero());
        assert!(PieceId(Vec::new()).is_zero());

        let mut id = vec![0u8; PieceId::SIZE];
        id[5] = 1;
        assert!(!PieceId(id).is_zero());
    }
}
