mod piece_picker;

pub use piece_picker::PiecePicker;

use crate::PieceIndex;

/// number of connected peers that have a piece we are tracking.
type PieceFreq = usize;

/// pieces sharing one interest level, stored as a list-as-set: removal swaps the last entry
/// into the hole, and every piece remembers its slot in `PiecePicker::pos_in_interests`.
type InterestBucket = Vec<PieceIndex>;
