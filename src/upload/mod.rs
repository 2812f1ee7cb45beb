mod connection;
mod upload;

pub use connection::{Connection, PeerDownload, Wire};
pub use upload::{PeerLink, RequestOutcome, Upload, UploadTotals};

use crate::{BlockLength, BlockOffset, PieceIndex};

/// one block a peer asked us for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: PieceIndex,
    pub begin: BlockOffset,
    pub length: BlockLength,
}

impl BlockRequest {
    pub fn new(index: PieceIndex, begin: BlockOffset, length: BlockLength) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}
