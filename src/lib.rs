//! Scheduling core of a swarm download: which piece to ask for next, how fast to serve
//! blocks to peers under a global cap, and how to report the health of the swarm.
//!
//! Everything in here is driven from a single event-loop thread. Network and disk live
//! behind the [`transport::Transport`] and [`storage::Storage`] traits, and a [`session::Session`]
//! ties the pieces together for one download.

pub mod choker;
pub mod config;
pub mod feedback;
pub mod measure;
pub mod piece_picker;
pub mod prelude;
pub mod rate_limiter;
pub mod session;
pub mod sim;
pub mod storage;
pub mod torrent;
pub mod transport;
pub mod upload;

pub use choker::{ChokeCandidate, ChokeDecision, Choker, RoundRobinChoker};
pub use config::EngineConfig;
pub use feedback::{DownloaderFeedback, Statistics};
pub use measure::Measure;
pub use piece_picker::PiecePicker;
pub use rate_limiter::{Deadline, RateLimiter, Scheduler, SendQueue};
pub use session::{Session, SessionError};
pub use storage::{MemoryStorage, PieceStore, Storage, StorageError, StorageStats};
pub use torrent::{Bitfield, PeerId};
pub use transport::{SendError, Transport};
pub use upload::{BlockRequest, Connection, RequestOutcome, Upload};

pub type PieceIndex = usize;
pub type PieceLength = u32;
pub type BlockOffset = u32;
pub type BlockLength = u32;

/// Handle of one peer connection, unique for the life of a [`Session`].
pub type ConnId = usize;
