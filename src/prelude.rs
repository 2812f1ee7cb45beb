pub use anyhow::Context as _;
pub use tracing::{debug, debug_span, error, info, instrument, trace, warn};
