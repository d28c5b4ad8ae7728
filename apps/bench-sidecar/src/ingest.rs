mod buffer;
mod ingestor;
mod liveness;
mod types;

#[cfg(test)]
mod tests;

pub(crate) use buffer::ChannelBuffer;
pub(crate) use liveness::LivenessTracker;
pub use types::{Channel, ChannelKind, DropReason, IngestOutcome, Sample};

use crate::state::{EngineStats, SharedState};
use std::sync::Arc;

pub const DEFAULT_BUCKET_RESOLUTION_MS: u64 = 10;

/// Accepts scalar measurements and appends them to the running session.
///
/// Cheap to clone; every clone shares the same engine state.
#[derive(Clone)]
pub struct TelemetryIngestor {
    state: SharedState,
    stats: Arc<EngineStats>,
    bucket_resolution_ms: u64,
}
