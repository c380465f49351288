use std::time::Instant;

use cs_sync::SyncEngine;

/// Shared state behind every handler.
pub struct ApiState {
    pub engine: SyncEngine,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}
