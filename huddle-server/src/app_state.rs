use std::{fmt, sync::Arc};

use shared::config::server::Config;

use crate::services::{ChatEngine, event_publisher::BroadcastPublisher};

/// Shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub engine: ChatEngine,
    /// Source of the SSE stream; the engine publishes into the same channel.
    pub events: Arc<BroadcastPublisher>,
    /// `None` when serving from the in-memory store.
    pub pool: Option<sqlx::PgPool>,
    pub config: Arc<Config>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("events", &self.events)
            .field("database", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}
