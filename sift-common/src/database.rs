//! Connection-pool construction shared by every worker process.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

const POOL_MIN_CONNECTIONS: u32 = 1;
const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(300);
const CONNECTION_MAX_IDLE: Duration = Duration::from_secs(60);

/// One lazily-connecting pool per worker process, shared by its stores and
/// queue handles. Connections are recycled on a short lifetime so long-lived
/// workers survive database failovers.
pub fn build_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(max_connections)
        .max_lifetime(CONNECTION_MAX_LIFETIME)
        .idle_timeout(CONNECTION_MAX_IDLE)
        .connect_lazy(url)
}
