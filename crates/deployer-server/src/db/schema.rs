//! Database schema and port-pool seeding

use super::{DbError, DbPool};
use tracing::info;

const SCHEMA_SQL: &str = r#"
-- CTF Deployer Schema

-- Challenge instances, one row per deploy; terminal rows kept for audit
CREATE TABLE IF NOT EXISTS containers (
    id TEXT PRIMARY KEY,
    port INTEGER NOT NULL,
    start_time BIGINT NOT NULL,
    expiration_time BIGINT NOT NULL,
    user_uuid TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running'
);

CREATE INDEX IF NOT EXISTS idx_containers_user_uuid ON containers (user_uuid);
CREATE INDEX IF NOT EXISTS idx_containers_expiration ON containers (expiration_time);
CREATE INDEX IF NOT EXISTS idx_containers_status ON containers (status);

-- One running instance per user, one user per port
CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_user_running
    ON containers (user_uuid) WHERE status = 'running';
CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_port_running
    ON containers (port) WHERE status = 'running';

-- Admission history for per-source rate limiting
CREATE TABLE IF NOT EXISTS ip_requests (
    ip_address TEXT NOT NULL,
    request_time BIGINT NOT NULL,
    PRIMARY KEY (ip_address, request_time)
);

CREATE INDEX IF NOT EXISTS idx_ip_requests_time ON ip_requests (request_time);

-- Port pool, pre-populated for the configured range
CREATE TABLE IF NOT EXISTS port_allocations (
    port INTEGER PRIMARY KEY,
    allocated BOOLEAN NOT NULL DEFAULT FALSE,
    container_id TEXT NULL,
    allocated_at BIGINT NULL,
    CHECK ((allocated AND container_id IS NOT NULL)
        OR (NOT allocated AND container_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_port_allocations_allocated ON port_allocations (allocated);
"#;

/// Create tables idempotently and seed the port pool for
/// `[start_range, stop_range)` when the table is empty.
pub async fn init_schema(pool: &DbPool, start_range: u16, stop_range: u16) -> Result<(), DbError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA_SQL).await?;

    let count: i64 = client
        .query_one("SELECT COUNT(*) FROM port_allocations", &[])
        .await?
        .get(0);

    if count == 0 {
        let inserted = client
            .execute(
                "INSERT INTO port_allocations (port, allocated)
                 SELECT gs, FALSE FROM generate_series($1::int, $2::int) gs
                 ON CONFLICT (port) DO NOTHING",
                &[&(start_range as i32), &(stop_range as i32 - 1)],
            )
            .await?;
        info!(ports = inserted, start_range, stop_range, "Seeded port allocation table");
    }

    info!("Database schema initialized");
    Ok(())
}
