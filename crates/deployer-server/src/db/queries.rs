//! Queries over the deployer tables

use super::{DbError, DbPool};
use deployer_core::{ContainerRecord, ContainerStatus};
use tokio_postgres::Row;

const CONTAINER_COLUMNS: &str =
    "id, port, start_time, expiration_time, user_uuid, ip_address, status";

fn map_container(row: &Row) -> ContainerRecord {
    ContainerRecord {
        id: row.get(0),
        port: row.get::<_, i32>(1) as u16,
        start_time: row.get(2),
        expiration_time: row.get(3),
        user_uuid: row.get(4),
        ip_address: row.get(5),
        status: row
            .get::<_, String>(6)
            .parse()
            .unwrap_or(ContainerStatus::Removed),
    }
}

/// The user's running instance, if any.
pub async fn running_container_for_user(
    pool: &DbPool,
    user_uuid: &str,
) -> Result<Option<ContainerRecord>, DbError> {
    let client = pool.get().await?;
    let sql = format!(
        "SELECT {} FROM containers WHERE user_uuid = $1 AND status = 'running'",
        CONTAINER_COLUMNS
    );
    let row = client.query_opt(sql.as_str(), &[&user_uuid]).await?;
    Ok(row.as_ref().map(map_container))
}

pub async fn get_container(pool: &DbPool, id: &str) -> Result<Option<ContainerRecord>, DbError> {
    let client = pool.get().await?;
    let sql = format!("SELECT {} FROM containers WHERE id = $1", CONTAINER_COLUMNS);
    let row = client.query_opt(sql.as_str(), &[&id]).await?;
    Ok(row.as_ref().map(map_container))
}

pub async fn insert_container(pool: &DbPool, record: &ContainerRecord) -> Result<(), DbError> {
    let client = pool.get().await?;
    client
        .execute(
            "INSERT INTO containers (id, port, start_time, expiration_time, user_uuid, ip_address, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &record.id,
                &(record.port as i32),
                &record.start_time,
                &record.expiration_time,
                &record.user_uuid,
                &record.ip_address,
                &record.status.as_str(),
            ],
        )
        .await?;
    Ok(())
}

pub async fn update_expiration(
    pool: &DbPool,
    id: &str,
    expiration_time: i64,
) -> Result<u64, DbError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE containers SET expiration_time = $1 WHERE id = $2 AND status = 'running'",
            &[&expiration_time, &id],
        )
        .await?;
    Ok(updated)
}

/// Authoritative expiration for a container, re-read by monitors on wake.
pub async fn container_deadline(
    pool: &DbPool,
    id: &str,
) -> Result<Option<(i64, ContainerStatus)>, DbError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT expiration_time, status FROM containers WHERE id = $1",
            &[&id],
        )
        .await?;
    Ok(row.map(|row| {
        (
            row.get(0),
            row.get::<_, String>(1)
                .parse()
                .unwrap_or(ContainerStatus::Removed),
        )
    }))
}

/// Oldest-first batch of running containers past their expiration.
pub async fn expired_running_containers(
    pool: &DbPool,
    now: i64,
    limit: i64,
) -> Result<Vec<ContainerRecord>, DbError> {
    let client = pool.get().await?;
    let sql = format!(
        "SELECT {} FROM containers
         WHERE status = 'running' AND expiration_time <= $1
         ORDER BY expiration_time ASC LIMIT $2",
        CONTAINER_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[&now, &limit]).await?;
    Ok(rows.iter().map(map_container).collect())
}

pub async fn running_container_count(pool: &DbPool) -> Result<i64, DbError> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM containers WHERE status = 'running'",
            &[],
        )
        .await?;
    Ok(row.get(0))
}

pub async fn total_container_count(pool: &DbPool) -> Result<i64, DbError> {
    let client = pool.get().await?;
    let row = client.query_one("SELECT COUNT(*) FROM containers", &[]).await?;
    Ok(row.get(0))
}

/// All container rows, running first, newest first within each state.
pub async fn all_containers(pool: &DbPool) -> Result<Vec<ContainerRecord>, DbError> {
    let client = pool.get().await?;
    let sql = format!(
        "SELECT {} FROM containers
         ORDER BY (status = 'running') DESC, start_time DESC",
        CONTAINER_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[]).await?;
    Ok(rows.iter().map(map_container).collect())
}

/// All running container ids, used by the port sweep and shutdown paths.
pub async fn running_container_ids(pool: &DbPool) -> Result<Vec<String>, DbError> {
    let client = pool.get().await?;
    let rows = client
        .query("SELECT id FROM containers WHERE status = 'running'", &[])
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// `(total, allocated)` counts of the port pool.
pub async fn port_pool_counts(pool: &DbPool) -> Result<(i64, i64), DbError> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE allocated) FROM port_allocations",
            &[],
        )
        .await?;
    Ok((row.get(0), row.get(1)))
}

/// Move a running container to a terminal state and release its port in one
/// transaction. Idempotent: a second call finds no running row and changes
/// nothing.
pub async fn finalize_container(
    pool: &DbPool,
    id: &str,
    port: u16,
    status: ContainerStatus,
) -> Result<bool, DbError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let updated = tx
        .execute(
            "UPDATE containers SET status = $1 WHERE id = $2 AND status = 'running'",
            &[&status.as_str(), &id],
        )
        .await?;
    tx.execute(
        "UPDATE port_allocations
         SET allocated = FALSE, container_id = NULL, allocated_at = NULL
         WHERE port = $1 AND allocated",
        &[&(port as i32)],
    )
    .await?;

    tx.commit().await?;
    Ok(updated > 0)
}

pub async fn purge_ip_requests(pool: &DbPool, cutoff: i64) -> Result<u64, DbError> {
    let client = pool.get().await?;
    let purged = client
        .execute("DELETE FROM ip_requests WHERE request_time <= $1", &[&cutoff])
        .await?;
    Ok(purged)
}
