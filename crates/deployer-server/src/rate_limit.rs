//! Per-source admission control
//!
//! Sliding window over the `ip_requests` table. Purge, count and insert run
//! inside one transaction so two admissions from the same source cannot both
//! squeeze through the last remaining slot. Running containers owned by the
//! source count against the window as well.

use crate::db::{DbError, DbPool};
use deployer_core::{epoch_now, DeployError};
use tracing::{debug, info, warn};

/// Outcome of one admission check, fed into metrics by the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { count: i64, limit: i64 },
}

pub struct RateLimiter {
    pool: DbPool,
    max_per_window: i64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(pool: DbPool, max_per_window: i64, window_secs: u64) -> Self {
        Self {
            pool,
            max_per_window,
            window_secs,
        }
    }

    /// Admit or reject a deploy from `ip`, recording the admission when it
    /// passes.
    pub async fn admit(&self, ip: &str) -> Result<Admission, DeployError> {
        if is_local(ip) {
            debug!(ip = %ip, "Rate limit skipped for local source");
            return Ok(Admission::Admitted);
        }

        let now = epoch_now();
        let cutoff = now - self.window_secs as i64;

        match self.admit_tx(ip, now, cutoff).await {
            Ok(admission) => {
                if let Admission::Rejected { count, limit } = &admission {
                    warn!(ip = %ip, count, limit, "Rate limit exceeded");
                }
                Ok(admission)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn admit_tx(&self, ip: &str, now: i64, cutoff: i64) -> Result<Admission, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serialize admissions per source: two concurrent deploys from the
        // same address must not both pass the count when one slot remains.
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&ip])
            .await?;

        // Rows outside the window are dead weight either way.
        tx.execute("DELETE FROM ip_requests WHERE request_time <= $1", &[&cutoff])
            .await?;

        let recent: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM ip_requests WHERE ip_address = $1 AND request_time > $2",
                &[&ip, &cutoff],
            )
            .await?
            .get(0);

        let active: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM containers WHERE ip_address = $1 AND status = 'running'",
                &[&ip],
            )
            .await?
            .get(0);

        let count = recent + active;
        if count >= self.max_per_window {
            tx.commit().await?;
            return Ok(Admission::Rejected {
                count,
                limit: self.max_per_window,
            });
        }

        tx.execute(
            "INSERT INTO ip_requests (ip_address, request_time) VALUES ($1, $2)
             ON CONFLICT (ip_address, request_time) DO NOTHING",
            &[&ip, &now],
        )
        .await?;
        tx.commit().await?;

        info!(ip = %ip, count = count + 1, limit = self.max_per_window, "Deploy admitted");
        Ok(Admission::Admitted)
    }
}

fn is_local(ip: &str) -> bool {
    ip == "127.0.0.1" || ip == "::1" || ip == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_sources_bypass() {
        assert!(is_local("127.0.0.1"));
        assert!(is_local("::1"));
        assert!(!is_local("10.0.0.1"));
        assert!(!is_local("127.0.0.2"));
    }

    #[test]
    fn test_rejection_carries_observed_count() {
        let rejected = Admission::Rejected { count: 5, limit: 5 };
        assert_ne!(rejected, Admission::Admitted);
    }
}
