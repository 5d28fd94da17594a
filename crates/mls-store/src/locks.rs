use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

/// Handle for a held per-site build slot.
#[derive(Debug, Clone)]
pub struct SiteSlot {
    pub site_id: String,
    pub holder: String,
    pub lease_expires_at: DateTime<Utc>,
}

impl Store {
    /// Atomically asserts no non-terminal build or agent run exists for the
    /// site and takes the `site_locks` row. The single serialization point:
    /// any number of workers may exist, but one job per site runs at a time.
    /// Re-acquisition by the current holder renews the lease, which is how a
    /// worker picks up a job whose slot was taken at enqueue time.
    pub async fn acquire_site_slot(
        &self,
        site_id: &str,
        holder: &str,
        lease: Duration,
    ) -> StoreResult<SiteSlot> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let held: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, lease_expires_at FROM site_locks WHERE site_id = ?1",
                params![site_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((other_holder, expires_raw)) = held {
            if other_holder == holder {
                let lease_expires_at = now + lease;
                tx.execute(
                    "UPDATE site_locks SET lease_expires_at = ?2 WHERE site_id = ?1",
                    params![site_id, to_rfc3339(lease_expires_at)],
                )?;
                tx.commit()?;
                return Ok(SiteSlot {
                    site_id: site_id.to_string(),
                    holder: holder.to_string(),
                    lease_expires_at,
                });
            }
            let expires = parse_ts("site_locks", "lease_expires_at", &expires_raw)?;
            if expires > now {
                return Err(StoreError::AlreadyInProgress {
                    site_id: site_id.to_string(),
                });
            }
            tx.execute(
                "DELETE FROM site_locks WHERE site_id = ?1",
                params![site_id],
            )?;
        }

        let active_builds: i64 = tx.query_row(
            "SELECT COUNT(*) FROM builds WHERE site_id = ?1
             AND status IN ('crawling', 'optimizing', 'deploying')",
            params![site_id],
            |row| row.get(0),
        )?;
        let active_runs: i64 = tx.query_row(
            "SELECT COUNT(*) FROM agent_runs WHERE site_id = ?1
             AND phase NOT IN ('complete', 'failed')",
            params![site_id],
            |row| row.get(0),
        )?;
        if active_builds > 0 || active_runs > 0 {
            return Err(StoreError::AlreadyInProgress {
                site_id: site_id.to_string(),
            });
        }

        let lease_expires_at = now + lease;
        tx.execute(
            "INSERT INTO site_locks (site_id, holder, lease_expires_at, acquired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                site_id,
                holder,
                to_rfc3339(lease_expires_at),
                to_rfc3339(now)
            ],
        )?;
        tx.commit()?;
        Ok(SiteSlot {
            site_id: site_id.to_string(),
            holder: holder.to_string(),
            lease_expires_at,
        })
    }

    pub async fn renew_site_slot(
        &self,
        site_id: &str,
        holder: &str,
        lease: Duration,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE site_locks SET lease_expires_at = ?3 WHERE site_id = ?1 AND holder = ?2",
            params![site_id, holder, to_rfc3339(Utc::now() + lease)],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("site slot", site_id));
        }
        Ok(())
    }

    pub async fn release_site_slot(&self, site_id: &str, holder: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM site_locks WHERE site_id = ?1 AND holder = ?2",
            params![site_id, holder],
        )?;
        Ok(())
    }

    /// Crash recovery: drop the lock row regardless of holder.
    pub async fn break_site_slot(&self, site_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM site_locks WHERE site_id = ?1",
            params![site_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::{AgentPhase, AgentRun, Site};

    #[tokio::test]
    async fn slot_is_exclusive_until_released() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        store
            .acquire_site_slot(&site.id, "worker-1", Duration::minutes(30))
            .await
            .unwrap();
        assert!(matches!(
            store
                .acquire_site_slot(&site.id, "worker-2", Duration::minutes(30))
                .await,
            Err(StoreError::AlreadyInProgress { .. })
        ));

        store.release_site_slot(&site.id, "worker-1").await.unwrap();
        store
            .acquire_site_slot(&site.id, "worker-2", Duration::minutes(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        store
            .acquire_site_slot(&site.id, "worker-1", Duration::seconds(-5))
            .await
            .unwrap();
        store
            .acquire_site_slot(&site.id, "worker-2", Duration::minutes(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_agent_run_blocks_the_slot() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let run = AgentRun::new(&site.id, 10);
        store.insert_agent_run(&run).await.unwrap();

        assert!(matches!(
            store
                .acquire_site_slot(&site.id, "worker-1", Duration::minutes(30))
                .await,
            Err(StoreError::AlreadyInProgress { .. })
        ));

        store
            .update_agent_phase(&run.id, AgentPhase::Complete)
            .await
            .unwrap();
        store
            .acquire_site_slot(&site.id, "worker-1", Duration::minutes(30))
            .await
            .unwrap();
    }
}
