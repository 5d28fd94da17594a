use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{parse_opt_ts, parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Agent,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "build" => Some(JobKind::Build),
            "agent" => Some(JobKind::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ready,
    Reserved,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Reserved => "reserved",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(JobStatus::Ready),
            "reserved" => Some(JobStatus::Reserved),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// One durable queue entry. The payload carries the build or run id the
/// worker should drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub site_id: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub not_before: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct JobRow {
    id: String,
    kind: String,
    site_id: String,
    payload: String,
    status: String,
    attempts: i64,
    max_retries: i64,
    not_before: String,
    lease_expires_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get("id")?,
        kind: row.get("kind")?,
        site_id: row.get("site_id")?,
        payload: row.get("payload")?,
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        max_retries: row.get("max_retries")?,
        not_before: row.get("not_before")?,
        lease_expires_at: row.get("lease_expires_at")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> StoreResult<JobRecord> {
        Ok(JobRecord {
            kind: JobKind::parse(&row.kind).ok_or_else(|| StoreError::Corrupt {
                table: "jobs",
                column: "kind",
                detail: row.kind.clone(),
            })?,
            status: JobStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
                table: "jobs",
                column: "status",
                detail: row.status.clone(),
            })?,
            payload: serde_json::from_str(&row.payload)?,
            not_before: parse_ts("jobs", "not_before", &row.not_before)?,
            lease_expires_at: parse_opt_ts("jobs", "lease_expires_at", row.lease_expires_at)?,
            created_at: parse_ts("jobs", "created_at", &row.created_at)?,
            updated_at: parse_ts("jobs", "updated_at", &row.updated_at)?,
            id: row.id,
            site_id: row.site_id,
            attempts: row.attempts as u32,
            max_retries: row.max_retries as u32,
            last_error: row.last_error,
        })
    }
}

impl Store {
    /// Inserts a ready job. Deduplicates by id: an existing row is returned
    /// untouched with `inserted = false`.
    pub async fn insert_job(&self, job: &JobRecord) -> StoreResult<(JobRecord, bool)> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
             (id, kind, site_id, payload, status, attempts, max_retries, not_before,
              lease_expires_at, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.kind.as_str(),
                job.site_id,
                serde_json::to_string(&job.payload)?,
                job.status.as_str(),
                job.attempts as i64,
                job.max_retries as i64,
                to_rfc3339(job.not_before),
                job.lease_expires_at.map(to_rfc3339),
                job.last_error,
                to_rfc3339(job.created_at),
                to_rfc3339(job.updated_at),
            ],
        )?;
        let stored: JobRecord = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job.id], job_row)?
            .try_into()?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<JobRecord> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], job_row)
            .optional()?
            .ok_or_else(|| StoreError::not_found("job", job_id))?
            .try_into()
    }

    /// Pulls the oldest ready job and marks it reserved with a visibility
    /// lease. Expired leases are released first so crashed workers never
    /// strand a job.
    pub async fn reserve_next_job(&self, lease: Duration) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "UPDATE jobs SET status = 'ready', lease_expires_at = NULL, updated_at = ?1
             WHERE status = 'reserved' AND lease_expires_at < ?1",
            params![to_rfc3339(now)],
        )?;
        let candidate = tx
            .query_row(
                "SELECT * FROM jobs WHERE status = 'ready' AND not_before <= ?1
                 ORDER BY created_at, id LIMIT 1",
                params![to_rfc3339(now)],
                job_row,
            )
            .optional()?;
        let Some(candidate) = candidate else {
            tx.commit()?;
            return Ok(None);
        };
        let lease_expires = now + lease;
        tx.execute(
            "UPDATE jobs SET status = 'reserved', lease_expires_at = ?2,
                    attempts = attempts + 1, updated_at = ?3
             WHERE id = ?1",
            params![candidate.id, to_rfc3339(lease_expires), to_rfc3339(now)],
        )?;
        let reserved = tx
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![candidate.id],
                job_row,
            )?
            .try_into()?;
        tx.commit()?;
        Ok(Some(reserved))
    }

    pub async fn ack_job(
        &self,
        job_id: &str,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, lease_expires_at = NULL, last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                job_id,
                status.as_str(),
                last_error,
                to_rfc3339(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("job", job_id));
        }
        Ok(())
    }

    /// Returns a failed job to the ready set with a delay.
    pub async fn requeue_job(
        &self,
        job_id: &str,
        not_before: DateTime<Utc>,
        last_error: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'ready', lease_expires_at = NULL,
                    not_before = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                job_id,
                to_rfc3339(not_before),
                last_error,
                to_rfc3339(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("job", job_id));
        }
        Ok(())
    }

    pub async fn cancel_jobs_for_site(&self, site_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', lease_expires_at = NULL, updated_at = ?2
             WHERE site_id = ?1 AND status IN ('ready', 'reserved')",
            params![site_id, to_rfc3339(Utc::now())],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, site: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: id.to_string(),
            kind: JobKind::Build,
            site_id: site.to_string(),
            payload: json!({"buildId": "build_x"}),
            status: JobStatus::Ready,
            attempts: 0,
            max_retries: 5,
            not_before: now,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn enqueue_deduplicates_by_id() {
        let store = Store::open_in_memory().await.unwrap();
        let (_, inserted) = store.insert_job(&job("job_1", "site_a")).await.unwrap();
        assert!(inserted);
        let (existing, inserted) = store.insert_job(&job("job_1", "site_a")).await.unwrap();
        assert!(!inserted);
        assert_eq!(existing.id, "job_1");
    }

    #[tokio::test]
    async fn reserve_is_fifo_and_leases() {
        let store = Store::open_in_memory().await.unwrap();
        let mut first = job("job_1", "site_a");
        first.created_at = Utc::now() - Duration::seconds(10);
        store.insert_job(&first).await.unwrap();
        store.insert_job(&job("job_2", "site_b")).await.unwrap();

        let reserved = store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.id, "job_1");
        assert_eq!(reserved.status, JobStatus::Reserved);
        assert_eq!(reserved.attempts, 1);
        assert!(reserved.lease_expires_at.is_some());

        let next = store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "job_2");
        assert!(store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_lease_returns_job_to_ready() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&job("job_1", "site_a")).await.unwrap();
        // Lease already expired at reserve time.
        let reserved = store
            .reserve_next_job(Duration::seconds(-1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.id, "job_1");
        let again = store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, "job_1");
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn requeue_delays_until_not_before() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&job("job_1", "site_a")).await.unwrap();
        store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        store
            .requeue_job("job_1", Utc::now() + Duration::minutes(5), "timeout")
            .await
            .unwrap();
        assert!(store
            .reserve_next_job(Duration::minutes(30))
            .await
            .unwrap()
            .is_none());
    }
}
