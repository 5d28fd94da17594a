use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use mls_types::{
    Build, BuildLogLine, BuildPhase, BuildScope, BuildStatus, BuildTrigger, ErrorDetails,
    SizeBreakdown,
};

use crate::db::{parse_opt_ts, parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

struct BuildRow {
    id: String,
    site_id: String,
    scope: String,
    triggered_by: String,
    status: String,
    pages_total: i64,
    pages_processed: i64,
    original_size: String,
    optimized_size: String,
    iframe_facades_applied: i64,
    scripts_removed: i64,
    score_before: Option<f64>,
    score_after: Option<f64>,
    error_details: Option<String>,
    resolved_settings: String,
    checkpoint_phase: Option<String>,
    log: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

fn build_row(row: &Row<'_>) -> rusqlite::Result<BuildRow> {
    Ok(BuildRow {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        scope: row.get("scope")?,
        triggered_by: row.get("triggered_by")?,
        status: row.get("status")?,
        pages_total: row.get("pages_total")?,
        pages_processed: row.get("pages_processed")?,
        original_size: row.get("original_size")?,
        optimized_size: row.get("optimized_size")?,
        iframe_facades_applied: row.get("iframe_facades_applied")?,
        scripts_removed: row.get("scripts_removed")?,
        score_before: row.get("score_before")?,
        score_after: row.get("score_after")?,
        error_details: row.get("error_details")?,
        resolved_settings: row.get("resolved_settings")?,
        checkpoint_phase: row.get("checkpoint_phase")?,
        log: row.get("log")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
    })
}

fn corrupt(column: &'static str, detail: &str) -> StoreError {
    StoreError::Corrupt {
        table: "builds",
        column,
        detail: detail.to_string(),
    }
}

impl TryFrom<BuildRow> for Build {
    type Error = StoreError;

    fn try_from(row: BuildRow) -> StoreResult<Build> {
        let scope = match row.scope.as_str() {
            "full" => BuildScope::Full,
            "partial" => BuildScope::Partial,
            other => return Err(corrupt("scope", other)),
        };
        let triggered_by = match row.triggered_by.as_str() {
            "user" => BuildTrigger::User,
            "webhook" => BuildTrigger::Webhook,
            "schedule" => BuildTrigger::Schedule,
            "agent" => BuildTrigger::Agent,
            other => return Err(corrupt("triggered_by", other)),
        };
        let status =
            BuildStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        let checkpoint_phase = row
            .checkpoint_phase
            .as_deref()
            .map(|p| BuildPhase::parse(p).ok_or_else(|| corrupt("checkpoint_phase", p)))
            .transpose()?;
        let original_size: SizeBreakdown = serde_json::from_str(&row.original_size)?;
        let optimized_size: SizeBreakdown = serde_json::from_str(&row.optimized_size)?;
        let error_details: Option<ErrorDetails> = row
            .error_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let log: Vec<BuildLogLine> = serde_json::from_str(&row.log)?;
        Ok(Build {
            scope,
            triggered_by,
            status,
            checkpoint_phase,
            original_size,
            optimized_size,
            error_details,
            log,
            resolved_settings: serde_json::from_str(&row.resolved_settings)?,
            started_at: parse_opt_ts("builds", "started_at", row.started_at)?,
            completed_at: parse_opt_ts("builds", "completed_at", row.completed_at)?,
            created_at: parse_ts("builds", "created_at", &row.created_at)?,
            id: row.id,
            site_id: row.site_id,
            pages_total: row.pages_total as u64,
            pages_processed: row.pages_processed as u64,
            iframe_facades_applied: row.iframe_facades_applied as u64,
            scripts_removed: row.scripts_removed as u64,
            score_before: row.score_before,
            score_after: row.score_after,
        })
    }
}

impl Store {
    /// Inserts the build and bumps the site's denormalized last-build pointer
    /// in the same transaction.
    pub async fn insert_build(&self, build: &Build) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO builds
             (id, site_id, scope, triggered_by, status, pages_total, pages_processed,
              original_size, optimized_size, iframe_facades_applied, scripts_removed,
              score_before, score_after, error_details, resolved_settings, checkpoint_phase,
              log, started_at, completed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20)",
            params![
                build.id,
                build.site_id,
                build.scope.as_str(),
                build.triggered_by.as_str(),
                build.status.as_str(),
                build.pages_total as i64,
                build.pages_processed as i64,
                serde_json::to_string(&build.original_size)?,
                serde_json::to_string(&build.optimized_size)?,
                build.iframe_facades_applied as i64,
                build.scripts_removed as i64,
                build.score_before,
                build.score_after,
                build
                    .error_details
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&build.resolved_settings)?,
                build.checkpoint_phase.map(|p| p.as_str()),
                serde_json::to_string(&build.log)?,
                build.started_at.map(to_rfc3339),
                build.completed_at.map(to_rfc3339),
                to_rfc3339(build.created_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                what: "build",
                id: build.id.clone(),
            });
        }
        tx.execute(
            "UPDATE sites SET last_build_id = ?2, last_build_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![build.site_id, build.id, to_rfc3339(Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_build(&self, build_id: &str) -> StoreResult<Build> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM builds WHERE id = ?1",
            params![build_id],
            build_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("build", build_id))?
        .try_into()
    }

    pub async fn list_builds(
        &self,
        site_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Build>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM builds WHERE site_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![site_id, limit as i64, offset as i64], build_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Build::try_from).collect()
    }

    /// Status write; the state machine is the sole caller.
    pub async fn write_build_status(
        &self,
        build_id: &str,
        status: BuildStatus,
        error_details: Option<&ErrorDetails>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let now = to_rfc3339(Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());
        let started_at = matches!(status, BuildStatus::Crawling).then(|| now.clone());
        let changed = conn.execute(
            "UPDATE builds SET
                status = ?2,
                error_details = ?3,
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![
                build_id,
                status.as_str(),
                error_details.map(serde_json::to_string).transpose()?,
                started_at,
                completed_at,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("build", build_id));
        }
        Ok(())
    }

    pub async fn update_build_progress(
        &self,
        build_id: &str,
        pages_total: u64,
        pages_processed: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE builds SET pages_total = ?2, pages_processed = ?3 WHERE id = ?1",
            params![build_id, pages_total as i64, pages_processed as i64],
        )?;
        Ok(())
    }

    pub async fn update_build_metrics(&self, build: &Build) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE builds SET
                original_size = ?2, optimized_size = ?3,
                iframe_facades_applied = ?4, scripts_removed = ?5,
                score_before = ?6, score_after = ?7, resolved_settings = ?8
             WHERE id = ?1",
            params![
                build.id,
                serde_json::to_string(&build.original_size)?,
                serde_json::to_string(&build.optimized_size)?,
                build.iframe_facades_applied as i64,
                build.scripts_removed as i64,
                build.score_before,
                build.score_after,
                serde_json::to_string(&build.resolved_settings)?,
            ],
        )?;
        Ok(())
    }

    /// Phase checkpoint so a crashed worker can resume without re-crawling.
    pub async fn write_build_checkpoint(
        &self,
        build_id: &str,
        phase: BuildPhase,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE builds SET checkpoint_phase = ?2 WHERE id = ?1",
            params![build_id, phase.as_str()],
        )?;
        Ok(())
    }

    pub async fn append_build_log(&self, build_id: &str, lines: &[BuildLogLine]) -> StoreResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let raw: String = tx
            .query_row(
                "SELECT log FROM builds WHERE id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("build", build_id))?;
        let mut log: Vec<BuildLogLine> = serde_json::from_str(&raw)?;
        log.extend(lines.iter().cloned());
        tx.execute(
            "UPDATE builds SET log = ?2 WHERE id = ?1",
            params![build_id, serde_json::to_string(&log)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Retry keeps the build id, re-enters at the checkpoint and clears the
    /// failure payload. Progress counters reset; crawl artifacts survive on
    /// disk.
    pub async fn reset_build_for_retry(&self, build_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE builds SET
                status = 'queued', error_details = NULL,
                pages_processed = 0, completed_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![build_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("failed build", build_id));
        }
        Ok(())
    }

    pub async fn non_terminal_builds(&self, site_id: &str) -> StoreResult<Vec<Build>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM builds WHERE site_id = ?1
             AND status NOT IN ('success', 'failed', 'cancelled')
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![site_id], build_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Build::try_from).collect()
    }

    /// Marks every non-terminal build for the site cancelled; returns how
    /// many were affected.
    pub async fn cancel_non_terminal_builds(&self, site_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE builds SET status = 'cancelled', completed_at = ?2
             WHERE site_id = ?1 AND status NOT IN ('success', 'failed', 'cancelled')",
            params![site_id, to_rfc3339(Utc::now())],
        )?;
        Ok(changed)
    }

    /// Ids of the most recent successful builds, newest first. Anything not
    /// in this list is a candidate for the artifact sweep.
    pub async fn recent_successful_build_ids(
        &self,
        site_id: &str,
        keep: usize,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM builds WHERE site_id = ?1 AND status = 'success'
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![site_id, keep as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub async fn latest_successful_build(&self, site_id: &str) -> StoreResult<Option<Build>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM builds WHERE site_id = ?1 AND status = 'success'
             ORDER BY created_at DESC LIMIT 1",
            params![site_id],
            build_row,
        )
        .optional()?
        .map(Build::try_from)
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::Site;

    async fn seeded() -> (Store, Site) {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        (store, site)
    }

    #[tokio::test]
    async fn insert_build_bumps_site_pointer() {
        let (store, site) = seeded().await;
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();
        let site = store.get_site(&site.id).await.unwrap();
        assert_eq!(site.last_build_id.as_deref(), Some(build.id.as_str()));
        assert!(site.last_build_at.is_some());
    }

    #[tokio::test]
    async fn terminal_status_sets_completed_at() {
        let (store, site) = seeded().await;
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();
        store
            .write_build_status(&build.id, BuildStatus::Crawling, None)
            .await
            .unwrap();
        store
            .write_build_status(&build.id, BuildStatus::Success, None)
            .await
            .unwrap();
        let loaded = store.get_build(&build.id).await.unwrap();
        assert_eq!(loaded.status, BuildStatus::Success);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn retry_reset_requires_failed_status() {
        let (store, site) = seeded().await;
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();
        assert!(store.reset_build_for_retry(&build.id).await.is_err());

        let details = ErrorDetails::fatal(BuildPhase::Css, "purge", "bad stylesheet");
        store
            .write_build_status(&build.id, BuildStatus::Failed, Some(&details))
            .await
            .unwrap();
        store.write_build_checkpoint(&build.id, BuildPhase::Images).await.unwrap();
        store.reset_build_for_retry(&build.id).await.unwrap();
        let loaded = store.get_build(&build.id).await.unwrap();
        assert_eq!(loaded.status, BuildStatus::Queued);
        assert!(loaded.error_details.is_none());
        assert_eq!(loaded.checkpoint_phase, Some(BuildPhase::Images));
    }

    #[tokio::test]
    async fn cancel_non_terminal_counts_affected_rows() {
        let (store, site) = seeded().await;
        let a = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        let mut b = Build::new(&site.id, BuildScope::Full, BuildTrigger::Webhook);
        b.status = BuildStatus::Success;
        store.insert_build(&a).await.unwrap();
        store.insert_build(&b).await.unwrap();
        assert_eq!(store.cancel_non_terminal_builds(&site.id).await.unwrap(), 1);
        let loaded = store.get_build(&a.id).await.unwrap();
        assert_eq!(loaded.status, BuildStatus::Cancelled);
    }

    #[tokio::test]
    async fn build_log_appends() {
        let (store, site) = seeded().await;
        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();
        let line = BuildLogLine {
            ts: Utc::now(),
            level: "info".into(),
            message: "crawled /".into(),
        };
        store
            .append_build_log(&build.id, std::slice::from_ref(&line))
            .await
            .unwrap();
        store
            .append_build_log(&build.id, std::slice::from_ref(&line))
            .await
            .unwrap();
        let loaded = store.get_build(&build.id).await.unwrap();
        assert_eq!(loaded.log.len(), 2);
    }
}
