use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use mls_types::{AgentCheckpoint, AgentPhase, AgentRun};

use crate::db::{parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

struct AgentRunRow {
    id: String,
    site_id: String,
    phase: String,
    iteration: i64,
    max_iterations: i64,
    phase_timings: String,
    last_error: Option<String>,
    checkpoint: String,
    current_build_id: Option<String>,
    workdir: Option<String>,
    created_at: String,
    updated_at: String,
}

fn agent_run_row(row: &Row<'_>) -> rusqlite::Result<AgentRunRow> {
    Ok(AgentRunRow {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        phase: row.get("phase")?,
        iteration: row.get("iteration")?,
        max_iterations: row.get("max_iterations")?,
        phase_timings: row.get("phase_timings")?,
        last_error: row.get("last_error")?,
        checkpoint: row.get("checkpoint")?,
        current_build_id: row.get("current_build_id")?,
        workdir: row.get("workdir")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl TryFrom<AgentRunRow> for AgentRun {
    type Error = StoreError;

    fn try_from(row: AgentRunRow) -> StoreResult<AgentRun> {
        Ok(AgentRun {
            phase: AgentPhase::parse(&row.phase).ok_or_else(|| StoreError::Corrupt {
                table: "agent_runs",
                column: "phase",
                detail: row.phase.clone(),
            })?,
            phase_timings: serde_json::from_str(&row.phase_timings)?,
            checkpoint: serde_json::from_str(&row.checkpoint)?,
            created_at: parse_ts("agent_runs", "created_at", &row.created_at)?,
            updated_at: parse_ts("agent_runs", "updated_at", &row.updated_at)?,
            id: row.id,
            site_id: row.site_id,
            iteration: row.iteration as u32,
            max_iterations: row.max_iterations as u32,
            last_error: row.last_error,
            current_build_id: row.current_build_id,
            workdir: row.workdir,
        })
    }
}

impl Store {
    /// Enforces the "at most one non-terminal run per site" invariant at
    /// insert time.
    pub async fn insert_agent_run(&self, run: &AgentRun) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM agent_runs
             WHERE site_id = ?1 AND phase NOT IN ('complete', 'failed')",
            params![run.site_id],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(StoreError::AlreadyInProgress {
                site_id: run.site_id.clone(),
            });
        }
        tx.execute(
            "INSERT INTO agent_runs
             (id, site_id, phase, iteration, max_iterations, phase_timings, last_error,
              checkpoint, current_build_id, workdir, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id,
                run.site_id,
                run.phase.as_str(),
                run.iteration as i64,
                run.max_iterations as i64,
                serde_json::to_string(&run.phase_timings)?,
                run.last_error,
                serde_json::to_string(&run.checkpoint)?,
                run.current_build_id,
                run.workdir,
                to_rfc3339(run.created_at),
                to_rfc3339(run.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_agent_run(&self, run_id: &str) -> StoreResult<AgentRun> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM agent_runs WHERE id = ?1",
            params![run_id],
            agent_run_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("agent run", run_id))?
        .try_into()
    }

    pub async fn latest_agent_run(&self, site_id: &str) -> StoreResult<Option<AgentRun>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM agent_runs WHERE site_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![site_id],
            agent_run_row,
        )
        .optional()?
        .map(AgentRun::try_from)
        .transpose()
    }

    pub async fn active_agent_run(&self, site_id: &str) -> StoreResult<Option<AgentRun>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM agent_runs WHERE site_id = ?1
             AND phase NOT IN ('complete', 'failed')
             ORDER BY created_at DESC LIMIT 1",
            params![site_id],
            agent_run_row,
        )
        .optional()?
        .map(AgentRun::try_from)
        .transpose()
    }

    /// Terminal phases never transition away; the guard lives here so every
    /// caller inherits it.
    pub async fn update_agent_phase(&self, run_id: &str, phase: AgentPhase) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_runs SET phase = ?2, updated_at = ?3
             WHERE id = ?1 AND phase NOT IN ('complete', 'failed')",
            params![run_id, phase.as_str(), to_rfc3339(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("active agent run", run_id));
        }
        Ok(())
    }

    pub async fn update_agent_run(&self, run: &AgentRun) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_runs SET
                phase = ?2, iteration = ?3, phase_timings = ?4, last_error = ?5,
                checkpoint = ?6, current_build_id = ?7, workdir = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                run.id,
                run.phase.as_str(),
                run.iteration as i64,
                serde_json::to_string(&run.phase_timings)?,
                run.last_error,
                serde_json::to_string(&run.checkpoint)?,
                run.current_build_id,
                run.workdir,
                to_rfc3339(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("agent run", &run.id));
        }
        Ok(())
    }

    /// Durable checkpoint write before each build phase; the single source
    /// of truth for resume.
    pub async fn write_agent_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &AgentCheckpoint,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_runs SET checkpoint = ?2, iteration = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                run_id,
                serde_json::to_string(checkpoint)?,
                checkpoint.iteration as i64,
                to_rfc3339(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("agent run", run_id));
        }
        Ok(())
    }

    /// The one sanctioned exception to "terminal never transitions away":
    /// resuming a failed run whose workspace is still on disk re-enters the
    /// loop at its checkpoint.
    pub async fn reopen_agent_run(&self, run_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_runs SET phase = 'building', last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND phase = 'failed' AND workdir IS NOT NULL",
            params![run_id, to_rfc3339(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("resumable agent run", run_id));
        }
        Ok(())
    }

    pub async fn cancel_non_terminal_agent_runs(&self, site_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_runs SET phase = 'failed', last_error = 'cancelled', updated_at = ?2
             WHERE site_id = ?1 AND phase NOT IN ('complete', 'failed')",
            params![site_id, to_rfc3339(Utc::now())],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::Site;

    #[tokio::test]
    async fn single_active_run_per_site() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        let first = AgentRun::new(&site.id, 10);
        store.insert_agent_run(&first).await.unwrap();
        let second = AgentRun::new(&site.id, 10);
        assert!(matches!(
            store.insert_agent_run(&second).await,
            Err(StoreError::AlreadyInProgress { .. })
        ));

        store.update_agent_phase(&first.id, AgentPhase::Complete).await.unwrap();
        store.insert_agent_run(&second).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_phase_never_transitions_away() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let run = AgentRun::new(&site.id, 10);
        store.insert_agent_run(&run).await.unwrap();
        store.update_agent_phase(&run.id, AgentPhase::Failed).await.unwrap();
        assert!(store
            .update_agent_phase(&run.id, AgentPhase::Building)
            .await
            .is_err());
        let loaded = store.get_agent_run(&run.id).await.unwrap();
        assert_eq!(loaded.phase, AgentPhase::Failed);
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let run = AgentRun::new(&site.id, 10);
        store.insert_agent_run(&run).await.unwrap();

        let mut checkpoint = AgentCheckpoint::default();
        checkpoint.iteration = 2;
        checkpoint.settings = serde_json::json!({"js": {"minify": false}});
        store.write_agent_checkpoint(&run.id, &checkpoint).await.unwrap();

        let loaded = store.get_agent_run(&run.id).await.unwrap();
        assert_eq!(loaded.iteration, 2);
        assert_eq!(loaded.checkpoint.settings["js"]["minify"], false);
    }
}
