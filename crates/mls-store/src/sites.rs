use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use mls_types::{Site, SiteStatus};
use serde_json::Value;

use crate::db::{parse_opt_ts, parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

/// Raw column values; JSON and timestamp parsing happens outside the
/// rusqlite row closure so errors map to `StoreError`.
struct SiteRow {
    id: String,
    name: String,
    source_url: String,
    status: String,
    last_build_id: Option<String>,
    last_build_at: Option<String>,
    edge_url: Option<String>,
    edge_project: Option<String>,
    page_count: i64,
    total_bytes: i64,
    settings: String,
    webhook_secret: Option<String>,
    created_at: String,
    updated_at: String,
}

fn site_row(row: &Row<'_>) -> rusqlite::Result<SiteRow> {
    Ok(SiteRow {
        id: row.get("id")?,
        name: row.get("name")?,
        source_url: row.get("source_url")?,
        status: row.get("status")?,
        last_build_id: row.get("last_build_id")?,
        last_build_at: row.get("last_build_at")?,
        edge_url: row.get("edge_url")?,
        edge_project: row.get("edge_project")?,
        page_count: row.get("page_count")?,
        total_bytes: row.get("total_bytes")?,
        settings: row.get("settings")?,
        webhook_secret: row.get("webhook_secret")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl TryFrom<SiteRow> for Site {
    type Error = StoreError;

    fn try_from(row: SiteRow) -> StoreResult<Site> {
        Ok(Site {
            status: SiteStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
                table: "sites",
                column: "status",
                detail: row.status.clone(),
            })?,
            settings: serde_json::from_str(&row.settings)?,
            last_build_at: parse_opt_ts("sites", "last_build_at", row.last_build_at)?,
            created_at: parse_ts("sites", "created_at", &row.created_at)?,
            updated_at: parse_ts("sites", "updated_at", &row.updated_at)?,
            id: row.id,
            name: row.name,
            source_url: row.source_url,
            last_build_id: row.last_build_id,
            edge_url: row.edge_url,
            edge_project: row.edge_project,
            page_count: row.page_count as u64,
            total_bytes: row.total_bytes as u64,
            webhook_secret: row.webhook_secret,
        })
    }
}

impl Store {
    pub async fn insert_site(&self, site: &Site) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sites
             (id, name, source_url, status, last_build_id, last_build_at, edge_url, edge_project,
              page_count, total_bytes, settings, webhook_secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                site.id,
                site.name,
                site.source_url,
                site.status.as_str(),
                site.last_build_id,
                site.last_build_at.map(to_rfc3339),
                site.edge_url,
                site.edge_project,
                site.page_count as i64,
                site.total_bytes as i64,
                serde_json::to_string(&site.settings)?,
                site.webhook_secret,
                to_rfc3339(site.created_at),
                to_rfc3339(site.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                what: "site",
                id: site.id.clone(),
            });
        }
        Ok(())
    }

    pub async fn get_site(&self, site_id: &str) -> StoreResult<Site> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM sites WHERE id = ?1",
            params![site_id],
            site_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("site", site_id))?
        .try_into()
    }

    pub async fn list_sites(&self) -> StoreResult<Vec<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM sites ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], site_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Site::try_from).collect()
    }

    pub async fn update_site_settings(&self, site_id: &str, settings: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sites SET settings = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                site_id,
                serde_json::to_string(settings)?,
                to_rfc3339(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("site", site_id));
        }
        Ok(())
    }

    pub async fn set_site_status(&self, site_id: &str, status: SiteStatus) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sites SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![site_id, status.as_str(), to_rfc3339(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("site", site_id));
        }
        Ok(())
    }

    /// Denormalized summary update after a successful build. Best-effort by
    /// contract; readers tolerate a small lag.
    pub async fn update_site_after_build(
        &self,
        site_id: &str,
        edge_url: Option<&str>,
        edge_project: Option<&str>,
        page_count: u64,
        total_bytes: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sites SET
                edge_url = COALESCE(?2, edge_url),
                edge_project = COALESCE(?3, edge_project),
                page_count = ?4,
                total_bytes = ?5,
                updated_at = ?6
             WHERE id = ?1",
            params![
                site_id,
                edge_url,
                edge_project,
                page_count as i64,
                total_bytes as i64,
                to_rfc3339(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Deletes the site; dependent rows cascade. Jobs and locks reference by
    /// id only, so they are cleared explicitly.
    pub async fn delete_site(&self, site_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM sites WHERE id = ?1", params![site_id])?;
        if changed == 0 {
            return Err(StoreError::not_found("site", site_id));
        }
        conn.execute("DELETE FROM jobs WHERE site_id = ?1", params![site_id])?;
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

    #[tokio::test]
    async fn site_round_trip_and_duplicate_detection() {
        let store = Store::open_in_memory().await.unwrap();
        let mut site = Site::new("Acme", "https://acme.test");
        site.settings = serde_json::json!({"css": {"minify": false}});
        store.insert_site(&site).await.unwrap();

        let loaded = store.get_site(&site.id).await.unwrap();
        assert_eq!(loaded.name, "Acme");
        assert_eq!(loaded.settings["css"]["minify"], false);
        assert!(loaded.webhook_secret.is_some());

        let dup = store.insert_site(&site).await;
        assert!(matches!(dup, Err(StoreError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn delete_site_removes_it() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        store.delete_site(&site.id).await.unwrap();
        assert!(matches!(
            store.get_site(&site.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.list_sites().await.unwrap().is_empty());
    }
}
