use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use mls_types::{
    AlertFired, AlertRule, AssetClass, AssetOverride, MeasureStrategy, MeasurementComparison,
    SettingsHistoryEntry,
};

use crate::db::{parse_ts, to_rfc3339, Store};
use crate::error::{StoreError, StoreResult};

struct OverrideRow {
    id: String,
    site_id: String,
    url_pattern: String,
    asset_class: Option<String>,
    settings: String,
    created_at: String,
}

fn override_row(row: &Row<'_>) -> rusqlite::Result<OverrideRow> {
    Ok(OverrideRow {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        url_pattern: row.get("url_pattern")?,
        asset_class: row.get("asset_class")?,
        settings: row.get("settings")?,
        created_at: row.get("created_at")?,
    })
}

impl TryFrom<OverrideRow> for AssetOverride {
    type Error = StoreError;

    fn try_from(row: OverrideRow) -> StoreResult<AssetOverride> {
        let asset_class = row
            .asset_class
            .as_deref()
            .map(|raw| {
                AssetClass::parse(raw).ok_or_else(|| StoreError::Corrupt {
                    table: "asset_overrides",
                    column: "asset_class",
                    detail: raw.to_string(),
                })
            })
            .transpose()?;
        Ok(AssetOverride {
            asset_class,
            settings: serde_json::from_str(&row.settings)?,
            created_at: parse_ts("asset_overrides", "created_at", &row.created_at)?,
            id: row.id,
            site_id: row.site_id,
            url_pattern: row.url_pattern,
        })
    }
}

impl Store {
    /// Idempotent upsert keyed on `(site_id, url_pattern)`.
    pub async fn upsert_asset_override(&self, ovr: &AssetOverride) -> StoreResult<AssetOverride> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO asset_overrides (id, site_id, url_pattern, asset_class, settings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (site_id, url_pattern) DO UPDATE SET
                asset_class = excluded.asset_class,
                settings = excluded.settings",
            params![
                ovr.id,
                ovr.site_id,
                ovr.url_pattern,
                ovr.asset_class.map(|c| c.as_str()),
                serde_json::to_string(&ovr.settings)?,
                to_rfc3339(ovr.created_at),
            ],
        )?;
        conn.query_row(
            "SELECT * FROM asset_overrides WHERE site_id = ?1 AND url_pattern = ?2",
            params![ovr.site_id, ovr.url_pattern],
            override_row,
        )?
        .try_into()
    }

    /// Insertion order matters: later overrides win during the merge.
    pub async fn list_asset_overrides(&self, site_id: &str) -> StoreResult<Vec<AssetOverride>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM asset_overrides WHERE site_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![site_id], override_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AssetOverride::try_from).collect()
    }

    pub async fn get_asset_override(&self, override_id: &str) -> StoreResult<AssetOverride> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM asset_overrides WHERE id = ?1",
            params![override_id],
            override_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("asset override", override_id))?
        .try_into()
    }

    pub async fn delete_asset_override(&self, override_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM asset_overrides WHERE id = ?1",
            params![override_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("asset override", override_id));
        }
        Ok(())
    }

    pub async fn append_settings_history(
        &self,
        site_id: &str,
        settings: &Value,
        actor: &str,
    ) -> StoreResult<SettingsHistoryEntry> {
        let entry = SettingsHistoryEntry {
            id: mls_types::prefixed_id("hist"),
            site_id: site_id.to_string(),
            settings: settings.clone(),
            actor: actor.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings_history (id, site_id, settings, actor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.site_id,
                serde_json::to_string(&entry.settings)?,
                entry.actor,
                to_rfc3339(entry.created_at),
            ],
        )?;
        Ok(entry)
    }

    pub async fn list_settings_history(
        &self,
        site_id: &str,
    ) -> StoreResult<Vec<SettingsHistoryEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, site_id, settings, actor, created_at FROM settings_history
             WHERE site_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![site_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, site_id, settings, actor, created_at)| {
                Ok(SettingsHistoryEntry {
                    settings: serde_json::from_str(&settings)?,
                    created_at: parse_ts("settings_history", "created_at", &created_at)?,
                    id,
                    site_id,
                    actor,
                })
            })
            .collect()
    }

    pub async fn get_settings_history_entry(
        &self,
        site_id: &str,
        entry_id: &str,
    ) -> StoreResult<SettingsHistoryEntry> {
        let entries = self.list_settings_history(site_id).await?;
        entries
            .into_iter()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| StoreError::not_found("settings history entry", entry_id))
    }

    pub async fn insert_measurement(&self, cmp: &MeasurementComparison) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO measurement_comparisons
             (id, site_id, build_id, strategy, original, optimized, improvements,
              payload_savings_bytes, measured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                cmp.id,
                cmp.site_id,
                cmp.build_id,
                cmp.strategy.as_str(),
                serde_json::to_string(&cmp.original)?,
                serde_json::to_string(&cmp.optimized)?,
                serde_json::to_string(&cmp.improvements)?,
                cmp.payload_savings_bytes,
                to_rfc3339(cmp.measured_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_measurements(
        &self,
        site_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<MeasurementComparison>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, site_id, build_id, strategy, original, optimized, improvements,
                    payload_savings_bytes, measured_at
             FROM measurement_comparisons WHERE site_id = ?1
             ORDER BY measured_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![site_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(
                |(id, site_id, build_id, strategy, original, optimized, improvements, savings, at)| {
                    let strategy = match strategy.as_str() {
                        "mobile" => MeasureStrategy::Mobile,
                        "desktop" => MeasureStrategy::Desktop,
                        other => {
                            return Err(StoreError::Corrupt {
                                table: "measurement_comparisons",
                                column: "strategy",
                                detail: other.to_string(),
                            })
                        }
                    };
                    Ok(MeasurementComparison {
                        strategy,
                        original: serde_json::from_str(&original)?,
                        optimized: serde_json::from_str(&optimized)?,
                        improvements: serde_json::from_str(&improvements)?,
                        measured_at: parse_ts("measurement_comparisons", "measured_at", &at)?,
                        id,
                        site_id,
                        build_id,
                        payload_savings_bytes: savings,
                    })
                },
            )
            .collect()
    }

    /// Replaces the stored page fingerprints for the site.
    pub async fn replace_page_fingerprints(
        &self,
        site_id: &str,
        hashes: &HashMap<String, String>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM pages WHERE site_id = ?1", params![site_id])?;
        let now = to_rfc3339(Utc::now());
        for (path, hash) in hashes {
            tx.execute(
                "INSERT INTO pages (site_id, path, content_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![site_id, path, hash, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn page_fingerprints(&self, site_id: &str) -> StoreResult<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT path, content_hash FROM pages WHERE site_id = ?1")?;
        let rows = stmt
            .query_map(params![site_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    pub async fn list_alert_rules(&self, site_id: &str) -> StoreResult<Vec<AlertRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, site_id, metric, comparator, threshold, enabled, created_at
             FROM alert_rules WHERE site_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![site_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, site_id, metric, comparator, threshold, enabled, created_at)| {
                let comparator = match comparator.as_str() {
                    "above" => mls_types::AlertComparator::Above,
                    "below" => mls_types::AlertComparator::Below,
                    other => {
                        return Err(StoreError::Corrupt {
                            table: "alert_rules",
                            column: "comparator",
                            detail: other.to_string(),
                        })
                    }
                };
                Ok(AlertRule {
                    comparator,
                    created_at: parse_ts("alert_rules", "created_at", &created_at)?,
                    id,
                    site_id,
                    metric,
                    threshold,
                    enabled: enabled != 0,
                })
            })
            .collect()
    }

    pub async fn insert_alert_rule(&self, rule: &AlertRule) -> StoreResult<()> {
        let comparator = match rule.comparator {
            mls_types::AlertComparator::Above => "above",
            mls_types::AlertComparator::Below => "below",
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO alert_rules (id, site_id, metric, comparator, threshold, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id,
                rule.site_id,
                rule.metric,
                comparator,
                rule.threshold,
                rule.enabled as i64,
                to_rfc3339(rule.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn append_alert_fired(&self, fired: &AlertFired) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO alert_log (id, rule_id, site_id, metric, observed, threshold, fired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fired.id,
                fired.rule_id,
                fired.site_id,
                fired.metric,
                fired.observed,
                fired.threshold,
                to_rfc3339(fired.fired_at),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::Site;
    use serde_json::json;

    #[tokio::test]
    async fn override_upsert_is_idempotent_per_pattern() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        let first = AssetOverride::new(&site.id, "images/**", json!({"images": {"standardQuality": 60}}));
        store.upsert_asset_override(&first).await.unwrap();
        let second = AssetOverride::new(&site.id, "images/**", json!({"images": {"standardQuality": 40}}));
        let stored = store.upsert_asset_override(&second).await.unwrap();

        // Same pattern updates in place, keeping the original row id.
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.settings["images"]["standardQuality"], 40);
        assert_eq!(store.list_asset_overrides(&site.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn settings_history_is_append_only_and_ordered() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        store
            .append_settings_history(&site.id, &json!({"a": 1}), "user")
            .await
            .unwrap();
        let latest = store
            .append_settings_history(&site.id, &json!({"a": 2}), "agent")
            .await
            .unwrap();
        let entries = store.list_settings_history(&site.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        let fetched = store
            .get_settings_history_entry(&site.id, &latest.id)
            .await
            .unwrap();
        assert_eq!(fetched.actor, "agent");
    }

    #[tokio::test]
    async fn page_fingerprints_replace_previous_set() {
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        let mut first = HashMap::new();
        first.insert("index.html".to_string(), "aaaa".to_string());
        first.insert("about/index.html".to_string(), "bbbb".to_string());
        store.replace_page_fingerprints(&site.id, &first).await.unwrap();

        let mut second = HashMap::new();
        second.insert("index.html".to_string(), "cccc".to_string());
        store.replace_page_fingerprints(&site.id, &second).await.unwrap();

        let stored = store.page_fingerprints(&site.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["index.html"], "cccc");
    }
}
