use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use mls_store::Store;
use mls_types::{AssetClass, PurgeAggressiveness, SiteSettings};

use crate::diff::overridden_leaves;
use crate::error::SettingsError;
use crate::globs::compile_glob;
use crate::merge::{deep_merge, merged};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CachedEntry {
    resolved: Value,
    cached_at: Instant,
}

/// Merges defaults → site sparse overrides → matching asset overrides and
/// validates the result. The site-level document (without asset overrides)
/// is cached with a TTL and invalidated on every settings write.
#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<Store>,
    cache: Arc<RwLock<HashMap<String, CachedEntry>>>,
}

impl SettingsResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn defaults_value() -> Value {
        serde_json::to_value(SiteSettings::default())
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }

    /// Validates a merged document by typed deserialization plus range
    /// checks. Failure is a fatal configuration error.
    pub fn validate(document: &Value) -> Result<SiteSettings, SettingsError> {
        let settings: SiteSettings = serde_json::from_value(document.clone())
            .map_err(|err| SettingsError::Invalid(err.to_string()))?;
        settings.validate().map_err(SettingsError::Invalid)?;
        Ok(settings)
    }

    /// Site-level resolved document (defaults + sparse site overrides).
    pub async fn resolve_site_value(&self, site_id: &str) -> Result<Value, SettingsError> {
        if let Some(entry) = self.cache.read().await.get(site_id) {
            if entry.cached_at.elapsed() < CACHE_TTL {
                return Ok(entry.resolved.clone());
            }
        }
        let site = self.store.get_site(site_id).await?;
        let resolved = merged(&Self::defaults_value(), &site.settings);
        Self::validate(&resolved)?;
        self.cache.write().await.insert(
            site_id.to_string(),
            CachedEntry {
                resolved: resolved.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(resolved)
    }

    pub async fn resolve_site(&self, site_id: &str) -> Result<SiteSettings, SettingsError> {
        let value = self.resolve_site_value(site_id).await?;
        Self::validate(&value)
    }

    /// Full per-asset resolution: site document plus every matching asset
    /// override applied in insertion order.
    pub async fn resolve_for_asset(
        &self,
        site_id: &str,
        asset_url: &str,
        asset_class: Option<AssetClass>,
    ) -> Result<SiteSettings, SettingsError> {
        let mut document = self.resolve_site_value(site_id).await?;
        let overrides = self.store.list_asset_overrides(site_id).await?;
        for ovr in overrides {
            if let Some(required_class) = ovr.asset_class {
                if asset_class != Some(required_class) {
                    continue;
                }
            }
            let matcher = compile_glob(&ovr.url_pattern)?;
            if matcher.is_match(asset_url) {
                deep_merge(&mut document, &ovr.settings);
            }
        }
        Self::validate(&document)
    }

    /// Tree of booleans for each overridden leaf of the site's settings.
    pub async fn diff_site(&self, site_id: &str) -> Result<Value, SettingsError> {
        let resolved = self.resolve_site_value(site_id).await?;
        Ok(overridden_leaves(&Self::defaults_value(), &resolved))
    }

    /// Invalidation hook fired on any settings write.
    pub async fn invalidate(&self, site_id: &str) {
        self.cache.write().await.remove(site_id);
    }

    /// Writes a sparse override document, records history and invalidates
    /// the cache. The merged result must validate before anything persists.
    pub async fn write_site_settings(
        &self,
        site_id: &str,
        sparse: &Value,
        actor: &str,
    ) -> Result<Value, SettingsError> {
        let site = self.store.get_site(site_id).await?;
        let candidate = merged(&site.settings, sparse);
        let resolved = merged(&Self::defaults_value(), &candidate);
        Self::validate(&resolved)?;
        self.store
            .append_settings_history(site_id, &site.settings, actor)
            .await?;
        self.store
            .update_site_settings(site_id, &candidate)
            .await?;
        self.invalidate(site_id).await;
        Ok(resolved)
    }

    /// Replaces the sparse document outright (used by agent plans, which
    /// produce a full override document).
    pub async fn replace_site_settings(
        &self,
        site_id: &str,
        sparse: &Value,
        actor: &str,
    ) -> Result<Value, SettingsError> {
        let site = self.store.get_site(site_id).await?;
        let resolved = merged(&Self::defaults_value(), sparse);
        Self::validate(&resolved)?;
        self.store
            .append_settings_history(site_id, &site.settings, actor)
            .await?;
        self.store.update_site_settings(site_id, sparse).await?;
        self.invalidate(site_id).await;
        Ok(resolved)
    }

    /// Clears every site override back to defaults.
    pub async fn reset_site_settings(&self, site_id: &str) -> Result<Value, SettingsError> {
        let empty = Value::Object(serde_json::Map::new());
        self.replace_site_settings(site_id, &empty, "reset").await
    }

    /// Copies a history row into the current settings and appends a new
    /// history entry for the replaced value.
    pub async fn rollback(&self, site_id: &str, entry_id: &str) -> Result<Value, SettingsError> {
        let entry = self
            .store
            .get_settings_history_entry(site_id, entry_id)
            .await?;
        self.replace_site_settings(site_id, &entry.settings, "rollback")
            .await
    }
}

/// Sites matching a page-builder fingerprint never purge above the safe
/// floor regardless of what the settings say.
pub fn enforce_page_builder_floor(settings: &mut SiteSettings, is_page_builder: bool) {
    if is_page_builder && settings.css.purge_aggressiveness > PurgeAggressiveness::Safe {
        settings.css.purge_aggressiveness = PurgeAggressiveness::Safe;
    }
}
