use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Html,
    Css,
    Js,
    Images,
    Fonts,
}

impl AssetClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetClass::Html => "html",
            AssetClass::Css => "css",
            AssetClass::Js => "js",
            AssetClass::Images => "images",
            AssetClass::Fonts => "fonts",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "html" => Some(AssetClass::Html),
            "css" => Some(AssetClass::Css),
            "js" => Some(AssetClass::Js),
            "images" => Some(AssetClass::Images),
            "fonts" => Some(AssetClass::Fonts),
            _ => None,
        }
    }
}

/// Per-URL settings override; the pattern glob supports `*` within a path
/// segment and `**` across segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetOverride {
    pub id: String,
    pub site_id: String,
    pub url_pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_class: Option<AssetClass>,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
}

impl AssetOverride {
    pub fn new(site_id: &str, url_pattern: &str, settings: Value) -> Self {
        Self {
            id: crate::prefixed_id("ovr"),
            site_id: site_id.to_string(),
            url_pattern: url_pattern.to_string(),
            asset_class: None,
            settings,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of a prior sparse-settings value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsHistoryEntry {
    pub id: String,
    pub site_id: String,
    pub settings: Value,
    /// Who wrote the value being replaced: `user`, `agent`, `rollback`, `reset`.
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Per-path content fingerprint used by partial rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFingerprint {
    pub site_id: String,
    pub path: String,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertComparator {
    Above,
    Below,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub site_id: String,
    /// Metric key, e.g. `performance`, `lcpMs`.
    pub metric: String,
    pub comparator: AlertComparator,
    pub threshold: f64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn breached(&self, value: f64) -> bool {
        self.enabled
            && match self.comparator {
                AlertComparator::Above => value > self.threshold,
                AlertComparator::Below => value < self.threshold,
            }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFired {
    pub id: String,
    pub rule_id: String,
    pub site_id: String,
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
    pub fired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_rules_respect_comparator_and_enabled_flag() {
        let mut rule = AlertRule {
            id: "alert_1".into(),
            site_id: "site_a".into(),
            metric: "performance".into(),
            comparator: AlertComparator::Below,
            threshold: 50.0,
            enabled: true,
            created_at: Utc::now(),
        };
        assert!(rule.breached(40.0));
        assert!(!rule.breached(60.0));
        rule.enabled = false;
        assert!(!rule.breached(40.0));
    }
}
