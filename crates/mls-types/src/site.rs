use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Active,
    Building,
    Error,
    Archived,
}

impl SiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Active => "active",
            SiteStatus::Building => "building",
            SiteStatus::Error => "error",
            SiteStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SiteStatus::Active),
            "building" => Some(SiteStatus::Building),
            "error" => Some(SiteStatus::Error),
            "archived" => Some(SiteStatus::Archived),
            _ => None,
        }
    }
}

/// A registered source site and its denormalized latest-build summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub status: SiteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_project: Option<String>,
    pub page_count: u64,
    pub total_bytes: u64,
    /// Sparse settings overrides; merged over defaults by the resolver.
    #[serde(default)]
    pub settings: Value,
    /// Shared secret for inbound webhook signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn new(name: impl Into<String>, source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::site_id(),
            name: name.into(),
            source_url: source_url.into(),
            status: SiteStatus::Active,
            last_build_id: None,
            last_build_at: None,
            edge_url: None,
            edge_project: None,
            page_count: 0,
            total_bytes: 0,
            settings: Value::Object(serde_json::Map::new()),
            webhook_secret: Some(crate::prefixed_id("whsec")),
            created_at: now,
            updated_at: now,
        }
    }

    /// Edge deployment project name for this site.
    pub fn edge_project_name(&self) -> String {
        format!("mls-{}", self.id)
    }
}
