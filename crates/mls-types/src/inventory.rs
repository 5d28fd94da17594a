use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViewportKind {
    Mobile,
    Tablet,
    Desktop,
}

impl ViewportKind {
    pub const ALL: [ViewportKind; 3] = [
        ViewportKind::Mobile,
        ViewportKind::Tablet,
        ViewportKind::Desktop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ViewportKind::Mobile => "mobile",
            ViewportKind::Tablet => "tablet",
            ViewportKind::Desktop => "desktop",
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            ViewportKind::Mobile => (390, 844),
            ViewportKind::Tablet => (820, 1180),
            ViewportKind::Desktop => (1440, 900),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveKind {
    Slider,
    Accordion,
    Dropdown,
    Form,
    Video,
}

impl InteractiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractiveKind::Slider => "slider",
            InteractiveKind::Accordion => "accordion",
            InteractiveKind::Dropdown => "dropdown",
            InteractiveKind::Form => "form",
            InteractiveKind::Video => "video",
        }
    }
}

/// A detected interactive element plus the action verification should replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveElement {
    pub kind: InteractiveKind,
    pub selector: String,
    /// `click`, `hover` or `focus`.
    pub action: String,
    /// Whether the element's behavior depends on jQuery being present.
    #[serde(default)]
    pub jquery_dependent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRef {
    pub src: String,
    #[serde(default)]
    pub inline: bool,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylesheetRef {
    pub href: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub src: String,
    pub bytes: u64,
    #[serde(default)]
    pub lcp_candidate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

/// One crawled page: rendered HTML plus the per-page asset inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    pub url: String,
    /// Path relative to the site root, `index.html` for `/`.
    pub output_path: String,
    pub content_hash: String,
    pub html_bytes: u64,
    #[serde(default)]
    pub scripts: Vec<ScriptRef>,
    #[serde(default)]
    pub stylesheets: Vec<StylesheetRef>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub fonts: Vec<FontRef>,
    #[serde(default)]
    pub interactive: Vec<InteractiveElement>,
    #[serde(default)]
    pub links: Vec<String>,
}

/// Structured result of the crawl phase; input to every later phase and to
/// the oracle's plan prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInventory {
    pub site_id: String,
    pub source_url: String,
    pub pages: Vec<PageEntry>,
    /// Theme/plugin fingerprint tokens detected from markup (class prefixes,
    /// generator tags). Drives the CSS safelist and the page-builder floor.
    #[serde(default)]
    pub fingerprint: Vec<String>,
    pub crawled_at: DateTime<Utc>,
}

impl SiteInventory {
    pub fn page(&self, output_path: &str) -> Option<&PageEntry> {
        self.pages.iter().find(|p| p.output_path == output_path)
    }

    /// True when the fingerprint names a known page-builder.
    pub fn is_page_builder(&self) -> bool {
        const BUILDERS: [&str; 4] = ["elementor", "divi", "wpbakery", "beaver-builder"];
        self.fingerprint
            .iter()
            .any(|token| BUILDERS.iter().any(|b| token.contains(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_builder_fingerprints_are_detected() {
        let inventory = SiteInventory {
            site_id: "site_a".into(),
            source_url: "https://acme.test".into(),
            pages: Vec::new(),
            fingerprint: vec!["theme:astra".into(), "plugin:elementor".into()],
            crawled_at: Utc::now(),
        };
        assert!(inventory.is_page_builder());
    }
}
